use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::ast::Expr;

/// Everything an expression can evaluate to. Matched exhaustively at every
/// consumption site; `Pending` is never a terminal value — a recipient either
/// forwards it upward or registers a dependency on it.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Function(Arc<FunctionValue>),
    Pending(PendingValue),
    Fault(Arc<RemoteFault>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Function(_) => "function",
            Value::Pending(_) => "pending value",
            Value::Fault(_) => "fault",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{value}"),
            Value::Function(func) => {
                write!(f, "<def {}({})>", func.name, func.params.join(","))
            }
            Value::Pending(pending) => write!(f, "<pending {}>", pending.id),
            Value::Fault(fault) => write!(f, "<fault {}>", fault.message),
        }
    }
}

/// Opaque handle for a value that has not been computed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingValue {
    pub id: Uuid,
}

/// A named function. Parameters bind fresh at call time; there is no
/// captured environment.
#[derive(Debug)]
pub struct FunctionValue {
    pub name: String,
    pub params: Vec<String>,
    pub body: Arc<Expr>,
}

/// The typed outcome a failed remote chain resolves to.
#[derive(Debug, Clone)]
pub struct RemoteFault {
    pub id: Uuid,
    pub message: String,
}
