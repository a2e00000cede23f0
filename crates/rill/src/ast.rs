use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Identity of a `remote` node, stamped at parse time. Keys the one-shot
/// dispatch state held outside the AST, so the tree itself stays immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int(i64),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Assign {
        name: String,
        value: Box<Expr>,
    },
    Block(Vec<Expr>),
    FnDef {
        name: String,
        params: Vec<String>,
        body: Arc<Expr>,
    },
    FnCall {
        name: String,
        args: Vec<Expr>,
    },
    Remote {
        node: NodeId,
        inner: Box<Expr>,
        tag: Option<String>,
    },
}
