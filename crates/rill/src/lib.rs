pub mod ast;
pub mod lexer;
pub mod parser;
pub mod runtime;

pub use ast::{Expr, NodeId};
pub use parser::parse_program;
pub use runtime::{
    evaluate_isolated, Engine, EngineBuilder, ExecuteFuture, FunctionValue, LocalWorker,
    PendingValue, RemoteFault, Resolution, TcpWorker, Value, Worker,
};

pub use rill_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum RillError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("`{0}` is not a function")]
    NotAFunction(String),
    #[error("function `{name}` expects {expected} arguments but was called with {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("no workers registered")]
    NoWorkers,
    #[error("no worker registered for tag `{0}`")]
    NoWorkerForTag(String),
    #[error("not serializable: {0}")]
    NotSerializable(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
