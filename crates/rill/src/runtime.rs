use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::ast::{Expr, NodeId};
use crate::parser::parse_program;
use crate::RillError;

mod remote;
mod scope;
mod serialize;
mod tracker;
mod values;

pub use remote::{ExecuteFuture, LocalWorker, Resolution, TcpWorker, Worker};
pub use values::{FunctionValue, PendingValue, RemoteFault, Value};

use remote::{RemoteManager, WorkerRegistry};
use scope::Scope;
use serialize::serialize_for_remote;
use tracker::{Dependent, Outcome, Slot, Tracker};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// One-shot dispatch state of a `remote` node. Absent means NotStarted; the
/// transition NotStarted -> Pending -> Resolved happens exactly once, so a
/// resolved node replays its cached value on every later evaluation.
enum RemoteStatus {
    Pending(PendingValue),
    Resolved(Value),
}

/// Everything the cascade touches: the scope, the dependency tables, and the
/// remote one-shot side-table. Shared between the synchronous evaluation
/// walk and asynchronous completion callbacks through one mutex.
pub(crate) struct EngineState {
    scope: Scope,
    tracker: Tracker,
    remotes: HashMap<NodeId, RemoteStatus>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            scope: Scope::new(),
            tracker: Tracker::default(),
            remotes: HashMap::new(),
        }
    }

    /// The update cascade: synchronous, depth-first, parent before children.
    /// Sibling order is unconstrained. After its dependents are notified the
    /// id's entry and outgoing edges are gone.
    pub(crate) fn resolve(&mut self, id: Uuid, outcome: Outcome) {
        if let Some(Dependent::RemoteRoot { node }) = self.tracker.remove_entry(&id) {
            self.remotes
                .insert(node, RemoteStatus::Resolved(outcome.to_value()));
        }

        for child in self.tracker.take_children(&id) {
            let step = match self.tracker.entry_mut(&child) {
                // Already retired through another branch of this cascade
                // (an id can be reachable via two parents); skipping is the
                // required no-op.
                None => None,
                Some(dependent) => dependent.absorb(id, child, &outcome).map(|own| {
                    let bind = match dependent {
                        Dependent::Bind { name } => Some(name.clone()),
                        _ => None,
                    };
                    (bind, own)
                }),
            };
            let Some((bind, child_outcome)) = step else {
                continue;
            };
            if let Some(name) = bind {
                self.scope
                    .rebind_pending(&name, child, child_outcome.to_value());
            }
            self.resolve(child, child_outcome);
        }
    }
}

struct EvalCtx<'a> {
    state: &'a mut EngineState,
    shared: &'a Arc<Mutex<EngineState>>,
    remote: &'a Arc<RemoteManager>,
}

enum WorkerSpec {
    Transport {
        label: String,
        tags: Vec<String>,
        transport: Arc<dyn Worker>,
    },
    Tcp {
        addr: String,
        tags: Vec<String>,
    },
}

pub struct EngineBuilder {
    workers: Vec<WorkerSpec>,
    deadline: Duration,
}

impl EngineBuilder {
    /// Deadline applied to every remote round trip. A dispatch that outlives
    /// it resolves to a fault instead of waiting forever.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn worker(
        mut self,
        label: impl Into<String>,
        tags: Vec<String>,
        transport: Arc<dyn Worker>,
    ) -> Self {
        self.workers.push(WorkerSpec::Transport {
            label: label.into(),
            tags,
            transport,
        });
        self
    }

    pub fn tcp_worker(mut self, addr: impl Into<String>, tags: Vec<String>) -> Self {
        self.workers.push(WorkerSpec::Tcp {
            addr: addr.into(),
            tags,
        });
        self
    }

    pub fn build(self) -> Result<Engine, RillError> {
        let mut registry = WorkerRegistry::default();
        for spec in self.workers {
            match spec {
                WorkerSpec::Transport {
                    label,
                    tags,
                    transport,
                } => registry.register(label, tags, transport),
                WorkerSpec::Tcp { addr, tags } => {
                    let transport = Arc::new(TcpWorker::new(addr.clone(), self.deadline));
                    registry.register(addr, tags, transport);
                }
            }
        }

        let (notify_tx, notify_rx) = mpsc::channel();
        let remote = RemoteManager::new(registry, self.deadline, notify_tx)?;
        Ok(Engine {
            state: Arc::new(Mutex::new(EngineState::new())),
            remote: Arc::new(remote),
            resolutions: Mutex::new(Some(notify_rx)),
        })
    }
}

/// The evaluation engine: one persistent scope, the value tracker, and the
/// remote dispatch layer.
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
    remote: Arc<RemoteManager>,
    resolutions: Mutex<Option<mpsc::Receiver<Resolution>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            workers: Vec::new(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn parse(source: &str) -> Result<Expr, RillError> {
        parse_program(source)
    }

    /// Evaluates a parsed expression against the engine's live state.
    pub fn eval(&self, expr: &Expr) -> Result<Value, RillError> {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ctx = EvalCtx {
            state: &mut *guard,
            shared: &self.state,
            remote: &self.remote,
        };
        eval_expr(expr, &mut ctx)
    }

    /// Parses and evaluates one input (a REPL line or a whole program).
    pub fn execute(&self, source: &str) -> Result<Value, RillError> {
        let expr = Self::parse(source)?;
        self.eval(&expr)
    }

    /// Live tracker entries. Non-zero once everything settled means a
    /// dependency chain leaked.
    pub fn outstanding(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.tracker.outstanding(),
            Err(poisoned) => poisoned.into_inner().tracker.outstanding(),
        }
    }

    /// The completion notice channel. Yields once per settled dispatch;
    /// callable once.
    pub fn take_resolutions(&self) -> Option<mpsc::Receiver<Resolution>> {
        match self.resolutions.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Evaluates one program in a fresh worker-less engine with an empty scope
/// and renders the result. This is the worker side of the protocol — both
/// `LocalWorker` and the `rill serve` handler go through here.
pub fn evaluate_isolated(source: &str) -> Result<String, RillError> {
    let engine = Engine::builder().build()?;
    let value = engine.execute(source)?;
    Ok(value.to_string())
}

fn eval_expr(expr: &Expr, ctx: &mut EvalCtx<'_>) -> Result<Value, RillError> {
    match expr {
        Expr::Int(value) => Ok(Value::Int(*value)),
        Expr::Var(name) => ctx
            .state
            .scope
            .get(name)
            .ok_or_else(|| RillError::UnknownSymbol(name.clone())),
        Expr::Add(left, right) => eval_add(left, right, ctx),
        Expr::Assign { name, value } => {
            let evaluated = eval_expr(value, ctx)?;
            match &evaluated {
                Value::Pending(pending) => {
                    let forward = ctx.state.tracker.add_dependent(
                        pending.id,
                        Dependent::Bind { name: name.clone() },
                    );
                    ctx.state.scope.set(name.clone(), Value::Pending(forward));
                }
                concrete => ctx.state.scope.set(name.clone(), concrete.clone()),
            }
            Ok(evaluated)
        }
        Expr::Block(exprs) => eval_block(exprs, ctx),
        Expr::FnDef { name, params, body } => {
            let func = Value::Function(Arc::new(FunctionValue {
                name: name.clone(),
                params: params.clone(),
                body: body.clone(),
            }));
            ctx.state.scope.set(name.clone(), func.clone());
            Ok(func)
        }
        Expr::FnCall { name, args } => eval_call(name, args, ctx),
        Expr::Remote { node, inner, tag } => eval_remote(*node, inner, tag.as_deref(), ctx),
    }
}

/// Pushes a frame around `body` and pops it on every exit path.
fn with_frame<T>(ctx: &mut EvalCtx<'_>, body: impl FnOnce(&mut EvalCtx<'_>) -> T) -> T {
    ctx.state.scope.push_frame();
    let result = body(ctx);
    ctx.state.scope.pop_frame();
    result
}

enum Operand {
    Ready(i64),
    Waiting(PendingValue),
}

fn add_operand(value: Value) -> Result<Result<Operand, Arc<RemoteFault>>, RillError> {
    match value {
        Value::Int(int) => Ok(Ok(Operand::Ready(int))),
        Value::Pending(pending) => Ok(Ok(Operand::Waiting(pending))),
        Value::Fault(fault) => Ok(Err(fault)),
        Value::Function(func) => Err(RillError::TypeMismatch(format!(
            "cannot add function `{}`",
            func.name
        ))),
    }
}

fn eval_add(left: &Expr, right: &Expr, ctx: &mut EvalCtx<'_>) -> Result<Value, RillError> {
    let lhs = eval_expr(left, ctx)?;
    let rhs = eval_expr(right, ctx)?;

    let lhs = match add_operand(lhs)? {
        Ok(operand) => operand,
        Err(fault) => return Ok(Value::Fault(fault)),
    };
    let rhs = match add_operand(rhs)? {
        Ok(operand) => operand,
        Err(fault) => return Ok(Value::Fault(fault)),
    };

    match (lhs, rhs) {
        (Operand::Ready(a), Operand::Ready(b)) => match a.checked_add(b) {
            Some(sum) => Ok(Value::Int(sum)),
            None => Err(RillError::TypeMismatch(
                "integer overflow in addition".to_string(),
            )),
        },
        (Operand::Ready(a), Operand::Waiting(pending)) => Ok(register_add(
            ctx,
            Slot::Ready(a),
            Slot::Waiting(pending.id),
        )),
        (Operand::Waiting(pending), Operand::Ready(b)) => Ok(register_add(
            ctx,
            Slot::Waiting(pending.id),
            Slot::Ready(b),
        )),
        (Operand::Waiting(first), Operand::Waiting(second)) => Ok(register_add(
            ctx,
            Slot::Waiting(first.id),
            Slot::Waiting(second.id),
        )),
    }
}

/// Allocates one id for the whole addition and registers it under every
/// pending operand (fan-in); each side's value is stored independently and
/// the sum fires only once all slots are ready.
fn register_add(ctx: &mut EvalCtx<'_>, left: Slot, right: Slot) -> Value {
    let child = Uuid::new_v4();
    let mut pending = PendingValue { id: child };
    for slot in [left, right] {
        if let Slot::Waiting(parent) = slot {
            pending = ctx
                .state
                .tracker
                .add_dependent_with_id(parent, child, Dependent::Add { left, right });
        }
    }
    Value::Pending(pending)
}

fn eval_block(exprs: &[Expr], ctx: &mut EvalCtx<'_>) -> Result<Value, RillError> {
    let Some((last, init)) = exprs.split_last() else {
        return Err(RillError::Syntax("empty block".to_string()));
    };
    with_frame(ctx, |ctx| {
        for expr in init {
            eval_expr(expr, ctx)?;
        }
        eval_expr(last, ctx)
    })
}

fn eval_call(name: &str, args: &[Expr], ctx: &mut EvalCtx<'_>) -> Result<Value, RillError> {
    let func = match ctx.state.scope.get(name) {
        Some(Value::Function(func)) => func,
        _ => return Err(RillError::NotAFunction(name.to_string())),
    };
    if args.len() != func.params.len() {
        return Err(RillError::ArityMismatch {
            name: name.to_string(),
            expected: func.params.len(),
            found: args.len(),
        });
    }

    // Arguments evaluate in the caller's scope, before the frame is pushed.
    let mut evaluated = Vec::with_capacity(args.len());
    for arg in args {
        evaluated.push(eval_expr(arg, ctx)?);
    }

    with_frame(ctx, move |ctx| {
        for (param, value) in func.params.iter().zip(evaluated) {
            ctx.state.scope.set(param.clone(), value);
        }
        eval_expr(&func.body, ctx)
    })
}

fn eval_remote(
    node: NodeId,
    inner: &Expr,
    tag: Option<&str>,
    ctx: &mut EvalCtx<'_>,
) -> Result<Value, RillError> {
    if let Some(status) = ctx.state.remotes.get(&node) {
        return Ok(match status {
            RemoteStatus::Pending(pending) => Value::Pending(*pending),
            RemoteStatus::Resolved(value) => value.clone(),
        });
    }

    // Worker selection and serialization both run before any registration,
    // so a failure here leaves no tracker state behind.
    let worker = ctx.remote.registry().select(tag)?;
    let program = serialize_for_remote(inner, &ctx.state.scope)?;

    let pending = ctx.state.tracker.add_root(node);
    ctx.state.remotes.insert(node, RemoteStatus::Pending(pending));
    ctx.remote
        .dispatch(ctx.shared.clone(), pending.id, program, worker);
    Ok(Value::Pending(pending))
}
