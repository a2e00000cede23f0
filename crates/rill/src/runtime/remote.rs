use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill_transport::{ExprRequest, TransportError};
use uuid::Uuid;

use crate::RillError;

use super::values::{RemoteFault, Value};
use super::{evaluate_isolated, EngineState, Outcome};

pub type ExecuteFuture = Pin<Box<dyn Future<Output = Result<String, TransportError>> + Send>>;

/// An endpoint capable of evaluating serialized expression text. Transport
/// agnostic: anything that can answer with result text qualifies.
pub trait Worker: Send + Sync {
    fn execute(&self, program: String) -> ExecuteFuture;
}

/// Evaluates programs in-process, each in a fresh worker-less engine with an
/// empty scope — the same contract a real remote worker honors.
#[derive(Debug, Default)]
pub struct LocalWorker;

impl LocalWorker {
    pub fn new() -> Self {
        Self
    }
}

impl Worker for LocalWorker {
    fn execute(&self, program: String) -> ExecuteFuture {
        Box::pin(async move {
            let joined = tokio::task::spawn_blocking(move || evaluate_isolated(&program)).await;
            match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TransportError::Worker(err.to_string())),
                Err(err) => Err(TransportError::Worker(err.to_string())),
            }
        })
    }
}

/// Talks to a worker server over the line-delimited TCP protocol.
pub struct TcpWorker {
    addr: String,
    deadline: Duration,
}

impl TcpWorker {
    pub fn new(addr: impl Into<String>, deadline: Duration) -> Self {
        Self {
            addr: addr.into(),
            deadline,
        }
    }
}

impl Worker for TcpWorker {
    fn execute(&self, program: String) -> ExecuteFuture {
        let addr = self.addr.clone();
        let deadline = self.deadline;
        Box::pin(async move {
            let request = ExprRequest {
                id: Uuid::new_v4(),
                program,
            };
            rill_transport::execute(&addr, request, deadline).await
        })
    }
}

struct WorkerEntry {
    label: String,
    tags: Vec<String>,
    transport: Arc<dyn Worker>,
}

#[derive(Clone)]
pub(super) struct WorkerHandle {
    pub(super) label: String,
    pub(super) transport: Arc<dyn Worker>,
}

/// Append-only, ordered; populated once at startup.
#[derive(Default)]
pub(super) struct WorkerRegistry {
    entries: Vec<WorkerEntry>,
}

impl WorkerRegistry {
    pub(super) fn register(
        &mut self,
        label: String,
        tags: Vec<String>,
        transport: Arc<dyn Worker>,
    ) {
        self.entries.push(WorkerEntry {
            label,
            tags,
            transport,
        });
    }

    pub(super) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// No tag selects the first registered worker; a tag selects the first
    /// worker advertising it.
    pub(super) fn select(&self, tag: Option<&str>) -> Result<WorkerHandle, RillError> {
        let entry = match tag {
            None => self.entries.first(),
            Some(tag) => self
                .entries
                .iter()
                .find(|entry| entry.tags.iter().any(|advertised| advertised == tag)),
        };
        match (entry, tag) {
            (Some(entry), _) => Ok(WorkerHandle {
                label: entry.label.clone(),
                transport: entry.transport.clone(),
            }),
            (None, Some(tag)) => Err(RillError::NoWorkerForTag(tag.to_string())),
            (None, None) => Err(RillError::NoWorkers),
        }
    }
}

/// Notice that a dispatched remote expression settled.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub id: Uuid,
    pub value: Value,
}

/// Owns the worker registry and the background runtime the round trips run
/// on. The runtime exists only when workers are registered; a worker-less
/// engine stays purely synchronous.
pub(super) struct RemoteManager {
    registry: WorkerRegistry,
    runtime: Option<tokio::runtime::Runtime>,
    deadline: Duration,
    notify: mpsc::Sender<Resolution>,
}

impl RemoteManager {
    pub(super) fn new(
        registry: WorkerRegistry,
        deadline: Duration,
        notify: mpsc::Sender<Resolution>,
    ) -> Result<Self, RillError> {
        let runtime = if registry.is_empty() {
            None
        } else {
            Some(
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()?,
            )
        };
        Ok(Self {
            registry,
            runtime,
            deadline,
            notify,
        })
    }

    pub(super) fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Fire-and-forget: spawns the round trip and returns immediately. The
    /// completion locks the shared engine state and runs the cascade there.
    pub(super) fn dispatch(
        &self,
        state: Arc<Mutex<EngineState>>,
        id: Uuid,
        program: String,
        worker: WorkerHandle,
    ) {
        let Some(runtime) = &self.runtime else {
            // select() succeeded, so the registry is non-empty and a runtime
            // was built; resolve to a fault rather than strand the chain.
            Self::complete(
                &state,
                &self.notify,
                id,
                Outcome::Fault(Arc::new(RemoteFault {
                    id,
                    message: "remote runtime unavailable".to_string(),
                })),
            );
            return;
        };

        tracing::debug!(%id, worker = %worker.label, program = %program, "dispatching remote expression");
        let deadline = self.deadline;
        let notify = self.notify.clone();
        runtime.spawn(async move {
            let round_trip = tokio::time::timeout(deadline, worker.transport.execute(program)).await;
            let outcome = match round_trip {
                Ok(Ok(text)) => match text.trim().parse::<i64>() {
                    Ok(value) => Outcome::Int(value),
                    Err(_) => Outcome::Fault(Arc::new(RemoteFault {
                        id,
                        message: format!("worker returned non-integer `{}`", text.trim()),
                    })),
                },
                Ok(Err(err)) => Outcome::Fault(Arc::new(RemoteFault {
                    id,
                    message: err.to_string(),
                })),
                Err(_) => Outcome::Fault(Arc::new(RemoteFault {
                    id,
                    message: format!("remote evaluation timed out after {deadline:?}"),
                })),
            };
            Self::complete(&state, &notify, id, outcome);
        });
    }

    fn complete(
        state: &Arc<Mutex<EngineState>>,
        notify: &mpsc::Sender<Resolution>,
        id: Uuid,
        outcome: Outcome,
    ) {
        match &outcome {
            Outcome::Int(value) => tracing::info!(%id, value, "remote expression resolved"),
            Outcome::Fault(fault) => {
                tracing::warn!(%id, error = %fault.message, "remote expression failed")
            }
        }
        let mut guard = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.resolve(id, outcome.clone());
        drop(guard);
        let _ = notify.send(Resolution {
            id,
            value: outcome.to_value(),
        });
    }
}
