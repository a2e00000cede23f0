use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::ast::NodeId;

use super::values::{PendingValue, RemoteFault, Value};

/// A concrete result flowing through the dependency graph.
#[derive(Debug, Clone)]
pub(super) enum Outcome {
    Int(i64),
    Fault(Arc<RemoteFault>),
}

impl Outcome {
    pub(super) fn to_value(&self) -> Value {
        match self {
            Outcome::Int(value) => Value::Int(*value),
            Outcome::Fault(fault) => Value::Fault(fault.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum Slot {
    Ready(i64),
    Waiting(Uuid),
}

/// Externalized evaluation state of a node awaiting resolution. The AST
/// itself stays immutable; everything mutable lives here, keyed by the
/// pending id the node generated.
#[derive(Debug)]
pub(super) enum Dependent {
    /// An addition with at least one pending operand. Fan-in: the same
    /// entry can be registered under two parents; the sum fires once, when
    /// every slot is ready, regardless of arrival order.
    Add { left: Slot, right: Slot },
    /// A scope binding awaiting rewrite to the concrete value.
    Bind { name: String },
    /// An outstanding remote dispatch.
    RemoteRoot { node: NodeId },
}

impl Dependent {
    /// Feeds one parent's outcome in. `None` means the node is still
    /// waiting on another parent; `Some` carries this node's own outcome.
    pub(super) fn absorb(&mut self, parent: Uuid, own_id: Uuid, outcome: &Outcome) -> Option<Outcome> {
        match self {
            Dependent::Add { left, right } => {
                let value = match outcome {
                    // One faulted operand faults the whole node, even if the
                    // other side is still in flight; the late parent's visit
                    // lands on a retired entry and is dropped there.
                    Outcome::Fault(fault) => return Some(Outcome::Fault(fault.clone())),
                    Outcome::Int(value) => *value,
                };
                if matches!(*left, Slot::Waiting(waiting) if waiting == parent) {
                    *left = Slot::Ready(value);
                }
                if matches!(*right, Slot::Waiting(waiting) if waiting == parent) {
                    *right = Slot::Ready(value);
                }
                match (*left, *right) {
                    (Slot::Ready(a), Slot::Ready(b)) => Some(match a.checked_add(b) {
                        Some(sum) => Outcome::Int(sum),
                        None => Outcome::Fault(Arc::new(RemoteFault {
                            id: own_id,
                            message: "integer overflow in addition".to_string(),
                        })),
                    }),
                    _ => None,
                }
            }
            Dependent::Bind { .. } | Dependent::RemoteRoot { .. } => Some(outcome.clone()),
        }
    }
}

/// Registry of outstanding async nodes and their dependency edges.
#[derive(Default)]
pub(super) struct Tracker {
    entries: HashMap<Uuid, Dependent>,
    edges: HashMap<Uuid, Vec<Uuid>>,
}

impl Tracker {
    pub(super) fn add_root(&mut self, node: NodeId) -> PendingValue {
        let id = Uuid::new_v4();
        self.entries.insert(id, Dependent::RemoteRoot { node });
        PendingValue { id }
    }

    pub(super) fn add_dependent(&mut self, parent: Uuid, dependent: Dependent) -> PendingValue {
        self.add_dependent_with_id(parent, Uuid::new_v4(), dependent)
    }

    /// Registers `dependent` under an explicit child id. Calling this twice
    /// with the same child id (once per pending operand) creates fan-in:
    /// the first call stores the entry, both calls add an edge.
    pub(super) fn add_dependent_with_id(
        &mut self,
        parent: Uuid,
        child: Uuid,
        dependent: Dependent,
    ) -> PendingValue {
        self.entries.entry(child).or_insert(dependent);
        self.edges.entry(parent).or_default().push(child);
        PendingValue { id: child }
    }

    pub(super) fn entry_mut(&mut self, id: &Uuid) -> Option<&mut Dependent> {
        self.entries.get_mut(id)
    }

    pub(super) fn remove_entry(&mut self, id: &Uuid) -> Option<Dependent> {
        self.entries.remove(id)
    }

    pub(super) fn take_children(&mut self, id: &Uuid) -> Vec<Uuid> {
        self.edges.remove(id).unwrap_or_default()
    }

    /// Live entry count. Non-zero after all dispatches settled means a leak.
    pub(super) fn outstanding(&self) -> usize {
        self.entries.len()
    }
}
