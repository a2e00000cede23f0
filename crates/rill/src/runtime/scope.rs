use std::collections::HashMap;

use uuid::Uuid;

use super::values::Value;

/// Stack of lexical frames. Lookup scans innermost to outermost; writes
/// always target the innermost frame. The root frame is never popped.
pub(super) struct Scope {
    frames: Vec<HashMap<String, Value>>,
}

impl Scope {
    pub(super) fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    pub(super) fn get(&self, name: &str) -> Option<Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name).cloned())
    }

    pub(super) fn set(&mut self, name: String, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name, value);
        }
    }

    pub(super) fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub(super) fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Rewrites a binding that still holds the matching forwarding handle.
    /// Only the innermost binding of `name` is considered (it shadows any
    /// outer ones); a binding whose frame was already popped, or that was
    /// overwritten since, is left alone.
    pub(super) fn rebind_pending(&mut self, name: &str, pending: Uuid, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if let Some(slot) = frame.get_mut(name) {
                if matches!(slot, Value::Pending(handle) if handle.id == pending) {
                    *slot = value;
                }
                return;
            }
        }
    }
}
