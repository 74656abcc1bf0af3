//! Port-binding tracker
//!
//! Records which `(netns, port)` pairs are currently bound. Each port moves
//! `Unbound -> Bound` on bind (or TCP accept) and back on listen stop or
//! socket destruction. Both transitions are idempotent.

use crate::bounded::BoundedMap;
use crate::error::Result;
use crate::telemetry::Table;
use conntrace_common::PortBinding;

/// Binding state stored per port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Bound,
}

pub struct PortBindings {
    ports: BoundedMap<PortBinding, PortState>,
}

impl PortBindings {
    pub fn new(table: Table, capacity: usize) -> Self {
        Self {
            ports: BoundedMap::new(table, capacity),
        }
    }

    /// Mark the pair bound. Binding an already-bound pair is a no-op.
    pub fn bind(&self, binding: PortBinding) -> Result<()> {
        self.ports.insert(binding, PortState::Bound).map(|_| ())
    }

    /// Mark the pair unbound. Returns whether it was bound.
    pub fn unbind(&self, binding: &PortBinding) -> bool {
        self.ports.remove(binding).is_some()
    }

    pub fn contains(&self, binding: &PortBinding) -> bool {
        self.ports.contains_key(binding)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
