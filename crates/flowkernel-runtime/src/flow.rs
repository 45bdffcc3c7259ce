//! Flow definitions: a named set of state methods a [`crate::runner::FlowRunner`]
//! dispatches into by name.
//!
//! State methods are registered rather than looked up by reflection, so a
//! typo in a next-state name fails at registration or dispatch time instead
//! of silently landing on the wrong method. A handler receives the runner
//! (to call back out with
//! `CallClient`/`CallState`/`SendReply`) and the responses that completed
//! the request which triggered it.

use std::collections::HashMap;
use std::sync::Arc;

use flowkernel_core::message::GrrMessage;

use crate::error::Result;
use crate::runner::FlowRunner;

pub type StateHandler = dyn Fn(&FlowRunner<'_>, &[GrrMessage]) -> Result<()> + Send + Sync;

/// A flow's state machine: a name plus a registration table mapping state
/// names to handlers. `Start` is the conventional entry state but nothing
/// enforces that name beyond convention.
#[derive(Clone)]
pub struct FlowDefinition {
    name: String,
    states: HashMap<String, Arc<StateHandler>>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: HashMap::new(),
        }
    }

    pub fn with_state(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&FlowRunner<'_>, &[GrrMessage]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.states.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self, state: &str) -> Option<Arc<StateHandler>> {
        self.states.get(state).cloned()
    }
}
