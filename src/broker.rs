//! Execution context: the policy backend and helper transport a job uses

use std::sync::Arc;

use crate::action::{is_valid_action_name, Action, AuthStatus, ExecutionMode};
use crate::backend::{Capability, PolicyBackend};
use crate::job::ExecuteJob;
use crate::registry::BackendRegistry;
use crate::transport::HelperTransport;

/// Handle bundling the process-wide backend with the transport of one
/// execution context. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    backend: Arc<dyn PolicyBackend>,
    transport: Arc<dyn HelperTransport>,
}

impl Broker {
    pub fn new(backend: Arc<dyn PolicyBackend>, transport: Arc<dyn HelperTransport>) -> Self {
        Self { backend, transport }
    }

    pub fn backend(&self) -> &Arc<dyn PolicyBackend> {
        &self.backend
    }

    pub fn transport(&self) -> &Arc<dyn HelperTransport> {
        &self.transport
    }

    /// Create an action and let the backend prepare for it
    pub fn action(&self, name: impl Into<String>) -> Action {
        let action = Action::new(name);
        self.backend.setup_action(action.name());
        action
    }

    pub fn is_valid(&self, action: &Action) -> bool {
        if action.name().is_empty() {
            return false;
        }
        if self
            .backend
            .capabilities()
            .has(Capability::CheckActionExistence)
        {
            self.backend.action_exists(action.name())
        } else {
            is_valid_action_name(action.name())
        }
    }

    /// Queries the backend every time
    pub fn status(&self, action: &Action) -> AuthStatus {
        if !self.is_valid(action) {
            return AuthStatus::Invalid;
        }
        self.backend.action_status(action.name())
    }

    pub fn execute(&self, action: &Action, mode: ExecutionMode) -> ExecuteJob {
        ExecuteJob::new(action.clone(), mode, self.clone())
    }
}

impl Action {
    /// Status according to the process-wide registry
    pub fn status(&self) -> AuthStatus {
        BackendRegistry::global().broker().status(self)
    }

    pub fn is_valid(&self) -> bool {
        BackendRegistry::global().broker().is_valid(self)
    }

    /// Job on the process-wide registry's default context
    pub fn execute(&self, mode: ExecutionMode) -> ExecuteJob {
        BackendRegistry::global().broker().execute(self, mode)
    }
}
