//! Client side of the helper transport
//!
//! A transport delivers execute requests to helper processes and turns
//! everything the helper sends back into [`TransportEvent`]s. Every outcome,
//! including failure to reach the helper at all, arrives as an
//! `ActionPerformed` event; `execute_action` never fails synchronously.

pub mod fake;
pub mod protocol;
pub mod socket;

use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::action::{DetailsMap, VariantMap};
use crate::reply::ActionReply;

pub use fake::FakeHelperTransport;
pub use socket::SocketHelperTransport;

/// Identity of the process at the other end of a helper connection, as
/// reported by the operating system rather than by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Unique per connection, assigned by the helper
    pub connection_name: String,
    pub uid: Option<u32>,
    pub pid: Option<i32>,
}

/// One execute request
#[derive(Debug, Clone)]
pub struct ActionRequest {
    /// Ticket matching events to the job that issued the request
    pub request_id: Uuid,
    pub action: String,
    pub helper_id: String,
    pub details: DetailsMap,
    pub arguments: VariantMap,
    /// `None` uses the transport default
    pub timeout: Option<Duration>,
}

/// Events emitted by a helper transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ActionStarted {
        action: String,
        request_id: Option<Uuid>,
    },
    /// Terminal, exactly once per request
    ActionPerformed {
        action: String,
        request_id: Option<Uuid>,
        reply: ActionReply,
    },
    ProgressStep {
        action: String,
        request_id: Option<Uuid>,
        percent: i32,
    },
    ProgressStepData {
        action: String,
        request_id: Option<Uuid>,
        data: VariantMap,
    },
}

impl TransportEvent {
    pub fn action(&self) -> &str {
        match self {
            TransportEvent::ActionStarted { action, .. }
            | TransportEvent::ActionPerformed { action, .. }
            | TransportEvent::ProgressStep { action, .. }
            | TransportEvent::ProgressStepData { action, .. } => action,
        }
    }

    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            TransportEvent::ActionStarted { request_id, .. }
            | TransportEvent::ActionPerformed { request_id, .. }
            | TransportEvent::ProgressStep { request_id, .. }
            | TransportEvent::ProgressStepData { request_id, .. } => *request_id,
        }
    }

    /// Same action name and, when the event carries one, the same ticket
    pub fn concerns(&self, action: &str, request_id: Uuid) -> bool {
        self.action() == action && self.request_id().map_or(true, |id| id == request_id)
    }
}

pub trait HelperTransport: Send + Sync {
    /// Requires a Tokio runtime; the outcome arrives as an event
    fn execute_action(&self, request: ActionRequest);

    /// Best effort, no acknowledgement
    fn stop_action(&self, action: &str, helper_id: &str);

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
