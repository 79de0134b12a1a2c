//! Policy backends
//!
//! A backend decides whether an action may run. The same contract is used
//! on both sides of the helper transport:
//! - in the client process to query status and, when the backend supports
//!   it, to authorize before contacting the helper
//! - in the helper process to decide whether the remote caller may run the
//!   action it asked for

pub mod capability;
pub mod fake;
pub mod static_policy;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::action::{AuthDetail, AuthStatus, DetailsMap, VariantMap};
use crate::transport::PeerIdentity;

pub use capability::{AuthorizationStrategy, Capabilities, Capability};
pub use fake::FakeBackend;
pub use static_policy::StaticBackend;

/// How the helper double-checks the caller id a client hands it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallerIdVerification {
    /// Trust the backend's own check
    #[default]
    None,
    /// The caller id must be the connection name the helper assigned
    ConnectionName,
    /// The caller id must be the decimal process id of the connected peer
    ProcessId,
}

impl CallerIdVerification {
    pub fn verify(&self, caller_id: &[u8], peer: &PeerIdentity) -> bool {
        match self {
            CallerIdVerification::None => true,
            CallerIdVerification::ConnectionName => caller_id == peer.connection_name.as_bytes(),
            CallerIdVerification::ProcessId => {
                let Some(pid) = peer.pid else {
                    return false;
                };
                std::str::from_utf8(caller_id)
                    .ok()
                    .and_then(|s| s.parse::<i32>().ok())
                    .is_some_and(|claimed| claimed == pid)
            }
        }
    }
}

/// Notification that the backend's view of an action changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub action: String,
    pub status: AuthStatus,
}

/// The authorization policy contract
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Called once when an action is created for this backend
    fn setup_action(&self, action: &str);

    /// May wait on user interaction
    async fn authorize_action(&self, action: &str) -> AuthStatus;

    /// Never prompts
    fn action_status(&self, action: &str) -> AuthStatus;

    /// Token identifying this process to a helper
    fn caller_id(&self) -> Vec<u8>;

    fn extra_caller_id_verification(&self) -> CallerIdVerification {
        CallerIdVerification::None
    }

    /// Runs inside the helper process
    async fn is_caller_authorized(
        &self,
        action: &str,
        caller_id: &[u8],
        details: &VariantMap,
    ) -> bool;

    fn action_exists(&self, _action: &str) -> bool {
        false
    }

    fn pre_auth_action(&self, _action: &str, _parent_window: Option<u64>) {}

    /// Translate generic details into the keys this backend's prompts use
    fn backend_details(&self, details: &DetailsMap) -> VariantMap {
        details
            .iter()
            .map(|(key, value)| {
                let key = match key {
                    AuthDetail::Message => "message",
                    AuthDetail::Other => "other_details",
                };
                (key.to_string(), value.clone())
            })
            .collect()
    }

    fn status_changes(&self) -> Option<broadcast::Receiver<StatusChange>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(pid: Option<i32>) -> PeerIdentity {
        PeerIdentity {
            connection_name: ":1.7".to_string(),
            uid: Some(1000),
            pid,
        }
    }

    #[test]
    fn test_verify_none_accepts_anything() {
        assert!(CallerIdVerification::None.verify(b"whatever", &peer(None)));
    }

    #[test]
    fn test_verify_connection_name() {
        let method = CallerIdVerification::ConnectionName;
        assert!(method.verify(b":1.7", &peer(None)));
        assert!(!method.verify(b":1.8", &peer(None)));
    }

    #[test]
    fn test_verify_process_id() {
        let method = CallerIdVerification::ProcessId;
        assert!(method.verify(b"4242", &peer(Some(4242))));
        assert!(!method.verify(b"4243", &peer(Some(4242))));
        assert!(!method.verify(b"not a pid", &peer(Some(4242))));
        assert!(!method.verify(b"4242", &peer(None)));
    }

    #[test]
    fn test_default_backend_details() {
        let backend = FakeBackend::new();
        let mut details = DetailsMap::new();
        details.insert(AuthDetail::Message, "Reading a protected file".into());
        details.insert(AuthDetail::Other, 3.into());

        let mapped = backend.backend_details(&details);
        assert_eq!(mapped["message"], "Reading a protected file");
        assert_eq!(mapped["other_details"], 3);
    }
}
