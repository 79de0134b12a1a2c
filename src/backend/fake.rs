//! Backend used when no real policy backend could be loaded

use async_trait::async_trait;

use super::{Capabilities, PolicyBackend};
use crate::action::{AuthStatus, VariantMap};

/// Denies everything
#[derive(Debug, Default)]
pub struct FakeBackend;

impl FakeBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PolicyBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
    }

    fn setup_action(&self, _action: &str) {}

    async fn authorize_action(&self, _action: &str) -> AuthStatus {
        AuthStatus::Denied
    }

    fn action_status(&self, _action: &str) -> AuthStatus {
        AuthStatus::Denied
    }

    fn caller_id(&self) -> Vec<u8> {
        Vec::new()
    }

    async fn is_caller_authorized(
        &self,
        _action: &str,
        _caller_id: &[u8],
        _details: &VariantMap,
    ) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AuthorizationStrategy;

    #[tokio::test]
    async fn test_fake_backend_denies_everything() {
        let backend = FakeBackend::new();
        assert_eq!(
            backend.capabilities().strategy(),
            AuthorizationStrategy::Unspecified
        );
        assert_eq!(backend.authorize_action("a.b").await, AuthStatus::Denied);
        assert_eq!(backend.action_status("a.b"), AuthStatus::Denied);
        assert!(backend.caller_id().is_empty());
        assert!(
            !backend
                .is_caller_authorized("a.b", b"", &VariantMap::new())
                .await
        );
        assert!(!backend.action_exists("a.b"));
    }
}
