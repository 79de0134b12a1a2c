//! Table-driven policy backend
//!
//! Every action the backend knows has a fixed decision. Nothing prompts,
//! so `AuthRequired` entries are reported as such by `action_status` but
//! are never granted.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;

use super::{CallerIdVerification, Capabilities, Capability, PolicyBackend, StatusChange};
use crate::action::{AuthStatus, VariantMap};
use crate::error::{BrokerError, Result};

pub struct StaticBackend {
    rules: RwLock<HashMap<String, AuthStatus>>,
    capabilities: AtomicU32,
    status_tx: broadcast::Sender<StatusChange>,
}

impl StaticBackend {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(64);
        let capabilities = Capabilities::new()
            .with(Capability::AuthorizeFromHelper)
            .with(Capability::CheckActionExistence);
        Self {
            rules: RwLock::new(HashMap::new()),
            capabilities: AtomicU32::new(capabilities.bits()),
            status_tx,
        }
    }

    /// Parse `name=status;name=status`
    pub fn from_policy(policy: &str) -> Result<Self> {
        let backend = Self::new();
        for entry in policy.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, status) = entry.split_once('=').ok_or_else(|| {
                BrokerError::Config(format!("policy entry {:?} is not name=status", entry))
            })?;
            let status = status
                .trim()
                .parse::<AuthStatus>()
                .map_err(BrokerError::Config)?;
            backend.set_rule(name.trim(), status);
        }
        Ok(backend)
    }

    pub fn with_rule(self, action: impl Into<String>, status: AuthStatus) -> Self {
        self.set_rule(action, status);
        self
    }

    pub fn set_rule(&self, action: impl Into<String>, status: AuthStatus) {
        self.rules.write().insert(action.into(), status);
    }

    /// Takes effect for the next call into the backend
    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.capabilities
            .store(capabilities.bits(), Ordering::SeqCst);
    }

    fn rule(&self, action: &str) -> Option<AuthStatus> {
        self.rules.read().get(action).copied()
    }

    fn decide(&self, action: &str) -> AuthStatus {
        let status = match self.rule(action) {
            Some(AuthStatus::Authorized) => AuthStatus::Authorized,
            Some(AuthStatus::Invalid) | None => AuthStatus::Invalid,
            Some(_) => AuthStatus::Denied,
        };
        let _ = self.status_tx.send(StatusChange {
            action: action.to_string(),
            status,
        });
        status
    }
}

impl Default for StaticBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyBackend for StaticBackend {
    fn name(&self) -> &str {
        "static"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits(self.capabilities.load(Ordering::SeqCst))
    }

    fn setup_action(&self, action: &str) {
        tracing::debug!("Static policy for {}: {:?}", action, self.rule(action));
    }

    async fn authorize_action(&self, action: &str) -> AuthStatus {
        self.decide(action)
    }

    fn action_status(&self, action: &str) -> AuthStatus {
        self.rule(action).unwrap_or(AuthStatus::Invalid)
    }

    fn caller_id(&self) -> Vec<u8> {
        std::process::id().to_string().into_bytes()
    }

    fn extra_caller_id_verification(&self) -> CallerIdVerification {
        CallerIdVerification::ProcessId
    }

    async fn is_caller_authorized(
        &self,
        action: &str,
        _caller_id: &[u8],
        _details: &VariantMap,
    ) -> bool {
        self.decide(action) == AuthStatus::Authorized
    }

    fn action_exists(&self, action: &str) -> bool {
        self.rules.read().contains_key(action)
    }

    fn status_changes(&self) -> Option<broadcast::Receiver<StatusChange>> {
        Some(self.status_tx.subscribe())
    }
}
