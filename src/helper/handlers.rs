//! Handler registration for helper processes
//!
//! An action `<helper_id>.foo.bar` is served by the handler registered as
//! `foo_bar`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use crate::action::VariantMap;
use crate::reply::ActionReply;
use crate::transport::protocol::{self, SignalType};
use crate::transport::PeerIdentity;

pub type Handler = Arc<dyn Fn(&HelperContext, VariantMap) -> ActionReply + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&HelperContext, VariantMap) -> ActionReply + Send + Sync + 'static,
    {
        self.insert(name, handler);
        self
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&HelperContext, VariantMap) -> ActionReply + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// `None` when the action does not belong to this helper
    pub fn handler_name(helper_id: &str, action: &str) -> Option<String> {
        let suffix = action.strip_prefix(helper_id)?.strip_prefix('.')?;
        if suffix.is_empty() {
            return None;
        }
        Some(suffix.replace('.', "_"))
    }

    pub fn resolve(&self, helper_id: &str, action: &str) -> Option<Handler> {
        let name = Self::handler_name(helper_id, action)?;
        self.handlers.get(&name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What a running handler can do besides returning its reply
pub struct HelperContext {
    dispatcher: Arc<Dispatcher>,
    action: String,
    request_id: Uuid,
    caller: PeerIdentity,
}

impl HelperContext {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        action: String,
        request_id: Uuid,
        caller: PeerIdentity,
    ) -> Self {
        Self {
            dispatcher,
            action,
            request_id,
            caller,
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn progress_step(&self, percent: i32) {
        self.dispatcher.emit(
            SignalType::ProgressStepIndicator,
            &self.action,
            Some(self.request_id),
            protocol::progress_step_payload(percent),
        );
    }

    /// Data that cannot be encoded is dropped with a warning
    pub fn progress_data(&self, data: &VariantMap) {
        match protocol::progress_data_payload(data) {
            Ok(payload) => self.dispatcher.emit(
                SignalType::ProgressStepData,
                &self.action,
                Some(self.request_id),
                payload,
            ),
            Err(e) => tracing::warn!("Dropping progress data of {}: {}", self.action, e),
        }
    }

    /// Set once a client asked to stop; handlers poll it
    pub fn is_stopped(&self) -> bool {
        self.dispatcher.stop_flag().load(Ordering::SeqCst)
    }

    pub fn caller_uid(&self) -> Option<u32> {
        self.caller.uid
    }

    pub fn caller_pid(&self) -> Option<i32> {
        self.caller.pid
    }
}
