//! Request dispatch inside a helper process
//!
//! At most one action runs at a time. A request arriving while another is
//! in flight is answered with a busy reply straight away; nothing queues.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::handlers::{HandlerTable, HelperContext};
use super::watchdog::IdleWatchdog;
use crate::action::DetailsMap;
use crate::backend::PolicyBackend;
use crate::codec;
use crate::reply::ActionReply;
use crate::transport::protocol::{self, DebugLevel, HelperMessage, RemoteSignal, SignalType};
use crate::transport::PeerIdentity;

/// A `perform_action` call as received from a client
#[derive(Debug, Clone)]
pub struct PerformRequest {
    pub request_id: Uuid,
    pub action: String,
    pub caller_id: Vec<u8>,
    pub details: DetailsMap,
    /// Encoded argument map
    pub arguments: Vec<u8>,
}

#[derive(Debug, Clone)]
struct InFlight {
    action: String,
    request_id: Uuid,
}

pub struct Dispatcher {
    helper_id: String,
    backend: Arc<dyn PolicyBackend>,
    /// `None` when the process registered no responder at all
    handlers: Option<HandlerTable>,
    current: Mutex<Option<InFlight>>,
    stop_requested: AtomicBool,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<HelperMessage>>>,
    watchdog: Option<Arc<IdleWatchdog>>,
}

impl Dispatcher {
    pub fn new(
        helper_id: impl Into<String>,
        backend: Arc<dyn PolicyBackend>,
        handlers: Option<HandlerTable>,
    ) -> Self {
        Self {
            helper_id: helper_id.into(),
            backend,
            handlers,
            current: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            subscribers: Mutex::new(HashMap::new()),
            watchdog: None,
        }
    }

    pub fn with_watchdog(mut self, watchdog: Arc<IdleWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn helper_id(&self) -> &str {
        &self.helper_id
    }

    pub fn watchdog(&self) -> Option<&Arc<IdleWatchdog>> {
        self.watchdog.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.current.lock().is_some()
    }

    pub(crate) fn stop_flag(&self) -> &AtomicBool {
        &self.stop_requested
    }

    /// Remote signals are delivered to `tx` until `unsubscribe`
    pub fn subscribe(&self, connection: u64, tx: mpsc::UnboundedSender<HelperMessage>) {
        self.subscribers.lock().insert(connection, tx);
    }

    pub fn unsubscribe(&self, connection: u64) {
        self.subscribers.lock().remove(&connection);
    }

    /// Must not log: the log forwarding layer calls back into here
    pub fn emit(
        &self,
        signal: SignalType,
        action: &str,
        request_id: Option<Uuid>,
        payload: Vec<u8>,
    ) {
        let msg = HelperMessage::RemoteSignal(RemoteSignal {
            signal,
            action: action.to_string(),
            request_id,
            payload,
        });
        self.subscribers
            .lock()
            .retain(|_, tx| tx.send(msg.clone()).is_ok());
    }

    pub fn emit_debug(&self, level: DebugLevel, message: &str) {
        let current = self.current.lock().clone();
        let (action, request_id) = match current {
            Some(InFlight { action, request_id }) => (action, Some(request_id)),
            None => (String::new(), None),
        };
        self.emit(
            SignalType::DebugMessage,
            &action,
            request_id,
            protocol::debug_payload(level, message),
        );
    }

    /// Ignored unless `action` is the one running
    pub fn stop_action(&self, action: &str) {
        let running = self
            .current
            .lock()
            .as_ref()
            .is_some_and(|current| current.action == action);
        if running {
            self.stop_requested.store(true, Ordering::SeqCst);
            tracing::debug!("Stop requested for {}", action);
        } else {
            tracing::debug!("Ignoring stop for {}, it is not running", action);
        }
    }

    pub async fn perform_action(
        self: &Arc<Self>,
        peer: &PeerIdentity,
        request: PerformRequest,
    ) -> ActionReply {
        let Some(handlers) = self.handlers.clone() else {
            return ActionReply::no_responder_reply();
        };

        // Log only after the lock is released, log forwarding reads it
        let running = {
            let mut current = self.current.lock();
            match current.as_ref() {
                Some(running) => Some(running.action.clone()),
                None => {
                    *current = Some(InFlight {
                        action: request.action.clone(),
                        request_id: request.request_id,
                    });
                    None
                }
            }
        };
        if let Some(running) = running {
            tracing::debug!(
                "Refusing {} from {}: {} is still running",
                request.action,
                peer.connection_name,
                running
            );
            return ActionReply::helper_busy_reply();
        }

        let action = request.action.clone();
        let request_id = request.request_id;
        self.emit(
            SignalType::ActionStarted,
            &action,
            Some(request_id),
            Vec::new(),
        );

        if let Some(watchdog) = &self.watchdog {
            watchdog.pause();
        }
        let reply = self.run(&handlers, peer, request).await;
        if let Some(watchdog) = &self.watchdog {
            watchdog.resume();
        }

        let (reply, payload) = reply.into_encodable();
        self.emit(SignalType::ActionPerformed, &action, Some(request_id), payload);
        *self.current.lock() = None;
        self.stop_requested.store(false, Ordering::SeqCst);
        reply
    }

    async fn run(
        self: &Arc<Self>,
        handlers: &HandlerTable,
        peer: &PeerIdentity,
        request: PerformRequest,
    ) -> ActionReply {
        let arguments = match codec::decode_map(&request.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                return ActionReply::invalid_action_reply()
                    .with_description(format!("Malformed arguments: {}", e));
            }
        };

        if !self.is_caller_authorized(peer, &request).await {
            tracing::info!(
                "{} denied for {} (uid {:?})",
                request.action,
                peer.connection_name,
                peer.uid
            );
            return ActionReply::authorization_denied_reply();
        }

        let Some(handler) = handlers.resolve(&self.helper_id, &request.action) else {
            tracing::warn!("{} has no handler in {}", request.action, self.helper_id);
            return ActionReply::no_such_action_reply();
        };

        let ctx = HelperContext::new(
            self.clone(),
            request.action.clone(),
            request.request_id,
            peer.clone(),
        );
        match tokio::task::spawn_blocking(move || handler(&ctx, arguments)).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Handler for {} failed: {}", request.action, e);
                ActionReply::helper_error_reply()
                    .with_description(format!("Handler for {} failed: {}", request.action, e))
            }
        }
    }

    async fn is_caller_authorized(&self, peer: &PeerIdentity, request: &PerformRequest) -> bool {
        let method = self.backend.extra_caller_id_verification();
        if !method.verify(&request.caller_id, peer) {
            tracing::warn!(
                "Caller id presented by {} does not match the connection ({:?})",
                peer.connection_name,
                method
            );
            return false;
        }
        let details = self.backend.backend_details(&request.details);
        self.backend
            .is_caller_authorized(&request.action, &request.caller_id, &details)
            .await
    }
}
