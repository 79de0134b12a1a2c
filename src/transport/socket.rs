//! Unix socket transport
//!
//! One WebSocket connection per helper id, opened on first use and reused
//! afterwards. When nothing listens on the helper's socket and a helper
//! directory is configured, the helper executable is started and the
//! connection retried until the activation timeout runs out.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::protocol::{self, ClientMessage, DebugLevel, HelperMessage, RemoteSignal, SignalType};
use super::{ActionRequest, HelperTransport, TransportEvent};
use crate::backend::PolicyBackend;
use crate::codec;
use crate::config::BrokerConfig;
use crate::reply::ActionReply;

const ACTIVATION_POLL: Duration = Duration::from_millis(50);

/// Transport talking to helpers over `<socket_dir>/<helper_id>.sock`
#[derive(Clone)]
pub struct SocketHelperTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    backend: Arc<dyn PolicyBackend>,
    events: broadcast::Sender<TransportEvent>,
    /// One lock per helper; the map lock is never held across a connect
    connections: Mutex<HashMap<String, ConnectionSlot>>,
    pending: Mutex<HashMap<Uuid, PendingCall>>,
}

type ConnectionSlot = Arc<tokio::sync::Mutex<Option<Connection>>>;

#[derive(Clone)]
struct Connection {
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    fn send(&self, msg: &ClientMessage) -> Result<(), String> {
        let frame = msg.to_frame().map_err(|e| e.to_string())?;
        self.tx
            .send(frame)
            .map_err(|_| "connection closed".to_string())
    }
}

/// A request waiting for its terminal reply
struct PendingCall {
    helper_id: String,
    action: String,
    /// `ActionPerformed` was already emitted for this ticket
    delivered: bool,
    done: Option<oneshot::Sender<()>>,
}

impl SocketHelperTransport {
    pub fn new(config: BrokerConfig, backend: Arc<dyn PolicyBackend>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                events,
                connections: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of requests still waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl HelperTransport for SocketHelperTransport {
    fn execute_action(&self, request: ActionRequest) {
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.perform(request).await });
            }
            Err(e) => {
                inner.emit(TransportEvent::ActionPerformed {
                    action: request.action,
                    request_id: Some(request.request_id),
                    reply: ActionReply::transport_error_reply(format!(
                        "no async runtime to contact the helper: {}",
                        e
                    )),
                });
            }
        }
    }

    fn stop_action(&self, action: &str, helper_id: &str) {
        let inner = self.inner.clone();
        let action = action.to_string();
        let helper_id = helper_id.to_string();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Cannot stop {}: no async runtime", action);
            return;
        };
        handle.spawn(async move {
            let slot = inner.connections.lock().get(&helper_id).cloned();
            let conn = match slot {
                Some(slot) => slot.lock().await.clone(),
                None => None,
            };
            match conn {
                Some(conn) => {
                    if let Err(e) = conn.send(&ClientMessage::StopAction {
                        action: action.clone(),
                    }) {
                        tracing::debug!("Stop request for {} not sent: {}", action, e);
                    }
                }
                None => tracing::debug!("No connection to {}, nothing to stop", helper_id),
            }
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn perform(self: Arc<Self>, request: ActionRequest) {
        let ActionRequest {
            request_id,
            action,
            helper_id,
            details,
            arguments,
            timeout: request_timeout,
        } = request;

        let arguments = match codec::encode_map(&arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                self.emit(TransportEvent::ActionPerformed {
                    reply: ActionReply::invalid_action_reply()
                        .with_description(format!("Arguments of {} cannot be sent: {}", action, e)),
                    action,
                    request_id: Some(request_id),
                });
                return;
            }
        };

        let conn = match self.connection(&helper_id).await {
            Ok(conn) => conn,
            Err(reply) => {
                self.emit(TransportEvent::ActionPerformed {
                    action,
                    request_id: Some(request_id),
                    reply,
                });
                return;
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id,
            PendingCall {
                helper_id: helper_id.clone(),
                action: action.clone(),
                delivered: false,
                done: Some(done_tx),
            },
        );

        let msg = ClientMessage::PerformAction {
            request_id,
            action: action.clone(),
            caller_id: self.backend.caller_id(),
            details,
            arguments,
        };
        if let Err(e) = conn.send(&msg) {
            self.complete(
                request_id,
                ActionReply::transport_error_reply(format!(
                    "could not contact the helper {}: {}",
                    helper_id, e
                )),
            );
            return;
        }

        let limit = request_timeout.unwrap_or(self.config.default_timeout);
        if timeout(limit, done_rx).await.is_err() {
            tracing::warn!("{} timed out after {:?}", action, limit);
            self.complete(
                request_id,
                ActionReply::transport_error_reply(format!(
                    "no reply from {} within {} ms",
                    helper_id,
                    limit.as_millis()
                )),
            );
        }
    }

    /// Delivers the terminal reply unless the signal already did
    fn complete(&self, request_id: Uuid, reply: ActionReply) {
        let mut pending = self.pending.lock();
        let Some(mut call) = pending.remove(&request_id) else {
            return;
        };
        if !call.delivered {
            self.emit(TransportEvent::ActionPerformed {
                action: call.action.clone(),
                request_id: Some(request_id),
                reply,
            });
        }
        if let Some(done) = call.done.take() {
            let _ = done.send(());
        }
    }

    fn connection_lost(&self, helper_id: &str) {
        let lost: Vec<Uuid> = self
            .pending
            .lock()
            .iter()
            .filter(|(_, call)| call.helper_id == helper_id)
            .map(|(id, _)| *id)
            .collect();
        for request_id in lost {
            self.complete(
                request_id,
                ActionReply::transport_error_reply(format!(
                    "connection to {} was lost",
                    helper_id
                )),
            );
        }
    }

    /// Connecting to one helper only blocks other requests for that helper
    async fn connection(self: &Arc<Self>, helper_id: &str) -> Result<Connection, ActionReply> {
        let slot = self
            .connections
            .lock()
            .entry(helper_id.to_string())
            .or_default()
            .clone();
        let mut slot = slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.tx.is_closed() {
                return Ok(conn.clone());
            }
        }

        let path = self
            .config
            .socket_path(helper_id)
            .map_err(|e| ActionReply::transport_error_reply(e.to_string()))?;
        let stream = match UnixStream::connect(&path).await {
            Ok(stream) => stream,
            Err(e) => self.activate(helper_id, &path, e).await?,
        };
        let conn = self.open(helper_id, stream).await.map_err(|e| {
            ActionReply::transport_error_reply(format!(
                "could not contact the helper {}: {}",
                helper_id, e
            ))
        })?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn activate(
        &self,
        helper_id: &str,
        path: &Path,
        cause: std::io::Error,
    ) -> Result<UnixStream, ActionReply> {
        let fail = |reason: String| {
            ActionReply::transport_error_reply(format!(
                "Service start {} failed: {}",
                helper_id, reason
            ))
        };
        let exe = match self.config.helper_executable(helper_id) {
            Ok(Some(exe)) => exe,
            Ok(None) => return Err(fail(cause.to_string())),
            Err(e) => return Err(fail(e.to_string())),
        };

        tracing::info!("Starting helper {} from {}", helper_id, exe.display());
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env("AUTHBROKER_SOCKET_DIR", &self.config.socket_dir)
            .process_group(0);
        cmd.spawn().map_err(|e| fail(e.to_string()))?;

        let deadline = Instant::now() + self.config.activation_timeout;
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if Instant::now() >= deadline => return Err(fail(e.to_string())),
                Err(_) => sleep(ACTIVATION_POLL).await,
            }
        }
    }

    /// WebSocket handshake and subscription, then the connection task
    async fn open(self: &Arc<Self>, helper_id: &str, stream: UnixStream) -> Result<Connection, String> {
        let (ws_stream, _) = tokio_tungstenite::client_async("ws://localhost/helper", stream)
            .await
            .map_err(|e| e.to_string())?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = ClientMessage::Subscribe.to_frame().map_err(|e| e.to_string())?;
        write.send(subscribe).await.map_err(|e| e.to_string())?;

        let handshake = async {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(e.to_string()),
                };
                match serde_json::from_str::<HelperMessage>(&text) {
                    Ok(HelperMessage::Connected { connection, .. }) => {
                        tracing::debug!("Connected to {} as {}", helper_id, connection);
                    }
                    Ok(HelperMessage::Subscribed) => return Ok(()),
                    Ok(HelperMessage::Error { message }) => return Err(message),
                    Ok(_) => continue,
                    Err(e) => return Err(format!("invalid message from helper: {}", e)),
                }
            }
            Err("connection closed during subscription".to_string())
        };
        timeout(self.config.activation_timeout, handshake)
            .await
            .map_err(|_| "subscription timed out".to_string())??;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let inner = self.clone();
        let helper = helper_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = out_rx.recv() => {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<HelperMessage>(&text) {
                                Ok(msg) => inner.handle_message(&helper, msg),
                                Err(e) => {
                                    tracing::warn!("Failed to parse message: {} - {}", e, text);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {}", e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                }
            }
            drop(out_rx);
            tracing::debug!("Connection to {} closed", helper);
            inner.connection_lost(&helper);
        });

        Ok(Connection { tx: out_tx })
    }

    fn handle_message(&self, helper_id: &str, msg: HelperMessage) {
        match msg {
            HelperMessage::ActionReply { request_id, reply } => {
                let reply = ActionReply::deserialize(&reply).unwrap_or_else(|e| {
                    ActionReply::transport_error_reply(format!("malformed reply: {}", e))
                });
                self.complete(request_id, reply);
            }
            HelperMessage::RemoteSignal(signal) => self.handle_signal(signal),
            HelperMessage::Error { message } => {
                tracing::warn!("Helper {} reported: {}", helper_id, message);
            }
            HelperMessage::Connected { .. } | HelperMessage::Subscribed => {}
        }
    }

    fn handle_signal(&self, signal: RemoteSignal) {
        let RemoteSignal {
            signal,
            action,
            request_id,
            payload,
        } = signal;

        match signal {
            SignalType::ActionStarted => {
                self.emit(TransportEvent::ActionStarted { action, request_id });
            }
            SignalType::ActionPerformed => {
                let Some(id) = request_id else {
                    return;
                };
                let reply = ActionReply::deserialize(&payload).unwrap_or_else(|e| {
                    ActionReply::transport_error_reply(format!("malformed reply: {}", e))
                });
                let mut pending = self.pending.lock();
                if let Some(call) = pending.get_mut(&id) {
                    if !call.delivered {
                        call.delivered = true;
                        self.emit(TransportEvent::ActionPerformed {
                            action,
                            request_id: Some(id),
                            reply,
                        });
                    }
                }
            }
            SignalType::DebugMessage => match protocol::parse_debug(&payload) {
                Ok((DebugLevel::Debug, message)) => {
                    tracing::debug!("Debug message from helper: {}", message)
                }
                Ok((DebugLevel::Info, message)) => {
                    tracing::info!("Debug message from helper: {}", message)
                }
                Ok((DebugLevel::Warning, message)) => {
                    tracing::warn!("Debug message from helper: {}", message)
                }
                Ok((DebugLevel::Critical, message)) => {
                    tracing::error!("Debug message from helper: {}", message)
                }
                Err(e) => tracing::warn!("Unreadable debug message from helper: {}", e),
            },
            SignalType::ProgressStepIndicator => match protocol::parse_progress_step(&payload) {
                Ok(percent) => self.emit(TransportEvent::ProgressStep {
                    action,
                    request_id,
                    percent,
                }),
                Err(e) => tracing::warn!("Bad progress step for {}: {}", action, e),
            },
            SignalType::ProgressStepData => match protocol::parse_progress_data(&payload) {
                Ok(data) => self.emit(TransportEvent::ProgressStepData {
                    action,
                    request_id,
                    data,
                }),
                Err(e) => tracing::warn!("Bad progress data for {}: {}", action, e),
            },
        }
    }
}
