//! Helper-side socket server

use futures::{SinkExt, StreamExt};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::dispatcher::{Dispatcher, PerformRequest};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::transport::protocol::{ClientMessage, HelperMessage};
use crate::transport::PeerIdentity;

/// Listens on `<socket_dir>/<helper_id>.sock`. The socket file is removed
/// when the server is dropped.
///
/// `<helper_id>.lock` next to the socket is held locked for the server's
/// lifetime, so only one process at a time can own the socket path.
pub struct HelperServer {
    listener: UnixListener,
    path: PathBuf,
    _lock: File,
    dispatcher: Arc<Dispatcher>,
    next_connection: AtomicU64,
}

impl HelperServer {
    /// Must be called from within a tokio runtime
    pub fn bind(config: &BrokerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let helper_id = dispatcher.helper_id().to_string();
        let path = config.socket_path(&helper_id)?;
        std::fs::create_dir_all(&config.socket_dir)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.with_extension("lock"))?;
        if !try_lock_exclusive(&lock)? {
            return Err(BrokerError::AlreadyRegistered(helper_id));
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(BrokerError::AlreadyRegistered(helper_id));
            }
            tracing::debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::info!("Helper {} listening on {}", helper_id, path.display());
        Ok(Self {
            listener,
            path,
            _lock: lock,
            dispatcher,
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Helper {} shutting down", self.dispatcher.helper_id());
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    if let Some(watchdog) = self.dispatcher.watchdog() {
                        watchdog.kick();
                    }
                    let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(handle_connection(self.dispatcher.clone(), stream, id));
                }
            }
        }
    }
}

impl Drop for HelperServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// `Ok(false)` when another open file description holds the lock
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

fn peer_identity(stream: &UnixStream, id: u64) -> PeerIdentity {
    let cred = stream.peer_cred().ok();
    PeerIdentity {
        connection_name: format!(":1.{}", id),
        uid: cred.map(|c| c.uid()),
        pid: cred.and_then(|c| c.pid()),
    }
}

async fn handle_connection(dispatcher: Arc<Dispatcher>, stream: UnixStream, id: u64) {
    let peer = peer_identity(&stream, id);
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket handshake with {} failed: {}", peer.connection_name, e);
            return;
        }
    };
    let (mut sender, mut receiver) = ws.split();

    // Replies and signals share this queue so they reach the client in order
    let (tx, mut rx) = mpsc::unbounded_channel::<HelperMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!("Failed to encode message: {}", e);
                    continue;
                }
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(HelperMessage::Connected {
        helper_id: dispatcher.helper_id().to_string(),
        connection: peer.connection_name.clone(),
    });
    tracing::debug!("Client {} connected (uid {:?})", peer.connection_name, peer.uid);

    let mut subscribed = false;
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket error from {}: {}", peer.connection_name, e);
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                let _ = tx.send(HelperMessage::Error {
                    message: format!("Invalid message: {}", e),
                });
                continue;
            }
        };

        match client_msg {
            ClientMessage::Subscribe => {
                if !subscribed {
                    dispatcher.subscribe(id, tx.clone());
                    subscribed = true;
                }
                let _ = tx.send(HelperMessage::Subscribed);
            }
            ClientMessage::PerformAction {
                request_id,
                action,
                caller_id,
                details,
                arguments,
            } => {
                let dispatcher = dispatcher.clone();
                let peer = peer.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let request = PerformRequest {
                        request_id,
                        action,
                        caller_id,
                        details,
                        arguments,
                    };
                    let reply = dispatcher.perform_action(&peer, request).await;
                    let (_, reply) = reply.into_encodable();
                    let _ = tx.send(HelperMessage::ActionReply { request_id, reply });
                });
            }
            ClientMessage::StopAction { action } => dispatcher.stop_action(&action),
        }
    }

    dispatcher.unsubscribe(id);
    drop(tx);
    let _ = writer.await;
    tracing::debug!("Client {} disconnected", peer.connection_name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;
    use tokio_test::assert_ok;

    fn config(dir: &Path) -> BrokerConfig {
        BrokerConfig {
            socket_dir: dir.to_path_buf(),
            ..BrokerConfig::default()
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            "org.example.server",
            Arc::new(FakeBackend::new()),
            None,
        ))
    }

    #[tokio::test]
    async fn test_second_bind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = assert_ok!(HelperServer::bind(&config(dir.path()), dispatcher()));
        assert!(first.path().exists());

        match HelperServer::bind(&config(dir.path()), dispatcher()) {
            Err(BrokerError::AlreadyRegistered(id)) => assert_eq!(id, "org.example.server"),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("second bind succeeded"),
        }
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("org.example.server.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = assert_ok!(HelperServer::bind(&config(dir.path()), dispatcher()));
        assert_eq!(server.path(), path.as_path());
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_locked_helper_id_is_rejected_without_touching_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("org.example.server.sock");
        // Another process is between taking the lock and binding
        let held = File::create(dir.path().join("org.example.server.lock")).unwrap();
        assert!(try_lock_exclusive(&held).unwrap());
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        match HelperServer::bind(&config(dir.path()), dispatcher()) {
            Err(BrokerError::AlreadyRegistered(id)) => assert_eq!(id, "org.example.server"),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("bind succeeded while the lock was held"),
        }
        assert!(path.exists());

        drop(held);
        let server = assert_ok!(HelperServer::bind(&config(dir.path()), dispatcher()));
        assert_eq!(server.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_serve_until_returns_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = HelperServer::bind(&config(dir.path()), dispatcher()).unwrap();
        assert_ok!(server.serve_until(async {}).await);
    }
}
