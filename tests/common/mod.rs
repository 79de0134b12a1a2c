//! Shared fixtures: a scripted policy backend and an in-process helper

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use authbroker::backend::{Capabilities, Capability, PolicyBackend, StatusChange};
use authbroker::helper::{Dispatcher, HandlerTable, HelperServer};
use authbroker::job::JobEvent;
use authbroker::transport::SocketHelperTransport;
use authbroker::{Action, ActionReply, AuthStatus, Broker, BrokerConfig, ExecuteJob, VariantMap};

pub const HELPER_ID: &str = "org.example.autotest";

const CALLER_ID: &[u8] = b"a random caller Id";

/// Policy backend with hard-wired answers for a handful of action names
pub struct TestBackend {
    caller_id: Vec<u8>,
    statuses: Mutex<HashMap<String, AuthStatus>>,
    capabilities: AtomicU32,
    status_tx: broadcast::Sender<StatusChange>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::with_caller_id(CALLER_ID)
    }

    /// A client presenting some other identity to the helper
    pub fn with_caller_id(caller_id: &[u8]) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        let capabilities = Capabilities::new()
            .with(Capability::AuthorizeFromHelper)
            .with(Capability::CheckActionExistence);
        Self {
            caller_id: caller_id.to_vec(),
            statuses: Mutex::new(HashMap::new()),
            capabilities: AtomicU32::new(capabilities.bits()),
            status_tx,
        }
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        self.capabilities
            .store(capabilities.bits(), Ordering::SeqCst);
    }

    fn set_status(&self, action: &str, status: AuthStatus) {
        self.statuses.lock().insert(action.to_string(), status);
        let _ = self.status_tx.send(StatusChange {
            action: action.to_string(),
            status,
        });
    }
}

#[async_trait]
impl PolicyBackend for TestBackend {
    fn name(&self) -> &str {
        "test"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::from_bits(self.capabilities.load(Ordering::SeqCst))
    }

    fn setup_action(&self, action: &str) {
        let status = match action {
            "doomed.to.fail" => AuthStatus::Denied,
            "requires.auth" | "generates.error" => AuthStatus::AuthRequired,
            "always.authorized" => AuthStatus::Authorized,
            _ if action.starts_with(HELPER_ID) => AuthStatus::AuthRequired,
            _ => return,
        };
        self.statuses.lock().insert(action.to_string(), status);
    }

    async fn authorize_action(&self, action: &str) -> AuthStatus {
        if action == "doomed.to.fail" {
            AuthStatus::Denied
        } else {
            AuthStatus::Authorized
        }
    }

    fn action_status(&self, action: &str) -> AuthStatus {
        self.statuses
            .lock()
            .get(action)
            .copied()
            .unwrap_or(AuthStatus::Invalid)
    }

    fn caller_id(&self) -> Vec<u8> {
        self.caller_id.clone()
    }

    async fn is_caller_authorized(
        &self,
        action: &str,
        caller_id: &[u8],
        _details: &VariantMap,
    ) -> bool {
        match action {
            "doomed.to.fail" => false,
            "requires.auth" => {
                self.set_status(action, AuthStatus::Authorized);
                true
            }
            "generates.error" => {
                self.set_status(action, AuthStatus::Error);
                false
            }
            "always.authorized" => true,
            _ if action.starts_with(HELPER_ID) => {
                if caller_id == self.caller_id.as_slice() {
                    self.set_status(action, AuthStatus::Authorized);
                    true
                } else {
                    self.set_status(action, AuthStatus::Denied);
                    false
                }
            }
            _ => false,
        }
    }

    fn action_exists(&self, action: &str) -> bool {
        matches!(
            action,
            "doomed.to.fail"
                | "requires.auth"
                | "generates.error"
                | "always.authorized"
                | "/safinvalid124%$&"
        ) || action.starts_with(HELPER_ID)
    }

    fn status_changes(&self) -> Option<broadcast::Receiver<StatusChange>> {
        Some(self.status_tx.subscribe())
    }
}

/// Handlers of the test helper
pub fn test_handlers() -> HandlerTable {
    HandlerTable::new()
        .register("echoaction", |_, args| {
            ActionReply::success_reply().with_data(args)
        })
        .register("standardaction", |_, args| {
            let fail = args.get("fail").and_then(|v| v.as_bool()).unwrap_or(false);
            if fail {
                ActionReply::helper_error_reply()
            } else {
                ActionReply::success_reply()
            }
        })
        .register("longaction", |ctx, _| {
            for i in 1..=100 {
                if ctx.is_stopped() {
                    break;
                }
                if i == 50 {
                    let mut data = VariantMap::new();
                    data.insert("Answer".to_string(), 42.into());
                    ctx.progress_data(&data);
                }
                ctx.progress_step(i);
                std::thread::sleep(Duration::from_millis(20));
            }
            ActionReply::success_reply()
        })
        .register("failingaction", |_, _| ActionReply::helper_error_reply())
}

/// A helper served in-process from a temporary socket directory
pub struct TestHelper {
    pub dir: TempDir,
    pub config: BrokerConfig,
    pub backend: Arc<TestBackend>,
    pub dispatcher: Arc<Dispatcher>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<authbroker::Result<()>>>,
}

impl TestHelper {
    pub async fn start() -> Self {
        Self::start_with(Some(test_handlers())).await
    }

    pub async fn start_with(handlers: Option<HandlerTable>) -> Self {
        let backend = Arc::new(TestBackend::new());
        Self::start_with_policy(backend.clone(), backend, handlers).await
    }

    /// Helper deciding with `policy`; `backend` is what `broker()` clients use
    pub async fn start_with_policy(
        policy: Arc<dyn PolicyBackend>,
        backend: Arc<TestBackend>,
        handlers: Option<HandlerTable>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            socket_dir: dir.path().to_path_buf(),
            default_timeout: Duration::from_secs(10),
            activation_timeout: Duration::from_secs(2),
            ..BrokerConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(HELPER_ID, policy, handlers));
        let server = HelperServer::bind(&config, dispatcher.clone()).unwrap();

        let (shutdown, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_until(async {
            let _ = stopped.await;
        }));

        Self {
            dir,
            config,
            backend,
            dispatcher,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Client side sharing the helper's backend
    pub fn broker(&self) -> Broker {
        self.broker_with(self.backend.clone())
    }

    pub fn broker_with(&self, backend: Arc<dyn PolicyBackend>) -> Broker {
        let transport = SocketHelperTransport::new(self.config.clone(), backend.clone());
        Broker::new(backend, Arc::new(transport))
    }

    /// `org.example.autotest.<suffix>` bound to this helper
    pub fn action(&self, broker: &Broker, suffix: &str) -> Action {
        broker
            .action(format!("{}.{}", HELPER_ID, suffix))
            .with_helper_id(HELPER_ID)
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }
}

impl Drop for TestHelper {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Runs the job to completion, returning every event it published
pub async fn run_collecting(job: &ExecuteJob) -> Vec<JobEvent> {
    let mut rx = job.subscribe();
    assert!(job.start());
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(20), rx.recv()).await {
            Ok(Ok(event)) => {
                let done = matches!(event, JobEvent::Result(_));
                events.push(event);
                if done {
                    return events;
                }
            }
            Ok(Err(e)) => panic!("job events closed: {}", e),
            Err(_) => panic!("job did not finish, got {} events", events.len()),
        }
    }
}
