//! Execute jobs
//!
//! An [`ExecuteJob`] drives one action through authorization and, when the
//! action names a helper, through remote execution. Progress and the final
//! result are published as [`JobEvent`]s; the result is also available from
//! [`ExecuteJob::wait`] no matter when the caller starts waiting.
//!
//! Calling `start` a second time does nothing and returns `false`. The
//! result is produced exactly once, including for killed jobs.

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::action::{Action, AuthStatus, ExecutionMode, VariantMap};
use crate::backend::{AuthorizationStrategy, StatusChange};
use crate::broker::Broker;
use crate::reply::ActionReply;
use crate::transport::{ActionRequest, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Started,
    Authorizing,
    Executing,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillVerbosity {
    /// Finish without a `Result` event
    Quietly,
    EmitResult,
}

/// Final outcome of a job
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobResult {
    /// Zero on success, otherwise the reply's error code
    pub error: i32,
    pub error_text: String,
    pub data: VariantMap,
}

impl JobResult {
    fn from_reply(reply: &ActionReply) -> Self {
        if reply.failed() {
            Self {
                error: reply.error(),
                error_text: reply.error_description().to_string(),
                data: VariantMap::new(),
            }
        } else {
            Self {
                error: 0,
                error_text: String::new(),
                data: reply.data().clone(),
            }
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error == 0
    }
}

/// Events published by a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Result(JobResult),
    PercentChanged(u32),
    NewData(VariantMap),
    StatusChanged(AuthStatus),
}

/// Handle to one execution of an action
#[derive(Clone)]
pub struct ExecuteJob {
    shared: Arc<JobShared>,
}

struct JobShared {
    ticket: Uuid,
    action: Action,
    mode: Option<ExecutionMode>,
    broker: Broker,
    inner: Mutex<JobInner>,
    events: broadcast::Sender<JobEvent>,
    result: watch::Sender<Option<JobResult>>,
    killed: watch::Sender<bool>,
    /// Backend status notifications, subscribed when the job starts
    status_rx: Mutex<Option<broadcast::Receiver<StatusChange>>>,
    created_at: DateTime<Utc>,
}

struct JobInner {
    state: JobState,
    percent: u32,
    result: JobResult,
    completed_at: Option<DateTime<Utc>>,
}

impl ExecuteJob {
    pub fn new(action: Action, mode: ExecutionMode, broker: Broker) -> Self {
        Self::build(action, Some(mode), broker)
    }

    /// Mode given as its numeric value; unknown values fail when started
    pub fn with_raw_mode(action: Action, mode: u32, broker: Broker) -> Self {
        Self::build(action, ExecutionMode::from_raw(mode), broker)
    }

    fn build(action: Action, mode: Option<ExecutionMode>, broker: Broker) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (result, _) = watch::channel(None);
        let (killed, _) = watch::channel(false);
        Self {
            shared: Arc::new(JobShared {
                ticket: Uuid::new_v4(),
                action,
                mode,
                broker,
                inner: Mutex::new(JobInner {
                    state: JobState::Created,
                    percent: 0,
                    result: JobResult::default(),
                    completed_at: None,
                }),
                events,
                result,
                killed,
                status_rx: Mutex::new(None),
                created_at: Utc::now(),
            }),
        }
    }

    /// Ticket attached to the helper request
    pub fn id(&self) -> Uuid {
        self.shared.ticket
    }

    pub fn action(&self) -> &Action {
        &self.shared.action
    }

    pub fn mode(&self) -> Option<ExecutionMode> {
        self.shared.mode
    }

    pub fn state(&self) -> JobState {
        self.shared.inner.lock().state
    }

    pub fn percent(&self) -> u32 {
        self.shared.inner.lock().percent
    }

    pub fn error(&self) -> i32 {
        self.shared.inner.lock().result.error
    }

    pub fn error_text(&self) -> String {
        self.shared.inner.lock().result.error_text.clone()
    }

    pub fn data(&self) -> VariantMap {
        self.shared.inner.lock().result.data.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.shared.inner.lock().completed_at
    }

    /// Subscribe before `start` to see every event
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> impl Stream<Item = JobEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok())
    }

    /// Returns `false` if the job was already started
    pub fn start(&self) -> bool {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != JobState::Created {
                tracing::warn!(
                    "Job for {} was already started, ignoring",
                    self.shared.action.name()
                );
                return false;
            }
            inner.state = JobState::Started;
        }

        let shared = self.shared.clone();
        *shared.status_rx.lock() = shared.broker.backend().status_changes();
        if !shared.broker.is_valid(&shared.action) {
            shared.finish(
                ActionReply::invalid_action_reply()
                    .with_description("Tried to start an invalid action"),
                true,
            );
            return true;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.run().await });
            }
            Err(e) => {
                shared.finish(
                    ActionReply::backend_error_reply()
                        .with_description(format!("No async runtime to run the job: {}", e)),
                    true,
                );
            }
        }
        true
    }

    /// Resolves once the job completed
    pub async fn wait(&self) -> JobResult {
        let mut rx = self.shared.result.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        outcome.unwrap_or_else(|| self.shared.inner.lock().result.clone())
    }

    /// Start and wait
    pub async fn exec(&self) -> JobResult {
        self.start();
        self.wait().await
    }

    /// Ask the helper to stop and finish the job as killed. The helper is
    /// not forced to stop; its eventual reply is ignored. Only a job that
    /// is executing on its helper sends the stop request.
    pub fn kill(&self, verbosity: KillVerbosity) -> bool {
        let action = &self.shared.action;
        if action.has_helper() && self.state() == JobState::Executing {
            self.shared
                .broker
                .transport()
                .stop_action(action.name(), action.helper_id());
        }
        self.shared.finish(
            ActionReply::killed_reply().with_description("The job was killed"),
            verbosity == KillVerbosity::EmitResult,
        );
        let _ = self.shared.killed.send(true);
        true
    }
}

impl JobShared {
    fn set_state(&self, state: JobState) {
        let mut inner = self.inner.lock();
        if inner.state != JobState::Completed {
            inner.state = state;
        }
    }

    fn is_completed(&self) -> bool {
        self.inner.lock().state == JobState::Completed
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Returns `false` if the job had already completed
    fn finish(&self, reply: ActionReply, emit: bool) -> bool {
        let result = JobResult::from_reply(&reply);
        {
            let mut inner = self.inner.lock();
            if inner.state == JobState::Completed {
                return false;
            }
            inner.state = JobState::Completed;
            inner.result = result.clone();
            inner.completed_at = Some(Utc::now());
        }

        let mut status_rx = self.status_rx.lock().take();
        self.forward_pending_status(&mut status_rx);

        if result.succeeded() {
            tracing::debug!("{} finished", self.action.name());
        } else {
            tracing::debug!(
                "{} failed with {}: {}",
                self.action.name(),
                result.error,
                result.error_text
            );
        }
        if emit {
            self.emit(JobEvent::Result(result.clone()));
        }
        self.result.send_replace(Some(result));
        true
    }

    fn set_percent(&self, percent: i32) {
        let percent = percent.clamp(0, 100) as u32;
        {
            let mut inner = self.inner.lock();
            if inner.state == JobState::Completed || inner.percent == percent {
                return;
            }
            inner.percent = percent;
        }
        self.emit(JobEvent::PercentChanged(percent));
    }

    fn forward_status(&self, change: StatusChange) {
        if change.action == self.action.name() {
            self.emit(JobEvent::StatusChanged(change.status));
        }
    }

    /// Forwards notifications already queued without waiting for more
    fn forward_pending_status(&self, rx: &mut Option<broadcast::Receiver<StatusChange>>) {
        let Some(receiver) = rx.as_mut() else {
            return;
        };
        loop {
            match receiver.try_recv() {
                Ok(change) => self.forward_status(change),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    async fn run(self: Arc<Self>) {
        match self.mode {
            Some(ExecutionMode::Execute) => self.run_execute().await,
            Some(ExecutionMode::AuthorizeOnly) => self.run_authorize_only().await,
            None => {
                self.finish(
                    ActionReply::invalid_action_reply()
                        .with_description("Unknown execution mode chosen"),
                    true,
                );
            }
        }
    }

    async fn run_execute(&self) {
        let backend = self.broker.backend().clone();
        let name = self.action.name();

        match backend.capabilities().strategy() {
            AuthorizationStrategy::FromClient { pre_auth } => {
                self.set_state(JobState::Authorizing);
                if pre_auth {
                    backend.pre_auth_action(name, self.action.parent_window());
                }
                let status = backend.authorize_action(name).await;
                tracing::debug!("Client-side authorization of {}: {}", name, status);
                match status {
                    AuthStatus::Authorized if self.action.has_helper() => self.dispatch().await,
                    AuthStatus::Authorized => {
                        self.finish(ActionReply::success_reply(), true);
                    }
                    AuthStatus::Denied => {
                        self.finish(ActionReply::authorization_denied_reply(), true);
                    }
                    AuthStatus::Invalid => {
                        self.finish(ActionReply::invalid_action_reply(), true);
                    }
                    AuthStatus::UserCancelled => {
                        self.finish(ActionReply::user_cancelled_reply(), true);
                    }
                    _ => {
                        self.finish(
                            ActionReply::backend_error_reply().with_description(
                                "Unknown status for the authentication procedure",
                            ),
                            true,
                        );
                    }
                }
            }
            AuthorizationStrategy::FromHelper { pre_auth } => {
                if pre_auth {
                    backend.pre_auth_action(name, self.action.parent_window());
                }
                if self.action.has_helper() {
                    self.dispatch().await;
                } else {
                    self.finish(
                        ActionReply::invalid_action_reply().with_description(
                            "The current backend only allows helper authorization, \
                             but this action does not have a helper.",
                        ),
                        true,
                    );
                }
            }
            AuthorizationStrategy::Unspecified => {
                self.finish(
                    ActionReply::backend_error_reply()
                        .with_description("The backend does not specify how to authorize"),
                    true,
                );
            }
        }
    }

    async fn run_authorize_only(&self) {
        let backend = self.broker.backend().clone();
        let name = self.action.name();

        let mut status = self.broker.status(&self.action);
        if status == AuthStatus::AuthRequired {
            match backend.capabilities().strategy() {
                AuthorizationStrategy::FromClient { pre_auth } => {
                    self.set_state(JobState::Authorizing);
                    if pre_auth {
                        backend.pre_auth_action(name, self.action.parent_window());
                    }
                    status = backend.authorize_action(name).await;
                }
                // The helper decides at execution time
                AuthorizationStrategy::FromHelper { .. } => status = AuthStatus::Authorized,
                AuthorizationStrategy::Unspecified => {
                    self.finish(
                        ActionReply::backend_error_reply()
                            .with_description("The backend does not specify how to authorize"),
                        true,
                    );
                    return;
                }
            }
        }

        let reply = if status == AuthStatus::Authorized {
            ActionReply::success_reply()
        } else {
            ActionReply::authorization_denied_reply()
        };
        self.finish(reply, true);
    }

    async fn dispatch(&self) {
        if self.is_completed() {
            return;
        }
        self.set_state(JobState::Executing);

        let name = self.action.name();
        let transport = self.broker.transport().clone();
        let mut transport_rx = transport.subscribe();
        // Handed back before finishing so `finish` flushes what is queued
        let mut status_rx = self.status_rx.lock().take();
        let mut killed_rx = self.killed.subscribe();
        if *killed_rx.borrow() {
            return;
        }

        tracing::debug!(
            "Executing {} on helper {}",
            name,
            self.action.helper_id()
        );
        transport.execute_action(ActionRequest {
            request_id: self.ticket,
            action: name.to_string(),
            helper_id: self.action.helper_id().to_string(),
            details: self.action.details().clone(),
            arguments: self.action.arguments().clone(),
            timeout: u64::try_from(self.action.timeout())
                .ok()
                .map(Duration::from_millis),
        });

        loop {
            tokio::select! {
                biased;
                _ = killed_rx.changed() => return,
                Some(change) = next_status(&mut status_rx) => self.forward_status(change),
                event = transport_rx.recv() => match event {
                    Ok(event) if event.concerns(name, self.ticket) => {
                        if matches!(event, TransportEvent::ActionPerformed { .. }) {
                            *self.status_rx.lock() = status_rx.take();
                        }
                        if self.on_transport_event(event) {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("{} missed {} transport events", name, missed);
                    }
                    Err(RecvError::Closed) => {
                        *self.status_rx.lock() = status_rx.take();
                        self.finish(
                            ActionReply::transport_error_reply("The helper transport went away"),
                            true,
                        );
                        return;
                    }
                },
            }
        }
    }

    /// Returns `true` on the terminal event
    fn on_transport_event(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::ActionStarted { action, .. } => {
                tracing::debug!("{} started on the helper", action);
                false
            }
            TransportEvent::ProgressStep { percent, .. } => {
                self.set_percent(percent);
                false
            }
            TransportEvent::ProgressStepData { data, .. } => {
                if !self.is_completed() {
                    self.emit(JobEvent::NewData(data));
                }
                false
            }
            TransportEvent::ActionPerformed { reply, .. } => {
                self.finish(reply, true);
                true
            }
        }
    }
}

async fn next_status(rx: &mut Option<broadcast::Receiver<StatusChange>>) -> Option<StatusChange> {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(change) => return Some(change),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => *rx = None,
        }
    }
}
