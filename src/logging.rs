//! Tracing setup
//!
//! Clients log to stderr through the usual fmt layer, keeping stdout for
//! their output. Helpers log to stderr
//! until they are serving; from then on every event is forwarded to the
//! subscribed clients as a `DebugMessage` signal instead.

use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::helper::Dispatcher;
use crate::transport::protocol::DebugLevel;

static FORWARD_TO: RwLock<Option<Weak<Dispatcher>>> = parking_lot::const_rwlock(None);

/// Targets whose events would be produced by forwarding itself
const SILENT_TARGETS: &[&str] = &["tungstenite", "tokio_tungstenite", "tokio"];

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into())
}

/// Subscriber for client programs. Does nothing if one is already set.
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

/// Subscriber for helper processes, see [`forward_to`]
pub fn init_helper(default_filter: &str) {
    let local = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(dynamic_filter_fn(|_, _| !is_forwarding()));
    let _ = tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(local)
        .with(RemoteLogLayer)
        .try_init();
}

/// Send log events to the clients of `dispatcher` from now on
pub fn forward_to(dispatcher: &Arc<Dispatcher>) {
    *FORWARD_TO.write() = Some(Arc::downgrade(dispatcher));
}

pub fn stop_forwarding() {
    *FORWARD_TO.write() = None;
}

pub fn is_forwarding() -> bool {
    forwarding_target().is_some()
}

fn forwarding_target() -> Option<Arc<Dispatcher>> {
    FORWARD_TO.read().as_ref().and_then(Weak::upgrade)
}

fn is_silent(target: &str) -> bool {
    SILENT_TARGETS
        .iter()
        .any(|prefix| target == *prefix || target.starts_with(&format!("{}::", prefix)))
}

/// Turns events into `DebugMessage` signals
pub struct RemoteLogLayer;

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_silent(metadata.target()) {
            return;
        }
        let Some(dispatcher) = forwarding_target() else {
            return;
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        dispatcher.emit_debug(DebugLevel::from(metadata.level()), &visitor.finish());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        format!("{} {}", self.message, self.fields.join(" "))
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}
