//! Helper process side of the broker
//!
//! A helper registers under its id, serves `perform_action` requests one at
//! a time and exits after sitting idle for the configured timeout.

pub mod dispatcher;
pub mod handlers;
pub mod server;
pub mod watchdog;

pub use dispatcher::{Dispatcher, PerformRequest};
pub use handlers::{Handler, HandlerTable, HelperContext};
pub use server::HelperServer;
pub use watchdog::IdleWatchdog;

use std::sync::Arc;

use crate::backend::PolicyBackend;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::logging;

pub struct HelperOptions {
    pub helper_id: String,
    pub config: BrokerConfig,
    pub backend: Arc<dyn PolicyBackend>,
    /// `None` answers every request with a no-responder reply
    pub handlers: Option<HandlerTable>,
}

/// Register the helper and serve until the idle timeout fires.
///
/// Fails without serving anything when the id is already taken.
pub async fn run_helper(options: HelperOptions) -> Result<()> {
    ensure_home();

    let HelperOptions {
        helper_id,
        config,
        backend,
        handlers,
    } = options;

    let watchdog = Arc::new(IdleWatchdog::new(config.helper_idle_timeout));
    let dispatcher =
        Arc::new(Dispatcher::new(helper_id, backend, handlers).with_watchdog(watchdog.clone()));

    let server = HelperServer::bind(&config, dispatcher.clone())?;
    logging::forward_to(&dispatcher);

    let result = server.serve_until(watchdog.expired()).await;
    logging::stop_forwarding();
    result
}

/// Helpers started by activation may come up without `HOME`
fn ensure_home() {
    if std::env::var_os("HOME").is_some() {
        return;
    }
    if let Some(home) = dirs::home_dir() {
        tracing::debug!("Setting HOME to {}", home.display());
        std::env::set_var("HOME", home);
    }
}
