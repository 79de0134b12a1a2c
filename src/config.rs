//! Broker configuration
//!
//! Values come from `AUTHBROKER_*` environment variables, falling back to
//! defaults suitable for a system-wide installation.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BrokerError, Result};

pub const DEFAULT_SOCKET_DIR: &str = "/run/authbroker";
pub const DEFAULT_TIMEOUT_MS: u64 = 25_000;
pub const DEFAULT_ACTIVATION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HELPER_IDLE_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory holding one `<helper_id>.sock` per running helper
    pub socket_dir: PathBuf,
    /// Directory of helper executables for on-demand activation
    pub helper_dir: Option<PathBuf>,
    pub backend_search_path: Vec<String>,
    pub transport_search_path: Vec<String>,
    /// Rules for the `static` backend, `name=status;...`
    pub static_policy: Option<String>,
    pub default_timeout: Duration,
    pub activation_timeout: Duration,
    pub helper_idle_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            helper_dir: None,
            backend_search_path: vec!["static".to_string()],
            transport_search_path: vec!["socket".to_string()],
            static_policy: None,
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            activation_timeout: Duration::from_millis(DEFAULT_ACTIVATION_TIMEOUT_MS),
            helper_idle_timeout: Duration::from_millis(DEFAULT_HELPER_IDLE_MS),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("AUTHBROKER_SOCKET_DIR") {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("AUTHBROKER_HELPER_DIR") {
            config.helper_dir = Some(PathBuf::from(dir));
        }
        if let Some(list) = get("AUTHBROKER_BACKENDS") {
            config.backend_search_path = split_list(&list);
        }
        if let Some(list) = get("AUTHBROKER_TRANSPORTS") {
            config.transport_search_path = split_list(&list);
        }
        config.static_policy = get("AUTHBROKER_STATIC_POLICY");
        if let Some(ms) = get("AUTHBROKER_DEFAULT_TIMEOUT_MS") {
            config.default_timeout = parse_millis("AUTHBROKER_DEFAULT_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = get("AUTHBROKER_ACTIVATION_TIMEOUT_MS") {
            config.activation_timeout = parse_millis("AUTHBROKER_ACTIVATION_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = get("AUTHBROKER_HELPER_IDLE_MS") {
            config.helper_idle_timeout = parse_millis("AUTHBROKER_HELPER_IDLE_MS", &ms)?;
        }

        Ok(config)
    }

    pub fn socket_path(&self, helper_id: &str) -> Result<PathBuf> {
        validate_helper_id(helper_id)?;
        Ok(self.socket_dir.join(format!("{}.sock", helper_id)))
    }

    pub fn helper_executable(&self, helper_id: &str) -> Result<Option<PathBuf>> {
        validate_helper_id(helper_id)?;
        Ok(self.helper_dir.as_ref().map(|dir| dir.join(helper_id)))
    }

    /// `-1` (or any negative value) selects the default timeout
    pub fn action_timeout(&self, timeout_ms: i32) -> Duration {
        u64::try_from(timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }
}

/// Helper ids end up in file names
pub fn validate_helper_id(helper_id: &str) -> Result<()> {
    let valid = !helper_id.is_empty()
        && !helper_id.starts_with('.')
        && helper_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidHelperId(helper_id.to_string()))
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| BrokerError::Config(format!("{} must be milliseconds: {}", key, e)))
}
