//! authbroker CLI - query and run actions through the broker

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;

use authbroker::{
    Action, AuthDetail, BackendRegistry, Broker, BrokerConfig, ExecutionMode, JobEvent,
    KillVerbosity, VariantMap,
};

#[derive(Parser)]
#[command(name = "authbroker-cli")]
#[command(about = "Query and run privileged actions through the authorization broker")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

/// Broker configuration; unset options keep the built-in defaults
#[derive(Args, Debug, Default)]
struct Settings {
    /// Directory of helper sockets
    #[arg(long, global = true, env = "AUTHBROKER_SOCKET_DIR")]
    socket_dir: Option<PathBuf>,

    /// Directory of helper executables started on demand
    #[arg(long, global = true, env = "AUTHBROKER_HELPER_DIR")]
    helper_dir: Option<PathBuf>,

    /// Policy backends to try, in order
    #[arg(long, global = true, env = "AUTHBROKER_BACKENDS", value_delimiter = ',')]
    backends: Vec<String>,

    /// Helper transports to try, in order
    #[arg(long, global = true, env = "AUTHBROKER_TRANSPORTS", value_delimiter = ',')]
    transports: Vec<String>,

    /// Rules for the static backend, `name=status;...`
    #[arg(long, global = true, env = "AUTHBROKER_STATIC_POLICY")]
    static_policy: Option<String>,

    /// Reply timeout for actions that do not set one
    #[arg(long, global = true, env = "AUTHBROKER_DEFAULT_TIMEOUT_MS")]
    default_timeout_ms: Option<u64>,

    /// How long to wait for a helper started on demand
    #[arg(long, global = true, env = "AUTHBROKER_ACTIVATION_TIMEOUT_MS")]
    activation_timeout_ms: Option<u64>,
}

impl Settings {
    fn config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::default();
        if let Some(dir) = &self.socket_dir {
            config.socket_dir = dir.clone();
        }
        if self.helper_dir.is_some() {
            config.helper_dir = self.helper_dir.clone();
        }
        if !self.backends.is_empty() {
            config.backend_search_path = self.backends.clone();
        }
        if !self.transports.is_empty() {
            config.transport_search_path = self.transports.clone();
        }
        if self.static_policy.is_some() {
            config.static_policy = self.static_policy.clone();
        }
        if let Some(ms) = self.default_timeout_ms {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.activation_timeout_ms {
            config.activation_timeout = Duration::from_millis(ms);
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the authorization status of an action
    Status {
        /// Action name, e.g. org.example.demo.read
        action: String,
    },

    /// Run an action
    Exec {
        /// Action name
        action: String,

        /// Helper id serving the action
        #[arg(long)]
        helper: Option<String>,

        /// Argument as key=value, value parsed as JSON when possible
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Message shown by the backend when asking for authorization
        #[arg(short, long)]
        message: Option<String>,

        /// Timeout in milliseconds
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        timeout: i32,

        /// Only check whether the action would be authorized
        #[arg(long)]
        authorize_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    authbroker::logging::init("authbroker=info");

    let cli = Cli::parse();
    let registry = BackendRegistry::new(cli.settings.config());
    let broker = registry.broker();

    match cli.command {
        Commands::Status { action } => run_status(&broker, &action),
        Commands::Exec {
            action,
            helper,
            args,
            message,
            timeout,
            authorize_only,
        } => {
            let mut action = broker.action(action);
            if let Some(helper) = helper {
                action.set_helper_id(helper);
            }
            action.set_arguments(parse_args(&args)?);
            if let Some(message) = message {
                action = action.with_detail(AuthDetail::Message, message);
            }
            action.set_timeout(timeout);
            let mode = if authorize_only {
                ExecutionMode::AuthorizeOnly
            } else {
                ExecutionMode::Execute
            };
            run_exec(&broker, action, mode).await
        }
    }
}

fn run_status(broker: &Broker, name: &str) -> Result<()> {
    let action = broker.action(name);
    println!("{}", broker.status(&action));
    Ok(())
}

async fn run_exec(broker: &Broker, action: Action, mode: ExecutionMode) -> Result<()> {
    tracing::debug!(
        "Running {} ({:?}) with backend {}",
        action.name(),
        mode,
        broker.backend().name()
    );
    let job = broker.execute(&action, mode);
    let mut events = Box::pin(job.events());
    job.start();

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(JobEvent::PercentChanged(percent)) => eprintln!("{:>3}%", percent),
                Some(JobEvent::NewData(data)) => {
                    eprintln!("{}", serde_json::to_string(&data)?);
                }
                Some(JobEvent::StatusChanged(status)) => eprintln!("status: {}", status),
                Some(JobEvent::Result(_)) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, killing {}", action.name());
                job.kill(KillVerbosity::Quietly);
                break;
            }
        }
    }

    let result = job.wait().await;
    if !result.succeeded() {
        bail!("{} failed ({}): {}", action.name(), result.error, result.error_text);
    }
    if !result.data.is_empty() {
        println!("{}", serde_json::to_string_pretty(&result.data)?);
    }
    Ok(())
}

/// `key=value` pairs; values that are not valid JSON are taken as strings
fn parse_args(args: &[String]) -> Result<VariantMap> {
    let mut map = VariantMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .with_context(|| format!("Argument {:?} is not KEY=VALUE", arg))?;
        if key.is_empty() {
            bail!("Argument {:?} has an empty key", arg);
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_args() {
        let args = vec![
            "filename=/etc/hostname".to_string(),
            "count=3".to_string(),
            "flags=[true,false]".to_string(),
            "empty=".to_string(),
        ];
        let map = assert_ok!(parse_args(&args));
        assert_eq!(map["filename"], json!("/etc/hostname"));
        assert_eq!(map["count"], json!(3));
        assert_eq!(map["flags"], json!([true, false]));
        assert_eq!(map["empty"], json!(""));
    }

    #[test]
    fn test_parse_args_rejects_malformed() {
        assert_err!(parse_args(&["novalue".to_string()]));
        assert_err!(parse_args(&["=value".to_string()]));
    }

    #[test]
    fn test_settings_override_defaults() {
        let cli = Cli::try_parse_from([
            "authbroker",
            "status",
            "org.example.demo.read",
            "--socket-dir",
            "/tmp/brk",
            "--backends",
            "polkit,static",
            "--default-timeout-ms",
            "500",
        ])
        .unwrap();
        let config = cli.settings.config();
        assert_eq!(config.socket_dir, PathBuf::from("/tmp/brk"));
        assert_eq!(config.backend_search_path, vec!["polkit", "static"]);
        assert_eq!(config.default_timeout, Duration::from_millis(500));
        assert_eq!(
            config.activation_timeout,
            BrokerConfig::default().activation_timeout
        );
    }

    #[test]
    fn test_empty_settings_keep_defaults() {
        let config = Settings::default().config();
        let defaults = BrokerConfig::default();
        assert_eq!(config.socket_dir, defaults.socket_dir);
        assert_eq!(config.backend_search_path, defaults.backend_search_path);
        assert_eq!(config.default_timeout, defaults.default_timeout);
    }

    #[test]
    fn test_cli_parses_exec() {
        let cli = Cli::try_parse_from([
            "authbroker",
            "exec",
            "org.example.demo.read",
            "--helper",
            "org.example.demo",
            "--arg",
            "filename=/tmp/x",
            "--timeout",
            "500",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec {
                action,
                helper,
                args,
                timeout,
                authorize_only,
                ..
            } => {
                assert_eq!(action, "org.example.demo.read");
                assert_eq!(helper.as_deref(), Some("org.example.demo"));
                assert_eq!(args, vec!["filename=/tmp/x"]);
                assert_eq!(timeout, 500);
                assert!(!authorize_only);
            }
            _ => panic!("expected exec"),
        }
    }
}
