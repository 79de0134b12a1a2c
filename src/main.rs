//! authbroker-helper - example helper serving file actions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use authbroker::helper::{self, HandlerTable, HelperContext, HelperOptions};
use authbroker::{ActionReply, BackendRegistry, BrokerConfig, VariantMap};

#[derive(Parser, Debug)]
#[command(name = "authbroker-helper")]
#[command(about = "Example helper serving read, write and longaction")]
struct Args {
    /// Helper id to register under
    #[arg(long, env = "AUTHBROKER_HELPER_ID", default_value = "org.example.demo")]
    id: String,

    /// Directory of helper sockets
    #[arg(long, env = "AUTHBROKER_SOCKET_DIR")]
    socket_dir: Option<PathBuf>,

    /// Exit after this long without work
    #[arg(long, env = "AUTHBROKER_HELPER_IDLE_MS")]
    idle_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    authbroker::logging::init_helper("authbroker=info");

    let args = Args::parse();

    let mut config = BrokerConfig::from_env()?;
    if let Some(dir) = args.socket_dir {
        config.socket_dir = dir;
    }
    if let Some(ms) = args.idle_timeout_ms {
        config.helper_idle_timeout = Duration::from_millis(ms);
    }

    let backend = BackendRegistry::new(config.clone()).policy_backend();
    let handlers = HandlerTable::new()
        .register("read", read)
        .register("write", write)
        .register("longaction", long_action);

    helper::run_helper(HelperOptions {
        helper_id: args.id,
        config,
        backend,
        handlers: Some(handlers),
    })
    .await?;

    Ok(())
}

fn filename(args: &VariantMap) -> Option<&str> {
    args.get("filename").and_then(|v| v.as_str())
}

fn read(_ctx: &HelperContext, args: VariantMap) -> ActionReply {
    let Some(path) = filename(&args) else {
        return ActionReply::helper_error_reply().with_description("No filename given");
    };
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let mut reply = ActionReply::success_reply();
            reply.add_data("contents", contents);
            reply
        }
        Err(e) => ActionReply::helper_error_reply()
            .with_description(format!("Could not read {}: {}", path, e)),
    }
}

fn write(_ctx: &HelperContext, args: VariantMap) -> ActionReply {
    let Some(path) = filename(&args) else {
        return ActionReply::helper_error_reply().with_description("No filename given");
    };
    let contents = args
        .get("contents")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    match std::fs::write(path, contents) {
        Ok(()) => ActionReply::success_reply(),
        Err(e) => ActionReply::helper_error_reply()
            .with_description(format!("Could not write {}: {}", path, e)),
    }
}

fn long_action(ctx: &HelperContext, _args: VariantMap) -> ActionReply {
    for percent in 1..=100 {
        if ctx.is_stopped() {
            tracing::info!("{} stopped at {}%", ctx.action(), percent);
            return ActionReply::user_cancelled_reply();
        }
        ctx.progress_step(percent);
        std::thread::sleep(Duration::from_millis(20));
    }
    ActionReply::success_reply()
}
