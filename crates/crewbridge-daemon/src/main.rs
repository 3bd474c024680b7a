//! crewbridge-daemon: serves the Crewbridge controller over HTTP.
//!
//! Usage:
//!   crewbridge-daemon --port 7433 --log-dir ~/.crewbridge/logs
//!   crewbridge-daemon --env-bundles bundles.json --strict-env-bundles

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crewbridge_core::config::DEFAULT_MAX_MESSAGES;
use crewbridge_core::{
    BundlePolicy, Controller, ControllerConfig, EnvBundleStore, InMemoryEnvBundles, NoEnvBundles,
};
use crewbridge_http::SharedState;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7433;
const DEFAULT_KILL_GRACE_MS: u64 = 3000;

#[derive(Parser, Debug)]
#[command(name = "crewbridge-daemon")]
#[command(about = "Supervise command-line agents and stream their sessions to observers")]
#[command(version)]
struct Args {
    /// Address to bind
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to bind (0 picks a free port)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory for per-agent transcript logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// JSON file of environment bundles: { "slug": { "VAR": "value" } }
    #[arg(long)]
    env_bundles: Option<PathBuf>,

    /// Messages kept per agent
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGES)]
    max_messages: usize,

    /// Grace period between SIGTERM and SIGKILL, in milliseconds
    #[arg(long, default_value_t = DEFAULT_KILL_GRACE_MS)]
    kill_grace_ms: u64,

    /// Refuse to spawn an agent whose environment bundle cannot be loaded
    #[arg(long)]
    strict_env_bundles: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_messages_per_agent: self.max_messages.max(1),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            log_dir: self.log_dir.clone(),
            bundle_policy: if self.strict_env_bundles {
                BundlePolicy::Abort
            } else {
                BundlePolicy::Proceed
            },
            ..ControllerConfig::default()
        }
    }
}

fn load_bundles(path: &Path) -> Result<InMemoryEnvBundles, String> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    InMemoryEnvBundles::from_json_str(&json)
        .map_err(|e| format!("Invalid environment bundles in {}: {}", path.display(), e))
}

async fn run(args: Args) -> Result<(), String> {
    let bundles: Arc<dyn EnvBundleStore> = match &args.env_bundles {
        Some(path) => {
            let bundles = load_bundles(path)?;
            log::info!("Loaded {} environment bundle(s) from {}", bundles.len(), path.display());
            Arc::new(bundles)
        }
        None => Arc::new(NoEnvBundles),
    };

    if let Some(dir) = &args.log_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create log directory {}: {}", dir.display(), e))?;
    }

    let controller = Arc::new(Controller::new(args.controller_config(), bundles));
    let state = Arc::new(SharedState::new(Arc::clone(&controller)));

    let mut server = crewbridge_http::start(state, &args.host, args.port)
        .await
        .map_err(|e| format!("Failed to start HTTP server on {}:{}: {}", args.host, args.port, e))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl-C: {}", e))?;

    log::info!("Shutting down");
    controller.shutdown().await;
    server.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
