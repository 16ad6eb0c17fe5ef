use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vigil_clock::Clock;
use vigil_config::AppConfig;
use vigil_llm::SubprocessClient;
use vigil_modules::{ModuleRegistry, load_manifests};
use vigil_runtime::{ExitReason, Services};
use vigil_store::Store;
use vigil_transport::{Notifier, console::ConsoleTransport};

#[derive(Parser)]
#[command(name = "vigil", about = "Always-on proactive personal agent")]
struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = ".vigil/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent daemon (default).
    Run,
    /// Write a default config file and exit.
    Init,
}

fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let code = match cli.command.unwrap_or(Command::Run) {
        Command::Init => match init_config(&cli.config) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("init failed: {err}");
                1
            }
        },
        Command::Run => run_daemon(&cli.config),
    };
    std::process::exit(code);
}

fn init_config(path: &PathBuf) -> Result<()> {
    let config = AppConfig::default();
    config.save_to(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn run_daemon(config_path: &PathBuf) -> i32 {
    let config = match AppConfig::load_from(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal: unreadable config {}: {err}", config_path.display());
            return ExitReason::FatalStartup(err.to_string()).code();
        }
    };

    let _log_guard = init_tracing(&config);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "fatal: tokio runtime failed to start");
            return ExitReason::FatalStartup(err.to_string()).code();
        }
    };

    let reason = runtime.block_on(async {
        let notifier = Notifier::new(&config.notifier.url);

        let clock = Clock::new(&config.schedule.timezone);
        let db_path = PathBuf::from(&config.agent.data_dir).join("vigil.db");
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let store = match Store::open(&db_path, clock) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                error!(%err, path = %db_path.display(), "fatal: store unreachable");
                notifier.notify(&format!("vigil failed to start: store unreachable ({err})"));
                return ExitReason::FatalStartup(err.to_string());
            }
        };

        let manifests = load_manifests(&config.modules.manifest_dir);
        let modules = Arc::new(ModuleRegistry::with_manifests(manifests));

        let transport = Arc::new(ConsoleTransport::new());

        // One subprocess per driver path keeps their context caches apart.
        let proactive_client = Arc::new(SubprocessClient::new(&config.llm.command));
        let reactive_client = Arc::new(SubprocessClient::new(&config.llm.command));

        let services = Services {
            config,
            store,
            modules,
            transport,
            notifier,
            proactive_client,
            reactive_client,
            tools: Arc::new(vigil_llm::ToolRegistry::default()),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });

        vigil_runtime::run(services, shutdown_rx).await
    });

    if let ExitReason::FatalStartup(ref message) = reason {
        error!(message, "startup failed");
    }
    reason.code()
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_env("VIGIL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));

    if config.telemetry.log_dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&config.telemetry.log_dir, "vigil.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}
