use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use handoff::app;
use handoff::config::HandoffConfig;
use handoff::events::EventBus;
use handoff::scheduler::SlaScheduler;

#[derive(Parser)]
#[command(
    name = "handoff",
    about = "Agent transfer queue and SLA escalation engine"
)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, global = true, env = "HANDOFF_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and the SLA scheduler
    Serve {
        #[arg(long, env = "HANDOFF_PORT")]
        port: Option<u16>,
        #[arg(long, env = "HANDOFF_DB")]
        db: Option<String>,
    },
    /// Initialize the database
    Init {
        #[arg(long, env = "HANDOFF_DB")]
        db: Option<String>,
    },
    /// Run one scheduler tick against the database and print the report
    Tick {
        #[arg(long, env = "HANDOFF_DB")]
        db: Option<String>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("handoff=info,tower_http=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<HandoffConfig, String> {
    match path {
        Some(p) => HandoffConfig::load(p).map_err(|e| e.to_string()),
        None => Ok(HandoffConfig::default()),
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { port, db } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(db) = db {
                config.database.path = db;
            }
            app::run_server(config).await.map_err(|e| e.to_string())
        }
        Commands::Init { db } => {
            let path = db.unwrap_or(config.database.path);
            handoff::db::init_db(&path).map_err(|e| e.to_string())?;
            info!(path = %path, "database initialized");
            Ok(())
        }
        Commands::Tick { db } => {
            let path = db.unwrap_or_else(|| config.database.path.clone());
            let storage = handoff::db::init_sqlite_storage(&path).map_err(|e| e.to_string())?;
            let scheduler = SlaScheduler::new(
                storage.clone(),
                app::message_sender(&config),
                EventBus::default(),
                config.scheduler.to_scheduler_config(),
            );
            let report = scheduler.tick().await;
            let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            println!("{json}");
            storage.checkpoint().map_err(|e| e.to_string())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "handoff failed");
            ExitCode::FAILURE
        }
    }
}
