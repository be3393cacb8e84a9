//! # ReachLoop — timer-gated outreach pipeline
//!
//! Usage:
//!   reachloop serve                        # scheduler + consumers + gateway
//!   reachloop tick                         # one scheduler pass (for cron)
//!   reachloop add jane-doe "Jane Doe"      # add a record
//!   reachloop list --status failed         # inspect records
//!   reachloop pause jane-doe / resume jane-doe

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reachloop_core::config::ReachConfig;
use reachloop_core::traits::{RecordStore, WorkQueue};
use reachloop_core::types::{QueueKind, RecordStatus};
use reachloop_scheduler::{HttpActionExecutor, MemoryWorkQueue, Operator, Pipeline};
use reachloop_store::{MemoryRecordStore, SqliteRecordStore, SqliteWorkQueue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "reachloop",
    version,
    about = "🔁 ReachLoop — connect, wait for acceptance, follow up"
)]
struct Cli {
    /// Config file (default: ~/.reachloop/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduler, consumers and HTTP gateway until Ctrl-C
    Serve,
    /// Run exactly one scheduler pass and print the report
    Tick,
    /// Write a default config file if none exists
    Init,
    /// Add a record
    Add {
        id: String,
        display_name: String,
        /// Follow-up message for this record
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List records
    List {
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Pause a record
    Pause { id: String },
    /// Resume a paused record
    Resume { id: String },
    /// Force a record into a status and make it due now
    Reset { id: String, status: String },
}

struct Backends {
    store: Arc<dyn RecordStore>,
    connection_queue: Arc<dyn WorkQueue>,
    message_queue: Arc<dyn WorkQueue>,
}

fn open_backends(config: &ReachConfig) -> Result<Backends> {
    let visibility = Duration::from_secs(config.consumer.visibility_timeout_secs);
    match config.store.backend.as_str() {
        "sqlite" => {
            let path = config.store.resolved_path();
            let store = SqliteRecordStore::open(&path)
                .with_context(|| format!("opening record store at {}", path.display()))?;
            tracing::info!("💾 SQLite store at {}", path.display());
            Ok(Backends {
                store: Arc::new(store),
                connection_queue: Arc::new(SqliteWorkQueue::open(
                    &path,
                    QueueKind::Connection,
                    visibility,
                )?),
                message_queue: Arc::new(SqliteWorkQueue::open(
                    &path,
                    QueueKind::Message,
                    visibility,
                )?),
            })
        }
        "memory" => {
            tracing::warn!("⚠️ Memory store: records are lost on exit");
            Ok(Backends {
                store: Arc::new(MemoryRecordStore::new()),
                connection_queue: Arc::new(MemoryWorkQueue::new(QueueKind::Connection, visibility)),
                message_queue: Arc::new(MemoryWorkQueue::new(QueueKind::Message, visibility)),
            })
        }
        other => anyhow::bail!("unknown store backend '{other}' (expected sqlite or memory)"),
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
        .unwrap_or_else(ReachConfig::default_path)
}

fn load_config(path: &Path) -> Result<ReachConfig> {
    let config = if path.exists() {
        ReachConfig::load_from(path)?
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        ReachConfig::default()
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "reachloop=debug,reachloop_core=debug,reachloop_store=debug,reachloop_scheduler=debug,reachloop_gateway=debug,tower_http=debug"
    } else {
        "reachloop=info,reachloop_store=info,reachloop_scheduler=info,reachloop_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);
    if let Command::Init = cli.command {
        if path.exists() {
            println!("⚠️  Config already exists at {}", path.display());
        } else {
            ReachConfig::default().save_to(&path)?;
            println!("✅ Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let config = load_config(&path)?;
    let backends = open_backends(&config)?;

    match cli.command {
        Command::Serve => serve(config, backends).await,
        Command::Tick => {
            let pipeline = build_pipeline(&config, backends);
            let report = pipeline.scheduler.tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Add {
            id,
            display_name,
            message,
        } => {
            let record = Operator::new(backends.store)
                .create(&id, &display_name, message)
                .await?;
            println!("✅ Added {} ({})", record.display_name, record.id);
            Ok(())
        }
        Command::List { status } => {
            let filter = status.as_deref().map(str::parse::<RecordStatus>).transpose()?;
            let records = Operator::new(backends.store).list().await?;
            println!("{:<24} {:<9} {:<3} {:<26} NAME", "ID", "STATUS", "TRY", "NEXT ACTION");
            for r in records.iter().filter(|r| filter.is_none_or(|s| r.status == s)) {
                println!(
                    "{:<24} {:<9} {:<3} {:<26} {}",
                    r.id,
                    r.status.as_str(),
                    r.retry_count,
                    r.next_action_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| "now".into()),
                    r.display_name
                );
            }
            Ok(())
        }
        Command::Pause { id } => {
            let record = Operator::new(backends.store).pause(&id).await?;
            println!("⏸️  {} is {}", record.id, record.status);
            Ok(())
        }
        Command::Resume { id } => {
            let record = Operator::new(backends.store).resume(&id).await?;
            println!("▶️  {} is {}", record.id, record.status);
            Ok(())
        }
        Command::Reset { id, status } => {
            let status: RecordStatus = status.parse()?;
            let record = Operator::new(backends.store).reset(&id, status).await?;
            println!("🔧 {} is {}", record.id, record.status);
            Ok(())
        }
        Command::Init => Ok(()),
    }
}

fn build_pipeline(config: &ReachConfig, backends: Backends) -> Pipeline {
    let executor = Arc::new(HttpActionExecutor::new(&config.executor));
    Pipeline::new(
        config,
        backends.store,
        backends.connection_queue,
        backends.message_queue,
        executor,
    )
}

async fn serve(config: ReachConfig, backends: Backends) -> Result<()> {
    // Missing secret is fatal before anything starts
    let secret = config.shared_secret()?;

    let pipeline = build_pipeline(&config, backends);
    let state = reachloop_gateway::AppState::new(
        pipeline.operator.clone(),
        pipeline.webhook(&secret),
        pipeline.sessions.clone(),
    );

    let handle = pipeline.start();
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let gateway_config = config.gateway.clone();
    let mut gateway = tokio::spawn(async move {
        reachloop_gateway::start(&gateway_config, state, stop_rx).await
    });

    // Stop on Ctrl-C, or early if the gateway dies (e.g. port in use)
    let gateway_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("🛑 Shutting down");
            stop_tx.send_replace(true);
            gateway.await
        }
        result = &mut gateway => result,
    };
    handle.shutdown().await;

    match gateway_result {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("gateway task failed: {e}")),
    }
}
