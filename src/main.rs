use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use uws_store::api::job_routes;
use uws_store::config::StoreConfig;
use uws_store::error::DatabaseError;
use uws_store::jobs::{ExpirationSweeper, JobEvents, JobService, spawn_sweep_task};
use uws_store::store::{JobStore, LibSqlBackend};

/// Shared storage for UWS job records.
#[derive(Debug, Parser)]
#[command(name = "uws-store")]
#[command(version)]
struct Cli {
    /// Database file.
    #[arg(long, global = true, env = "UWS_DATABASE_PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply schema migrations.
    Init {
        /// Drop every job table first.
        #[arg(long)]
        reset: bool,
    },
    /// Exit non-zero unless the schema is at the current version.
    ValidateSchema,
    /// Run one expiration sweep and print its report.
    Expire,
    /// Serve the HTTP API and sweep expired jobs periodically.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    let mut config = StoreConfig::from_env().context("invalid configuration")?;
    if let Some(path) = cli.database {
        config.database_path = path;
    }

    let backend = Arc::new(
        LibSqlBackend::new_local(&config.database_path, &config)
            .await
            .with_context(|| format!("failed to open {}", config.database_path.display()))?,
    );
    let store: Arc<dyn JobStore> = backend.clone();

    match cli.command {
        Command::Init { reset } => {
            if reset {
                backend.reset().await?;
            } else {
                store.run_migrations().await?;
            }
            let status = store.schema_status().await?;
            eprintln!("Schema at V{}", status.current);
        }
        Command::ValidateSchema => {
            ensure_schema(store.as_ref()).await?;
            eprintln!("Schema is current");
        }
        Command::Expire => {
            ensure_schema(store.as_ref()).await?;
            let sweeper = ExpirationSweeper::new(Arc::clone(&store), &config);
            let report = sweeper.run_once(Utc::now()).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Serve => {
            ensure_schema(store.as_ref()).await?;
            serve(store, config).await?;
        }
    }

    Ok(())
}

/// Log to stderr, and to a daily-rolling file when `UWS_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr));

    match std::env::var("UWS_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "uws-store.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            registry.init();
            None
        }
    }
}

/// Refuse to touch a database that has not been migrated to this build's schema.
async fn ensure_schema(store: &dyn JobStore) -> Result<(), DatabaseError> {
    let status = store.schema_status().await?;
    if status.is_current() {
        Ok(())
    } else {
        Err(DatabaseError::SchemaOutdated {
            current: status.current,
            expected: status.expected,
        })
    }
}

async fn serve(store: Arc<dyn JobStore>, config: StoreConfig) -> anyhow::Result<()> {
    let events = JobEvents::default();
    let service = Arc::new(JobService::new(Arc::clone(&store), &config).with_events(events.clone()));

    let sweeper = Arc::new(ExpirationSweeper::new(store, &config).with_events(events));
    let _sweep_handle = spawn_sweep_task(sweeper, config.sweep_interval);

    let app = job_routes(service, config.admin_users.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;

    eprintln!("UWS job store v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   API: http://{}/jobs", config.bind_address);
    info!(address = %config.bind_address, "Job API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}
