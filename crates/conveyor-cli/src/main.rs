//! Conveyor server binary
//!
//! Constructs the components explicitly and owns their lifecycle; on
//! shutdown they stop in dependency order: Scheduler, then Worker
//! Pools, then the broker and store fall out of scope.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use conveyor_api::{create_router, AppState};
use conveyor_core::broker::Broker;
use conveyor_core::handler::HandlerMap;
use conveyor_core::redis::{KeyPrefix, RedisPool};
use conveyor_core::scheduler::CronTable;
use conveyor_core::store::JobStore;
use conveyor_core::{
    Config, ControlPlane, MemoryBroker, MemoryJobStore, RedisBroker, RedisJobStore, Scheduler,
    WorkerPool, QUEUE_NAMES,
};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Background-job orchestration service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestration server
    Serve {
        #[arg(short = 'H', long, help = "Bind address")]
        host: Option<String>,

        #[arg(short = 'P', long, help = "Port number")]
        port: Option<u16>,
    },

    /// Configuration operations
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Parse and validate a configuration file
    Check {
        #[arg(help = "Path to the TOML file")]
        path: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path).context("loading configuration file"),
        None => Config::from_env().context("loading configuration from environment"),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            init_tracing();
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Check { path } => {
                Config::load(&path).context("configuration is invalid")?;
                println!("configuration ok: {}", path.display());
                Ok(())
            }
        },
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!(version = conveyor_core::VERSION, "starting conveyor");

    let (store, broker): (Arc<dyn JobStore>, Arc<dyn Broker>) = if config.redis.enabled {
        let pool = RedisPool::connect(&config.redis)
            .await
            .map_err(|e| anyhow::anyhow!("redis: {}", e))?;
        let prefix = KeyPrefix::new(config.redis.key_prefix.clone());
        (
            Arc::new(RedisJobStore::new(pool.clone(), prefix.clone())),
            Arc::new(RedisBroker::new(pool, prefix)),
        )
    } else {
        info!("redis disabled; using in-memory store and broker");
        (Arc::new(MemoryJobStore::new()), Arc::new(MemoryBroker::new()))
    };

    let registry = Arc::new(config.build_registry()?);
    let handlers = Arc::new(HandlerMap::from_registry(&registry));
    let cron = Arc::new(CronTable::new(config.timezone()));

    let control = Arc::new(ControlPlane::new(
        store.clone(),
        broker.clone(),
        registry.clone(),
        cron.clone(),
        &config,
    ));

    let mut pools = Vec::with_capacity(QUEUE_NAMES.len());
    let mut pool_handles = Vec::new();
    for queue in QUEUE_NAMES {
        let pool = Arc::new(WorkerPool::new(
            queue,
            &config.queue_configuration(queue),
            &config.worker,
            config.scheduler.backoff_ceiling(),
            store.clone(),
            broker.clone(),
            handlers.clone(),
            &registry,
        ));
        pool_handles.extend(pool.start().await);
        pools.push(pool);
    }

    let scheduler = Arc::new(Scheduler::new(
        control.clone(),
        cron,
        config.scheduler.clone(),
    ));
    let scheduler_handles = scheduler.start();

    let app = create_router(AppState::new(control));
    let bind = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!(address = %bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Ordered shutdown: scheduler first so no new work is generated,
    // then the pools drain their current jobs
    scheduler.stop();
    for handle in scheduler_handles {
        let _ = handle.await;
    }
    for pool in &pools {
        pool.stop().await;
    }
    for handle in pool_handles {
        let _ = handle.await;
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed listening for shutdown signal");
    }
    info!("shutdown signal received");
}
