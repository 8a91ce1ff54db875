use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use axiom_gateway::config::Config;
use axiom_gateway::process::ProcessExecutor;
use axiom_gateway::queue::{RedisBroker, RedisJobSource, Worker};
use axiom_gateway::utils::init_tracing;
use axiom_gateway::{create_router, AppState, Backend};

#[derive(Parser)]
#[command(name = "axiom-gateway", version, about = "HTTP gateway for queued inference jobs")]
struct Cli {
    /// JSON config file (defaults to config/default.json when present)
    #[arg(long, global = true, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve,
    /// Run the reference queue worker
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Worker => run_worker(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Configuration loaded: {:?}", config.server);

    let backend = match &config.redis {
        Some(redis) => {
            info!(endpoint = %redis.endpoint(), queue = %redis.queue_name, "Connecting to Redis");
            let broker = RedisBroker::connect(redis)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", redis.endpoint()))?;
            Backend::Queue(Arc::new(broker))
        }
        None => {
            info!(program = %config.worker.program, "No broker configured, spawning a worker process per request");
            Backend::Spawn(ProcessExecutor::new(&config.worker))
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;

    let state = AppState::new(config, backend);
    let app = create_router(state);

    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Server stopped");
    Ok(())
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let redis = config
        .redis
        .as_ref()
        .context("The worker needs a broker: set REDIS_URL or REDIS_HOST, or add a redis section to the config file")?;

    let source = RedisJobSource::connect(redis)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis.endpoint()))?;
    let worker = Worker::new(Arc::new(source), Arc::new(ProcessExecutor::new(&config.worker)));

    info!(queue = %redis.queue_name, program = %config.worker.program, "Worker consuming jobs");

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop.send(true);
    });

    worker.run(shutdown).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
