use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tugboat_cloud_aws::{S3Config, S3ObjectStore};
use tugboat_cloud_k8s::KubeCluster;
use tugboat_config::{ServiceConfig, load_config};
use tugboatd::{AppState, create_app};

#[derive(Parser)]
#[command(name = "tugboatd")]
#[command(about = "Engine API compatible build service backed by BuildKit and Kubernetes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Serve(ServeArgs),
    /// Show version information
    Version,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Config file (overrides discovery)
    #[arg(short, long, env = "TUGBOAT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long, env = "TUGBOAT_LISTEN")]
    listen: Option<String>,

    /// Namespace for remote workloads
    #[arg(long, env = "TUGBOAT_NAMESPACE")]
    namespace: Option<String>,

    /// Internal registry host
    #[arg(long, env = "TUGBOAT_REGISTRY")]
    registry: Option<String>,

    /// Bucket for staged build contexts
    #[arg(long, env = "TUGBOAT_BUCKET")]
    bucket: Option<String>,

    /// Local buildkitd address
    #[arg(long, env = "BUILDKIT_HOST")]
    buildkitd: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

impl ServeArgs {
    fn load(&self) -> Result<(ServiceConfig, Option<PathBuf>)> {
        let (mut config, source) = match &self.config {
            Some(path) => {
                let config = ServiceConfig::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                (config, Some(path.clone()))
            }
            None => load_config().context("failed to load config")?,
        };

        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(registry) = &self.registry {
            config.registry = registry.clone();
        }
        if let Some(bucket) = &self.bucket {
            config.object_store.bucket = bucket.clone();
        }
        if let Some(buildkitd) = &self.buildkitd {
            config.local.buildkitd_addr = buildkitd.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok((config, source))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("tugboatd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (config, source) = args.load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &source {
        Some(path) => tracing::info!("Using config {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }

    let cluster = KubeCluster::connect(config.namespace.clone())
        .await
        .context("failed to connect to the cluster")?;

    let store = S3ObjectStore::connect(S3Config {
        bucket: config.object_store.bucket.clone(),
        prefix: config.object_store.prefix.clone(),
        endpoint: config.object_store.endpoint.clone(),
        region: config.object_store.region.clone(),
    })
    .await;

    let state = AppState::from_config(&config, Arc::new(cluster), Arc::new(store));
    let drain_timeout = state.limits.execution_timeout;
    let app = create_app(state);

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.listen))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Listening on http://{}", addr);

    let server = axum::serve(listener, axum::ServiceExt::<axum::extract::Request>::into_make_service(app))
        .with_graceful_shutdown(shutdown_signal());

    // In-flight requests get up to the execution ceiling to drain
    let drained = async {
        server.await?;
        Ok::<_, std::io::Error>(())
    };
    tokio::select! {
        result = drained => result.context("server error")?,
        _ = drain_deadline(drain_timeout) => {
            tracing::warn!("Drain timeout reached, exiting with requests still in flight");
        }
    }

    tracing::info!("tugboatd stopped");
    Ok(())
}

/// Completes `timeout` after the shutdown signal
async fn drain_deadline(timeout: Duration) {
    shutdown_signal().await;
    tokio::time::sleep(timeout).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    tracing::info!("Shutdown signal received, draining requests...");
}
