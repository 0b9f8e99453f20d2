//! corrald -- container management daemon, clustered control plane.
//!
//! Startup is recovery: when a peer-store snapshot exists under the
//! consensus state directory, the node rejoins its cluster before
//! serving requests, dialing the peers it knew about last.  Shutdown
//! is the mirror image: the raft engine is stopped and the transport
//! closed before the process exits, while the consensus state stays on
//! disk so the next start rejoins instead of bootstrapping.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use corral::config::LoggingConfig;
use corral::tls::TlsIdentity;
use corral::AppState;

/// Command-line arguments for the corral daemon.
#[derive(Parser, Debug)]
#[command(
    name = "corrald",
    version,
    about = "Container management daemon with a clustered control plane"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "corral.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = corral::config::load_config(&cli.config)?;
    init_logging(&config.logging);
    info!("loaded configuration from {}", cli.config);

    if let Some(bind) = &cli.bind {
        let (host, port) = bind
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--bind must be host:port"))?;
        config.server.host = host.to_string();
        config.server.port = port.parse()?;
    }
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Initialize Prometheus metrics recorder and register metric
    // descriptions.
    corral::metrics::init_metrics();
    corral::metrics::describe_metrics();

    std::fs::create_dir_all(&config.cluster.var_dir)?;
    let identity = TlsIdentity::load(&config.cluster.var_dir).map_err(|err| {
        anyhow::anyhow!(
            "no TLS identity under {}: {err}",
            config.cluster.var_dir.display()
        )
    })?;

    let state = Arc::new(AppState::new(config.clone(), identity));

    // A surviving peer-store snapshot means this node was clustered
    // when it went down; rejoin before serving requests.
    if config.cluster.raft_dir().join("cluster.json").exists() {
        info!("peer store snapshot found, rejoining cluster");
        state.enable_cluster(false)?;
    }

    let app = corral::server::app(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("corrald listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown(state.clone()))
    .await?;

    // The graceful-shutdown hook already stopped the engine; this
    // covers the listener failing on its own.
    state.shutdown();
    info!("corrald shut down");

    Ok(())
}

/// Build the subscriber from the logging section; `RUST_LOG` overrides
/// the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a stop signal, then wind the cluster down before the
/// listener closes: the engine worker is stopped and the transport
/// shut, so no raft connection outlives the process, while the
/// consensus state directory is left for the next start to rejoin
/// from.
async fn shutdown(state: Arc<AppState>) {
    stop_signal().await;

    if state.cluster_enabled() {
        info!("stopping replicated store");
    }
    state.shutdown();
}

/// Resolve once the daemon is asked to stop.
async fn stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, stopping"),
            _ = term.recv() => info!("received SIGTERM, stopping"),
        }
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received interrupt, stopping");
    }
}
