// FlowForge backend daemon
// Run with: cargo run --bin server -- --config ./flowforge.toml

//! Starts the FlowForge HTTP backend: loads the TOML configuration, opens
//! the entity store, wires the docker-backed runtime, and serves the
//! operation router until interrupted. On shutdown all tables are persisted
//! and the scratch directories are cleared.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowforge::config::Settings;
use flowforge::server::{router, AppState};
use flowforge::{DockerRuntime, EntityStore, TableKind};

#[derive(Parser)]
#[command(name = "flowforge-server")]
#[command(about = "FlowForge backend - workflow execution platform")]
struct Cli {
    /// TOML configuration file path
    #[arg(short, long, default_value = "./flowforge.toml")]
    config: String,

    /// Create this superuser if the user table is empty (bootstrap)
    #[arg(long)]
    bootstrap_superuser: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config).context("loading configuration")?;

    init_logging(&settings)?;

    let ctx = settings.store_context();
    info!(
        entity_store = %ctx.entity_store.display(),
        data_dir = %ctx.data_dir.display(),
        temp_dir = %ctx.temp_dir.display(),
        in_container = ctx.in_container,
        "opening entity store"
    );
    let store = Arc::new(EntityStore::open(ctx)?);

    if let Some(name) = &cli.bootstrap_superuser {
        if store.snapshot_values(TableKind::User).is_empty() {
            let hash = flowforge::engine::user::bootstrap_superuser(&store, name, name)?;
            info!(user = %name, hash = %hash, "bootstrapped superuser");
        }
    }

    let state = AppState {
        store: store.clone(),
        runtime: Arc::new(DockerRuntime::new(settings.tools.bash.clone())),
    };
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("parsing server address")?;
    info!(%addr, "serving");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // mirror the request-level /store operation on the way out
    info!("shutting down, persisting tables");
    store.persist()?;
    store.remove_temp_directories()?;
    Ok(())
}

fn init_logging(settings: &Settings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));
    match &settings.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
