use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use runway_server::{build_app_state, build_router, Config, ControlStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let port = config.port;

    let store = ControlStore::open(config.database_path())
        .with_context(|| format!("Failed to open control store at {:?}", config.database_path()))?;
    store
        .ensure_slot_rows(&config.slot_ids)
        .context("Failed to seed slot lease rows")?;

    info!(
        slots = ?config.slot_ids,
        lease_ttl_seconds = config.slot_lease_ttl_seconds,
        "starting runway control plane"
    );

    let state = build_app_state(config, store);
    let router = build_router(state);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!(port, "listening");

    axum::serve(listener, router)
        .await
        .context("Server error")?;

    Ok(())
}
