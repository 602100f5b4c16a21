//! keyword-relay binary entrypoint.
//! Loads config, starts the Matrix command listener and the optional admin
//! endpoints, then runs the polling loop until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keyword_relay::config::AppConfig;
use keyword_relay::metrics::{self, Metrics};
use keyword_relay::notify::matrix::MatrixClient;
use keyword_relay::{
    ConfigHandle, CursorStore, Dispatcher, Orchestrator, SnapshotCache, SourceClients,
};

/// `RELAY_LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("keyword_relay=info,warn"));
    let json = std::env::var("RELAY_LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::load_default().context("loading configuration")?;
    tracing::info!(
        users = config.users.len(),
        interval_secs = config.check_interval_secs,
        state_dir = %config.state_dir.display(),
        "configuration loaded"
    );

    let prom = Metrics::init()?;
    if let Some(addr) = config.admin_addr.clone() {
        let router = prom.router();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(&addr, router).await {
                tracing::error!(error = ?e, "admin server stopped");
            }
        });
    }

    // Source requests have no global timeout; Matrix calls set their own.
    let http = reqwest::Client::builder()
        .user_agent(concat!("keyword-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building http client")?;

    let matrix = Arc::new(MatrixClient::new(&config.matrix, http.clone())?);
    let handle = ConfigHandle::new(config.users.clone());
    let listener = matrix.clone().spawn_command_listener(handle.clone());

    let cursors = CursorStore::open(config.state_dir.join("last_check.json")).await?;
    let snapshots = SnapshotCache::open(config.state_dir.join("snapshots"));

    let orchestrator = Orchestrator::new(
        handle,
        SourceClients::http(http),
        Dispatcher::new(matrix),
        cursors,
        snapshots,
    )
    .with_policy(config.cursor_policy)
    .with_interval(Duration::from_secs(config.check_interval_secs));

    orchestrator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = ?e, "ctrl-c handler failed");
                std::future::pending::<()>().await;
            }
        })
        .await;

    listener.abort();
    tracing::info!("keyword-relay stopped");
    Ok(())
}
