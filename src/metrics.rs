// src/metrics.rs
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("relay_ticks_total", "Scheduler ticks started.");
        describe_counter!("relay_checker_runs_total", "Checker tasks executed.");
        describe_counter!(
            "relay_checker_errors_total",
            "Checker tasks that hit a source or state error."
        );
        describe_counter!("relay_candidates_total", "Notification candidates produced.");
        describe_counter!("relay_deliveries_total", "Notifications delivered.");
        describe_counter!(
            "relay_delivery_failures_total",
            "Notifications dropped after a failed send."
        );
        describe_counter!("relay_commands_total", "Chat commands handled, by outcome.");
        describe_gauge!("relay_last_tick_ts", "Unix ts when the last tick finished.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder for this process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_described();
        Ok(Self { handle })
    }

    /// `/health` and `/metrics` (Prometheus exposition format).
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
    }
}

/// Serve `router` on `addr` until the task is dropped.
pub async fn serve(addr: &str, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin listener on {addr}"))?;
    tracing::info!(%addr, "admin endpoints listening");
    axum::serve(listener, router).await.context("admin server")
}
