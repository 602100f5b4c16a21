// src/orchestrator.rs
//! The polling loop. Every interval it walks users and their checkers in
//! order, one at a time: read cursor, run checker, dispatch, commit cursor.
//! A failing checker is logged and the sweep moves on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, gauge};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::checkers::{self, PlannedTask, SourceClients};
use crate::config::{CheckerSlot, ConfigHandle, CursorPolicy, UserConfig};
use crate::notify::Dispatcher;
use crate::state::{CursorStore, SnapshotCache};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Counters for one sweep over all users.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub checkers_run: usize,
    pub checkers_skipped: usize,
    pub checker_errors: usize,
    pub candidates: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
}

pub struct Orchestrator {
    config: ConfigHandle,
    sources: SourceClients,
    dispatcher: Dispatcher,
    cursors: CursorStore,
    snapshots: SnapshotCache,
    policy: CursorPolicy,
    interval: Duration,
}

impl Orchestrator {
    pub fn new(
        config: ConfigHandle,
        sources: SourceClients,
        dispatcher: Dispatcher,
        cursors: CursorStore,
        snapshots: SnapshotCache,
    ) -> Self {
        Self {
            config,
            sources,
            dispatcher,
            cursors,
            snapshots,
            policy: CursorPolicy::default(),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_policy(mut self, policy: CursorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// One full sweep. `now` is the cursor value committed for every checker
    /// that completes in this tick.
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> TickReport {
        crate::metrics::ensure_described();
        counter!("relay_ticks_total").increment(1);

        let mut report = TickReport::default();
        // Keyword edits landing after this point apply next tick.
        let users = self.config.users();
        for user in &users {
            tracing::debug!(user = %user.name, checkers = user.checkers.len(), "checking user");
            for slot in &user.checkers {
                let config = match slot {
                    CheckerSlot::Ready(c) => c,
                    CheckerSlot::Invalid {
                        checker_type,
                        reason,
                    } => {
                        tracing::error!(
                            user = %user.name,
                            checker_type = %checker_type,
                            %reason,
                            "skipping invalid checker"
                        );
                        report.checkers_skipped += 1;
                        continue;
                    }
                };
                for planned in checkers::plan(&user.name, config) {
                    let cursor_key = planned.cursor_key.to_string();
                    if let Err(e) = self.run_planned(user, planned, now, &mut report).await {
                        report.checker_errors += 1;
                        counter!("relay_checker_errors_total").increment(1);
                        tracing::error!(
                            user = %user.name,
                            %cursor_key,
                            error = ?e,
                            "checker run failed"
                        );
                    }
                }
            }
        }

        gauge!("relay_last_tick_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "relay",
            run = report.checkers_run,
            skipped = report.checkers_skipped,
            errors = report.checker_errors,
            candidates = report.candidates,
            delivered = report.delivered,
            failed = report.delivery_failures,
            "tick finished"
        );
        report
    }

    async fn run_planned(
        &mut self,
        user: &UserConfig,
        planned: PlannedTask,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let key = &planned.cursor_key;
        let since = self.cursors.get(key, now).await.context("reading cursor")?;

        let run =
            checkers::run_task(&planned.task, since, &self.sources, &mut self.snapshots).await;
        report.checkers_run += 1;
        counter!("relay_checker_runs_total").increment(1);
        counter!("relay_candidates_total").increment(run.candidates.len() as u64);
        if run.fetch_errors > 0 {
            report.checker_errors += 1;
            counter!("relay_checker_errors_total").increment(1);
        }
        report.candidates += run.candidates.len();

        let sent = self
            .dispatcher
            .dispatch_all(&user.matrix_room_id, &run.candidates)
            .await;
        report.delivered += sent.delivered;
        report.delivery_failures += sent.failed;

        let advance = match self.policy {
            CursorPolicy::AlwaysAdvance => true,
            CursorPolicy::HoldOnFailure => run.fetch_errors == 0,
        };
        if advance {
            self.cursors.set(key, now).await.context("writing cursor")?;
        } else {
            tracing::info!(cursor_key = %key, cursor = %since, "source errors, holding cursor");
        }

        tracing::debug!(
            cursor_key = %key,
            since = %since,
            candidates = run.candidates.len(),
            stale = run.stale,
            fetch_errors = run.fetch_errors,
            delivered = sent.delivered,
            "checker done"
        );
        Ok(())
    }

    /// Tick every interval until `shutdown` resolves. The first tick fires
    /// one interval after start. A panicking tick is logged and the loop
    /// keeps going.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if AssertUnwindSafe(self.run_tick(now)).catch_unwind().await.is_err() {
                        tracing::error!("tick aborted by a panic; waiting for next interval");
                    }
                }
            }
        }
    }
}
