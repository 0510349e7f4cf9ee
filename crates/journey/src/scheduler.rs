//! Polling dispatcher that resumes due executions.
//!
//! Suspension is nothing more than a persisted `next_step_at`; any worker of
//! any process can resume an execution once it is due. The `waiting ->
//! running` compare-and-swap in the store is the only mutual exclusion.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use salesflow_core::config::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::engine::JourneyEngine;
use crate::error::JourneyResult;
use crate::store::ExecutionStore;

/// Where an execution goes after a dispatcher-level error.
#[derive(Debug, Clone, Copy)]
pub struct ReleasePolicy {
    pub delay: chrono::Duration,
    pub jitter_ms: u64,
}

impl ReleasePolicy {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            delay: chrono::Duration::milliseconds(cfg.release_delay_ms as i64),
            jitter_ms: cfg.release_jitter_ms,
        }
    }

    /// The original wake time (never earlier than now) plus the release
    /// delay and a random jitter.
    pub fn wake_at(&self, scheduled: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = scheduled.map(|at| at.max(now)).unwrap_or(now);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        base + self.delay + chrono::Duration::milliseconds(jitter as i64)
    }
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Rows returned by the due query.
    pub due: usize,
    /// Rows this worker won the lease for.
    pub claimed: usize,
    pub advanced: usize,
    /// Rows handed back to `waiting` after an error.
    pub released: usize,
}

pub struct Dispatcher {
    engine: Arc<JourneyEngine>,
    executions: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    release: ReleasePolicy,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<JourneyEngine>,
        executions: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let release = ReleasePolicy::from_config(&config);
        Self {
            engine,
            executions,
            clock,
            config,
            release,
        }
    }

    /// Claims and advances every due execution in one bounded batch.
    /// Per-execution failures are contained; only the due query itself can
    /// fail the cycle.
    pub async fn poll_once(&self) -> JourneyResult<DispatchReport> {
        let now = self.clock.now();
        let due = self.executions.due(now, self.config.batch_size).await?;
        let mut report = DispatchReport {
            due: due.len(),
            ..Default::default()
        };

        for candidate in due {
            let leased = match self.executions.try_acquire(candidate.id, now).await {
                Ok(Some(leased)) => leased,
                Ok(None) => {
                    debug!(execution_id = %candidate.id, "Lost lease race, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(execution_id = %candidate.id, error = %e, "Lease acquisition failed");
                    continue;
                }
            };
            report.claimed += 1;
            metrics::counter!("journey.dispatcher.claimed").increment(1);

            match self.engine.advance(leased).await {
                Ok(_) => report.advanced += 1,
                Err(e) => {
                    let wake_at = self.release.wake_at(candidate.next_step_at, self.clock.now());
                    error!(
                        execution_id = %candidate.id,
                        error = %e,
                        transient = e.is_transient(),
                        %wake_at,
                        "Advance failed, releasing execution"
                    );
                    match self
                        .executions
                        .release(candidate.id, wake_at, self.clock.now())
                        .await
                    {
                        Ok(true) => {
                            report.released += 1;
                            metrics::counter!("journey.dispatcher.released").increment(1);
                        }
                        Ok(false) => {
                            debug!(execution_id = %candidate.id, "Execution left running state before release")
                        }
                        Err(e) => {
                            error!(execution_id = %candidate.id, error = %e, "Release failed")
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Polls until `shutdown` flips to `true`. A full batch is followed by an
    /// immediate re-poll; otherwise the worker sleeps for the poll interval.
    pub async fn run(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        info!(worker_id, interval_ms = self.config.poll_interval_ms, "Dispatcher worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let backlog = match self.poll_once().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        debug!(worker_id, ?report, "Poll cycle finished");
                    }
                    report.due >= self.config.batch_size && report.claimed > 0
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Due query failed");
                    false
                }
            };
            if backlog {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id, "Dispatcher worker stopped");
    }

    /// Starts `workers` polling tasks sharing this dispatcher.
    pub fn spawn_workers(
        self: &Arc<Self>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker_id| {
                let dispatcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.run(worker_id, shutdown).await })
            })
            .collect()
    }
}
