use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::decision::DecisionPipeline;
use crate::error::Result;

/// Tally of one scheduling round
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub instruments: usize,
    pub completed: usize,
    pub executed: usize,
    /// Cycles that returned an error (configuration, market data, history)
    pub skipped: usize,
    pub panicked: usize,
}

/// Runs every active instrument's cycle concurrently, isolated per task
pub struct Scheduler {
    pipeline: Arc<DecisionPipeline>,
    interval: Duration,
    max_concurrent: usize,
}

impl Scheduler {
    pub fn new(pipeline: Arc<DecisionPipeline>, interval: Duration, max_concurrent: usize) -> Self {
        Self {
            pipeline,
            interval,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn pipeline(&self) -> &Arc<DecisionPipeline> {
        &self.pipeline
    }

    /// One round over the active set. Fails only when the active set itself
    /// cannot be read.
    pub async fn run_once(&self) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let start = Instant::now();
        let symbols = self.pipeline.config().active_symbols().await?;

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for symbol in symbols.iter().cloned() {
            let pipeline = Arc::clone(&self.pipeline);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                // Closed only if the semaphore is dropped, which it is not
                let _permit = permits.acquire_owned().await;
                let result = pipeline.run_cycle(&symbol).await;
                (symbol, result)
            });
        }

        let mut summary = CycleSummary {
            started_at,
            duration_ms: 0,
            instruments: symbols.len(),
            completed: 0,
            executed: 0,
            skipped: 0,
            panicked: 0,
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    summary.completed += 1;
                    if outcome.executed() {
                        summary.executed += 1;
                    }
                }
                Ok((symbol, Err(e))) => {
                    summary.skipped += 1;
                    debug!(symbol = %symbol, "cycle error counted: {}", e);
                }
                Err(e) => {
                    summary.panicked += 1;
                    error!("Instrument cycle task failed: {}", e);
                }
            }
        }
        summary.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            instruments = summary.instruments,
            completed = summary.completed,
            executed = summary.executed,
            skipped = summary.skipped,
            panicked = summary.panicked,
            duration_ms = summary.duration_ms,
            "Scheduling round finished"
        );
        Ok(summary)
    }

    /// Run a round on every interval tick until shutdown
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                max_concurrent = self.max_concurrent,
                "Scheduler started"
            );
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(kind = e.kind(), "Scheduling round skipped: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }
}
