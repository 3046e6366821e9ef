use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::info;

use crate::cache::ConfigCacheReport;
use crate::domain::{Action, TradeIntent, Verdict};

/// Metrics collector for observability
pub struct Metrics {
    /// Decision cycles that produced an intent
    pub cycles_run: AtomicU64,
    /// Cycles skipped because configuration or inputs were unavailable
    pub cycles_skipped: AtomicU64,
    pub approved: AtomicU64,
    pub rejected: AtomicU64,
    pub downgraded: AtomicU64,
    /// Approved pass-through HOLDs
    pub held: AtomicU64,
    pub executed: AtomicU64,
    pub execution_failures: AtomicU64,
    pub warm_passes: AtomicU64,
    /// Warm passes that finished with at least one failed fetch
    pub warm_failures: AtomicU64,
    last_cycle_at: AtomicI64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub approved: u64,
    pub rejected: u64,
    pub downgraded: u64,
    pub held: u64,
    pub executed: u64,
    pub execution_failures: u64,
    pub warm_passes: u64,
    pub warm_failures: u64,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            approved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            downgraded: AtomicU64::new(0),
            held: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            execution_failures: AtomicU64::new(0),
            warm_passes: AtomicU64::new(0),
            warm_failures: AtomicU64::new(0),
            last_cycle_at: AtomicI64::new(0),
        }
    }

    pub fn inc_cycles_run(&self) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn inc_cycles_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_execution_failures(&self) {
        self.execution_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an intent under its verdict
    pub fn record_intent(&self, intent: &TradeIntent) {
        let counter = match intent.verdict {
            Verdict::Approved if intent.action == Action::Hold => &self.held,
            Verdict::Approved => &self.approved,
            Verdict::Rejected => &self.rejected,
            Verdict::DowngradedToHold => &self.downgraded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warm(&self, complete: bool) {
        self.warm_passes.fetch_add(1, Ordering::Relaxed);
        if !complete {
            self.warm_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Unix seconds of the last completed cycle, 0 before the first
    pub fn last_cycle_at(&self) -> i64 {
        self.last_cycle_at.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            approved: self.approved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            downgraded: self.downgraded.load(Ordering::Relaxed),
            held: self.held.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            execution_failures: self.execution_failures.load(Ordering::Relaxed),
            warm_passes: self.warm_passes.load(Ordering::Relaxed),
            warm_failures: self.warm_failures.load(Ordering::Relaxed),
        }
    }

    /// Get current metrics as a formatted string
    pub fn summary(&self) -> String {
        let m = self.snapshot();
        format!(
            r#"
=== QUORUM DECISION ENGINE ===
Cycles: {} run, {} skipped
Intents: {} approved | {} rejected | {} downgraded | {} hold
Executions: {} ok, {} failed
Cache warms: {} ({} incomplete)
=============================="#,
            m.cycles_run,
            m.cycles_skipped,
            m.approved,
            m.rejected,
            m.downgraded,
            m.held,
            m.executed,
            m.execution_failures,
            m.warm_passes,
            m.warm_failures,
        )
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self, cache: &ConfigCacheReport, emergency_active: bool) -> String {
        let m = self.snapshot();

        format!(
            r#"# HELP quorum_cycles_total Decision cycles by outcome
# TYPE quorum_cycles_total counter
quorum_cycles_total{{outcome="run"}} {}
quorum_cycles_total{{outcome="skipped"}} {}

# HELP quorum_intents_total Trade intents by verdict
# TYPE quorum_intents_total counter
quorum_intents_total{{verdict="approved"}} {}
quorum_intents_total{{verdict="rejected"}} {}
quorum_intents_total{{verdict="downgraded_to_hold"}} {}
quorum_intents_total{{verdict="hold"}} {}

# HELP quorum_executions_total Submitted intents by result
# TYPE quorum_executions_total counter
quorum_executions_total{{result="ok"}} {}
quorum_executions_total{{result="failed"}} {}

# HELP quorum_cache_warm_passes_total Cache warm passes
# TYPE quorum_cache_warm_passes_total counter
quorum_cache_warm_passes_total {}

# HELP quorum_cache_warm_failures_total Warm passes with failed fetches
# TYPE quorum_cache_warm_failures_total counter
quorum_cache_warm_failures_total {}

# HELP quorum_cache_entries Cached configuration entries
# TYPE quorum_cache_entries gauge
quorum_cache_entries{{state="live"}} {}
quorum_cache_entries{{state="expired"}} {}

# HELP quorum_cache_bytes Approximate cached payload size
# TYPE quorum_cache_bytes gauge
quorum_cache_bytes {}

# HELP quorum_cache_lookups_total Config lookups by result
# TYPE quorum_cache_lookups_total counter
quorum_cache_lookups_total{{result="hit"}} {}
quorum_cache_lookups_total{{result="miss"}} {}
quorum_cache_lookups_total{{result="failure"}} {}

# HELP quorum_emergency_stop Emergency stop latch (1=active)
# TYPE quorum_emergency_stop gauge
quorum_emergency_stop {}
"#,
            m.cycles_run,
            m.cycles_skipped,
            m.approved,
            m.rejected,
            m.downgraded,
            m.held,
            m.executed,
            m.execution_failures,
            m.warm_passes,
            m.warm_failures,
            cache.cache.live_entries,
            cache.cache.expired_entries,
            cache.cache.approx_bytes,
            cache.lookups.hits,
            cache.lookups.misses,
            cache.lookups.fetch_failures,
            u8::from(emergency_active),
        )
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!("{}", self.summary());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
