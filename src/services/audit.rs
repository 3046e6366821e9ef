use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::RwLock;

use crate::domain::{AggregateDecision, TradeIntent};

pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// One decision cycle as observed from outside
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub symbol: String,
    pub decision: AggregateDecision,
    pub intent: TradeIntent,
    pub executed: bool,
    pub execution_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded in-memory log of recent decisions, oldest evicted first
pub struct DecisionAudit {
    records: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl DecisionAudit {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY))),
            capacity,
        }
    }

    pub async fn record(&self, record: AuditRecord) {
        let mut records = self.records.write().await;
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Newest first, optionally for one symbol
    pub async fn recent(&self, limit: usize, symbol: Option<&str>) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| symbol.map_or(true, |s| r.symbol == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for DecisionAudit {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}
