//! Emergency stop latch
//!
//! Once tripped, every BUY/SELL on every instrument is rejected until an
//! operator resets it. Nothing in the decision path clears it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Why the emergency stop tripped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EmergencyReason {
    /// Manual trigger by operator
    Manual,
    /// Portfolio drawdown reached the configured threshold
    Drawdown { drawdown_percent: Decimal, threshold_percent: Decimal },
    Other(String),
}

impl std::fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencyReason::Manual => write!(f, "Manual"),
            EmergencyReason::Drawdown {
                drawdown_percent,
                threshold_percent,
            } => write!(f, "Drawdown {drawdown_percent}% >= {threshold_percent}%"),
            EmergencyReason::Other(s) => write!(f, "Other: {}", s),
        }
    }
}

/// Emergency stop state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    pub reason: Option<EmergencyReason>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub context: Option<String>,
    /// Who cleared the previous stop, and when
    pub last_reset_by: Option<String>,
    pub last_reset_at: Option<DateTime<Utc>>,
}

/// Process-wide emergency stop latch
#[derive(Clone, Default)]
pub struct EmergencyStop {
    state: Arc<RwLock<EmergencyState>>,
    is_stopped: Arc<AtomicBool>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast atomic check
    pub fn is_active(&self) -> bool {
        self.is_stopped.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> EmergencyState {
        self.state.read().await.clone()
    }

    /// Latch the stop. Returns false when it was already active.
    pub async fn trip(&self, reason: EmergencyReason, context: Option<String>) -> bool {
        if self.is_stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!("🚨 EMERGENCY STOP TRIGGERED: {} - {:?}", reason, context);

        let mut state = self.state.write().await;
        state.active = true;
        state.reason = Some(reason);
        state.triggered_at = Some(Utc::now());
        state.context = context;
        true
    }

    /// Clear the stop (requires manual intervention)
    pub async fn reset(&self, operator: &str) -> bool {
        let mut state = self.state.write().await;
        if !self.is_stopped.swap(false, Ordering::SeqCst) {
            warn!(operator, "Emergency stop reset requested but it was not active");
            return false;
        }
        info!(
            "Resetting emergency stop (operator: {}, was: {:?})",
            operator, state.reason
        );
        *state = EmergencyState {
            last_reset_by: Some(operator.to_string()),
            last_reset_at: Some(Utc::now()),
            ..EmergencyState::default()
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trip_latches_until_reset() {
        let stop = EmergencyStop::new();
        assert!(!stop.is_active());

        assert!(stop.trip(EmergencyReason::Manual, Some("test".into())).await);
        assert!(!stop.trip(EmergencyReason::Manual, None).await);
        assert!(stop.is_active());
        assert_eq!(stop.state().await.reason, Some(EmergencyReason::Manual));

        assert!(stop.reset("ops").await);
        assert!(!stop.is_active());
        let state = stop.state().await;
        assert!(!state.active);
        assert_eq!(state.last_reset_by.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_reset_when_inactive_is_noop() {
        let stop = EmergencyStop::new();
        assert!(!stop.reset("ops").await);
    }
}
