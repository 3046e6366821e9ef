//! Read-only observability endpoints plus the manual emergency reset

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::audit::DecisionAudit;
use super::metrics::{Metrics, MetricsSnapshot};
use crate::cache::ConfigService;
use crate::error::{QuorumError, Result};
use crate::risk::{EmergencyState, EmergencyStop};

const DEFAULT_DECISION_LIMIT: usize = 50;
const MAX_DECISION_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub counters: MetricsSnapshot,
    pub emergency: EmergencyState,
}

/// Shared state behind every route
pub struct ApiState {
    pub config: Arc<ConfigService>,
    pub audit: Arc<DecisionAudit>,
    pub metrics: Arc<Metrics>,
    pub emergency: EmergencyStop,
    /// Expected gap between scheduling rounds
    pub cycle_interval: Duration,
    started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(
        config: Arc<ConfigService>,
        audit: Arc<DecisionAudit>,
        metrics: Arc<Metrics>,
        emergency: EmergencyStop,
        cycle_interval: Duration,
    ) -> Self {
        Self {
            config,
            audit,
            metrics,
            emergency,
            cycle_interval,
            started_at: Utc::now(),
        }
    }

    pub async fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();
        let mut overall = HealthStatus::Healthy;

        // Config cache
        let report = self.config.report();
        let cache_status = if report.cache.live_entries > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        components.push(ComponentHealth {
            name: "config_cache".to_string(),
            status: cache_status,
            message: Some(format!(
                "{} live, {} fetch failures",
                report.cache.live_entries, report.lookups.fetch_failures
            )),
        });
        if cache_status == HealthStatus::Degraded {
            overall = HealthStatus::Degraded;
        }

        // Scheduler liveness
        let last_cycle = self.metrics.last_cycle_at();
        let stale_after = (self.cycle_interval.as_secs() as i64 * 3).max(1);
        let scheduler_status = if last_cycle == 0 {
            HealthStatus::Degraded
        } else if Utc::now().timestamp() - last_cycle > stale_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "scheduler".to_string(),
            status: scheduler_status,
            message: (last_cycle == 0).then(|| "no cycle completed yet".to_string()),
        });
        if scheduler_status == HealthStatus::Degraded && overall == HealthStatus::Healthy {
            overall = HealthStatus::Degraded;
        }

        // Emergency latch
        let emergency = self.emergency.state().await;
        let risk_status = if emergency.active {
            overall = HealthStatus::Unhealthy;
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "emergency_stop".to_string(),
            status: risk_status,
            message: emergency.reason.as_ref().map(|r| r.to_string()),
        });

        let uptime = (Utc::now() - self.started_at).num_seconds().max(0) as u64;
        HealthResponse {
            status: overall,
            timestamp: Utc::now(),
            uptime_seconds: uptime,
            components,
            counters: self.metrics.snapshot(),
            emergency,
        }
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route("/decisions", get(decisions_handler))
        .route("/metrics", get(metrics_handler))
        .route("/emergency/reset", post(emergency_reset_handler))
        .with_state(state)
}

/// HTTP server for the observability surface
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    pub fn new(state: Arc<ApiState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve until the shutdown flag flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting API server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| QuorumError::Internal(format!("API server error: {}", e)))?;

        Ok(())
    }

    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }
}

async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn cache_stats_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.config.report())
}

#[derive(Debug, Deserialize)]
pub struct DecisionQuery {
    pub limit: Option<usize>,
    pub symbol: Option<String>,
}

async fn decisions_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DecisionQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DECISION_LIMIT)
        .min(MAX_DECISION_LIMIT);
    Json(state.audit.recent(limit, query.symbol.as_deref()).await)
}

async fn metrics_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let text = state
        .metrics
        .prometheus(&state.config.report(), state.emergency.is_active());
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        text,
    )
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub operator: String,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    reset: bool,
    state: EmergencyState,
}

async fn emergency_reset_handler(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ResetRequest>,
) -> impl IntoResponse {
    let operator = request.operator.trim();
    if operator.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "operator is required" })),
        );
    }
    let reset = state.emergency.reset(operator).await;
    if !reset {
        warn!(operator, "Reset requested while emergency stop inactive");
    }
    let body = ResetResponse {
        reset,
        state: state.emergency.state().await,
    };
    (
        StatusCode::OK,
        Json(serde_json::to_value(body).unwrap_or_default()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::domain::{Action, AggregateDecision, GlobalRiskConfig, HoldReason, TradeIntent};
    use crate::risk::EmergencyReason;
    use crate::services::AuditRecord;
    use crate::source::InMemoryConfigSource;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    fn state() -> Arc<ApiState> {
        let config = Arc::new(ConfigService::new(
            Arc::new(CacheStore::default()),
            Arc::new(InMemoryConfigSource::new()),
            Duration::from_millis(100),
            GlobalRiskConfig::default(),
        ));
        Arc::new(ApiState::new(
            config,
            Arc::new(DecisionAudit::default()),
            Arc::new(Metrics::new()),
            EmergencyStop::new(),
            Duration::from_secs(60),
        ))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn audit_record(symbol: &str) -> AuditRecord {
        AuditRecord {
            symbol: symbol.to_string(),
            decision: AggregateDecision {
                symbol: symbol.to_string(),
                action: Action::Hold,
                score: Decimal::ZERO,
                epsilon: Decimal::ZERO,
                votes: vec![],
                hold_reason: Some(HoldReason::NoVotes),
                decided_at: Utc::now(),
            },
            intent: TradeIntent::new(symbol, Action::Hold, Decimal::ONE, Decimal::ZERO),
            executed: false,
            execution_error: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_liveness() {
        let response = router(state())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_latched() {
        let state = state();
        state.emergency.trip(EmergencyReason::Manual, None).await;

        let response = router(Arc::clone(&state))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["emergency"]["active"], true);
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let response = router(state())
            .oneshot(Request::builder().uri("/cache/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total_entries"], 0);
        assert_eq!(body["default_ttl_secs"], 300);
        assert_eq!(body["lookups"]["hits"], 0);
    }

    #[tokio::test]
    async fn test_decisions_filter_and_limit() {
        let state = state();
        for sym in ["A", "B", "A", "A"] {
            state.audit.record(audit_record(sym)).await;
        }

        let response = router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .uri("/decisions?limit=2&symbol=A")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let records = body.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r["symbol"] == "A"));
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let response = router(state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("quorum_emergency_stop 0"));
    }

    #[tokio::test]
    async fn test_emergency_reset() {
        let state = state();
        state.emergency.trip(EmergencyReason::Manual, None).await;

        let request = |body: &str| {
            Request::builder()
                .method("POST")
                .uri("/emergency/reset")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = router(Arc::clone(&state))
            .oneshot(request(r#"{"operator": "  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.emergency.is_active());

        let response = router(Arc::clone(&state))
            .oneshot(request(r#"{"operator": "alice"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["reset"], true);
        assert_eq!(body["state"]["last_reset_by"], "alice");
        assert!(!state.emergency.is_active());
    }
}
