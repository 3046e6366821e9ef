pub mod api;
pub mod audit;
pub mod metrics;

pub use api::{router, ApiServer, ApiState, ComponentHealth, HealthResponse, HealthStatus};
pub use audit::{AuditRecord, DecisionAudit, DEFAULT_AUDIT_CAPACITY};
pub use metrics::{Metrics, MetricsSnapshot};
