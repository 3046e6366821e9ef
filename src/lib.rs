pub mod cache;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod pipeline;
pub mod risk;
pub mod services;
pub mod source;
pub mod strategy;

pub use cache::{CacheStore, ConfigService, Warmer};
pub use config::AppConfig;
pub use domain::{Action, AggregateDecision, RiskReason, TradeIntent, Verdict};
pub use error::{QuorumError, Result};
pub use pipeline::{DecisionPipeline, Scheduler};
pub use risk::{EmergencyStop, RiskGate};
pub use source::{ConfigSource, InMemoryConfigSource, PostgresStore};
