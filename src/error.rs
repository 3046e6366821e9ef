use thiserror::Error;

/// Main error type for the decision engine
#[derive(Error, Debug)]
pub enum QuorumError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Config source errors (fail closed)
    #[error("Config unavailable for {key}: {reason}")]
    ConfigUnavailable { key: String, reason: String },

    #[error("Config fetch for {key} timed out after {timeout_ms}ms")]
    ConfigTimeout { key: String, timeout_ms: u64 },

    #[error("Instrument not found: {0}")]
    InstrumentNotFound(String),

    #[error("Risk config missing for instrument: {0}")]
    RiskConfigMissing(String),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    // Execution errors
    #[error("Execution failed: {0}")]
    Execution(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl QuorumError {
    /// True for the family of errors that make an instrument's cycle skip
    /// instead of deciding on guessed configuration.
    pub fn is_config_unavailable(&self) -> bool {
        matches!(
            self,
            QuorumError::ConfigUnavailable { .. }
                | QuorumError::ConfigTimeout { .. }
                | QuorumError::InstrumentNotFound(_)
                | QuorumError::RiskConfigMissing(_)
        )
    }

    /// Short, stable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            QuorumError::Config(_) => "config",
            QuorumError::Database(_) | QuorumError::Migration(_) => "database",
            QuorumError::Json(_) => "json",
            QuorumError::ConfigUnavailable { .. } => "config_unavailable",
            QuorumError::ConfigTimeout { .. } => "config_timeout",
            QuorumError::InstrumentNotFound(_) => "instrument_not_found",
            QuorumError::RiskConfigMissing(_) => "risk_config_missing",
            QuorumError::MarketDataUnavailable(_) => "market_data",
            QuorumError::Execution(_) => "execution",
            QuorumError::Validation(_) => "validation",
            QuorumError::Io(_) => "io",
            QuorumError::Internal(_) | QuorumError::Other(_) => "internal",
        }
    }
}

/// Result type alias for QuorumError
pub type Result<T> = std::result::Result<T, QuorumError>;

/// Specific error types for order execution
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("Intent {intent_id} is not actionable ({reason})")]
    NotActionable { intent_id: String, reason: String },

    #[error("Insufficient balance: available ${available}, required ${required}")]
    InsufficientBalance {
        available: rust_decimal::Decimal,
        required: rust_decimal::Decimal,
    },

    #[error("No open position to sell for {symbol}")]
    NoPosition { symbol: String },

    #[error("Invalid price: {0}")]
    InvalidPrice(rust_decimal::Decimal),
}

impl From<ExecutionError> for QuorumError {
    fn from(err: ExecutionError) -> Self {
        QuorumError::Execution(err.to_string())
    }
}
