use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{QuorumError, Result};
use crate::strategy::IndicatorSnapshot;

/// Supplies the current price and indicator values for an instrument
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<IndicatorSnapshot>;
}

/// Reads `{ "SYM": { ..snapshot.. } }` from a JSON file on every call, so an
/// external indicator job can rewrite the file between cycles.
#[derive(Debug, Clone)]
pub struct JsonSnapshotFile {
    path: PathBuf,
}

impl JsonSnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MarketDataSource for JsonSnapshotFile {
    async fn snapshot(&self, symbol: &str) -> Result<IndicatorSnapshot> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            QuorumError::MarketDataUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let mut all: HashMap<String, IndicatorSnapshot> = serde_json::from_str(&raw)?;
        let mut snapshot = all.remove(symbol).ok_or_else(|| {
            QuorumError::MarketDataUnavailable(format!("no snapshot for {symbol}"))
        })?;
        if snapshot.symbol.is_empty() {
            snapshot.symbol = symbol.to_string();
        }
        Ok(snapshot)
    }
}

/// Fixed snapshots held in memory
#[derive(Debug, Default)]
pub struct StaticMarketData {
    snapshots: RwLock<HashMap<String, IndicatorSnapshot>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, snapshot: IndicatorSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.symbol.clone(), snapshot);
    }

    pub async fn remove(&self, symbol: &str) {
        self.snapshots.write().await.remove(symbol);
    }
}

#[async_trait]
impl MarketDataSource for StaticMarketData {
    async fn snapshot(&self, symbol: &str) -> Result<IndicatorSnapshot> {
        self.snapshots
            .read()
            .await
            .get(symbol)
            .cloned()
            .ok_or_else(|| QuorumError::MarketDataUnavailable(format!("no snapshot for {symbol}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_json_file_reads_per_call() {
        let path = std::env::temp_dir().join(format!("quorum-md-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"BTC/USD": {"price": "50000", "rsi": 25.0}}"#)
            .unwrap();

        let source = JsonSnapshotFile::new(&path);
        let snap = source.snapshot("BTC/USD").await.unwrap();
        assert_eq!(snap.symbol, "BTC/USD");
        assert_eq!(snap.price, dec!(50000));
        assert_eq!(snap.rsi, Some(25.0));
        assert!(snap.short_sma.is_none());

        std::fs::write(&path, r#"{"BTC/USD": {"symbol": "BTC/USD", "price": "51000"}}"#).unwrap();
        assert_eq!(source.snapshot("BTC/USD").await.unwrap().price, dec!(51000));

        let err = source.snapshot("ETH/USD").await.unwrap_err();
        assert!(matches!(err, QuorumError::MarketDataUnavailable(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let source = JsonSnapshotFile::new("/nonexistent/quorum/indicators.json");
        assert!(matches!(
            source.snapshot("X").await,
            Err(QuorumError::MarketDataUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_static_market_data() {
        let md = StaticMarketData::new();
        md.set(IndicatorSnapshot::new("X/USD", dec!(10))).await;
        assert_eq!(md.snapshot("X/USD").await.unwrap().price, dec!(10));
        md.remove("X/USD").await;
        assert!(md.snapshot("X/USD").await.is_err());
    }
}
