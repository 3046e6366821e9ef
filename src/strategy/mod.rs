pub mod aggregator;
pub mod indicators;
pub mod registry;

pub use aggregator::{aggregate_votes, collect_votes, SignalAggregator};
pub use indicators::IndicatorSnapshot;
pub use registry::StrategyKind;
