//! Decision pipeline: per-instrument cycles, scheduling and execution

pub mod decision;
pub mod executor;
pub mod history;
pub mod market;
pub mod scheduler;

pub use decision::{CycleOutcome, DecisionPipeline};
pub use executor::{ExecutionReport, Executor, Fill, FillJournal, PaperExecutor, PaperLedger};
pub use history::TradeHistory;
pub use market::{JsonSnapshotFile, MarketDataSource, StaticMarketData};
pub use scheduler::{CycleSummary, Scheduler};
