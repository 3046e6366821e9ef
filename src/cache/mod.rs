pub mod keys;
pub mod service;
pub mod store;
pub mod warmer;

pub use service::{ConfigCacheReport, ConfigEntry, ConfigService, LookupStats};
pub use store::{CacheEntry, CacheStats, CacheStore, DEFAULT_TTL};
pub use warmer::{WarmFailure, WarmReport, Warmer};
