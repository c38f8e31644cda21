// Core building blocks for the geoscope control plane: error taxonomy,
// log-level gate, response cache and the resilient outbound-call layer.

pub mod cache;
pub mod error;
pub mod http;
pub mod log_level;
pub mod resilience;

pub use cache::{cache_key, CacheEntry, CacheHit, CachePolicy, CacheStats, CacheStore, Freshness};
pub use error::{DispatchError, DispatchResult, ErrorKind};
pub use http::{FetchedPage, HttpFetcher};
pub use log_level::{LevelChange, LevelGate, LogLevel};
pub use resilience::{
    CallError, CallOptions, CallOutcome, PermanentFailure, ResilientCaller, ResponseSource,
    RetryConfig,
};
