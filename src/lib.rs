#![forbid(unsafe_code)]

//! # Redoubt
//!
//! Fault-tolerant remote-call execution for async Rust. A [`Command`]
//! wraps an arbitrary remote invocation with service discovery, bounded
//! concurrency with circuit breaking, retry with backoff, and optional
//! read-through result caching; the [`CommandEngine`] composes the four
//! into a single submission surface.
//!
//! ## Features
//!
//! - **Circuit breakers** with rolling-window error rates, sleep windows,
//!   and single half-open probes
//! - **Bulkheads** bounding concurrency per command, with pool or
//!   semaphore isolation
//! - **Retry driver** with failure classification, backoff schedules, and
//!   jitter
//! - **URI providers** over static endpoints or service discovery, with
//!   instance-level error marking
//! - **Command caches** with translation hooks and pluggable stores
//! - **Property-store configuration** binding the whole table of
//!   per-command options
//!
//! ## Quick Start
//!
//! ```rust
//! use redoubt::{Command, CommandEngine};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone)]
//! struct TransportError(&'static str);
//!
//! impl std::fmt::Display for TransportError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{}", self.0)
//!     }
//! }
//!
//! impl std::error::Error for TransportError {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!     let counter = attempts.clone();
//!
//!     let command = Command::builder()
//!         .name("GetGreeting")
//!         .uri("http://api.example.com")
//!         .max_attempts(3)
//!         .callback(move |_ctx, base| {
//!             let counter = counter.clone();
//!             async move {
//!                 if counter.fetch_add(1, Ordering::Relaxed) == 0 {
//!                     Err(TransportError("connection reset"))
//!                 } else {
//!                     Ok(format!("hello from {base}"))
//!                 }
//!             }
//!         })
//!         .build()?;
//!
//!     let engine = CommandEngine::new();
//!     let greeting = engine.execute(&command).await?;
//!     assert_eq!(greeting, "hello from http://api.example.com");
//!     Ok(())
//! }
//! ```

mod backoff;
mod breaker;
mod bulkhead;
mod cache;
mod classify;
mod clock;
mod command;
mod config;
mod context;
mod engine;
mod error;
mod health;
mod jitter;
mod provider;
mod retry;
mod sleeper;
mod telemetry;

// Re-exports
pub use backoff::Backoff;
pub use breaker::{BreakerPolicy, CircuitBreaker, CircuitState, ShortCircuit, WindowMetrics};
pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadRejection, IsolationMode};
pub use cache::{
    AnyCache, CacheConfig, CacheLookup, CacheStore, CommandCache, MemoryStore, TtlStore,
};
pub use classify::{Classification, Classifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use command::{
    AttemptInterceptor, CacheBinding, CacheInterceptor, Command, CommandBuilder, DescriptorError,
    ExecutionPolicy, Fallback, PoolPolicy, RemoteCallback, RetryPolicy, DEFAULT_COMMAND_NAME,
};
pub use config::{
    parse_kv, CacheBackendKind, CacheSettings, ClientConfig, CommandPolicies, ConfigSource,
    MapSource,
};
pub use context::CommandContext;
pub use engine::{CommandEngine, CommandHandle, EngineBuilder};
pub use error::{CommandError, MAX_ATTEMPT_FAILURES};
pub use health::{BreakerFailureCheck, DiscoveryCheck, HealthCheck, HealthReport, HealthStatus};
pub use jitter::Jitter;
pub use provider::{
    BaseUri, ConstantUriProvider, DiscoveryUriProvider, ProviderError, SelectionStrategy,
    ServiceDiscovery, ServiceInstance, StaticDiscovery, UriProvider,
};
pub use retry::{AttemptFailure, RetryDriver, RetryDriverBuilder, RetryListener};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{CommandEvent, EventSink, LogSink, MemorySink, NullSink};

pub mod prelude;
