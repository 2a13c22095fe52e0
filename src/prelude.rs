//! Convenience re-exports for the common path.
//!
//! ```rust
//! use redoubt::prelude::*;
//! ```

pub use crate::{
    Backoff, BaseUri, BreakerPolicy, CacheConfig, CacheLookup, Classification, Classifier,
    ClientConfig, Command, CommandCache, CommandContext, CommandEngine, CommandError,
    ConstantUriProvider, DiscoveryUriProvider, ExecutionPolicy, IsolationMode, Jitter, MapSource,
    PoolPolicy, RetryPolicy, SelectionStrategy, ServiceDiscovery, ServiceInstance, UriProvider,
};
