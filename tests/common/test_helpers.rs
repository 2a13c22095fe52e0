//! Shared fixtures for the integration suite.
#![allow(dead_code)]

use redoubt::{
    Classifier, ClientConfig, CommandEngine, InstantSleeper, ManualClock, MapSource, MemorySink,
};
use std::sync::Arc;

/// Error type standing in for a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeHttpError {
    /// Retryable: the server fell over.
    ServerError(u16),
    /// Retryable: the connection never established.
    ConnectionReset,
    /// Non-retryable: the caller sent garbage.
    BadRequest,
    /// Non-retryable: missing credentials.
    Unauthorized,
}

impl std::fmt::Display for FakeHttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerError(code) => write!(f, "server error {code}"),
            Self::ConnectionReset => write!(f, "connection reset"),
            Self::BadRequest => write!(f, "bad request"),
            Self::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

impl std::error::Error for FakeHttpError {}

/// Classification mirroring an HTTP client: 4xx is permanent, the rest is
/// transient.
pub fn http_classifier() -> Classifier<FakeHttpError> {
    Classifier::new().non_retryable(|e: &FakeHttpError| {
        matches!(e, FakeHttpError::BadRequest | FakeHttpError::Unauthorized)
    })
}

/// Engine wired for deterministic tests: no real backoff sleeps, a
/// hand-driven breaker clock, and an in-memory event sink.
pub struct TestRig {
    pub engine: CommandEngine,
    pub clock: ManualClock,
    pub sink: Arc<MemorySink>,
}

pub fn test_rig() -> TestRig {
    let clock = ManualClock::new();
    let sink = Arc::new(MemorySink::new());
    let engine = CommandEngine::builder()
        .sleeper(Arc::new(InstantSleeper))
        .clock(Arc::new(clock.clone()))
        .sink(sink.clone())
        .build();
    TestRig { engine, clock, sink }
}

/// Config view over an in-memory property map with the `api` prefix.
pub fn client_config(pairs: &[(&str, &str)]) -> ClientConfig {
    ClientConfig::new("api", Arc::new(MapSource::from_pairs(pairs.iter().copied())))
}
