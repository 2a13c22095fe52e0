//! Abstraction over inter-attempt waits
//!
//! Lets tests drive the retry driver without real time delays.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        // no-op
    }
}

/// Test sleeper that records every requested duration without waiting.
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Number of recorded sleep calls.
    pub fn calls(&self) -> usize {
        self.calls.lock().expect("TrackingSleeper.calls: mutex poisoned").len()
    }

    /// A recorded call duration by index, if present.
    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.calls.lock().expect("TrackingSleeper.call_at: mutex poisoned").get(index).copied()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("TrackingSleeper.clear: mutex poisoned").clear();
    }
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}
