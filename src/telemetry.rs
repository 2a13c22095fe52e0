//! Structured events emitted during command execution.
//!
//! Every policy decision the engine takes is surfaced as a [`CommandEvent`]
//! flowing into an [`EventSink`]. Sinks are best-effort observers: the
//! engine never consults their output and a misbehaving sink cannot change
//! a command's outcome.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Events describing what the engine did with a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// An attempt is about to run.
    AttemptStarted { command: String, attempt: usize },
    /// An attempt failed and will feed classification.
    AttemptFailed { command: String, attempt: usize },
    /// A retry was scheduled after a failed attempt.
    RetryScheduled { command: String, attempt: usize, delay: Duration },
    /// The retry budget ran out.
    AttemptsExhausted { command: String, attempts: usize },
    /// The breaker moved to open.
    CircuitOpened { command: String, total: u64 },
    /// The breaker admitted a half-open probe.
    CircuitHalfOpen { command: String },
    /// The breaker moved back to closed.
    CircuitClosed { command: String },
    /// A submission was rejected by the breaker.
    ShortCircuited { command: String },
    /// A submission was rejected by the bulkhead.
    PoolRejected { command: String, in_flight: usize, max: usize },
    /// The bound cache answered with a present value.
    CacheHit { command: String, cache: String },
    /// The bound cache had no usable entry.
    CacheMiss { command: String, cache: String },
    /// A successful result was written through to the cache.
    CacheStored { command: String, cache: String },
    /// The submission was cancelled from the outside.
    Cancelled { command: String },
}

impl fmt::Display for CommandEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttemptStarted { command, attempt } => {
                write!(f, "{command}: attempt {attempt} started")
            }
            Self::AttemptFailed { command, attempt } => {
                write!(f, "{command}: attempt {attempt} failed")
            }
            Self::RetryScheduled { command, attempt, delay } => {
                write!(f, "{command}: retry after attempt {attempt} in {delay:?}")
            }
            Self::AttemptsExhausted { command, attempts } => {
                write!(f, "{command}: exhausted after {attempts} attempts")
            }
            Self::CircuitOpened { command, total } => {
                write!(f, "{command}: circuit opened ({total} events in window)")
            }
            Self::CircuitHalfOpen { command } => write!(f, "{command}: circuit half-open"),
            Self::CircuitClosed { command } => write!(f, "{command}: circuit closed"),
            Self::ShortCircuited { command } => write!(f, "{command}: short-circuited"),
            Self::PoolRejected { command, in_flight, max } => {
                write!(f, "{command}: pool rejected ({in_flight}/{max} in flight)")
            }
            Self::CacheHit { command, cache } => write!(f, "{command}: cache hit ({cache})"),
            Self::CacheMiss { command, cache } => write!(f, "{command}: cache miss ({cache})"),
            Self::CacheStored { command, cache } => {
                write!(f, "{command}: cache stored ({cache})")
            }
            Self::Cancelled { command } => write!(f, "{command}: cancelled"),
        }
    }
}

/// Consumer of command events. Side-effect only.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: CommandEvent);
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: CommandEvent) {}
}

/// Forwards events to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: CommandEvent) {
        tracing::info!(event = %event, "command_event");
    }
}

/// Stores events in memory, evicting the oldest past capacity.
#[derive(Debug, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<CommandEvent>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::new(Mutex::new(Vec::new())), capacity: capacity.max(1) }
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<CommandEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of events matching a predicate.
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CommandEvent) -> bool,
    {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).iter().filter(|e| predicate(e)).count()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: CommandEvent) {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if guard.len() >= self.capacity {
            guard.remove(0);
        }
        guard.push(event);
    }
}
