//! Error types surfaced by command execution

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside AttemptsExhausted to avoid unbounded growth.
pub const MAX_ATTEMPT_FAILURES: usize = 10;

/// Unified error type for a command submission.
///
/// Every terminal outcome of a submission is exactly one of these kinds.
/// `E` is the caller's error type as produced by the remote callback.
#[derive(Debug)]
pub enum CommandError<E> {
    /// The attempt exceeded the per-attempt latency budget
    Timeout { elapsed: Duration, budget: Duration },
    /// The bulkhead rejected the submission at capacity
    PoolRejected { in_flight: usize, max: usize },
    /// The circuit breaker was open at submission time
    ShortCircuited { error_rate: f64, open_for: Duration },
    /// The provider's instance pool had no available instance
    NoInstance { pool: String },
    /// The outer future or stream was cancelled before completion
    Cancelled,
    /// All retry attempts were exhausted; holds the trailing failure causes
    AttemptsExhausted { attempts: usize, failures: Vec<E> },
    /// The failure was classified non-retryable and propagated as-is
    Rejected(E),
}

impl<E: Clone> Clone for CommandError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Timeout { elapsed, budget } => {
                Self::Timeout { elapsed: *elapsed, budget: *budget }
            }
            Self::PoolRejected { in_flight, max } => {
                Self::PoolRejected { in_flight: *in_flight, max: *max }
            }
            Self::ShortCircuited { error_rate, open_for } => {
                Self::ShortCircuited { error_rate: *error_rate, open_for: *open_for }
            }
            Self::NoInstance { pool } => Self::NoInstance { pool: pool.clone() },
            Self::Cancelled => Self::Cancelled,
            Self::AttemptsExhausted { attempts, failures } => {
                Self::AttemptsExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Rejected(e) => Self::Rejected(e.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for CommandError<E> {
    fn eq(&self, other: &Self) -> bool {
        use CommandError::*;
        match (self, other) {
            (Timeout { elapsed: a1, budget: b1 }, Timeout { elapsed: a2, budget: b2 }) => {
                a1 == a2 && b1 == b2
            }
            (
                PoolRejected { in_flight: a1, max: b1 },
                PoolRejected { in_flight: a2, max: b2 },
            ) => a1 == a2 && b1 == b2,
            (
                ShortCircuited { error_rate: r1, open_for: d1 },
                ShortCircuited { error_rate: r2, open_for: d2 },
            ) => r1 == r2 && d1 == d2,
            (NoInstance { pool: p1 }, NoInstance { pool: p2 }) => p1 == p2,
            (Cancelled, Cancelled) => true,
            (
                AttemptsExhausted { attempts: a1, failures: f1 },
                AttemptsExhausted { attempts: a2, failures: f2 },
            ) => a1 == a2 && f1 == f2,
            (Rejected(e1), Rejected(e2)) => e1 == e2,
            _ => false,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CommandError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, budget } => {
                write!(f, "attempt timed out after {:?} (budget: {:?})", elapsed, budget)
            }
            Self::PoolRejected { in_flight, max } => {
                write!(f, "bulkhead rejected submission ({} in-flight, max {})", in_flight, max)
            }
            Self::ShortCircuited { error_rate, open_for } => {
                write!(
                    f,
                    "circuit breaker open ({:.1}% error rate, open for {:?})",
                    error_rate * 100.0,
                    open_for
                )
            }
            Self::NoInstance { pool } => {
                write!(f, "no available instance in pool '{}'", pool)
            }
            Self::Cancelled => write!(f, "command cancelled"),
            Self::AttemptsExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "attempts exhausted after {} tries ({} failures recorded), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Rejected(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CommandError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::AttemptsExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> CommandError<E> {
    /// Check if this error is due to the per-attempt latency budget
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to the circuit breaker
    pub fn is_short_circuited(&self) -> bool {
        matches!(self, Self::ShortCircuited { .. })
    }

    /// Check if this error is due to bulkhead rejection
    pub fn is_pool_rejected(&self) -> bool {
        matches!(self, Self::PoolRejected { .. })
    }

    /// Check if this error is due to an empty instance pool
    pub fn is_no_instance(&self) -> bool {
        matches!(self, Self::NoInstance { .. })
    }

    /// Check if this error is due to outer cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_attempts_exhausted(&self) -> bool {
        matches!(self, Self::AttemptsExhausted { .. })
    }

    /// Check if this error wraps a non-retryable callback failure
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Extract the non-retryable cause if this is a Rejected variant
    pub fn into_rejected(self) -> Option<E> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the non-retryable cause if present.
    pub fn as_rejected(&self) -> Option<&E> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }

    /// Access all recorded failures for AttemptsExhausted, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::AttemptsExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The last failure cause that produced this terminal outcome, if any.
    pub fn last_cause(&self) -> Option<&E> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::AttemptsExhausted { failures, .. } => failures.last(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    #[test]
    fn timeout_error_display() {
        let err: CommandError<DummyError> = CommandError::Timeout {
            elapsed: Duration::from_millis(8100),
            budget: Duration::from_secs(8),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("8.1"));
    }

    #[test]
    fn pool_rejected_display() {
        let err: CommandError<DummyError> = CommandError::PoolRejected { in_flight: 5, max: 5 };
        let msg = format!("{}", err);
        assert!(msg.contains("bulkhead"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn short_circuited_display_shows_percentage() {
        let err: CommandError<DummyError> = CommandError::ShortCircuited {
            error_rate: 0.75,
            open_for: Duration::from_secs(3),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("circuit breaker"));
        assert!(msg.contains("75.0%"));
    }

    #[test]
    fn no_instance_display_names_pool() {
        let err: CommandError<DummyError> =
            CommandError::NoInstance { pool: "user-service".to_string() };
        assert!(format!("{}", err).contains("user-service"));
    }

    #[test]
    fn attempts_exhausted_display_includes_last_error() {
        let err: CommandError<DummyError> = CommandError::AttemptsExhausted {
            attempts: 3,
            failures: vec![DummyError("first"), DummyError("final")],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("3"));
        assert!(msg.contains("last error"));
        assert!(msg.contains("final"));
    }

    #[test]
    fn source_returns_last_failure_for_exhausted() {
        let err: CommandError<DummyError> = CommandError::AttemptsExhausted {
            attempts: 2,
            failures: vec![DummyError("a"), DummyError("b")],
        };
        let src = err.source().unwrap();
        assert_eq!(src.to_string(), "b");
    }

    #[test]
    fn source_is_none_for_timeout() {
        let err: CommandError<DummyError> = CommandError::Timeout {
            elapsed: Duration::from_secs(1),
            budget: Duration::from_secs(2),
        };
        assert!(err.source().is_none());
    }

    #[test]
    fn predicates_cover_all_variants() {
        let timeout: CommandError<DummyError> = CommandError::Timeout {
            elapsed: Duration::from_secs(1),
            budget: Duration::from_secs(2),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_short_circuited());

        let rejected_pool: CommandError<DummyError> =
            CommandError::PoolRejected { in_flight: 1, max: 1 };
        assert!(rejected_pool.is_pool_rejected());

        let open: CommandError<DummyError> =
            CommandError::ShortCircuited { error_rate: 0.5, open_for: Duration::from_secs(1) };
        assert!(open.is_short_circuited());

        let no_instance: CommandError<DummyError> =
            CommandError::NoInstance { pool: "p".into() };
        assert!(no_instance.is_no_instance());

        let cancelled: CommandError<DummyError> = CommandError::Cancelled;
        assert!(cancelled.is_cancelled());

        let exhausted: CommandError<DummyError> =
            CommandError::AttemptsExhausted { attempts: 2, failures: vec![] };
        assert!(exhausted.is_attempts_exhausted());

        let rejected: CommandError<DummyError> = CommandError::Rejected(DummyError("x"));
        assert!(rejected.is_rejected());
    }

    #[test]
    fn rejected_accessors_work() {
        let err: CommandError<DummyError> = CommandError::Rejected(DummyError("auth"));
        assert_eq!(err.as_rejected().unwrap().0, "auth");
        assert_eq!(err.last_cause().unwrap().0, "auth");
        assert_eq!(err.into_rejected().unwrap().0, "auth");
    }

    #[test]
    fn last_cause_prefers_trailing_failure() {
        let err: CommandError<DummyError> = CommandError::AttemptsExhausted {
            attempts: 2,
            failures: vec![DummyError("a"), DummyError("b")],
        };
        assert_eq!(err.last_cause().unwrap().0, "b");
    }
}
