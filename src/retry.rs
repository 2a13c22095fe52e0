//! Retry driver: attempt scheduling, classification, and listener events.

use crate::backoff::Backoff;
use crate::classify::Classifier;
use crate::error::{CommandError, MAX_ATTEMPT_FAILURES};
use crate::jitter::Jitter;
use crate::provider::ProviderError;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Cause of one failed attempt, before classification.
#[derive(Debug)]
pub enum AttemptFailure<E> {
    /// The attempt exceeded the per-attempt latency budget. Retryable.
    Timeout { elapsed: Duration, budget: Duration },
    /// The provider had no instance to offer. Retryable; discovery may
    /// repopulate between attempts.
    NoInstance { pool: String },
    /// The callback failed; the classification table decides.
    Inner(E),
}

impl<E> From<ProviderError> for AttemptFailure<E> {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NoInstance { pool } => AttemptFailure::NoInstance { pool },
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { elapsed, budget } => {
                write!(f, "attempt timed out after {:?} (budget: {:?})", elapsed, budget)
            }
            Self::NoInstance { pool } => write!(f, "no available instance in pool '{}'", pool),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

/// Side-effect-only observer of the retry loop. Implementations must not
/// block; their output is never consulted.
pub trait RetryListener<E>: Send + Sync {
    /// Called before each attempt runs.
    fn on_open(&self, _attempt: usize) {}
    /// Called after a failed attempt, before classification decides its fate.
    fn on_error(&self, _attempt: usize, _cause: &AttemptFailure<E>) {}
    /// Called once with the terminal outcome's cause (None on success).
    fn on_close(&self, _last_cause: Option<&AttemptFailure<E>>) {}
}

/// Drives an operation through up to `max_attempts` tries.
pub struct RetryDriver<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    classifier: Classifier<E>,
    sleeper: Arc<dyn Sleeper>,
    listeners: Vec<Arc<dyn RetryListener<E>>>,
}

impl<E> std::fmt::Debug for RetryDriver<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryDriver")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<E> RetryDriver<E>
where
    E: Send,
{
    pub fn builder() -> RetryDriverBuilder<E> {
        RetryDriverBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `op` until it succeeds, fails non-retryably, or the attempt
    /// budget runs out. `op` receives the 1-indexed attempt number.
    ///
    /// Terminal failure mapping: a non-retryable inner failure surfaces as
    /// [`CommandError::Rejected`]; an exhausted budget surfaces as the last
    /// cause's kind (`Timeout`, `NoInstance`, or `AttemptsExhausted` with
    /// the trailing inner failures).
    pub async fn execute<T, Fut, Op>(&self, mut op: Op) -> Result<T, CommandError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, AttemptFailure<E>>> + Send,
        Op: FnMut(usize) -> Fut + Send,
    {
        let mut inner_failures: Vec<E> = Vec::new();

        for attempt in 1..=self.max_attempts {
            for listener in &self.listeners {
                listener.on_open(attempt);
            }

            match op(attempt).await {
                Ok(value) => {
                    for listener in &self.listeners {
                        listener.on_close(None);
                    }
                    return Ok(value);
                }
                Err(failure) => {
                    for listener in &self.listeners {
                        listener.on_error(attempt, &failure);
                    }

                    let retryable = match &failure {
                        AttemptFailure::Timeout { .. } => true,
                        AttemptFailure::NoInstance { .. } => true,
                        AttemptFailure::Inner(e) => self.classifier.classify(e).is_retryable(),
                    };

                    if !retryable {
                        for listener in &self.listeners {
                            listener.on_close(Some(&failure));
                        }
                        return Err(match failure {
                            AttemptFailure::Inner(e) => CommandError::Rejected(e),
                            // Timeout and NoInstance are always retryable.
                            _ => unreachable!("non-inner failures are retryable"),
                        });
                    }

                    if attempt >= self.max_attempts {
                        for listener in &self.listeners {
                            listener.on_close(Some(&failure));
                        }
                        return Err(self.terminal(failure, inner_failures));
                    }

                    if let AttemptFailure::Inner(e) = failure {
                        inner_failures.push(e);
                        if inner_failures.len() > MAX_ATTEMPT_FAILURES {
                            let excess = inner_failures.len() - MAX_ATTEMPT_FAILURES;
                            inner_failures.drain(0..excess);
                        }
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop returns from its final attempt")
    }

    fn terminal(&self, last: AttemptFailure<E>, mut inner_failures: Vec<E>) -> CommandError<E> {
        match last {
            AttemptFailure::Timeout { elapsed, budget } => {
                CommandError::Timeout { elapsed, budget }
            }
            AttemptFailure::NoInstance { pool } => CommandError::NoInstance { pool },
            AttemptFailure::Inner(e) => {
                inner_failures.push(e);
                if inner_failures.len() > MAX_ATTEMPT_FAILURES {
                    let excess = inner_failures.len() - MAX_ATTEMPT_FAILURES;
                    inner_failures.drain(0..excess);
                }
                CommandError::AttemptsExhausted {
                    attempts: self.max_attempts,
                    failures: inner_failures,
                }
            }
        }
    }
}

pub struct RetryDriverBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    classifier: Classifier<E>,
    sleeper: Arc<dyn Sleeper>,
    listeners: Vec<Arc<dyn RetryListener<E>>>,
}

impl<E> RetryDriverBuilder<E>
where
    E: Send,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::None,
            classifier: Classifier::new(),
            sleeper: Arc::new(TokioSleeper),
            listeners: Vec::new(),
        }
    }

    /// Attempt budget, counting the first try. Zero is repaired to one.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        if attempts == 0 {
            tracing::warn!("max_attempts 0 repaired to 1");
            self.max_attempts = 1;
        } else {
            self.max_attempts = attempts;
        }
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn classifier(mut self, classifier: Classifier<E>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Use an already-shared sleeper.
    pub fn shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RetryListener<E>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> RetryDriver<E> {
        RetryDriver {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            classifier: self.classifier,
            sleeper: self.sleeper,
            listeners: self.listeners,
        }
    }
}

impl<E> Default for RetryDriverBuilder<E>
where
    E: Send,
{
    fn default() -> Self {
        Self::new()
    }
}
