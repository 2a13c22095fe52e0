//! The command execution engine.
//!
//! One engine owns the per-command-name registries of breakers, bulkheads,
//! and caches, and exposes the single submission surface in three delivery
//! shapes: [`CommandEngine::execute`] (caller awaits the outcome),
//! [`CommandEngine::enqueue`] (spawned task behind a cancellable handle),
//! and [`CommandEngine::observe`] (one-shot stream over the handle).
//!
//! Per submission: the breaker gates first, then a bulkhead slot is
//! acquired, then the retry driver runs attempts. Cache lookups happen
//! inside the retry loop so a hit short-circuits remaining attempts; cache
//! writes happen only after the producing callback returned. The slot is
//! an RAII permit, released on every exit path.

use crate::breaker::CircuitBreaker;
use crate::bulkhead::{Bulkhead, IsolationMode};
use crate::cache::AnyCache;
use crate::clock::{Clock, MonotonicClock};
use crate::command::Command;
use crate::context::CommandContext;
use crate::error::CommandError;
use crate::retry::{AttemptFailure, RetryDriver};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{CommandEvent, EventSink, NullSink};
use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::task::JoinHandle;

struct EngineInner {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    bulkheads: Mutex<HashMap<String, Arc<Bulkhead>>>,
    caches: Mutex<HashMap<String, Arc<dyn AnyCache>>>,
    sink: Arc<dyn EventSink>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

/// Shared handle to the engine. Clones share the registries.
#[derive(Clone)]
pub struct CommandEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CommandEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEngine")
            .field("breakers", &self.inner.breakers.lock().unwrap_or_else(|p| p.into_inner()).len())
            .field("caches", &self.inner.caches.lock().unwrap_or_else(|p| p.into_inner()).len())
            .finish()
    }
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder injecting the engine's shared collaborators.
pub struct EngineBuilder {
    sink: Arc<dyn EventSink>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            sink: Arc::new(NullSink),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Event sink receiving every policy decision.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sleeper used for inter-attempt backoff (tests inject fakes).
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Clock driving breaker windows (tests inject fakes).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> CommandEngine {
        CommandEngine {
            inner: Arc::new(EngineInner {
                breakers: Mutex::new(HashMap::new()),
                bulkheads: Mutex::new(HashMap::new()),
                caches: Mutex::new(HashMap::new()),
                sink: self.sink,
                sleeper: self.sleeper,
                clock: self.clock,
            }),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandEngine {
    /// Engine with production collaborators and no event sink.
    pub fn new() -> Self {
        EngineBuilder::new().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Submit a command and await its outcome on the calling task.
    pub async fn execute<T, E>(&self, command: &Command<T, E>) -> Result<T, CommandError<E>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let ctx = command.new_context();
        self.run(command, ctx).await
    }

    /// Submit a command onto the runtime; the handle resolves with the
    /// outcome and can cancel the submission.
    pub fn enqueue<T, E>(&self, command: Command<T, E>) -> CommandHandle<T, E>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let ctx = command.new_context();
        let handle_ctx = ctx.clone();
        let engine = self.clone();
        let join = tokio::spawn(async move { engine.run(&command, ctx).await });
        CommandHandle { join, ctx: handle_ctx }
    }

    /// Submit a command as a one-shot stream: exactly one `next(value)` or
    /// `error(kind)` item.
    pub fn observe<T, E>(
        &self,
        command: Command<T, E>,
    ) -> impl Stream<Item = Result<T, CommandError<E>>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        futures::stream::once(self.enqueue(command))
    }

    /// Breaker registered under a command name, if one exists yet.
    pub fn breaker(&self, command: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.breakers.lock().unwrap_or_else(|p| p.into_inner()).get(command).cloned()
    }

    /// Cache registered under a name, if any command bound it.
    pub fn cache(&self, name: &str) -> Option<Arc<dyn AnyCache>> {
        self.inner.caches.lock().unwrap_or_else(|p| p.into_inner()).get(name).cloned()
    }

    /// Purge a registered cache. Returns whether the name was known.
    pub fn empty_cache(&self, name: &str) -> bool {
        match self.cache(name) {
            Some(cache) => {
                cache.empty();
                true
            }
            None => false,
        }
    }

    /// Reset a breaker to Closed. Returns whether the name was known.
    pub fn reset_breaker(&self, command: &str) -> bool {
        match self.breaker(command) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Sorted snapshot of breaker states, for operational tooling.
    pub fn breaker_snapshot(&self) -> Vec<(String, crate::breaker::CircuitState)> {
        let map = self.inner.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<_> =
            map.iter().map(|(name, breaker)| (name.clone(), breaker.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn breaker_for<T, E>(&self, command: &Command<T, E>) -> Arc<CircuitBreaker> {
        let mut map = self.inner.breakers.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(command.name.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_parts(
                    command.name.clone(),
                    command.breaker.clone(),
                    self.inner.clock.clone(),
                    self.inner.sink.clone(),
                ))
            })
            .clone()
    }

    fn bulkhead_for<T, E>(&self, command: &Command<T, E>) -> Arc<Bulkhead> {
        let mut map = self.inner.bulkheads.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(command.name.clone())
            .or_insert_with(|| {
                let queue_limit = match command.execution.isolation {
                    IsolationMode::Pool => command.pool.queue_limit(),
                    IsolationMode::Semaphore => 0,
                };
                Arc::new(Bulkhead::new(command.pool.core_size, queue_limit))
            })
            .clone()
    }

    fn register_cache(&self, cache: Arc<dyn AnyCache>) {
        let mut map = self.inner.caches.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(cache.name().to_string()).or_insert(cache);
    }

    async fn run<T, E>(
        &self,
        command: &Command<T, E>,
        ctx: Arc<CommandContext>,
    ) -> Result<T, CommandError<E>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let breaker = self.breaker_for(command);
        let bulkhead = self.bulkhead_for(command);
        if let Some(binding) = &command.cache {
            self.register_cache(binding.erased());
        }
        let sink = self.inner.sink.clone();
        let name = command.name.clone();

        if let Err(denial) = breaker.allow() {
            sink.emit(CommandEvent::ShortCircuited { command: name });
            let err = CommandError::ShortCircuited {
                error_rate: denial.error_rate,
                open_for: denial.open_for,
            };
            return self.finish(command, Err(err));
        }

        let permit = match bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(rejection) => {
                breaker.record_rejected();
                sink.emit(CommandEvent::PoolRejected {
                    command: name,
                    in_flight: rejection.in_flight,
                    max: rejection.max,
                });
                let err = CommandError::PoolRejected {
                    in_flight: rejection.in_flight,
                    max: rejection.max,
                };
                return self.finish(command, Err(err));
            }
        };

        let driver: RetryDriver<E> = {
            let mut builder = RetryDriver::builder()
                .max_attempts(command.retry.max_attempts)
                .backoff(command.retry.backoff.clone())
                .jitter(command.retry.jitter.clone())
                .classifier(command.classifier.clone())
                .shared_sleeper(self.inner.sleeper.clone());
            for listener in &command.listeners {
                builder = builder.listener(listener.clone());
            }
            builder.build()
        };

        let op_ctx = ctx.clone();
        let op = |attempt: usize| {
            self.attempt(command, breaker.clone(), op_ctx.clone(), attempt)
        };

        let outcome = tokio::select! {
            outcome = driver.execute(op) => outcome,
            _ = ctx.cancelled_wait() => {
                sink.emit(CommandEvent::Cancelled { command: command.name.clone() });
                Err(CommandError::Cancelled)
            }
        };
        drop(permit);

        if let Err(CommandError::AttemptsExhausted { attempts, .. }) = &outcome {
            sink.emit(CommandEvent::AttemptsExhausted {
                command: command.name.clone(),
                attempts: *attempts,
            });
        }

        self.finish(command, outcome)
    }

    /// One attempt: cache lookup, provider resolution, budgeted callback,
    /// breaker accounting, write-through.
    async fn attempt<T, E>(
        &self,
        command: &Command<T, E>,
        breaker: Arc<CircuitBreaker>,
        ctx: Arc<CommandContext>,
        attempt: usize,
    ) -> Result<T, AttemptFailure<E>>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let sink = &self.inner.sink;
        let name = command.name.as_str();

        if let Some(binding) = &command.cache {
            if !binding.key().is_empty() {
                let started = Instant::now();
                for interceptor in &command.cache_interceptors {
                    interceptor.before_lookup(&ctx, binding.key());
                }
                let lookup = binding.get();
                let hit = lookup.is_hit();
                for interceptor in &command.cache_interceptors {
                    interceptor.after_lookup(&ctx, binding.key(), hit, started.elapsed());
                }
                match lookup.into_hit() {
                    Some(value) => {
                        sink.emit(CommandEvent::CacheHit {
                            command: name.to_string(),
                            cache: binding.cache_name().to_string(),
                        });
                        return Ok(value);
                    }
                    None => sink.emit(CommandEvent::CacheMiss {
                        command: name.to_string(),
                        cache: binding.cache_name().to_string(),
                    }),
                }
            }
        }

        let base = match command.provider.resolve(&ctx).await {
            Ok(base) => base,
            Err(err) => {
                breaker.record_failure();
                self.note_retry_scheduled(command, attempt);
                return Err(err.into());
            }
        };

        sink.emit(CommandEvent::AttemptStarted { command: name.to_string(), attempt });
        for interceptor in &command.attempt_interceptors {
            interceptor.before_attempt(&ctx, attempt);
        }

        let budget = command.execution.request_timeout;
        let started = Instant::now();
        let call = (command.callback)(ctx.clone(), base.clone());
        // Err(()) marks a blown latency budget; the timed-out future was
        // dropped, so a late success can never surface or be cached.
        let outcome: Result<Result<T, E>, ()> = match command.execution.isolation {
            IsolationMode::Pool => {
                let handle = tokio::spawn(async move { tokio::time::timeout(budget, call).await });
                match handle.await {
                    Ok(Ok(inner)) => Ok(inner),
                    Ok(Err(_elapsed)) => Err(()),
                    Err(join_err) if join_err.is_panic() => {
                        std::panic::resume_unwind(join_err.into_panic())
                    }
                    // Runtime shutdown cancelled the worker task; surface as
                    // a timed-out attempt.
                    Err(_) => Err(()),
                }
            }
            IsolationMode::Semaphore => {
                tokio::time::timeout(budget, call).await.map_err(|_| ())
            }
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                breaker.record_success();
                for interceptor in &command.attempt_interceptors {
                    interceptor.after_attempt(&ctx, attempt, true, elapsed);
                }
                if let Some(binding) = &command.cache {
                    if !binding.key().is_empty() && binding.put(&value) {
                        sink.emit(CommandEvent::CacheStored {
                            command: name.to_string(),
                            cache: binding.cache_name().to_string(),
                        });
                    }
                }
                Ok(value)
            }
            Ok(Err(error)) => {
                for interceptor in &command.attempt_interceptors {
                    interceptor.after_attempt(&ctx, attempt, false, elapsed);
                }
                sink.emit(CommandEvent::AttemptFailed { command: name.to_string(), attempt });
                if command.classifier.classify(&error).is_retryable() {
                    // Retryable failures feed the breaker and penalize the
                    // instance; non-retryable ones do neither.
                    breaker.record_failure();
                    command.provider.note_error(&base);
                    self.note_retry_scheduled(command, attempt);
                }
                Err(AttemptFailure::Inner(error))
            }
            Err(()) => {
                breaker.record_timeout();
                command.provider.note_error(&base);
                for interceptor in &command.attempt_interceptors {
                    interceptor.after_attempt(&ctx, attempt, false, elapsed);
                }
                sink.emit(CommandEvent::AttemptFailed { command: name.to_string(), attempt });
                self.note_retry_scheduled(command, attempt);
                Err(AttemptFailure::Timeout { elapsed, budget })
            }
        }
    }

    fn note_retry_scheduled<T, E>(&self, command: &Command<T, E>, attempt: usize) {
        if attempt < command.retry.max_attempts {
            self.inner.sink.emit(CommandEvent::RetryScheduled {
                command: command.name.clone(),
                attempt,
                delay: command.retry.backoff.delay(attempt),
            });
        }
    }

    /// Apply the fallback gate to a terminal outcome.
    fn finish<T, E>(
        &self,
        command: &Command<T, E>,
        outcome: Result<T, CommandError<E>>,
    ) -> Result<T, CommandError<E>> {
        match outcome {
            Ok(value) => Ok(value),
            Err(error) => {
                if command.execution.fallback_enabled && !error.is_cancelled() {
                    if let Some(fallback) = &command.fallback {
                        if let Some(value) = fallback(&error) {
                            tracing::debug!(command = %command.name, "fallback value applied");
                            return Ok(value);
                        }
                    }
                }
                Err(error)
            }
        }
    }
}

/// Outcome handle returned by [`CommandEngine::enqueue`].
///
/// Awaiting the handle yields the command's outcome. [`CommandHandle::cancel`]
/// aborts the retry loop before its next attempt; an in-flight callback is
/// left to observe the context's cancellation flag.
#[derive(Debug)]
pub struct CommandHandle<T, E> {
    join: JoinHandle<Result<T, CommandError<E>>>,
    ctx: Arc<CommandContext>,
}

impl<T, E> CommandHandle<T, E> {
    /// Request cancellation of the submission.
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// The context shared with the running submission.
    pub fn context(&self) -> &Arc<CommandContext> {
        &self.ctx
    }
}

impl<T, E> Future for CommandHandle<T, E> {
    type Output = Result<T, CommandError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(join_err)) if join_err.is_panic() => {
                std::panic::resume_unwind(join_err.into_panic())
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(CommandError::Cancelled)),
        }
    }
}
