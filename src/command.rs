//! Command descriptors: what to call, where, and under which policies.
//!
//! A [`Command`] is immutable after [`CommandBuilder::build`] and cheap to
//! clone; the engine shares it read-only. The builder validates the two
//! required pieces (provider and callback), repairs a zero attempt budget,
//! and fills in the documented defaults for everything else.

use crate::backoff::Backoff;
use crate::breaker::BreakerPolicy;
use crate::bulkhead::IsolationMode;
use crate::cache::{AnyCache, CacheLookup, CommandCache};
use crate::classify::Classifier;
use crate::context::CommandContext;
use crate::error::CommandError;
use crate::jitter::Jitter;
use crate::provider::{BaseUri, ConstantUriProvider, UriProvider};
use crate::retry::RetryListener;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default command name applied when the builder is not given one.
pub const DEFAULT_COMMAND_NAME: &str = "ApiCommand";

/// Per-attempt execution knobs.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Per-attempt latency budget. Mandatory; attempts past it are
    /// abandoned and classified as timeouts.
    pub request_timeout: Duration,
    /// Where attempts run relative to the submitting task.
    pub isolation: IsolationMode,
    /// Whether a configured fallback may replace a terminal failure.
    pub fallback_enabled: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(8_000),
            isolation: IsolationMode::Pool,
            fallback_enabled: false,
        }
    }
}

/// Bulkhead sizing.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    /// Maximum concurrent attempts for the command.
    pub core_size: usize,
    /// Queue capacity behind the concurrency bound (pool isolation only).
    pub max_queue_size: usize,
    /// Queue occupancy at which submissions are rejected even when the
    /// queue has room.
    pub queue_rejection_threshold: usize,
}

impl PoolPolicy {
    /// Effective queue bound: the structural capacity clipped by the
    /// rejection threshold.
    pub fn queue_limit(&self) -> usize {
        self.max_queue_size.min(self.queue_rejection_threshold)
    }
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self { core_size: 5, max_queue_size: 0, queue_rejection_threshold: 5 }
    }
}

/// Retry schedule. Classification lives on the descriptor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt budget, counting the first try.
    pub max_attempts: usize,
    pub backoff: Backoff,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff: Backoff::default(), jitter: Jitter::None }
    }
}

/// Observer wrapped around the cache-get step.
pub trait CacheInterceptor: Send + Sync {
    fn before_lookup(&self, _ctx: &CommandContext, _key: &str) {}
    fn after_lookup(&self, _ctx: &CommandContext, _key: &str, _hit: bool, _elapsed: Duration) {}
}

/// Observer wrapped around each callback invocation.
pub trait AttemptInterceptor: Send + Sync {
    fn before_attempt(&self, _ctx: &CommandContext, _attempt: usize) {}
    fn after_attempt(
        &self,
        _ctx: &CommandContext,
        _attempt: usize,
        _succeeded: bool,
        _elapsed: Duration,
    ) {
    }
}

/// A cache and key bound to a command, with the storage form erased so the
/// engine only sees the client-visible type.
pub struct CacheBinding<T> {
    key: String,
    lookup: Arc<dyn Fn() -> CacheLookup<T> + Send + Sync>,
    store: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    erased: Arc<dyn AnyCache>,
}

impl<T> Clone for CacheBinding<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            lookup: self.lookup.clone(),
            store: self.store.clone(),
            erased: self.erased.clone(),
        }
    }
}

impl<T> std::fmt::Debug for CacheBinding<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBinding")
            .field("cache", &self.erased.name())
            .field("key", &self.key)
            .finish()
    }
}

impl<T> CacheBinding<T>
where
    T: Send + Sync + 'static,
{
    pub fn new<F>(cache: Arc<CommandCache<T, F>>, key: impl Into<String>) -> Self
    where
        F: Send + Sync + 'static,
    {
        let key = key.into();
        let lookup = {
            let cache = cache.clone();
            let key = key.clone();
            Arc::new(move || cache.get(&key)) as Arc<dyn Fn() -> CacheLookup<T> + Send + Sync>
        };
        let store = {
            let cache = cache.clone();
            let key = key.clone();
            Arc::new(move |value: &T| cache.put(&key, value))
                as Arc<dyn Fn(&T) -> bool + Send + Sync>
        };
        Self { key, lookup, store, erased: cache }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cache_name(&self) -> &str {
        self.erased.name()
    }

    pub(crate) fn get(&self) -> CacheLookup<T> {
        (self.lookup)()
    }

    pub(crate) fn put(&self, value: &T) -> bool {
        (self.store)(value)
    }

    pub(crate) fn erased(&self) -> Arc<dyn AnyCache> {
        self.erased.clone()
    }
}

/// The user-supplied remote invocation.
pub type RemoteCallback<T, E> =
    Arc<dyn Fn(Arc<CommandContext>, BaseUri) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Fallback producing a replacement value for a terminal failure.
pub type Fallback<T, E> = Arc<dyn Fn(&CommandError<E>) -> Option<T> + Send + Sync>;

/// Immutable descriptor of one logical remote operation.
pub struct Command<T, E> {
    pub(crate) name: String,
    pub(crate) provider: Arc<dyn UriProvider>,
    pub(crate) callback: RemoteCallback<T, E>,
    pub(crate) execution: ExecutionPolicy,
    pub(crate) breaker: BreakerPolicy,
    pub(crate) pool: PoolPolicy,
    pub(crate) retry: RetryPolicy,
    pub(crate) classifier: Classifier<E>,
    pub(crate) cache: Option<CacheBinding<T>>,
    pub(crate) cache_interceptors: Vec<Arc<dyn CacheInterceptor>>,
    pub(crate) attempt_interceptors: Vec<Arc<dyn AttemptInterceptor>>,
    pub(crate) listeners: Vec<Arc<dyn RetryListener<E>>>,
    pub(crate) fallback: Option<Fallback<T, E>>,
    pub(crate) attributes: Vec<(String, Arc<dyn Any + Send + Sync>)>,
}

impl<T, E> Clone for Command<T, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            provider: self.provider.clone(),
            callback: self.callback.clone(),
            execution: self.execution.clone(),
            breaker: self.breaker.clone(),
            pool: self.pool.clone(),
            retry: self.retry.clone(),
            classifier: self.classifier.clone(),
            cache: self.cache.clone(),
            cache_interceptors: self.cache_interceptors.clone(),
            attempt_interceptors: self.attempt_interceptors.clone(),
            listeners: self.listeners.clone(),
            fallback: self.fallback.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for Command<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("execution", &self.execution)
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .field("cache", &self.cache)
            .finish()
    }
}

impl<T, E> Command<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn builder() -> CommandBuilder<T, E> {
        CommandBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seed a fresh per-invocation context from the descriptor.
    pub(crate) fn new_context(&self) -> Arc<CommandContext> {
        let ctx = Arc::new(CommandContext::new(self.name.clone()));
        for (key, value) in &self.attributes {
            ctx.put_raw(key.clone(), value.clone());
        }
        ctx
    }
}

/// Builder validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("command '{command}' has no URI provider")]
    MissingProvider { command: String },
    #[error("command '{command}' has no remote callback")]
    MissingCallback { command: String },
}

/// Builder for [`Command`].
pub struct CommandBuilder<T, E> {
    name: Option<String>,
    provider: Option<Arc<dyn UriProvider>>,
    callback: Option<RemoteCallback<T, E>>,
    execution: ExecutionPolicy,
    breaker: BreakerPolicy,
    pool: PoolPolicy,
    retry: RetryPolicy,
    classifier: Classifier<E>,
    cache: Option<CacheBinding<T>>,
    cache_interceptors: Vec<Arc<dyn CacheInterceptor>>,
    attempt_interceptors: Vec<Arc<dyn AttemptInterceptor>>,
    listeners: Vec<Arc<dyn RetryListener<E>>>,
    fallback: Option<Fallback<T, E>>,
    attributes: Vec<(String, Arc<dyn Any + Send + Sync>)>,
}

impl<T, E> CommandBuilder<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            name: None,
            provider: None,
            callback: None,
            execution: ExecutionPolicy::default(),
            breaker: BreakerPolicy::default(),
            pool: PoolPolicy::default(),
            retry: RetryPolicy::default(),
            classifier: Classifier::new(),
            cache: None,
            cache_interceptors: Vec::new(),
            attempt_interceptors: Vec::new(),
            listeners: Vec::new(),
            fallback: None,
            attributes: Vec::new(),
        }
    }

    /// Logical command name; also the breaker/pool identity.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn UriProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Shorthand for a constant base URI.
    pub fn uri(self, base: impl Into<BaseUri>) -> Self {
        self.provider(Arc::new(ConstantUriProvider::new(base)))
    }

    /// The remote invocation run on each attempt.
    pub fn callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<CommandContext>, BaseUri) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.callback = Some(Arc::new(move |ctx, base| Box::pin(callback(ctx, base))));
        self
    }

    pub fn execution(mut self, execution: ExecutionPolicy) -> Self {
        self.execution = execution;
        self
    }

    /// Per-attempt latency budget.
    pub fn request_timeout(mut self, budget: Duration) -> Self {
        self.execution.request_timeout = budget;
        self
    }

    pub fn isolation(mut self, isolation: IsolationMode) -> Self {
        self.execution.isolation = isolation;
        self
    }

    pub fn breaker(mut self, breaker: BreakerPolicy) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn pool(mut self, pool: PoolPolicy) -> Self {
        self.pool = pool;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attempt budget, counting the first try.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn classifier(mut self, classifier: Classifier<E>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Pull execution, breaker, pool, and retry policies from the property
    /// store, scoped to the builder's command name. Set the name first.
    pub fn configure(mut self, config: &crate::config::ClientConfig) -> Self {
        let name = self.name.clone().unwrap_or_else(|| DEFAULT_COMMAND_NAME.to_string());
        let policies = config.policies(&name);
        self.execution = policies.execution;
        self.breaker = policies.breaker;
        self.pool = policies.pool;
        self.retry = policies.retry;
        self
    }

    /// Bind a cache and key; lookups run inside the retry loop and a hit
    /// short-circuits the attempt.
    pub fn cache<F>(mut self, cache: Arc<CommandCache<T, F>>, key: impl Into<String>) -> Self
    where
        F: Send + Sync + 'static,
    {
        self.cache = Some(CacheBinding::new(cache, key));
        self
    }

    pub fn cache_interceptor(mut self, interceptor: Arc<dyn CacheInterceptor>) -> Self {
        self.cache_interceptors.push(interceptor);
        self
    }

    pub fn attempt_interceptor(mut self, interceptor: Arc<dyn AttemptInterceptor>) -> Self {
        self.attempt_interceptors.push(interceptor);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn RetryListener<E>>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replacement value for terminal failures; only consulted when the
    /// execution policy enables fallback.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&CommandError<E>) -> Option<T> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self.execution.fallback_enabled = true;
        self
    }

    /// Initial context attribute visible to the callback.
    pub fn attribute<V: Any + Send + Sync>(mut self, key: impl Into<String>, value: V) -> Self {
        self.attributes.push((key.into(), Arc::new(value)));
        self
    }

    /// Validate and freeze the descriptor.
    pub fn build(mut self) -> Result<Command<T, E>, DescriptorError> {
        let name = self.name.unwrap_or_else(|| DEFAULT_COMMAND_NAME.to_string());
        let provider = self
            .provider
            .ok_or_else(|| DescriptorError::MissingProvider { command: name.clone() })?;
        let callback = self
            .callback
            .ok_or_else(|| DescriptorError::MissingCallback { command: name.clone() })?;

        if self.retry.max_attempts == 0 {
            tracing::warn!(command = %name, "max_attempts 0 repaired to 1");
            self.retry.max_attempts = 1;
        }

        Ok(Command {
            name,
            provider,
            callback,
            execution: self.execution,
            breaker: self.breaker,
            pool: self.pool,
            retry: self.retry,
            classifier: self.classifier,
            cache: self.cache,
            cache_interceptors: self.cache_interceptors,
            attempt_interceptors: self.attempt_interceptors,
            listeners: self.listeners,
            fallback: self.fallback,
            attributes: self.attributes,
        })
    }
}

impl<T, E> Default for CommandBuilder<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
