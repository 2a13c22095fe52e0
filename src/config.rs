//! Property-store binding for the runtime's configuration keys.
//!
//! A [`ConfigSource`] is a flat string key-value view over whatever
//! property store the host process uses. [`ClientConfig`] layers the
//! recognized key table on top: every command-scoped key resolves
//! `<prefix>.client.<key>.<cmd>` before `<prefix>.client.<key>`, and
//! unparsable values degrade to the documented default with a warning
//! rather than failing the submission path.

use crate::breaker::BreakerPolicy;
use crate::bulkhead::IsolationMode;
use crate::cache::CacheConfig;
use crate::command::{ExecutionPolicy, PoolPolicy, RetryPolicy};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Flat string key-value lookups.
pub trait ConfigSource: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory source with lock-free snapshot reads; writers swap a fresh
/// map in, so readers never block behind an update.
#[derive(Debug, Default)]
pub struct MapSource {
    values: ArcSwap<HashMap<String, String>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> =
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Self { values: ArcSwap::from_pointee(map) }
    }

    /// Set one key, publishing a fresh snapshot.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut next = HashMap::clone(&self.values.load());
        next.insert(key.into(), value.into());
        self.values.store(Arc::new(next));
    }

    /// Remove one key, publishing a fresh snapshot.
    pub fn remove(&self, key: &str) {
        let mut next = HashMap::clone(&self.values.load());
        next.remove(key);
        self.values.store(Arc::new(next));
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.load().get(key).cloned()
    }
}

/// Which built-in backend a configured cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    /// Unbounded in-memory hash map.
    Memory,
    /// Size-bounded with TTL and recency eviction.
    Bounded,
    /// Adapter over an external cache server.
    External,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "bounded" => Ok(Self::Bounded),
            "external" => Ok(Self::External),
            other => Err(format!("unknown cache backend '{other}'")),
        }
    }
}

/// Resolved settings for one named cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub kind: CacheBackendKind,
    pub options: HashMap<String, String>,
}

impl CacheSettings {
    /// Project the settings into a [`CacheConfig`].
    ///
    /// Recognized option keys: `maxSize`, `ttlMs`, `putEnabled`,
    /// `externalName`.
    pub fn cache_config(&self) -> CacheConfig {
        let mut config = match self.kind {
            CacheBackendKind::External => CacheConfig::external(
                self.options.get("externalName").cloned().unwrap_or_default(),
            ),
            _ => CacheConfig::new(),
        };
        config.enabled = self.enabled;
        if let Some(put_enabled) = self.options.get("putEnabled").and_then(|v| v.parse().ok()) {
            config.put_enabled = put_enabled;
        }
        if let Some(max_size) = self.options.get("maxSize").and_then(|v| v.parse().ok()) {
            config.max_size = Some(max_size);
        }
        if let Some(ttl_ms) = self.options.get("ttlMs").and_then(|v| v.parse().ok()) {
            config.ttl = Some(Duration::from_millis(ttl_ms));
        }
        config
    }
}

/// The four policies a command derives from configuration.
#[derive(Debug, Clone)]
pub struct CommandPolicies {
    pub execution: ExecutionPolicy,
    pub breaker: BreakerPolicy,
    pub pool: PoolPolicy,
    pub retry: RetryPolicy,
}

/// Typed view over the recognized `<prefix>.client.*` key table.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    prefix: String,
    source: Arc<dyn ConfigSource>,
}

impl ClientConfig {
    pub fn new(prefix: impl Into<String>, source: Arc<dyn ConfigSource>) -> Self {
        Self { prefix: prefix.into(), source }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn raw(&self, suffix: &str) -> Option<String> {
        self.source.get(&format!("{}.client.{}", self.prefix, suffix))
    }

    /// Command-scoped lookup: `<key>.<cmd>` wins over `<key>`.
    fn scoped(&self, suffix: &str, command: Option<&str>) -> Option<String> {
        command
            .and_then(|cmd| self.raw(&format!("{suffix}.{cmd}")))
            .or_else(|| self.raw(suffix))
    }

    fn parse_or<V: FromStr>(&self, suffix: &str, raw: Option<String>, default: V) -> V {
        match raw {
            None => default,
            Some(text) => match text.parse() {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(
                        key = %format!("{}.client.{}", self.prefix, suffix),
                        value = %text,
                        "unparsable config value, using default"
                    );
                    default
                }
            },
        }
    }

    /// Attempt budget, counting the first try.
    pub fn num_retries(&self, command: Option<&str>) -> usize {
        let raw = self.scoped("numRetries", command);
        let parsed = self.parse_or("numRetries", raw, 3usize);
        if parsed == 0 {
            tracing::warn!("numRetries 0 repaired to 1");
            1
        } else {
            parsed
        }
    }

    /// Connection timeout handed to the transport collaborator.
    pub fn connect_timeout(&self, command: Option<&str>) -> Duration {
        let raw = self.scoped("connectTimeout", command);
        Duration::from_millis(self.parse_or("connectTimeout", raw, 2_000u64))
    }

    /// Per-attempt latency budget.
    pub fn request_timeout(&self, command: Option<&str>) -> Duration {
        let raw = self.scoped("requestTimeout", command);
        Duration::from_millis(self.parse_or("requestTimeout", raw, 8_000u64))
    }

    fn command_opt(&self, command: &str, field: &str) -> Option<String> {
        self.raw(&format!("command.{command}.{field}"))
    }

    fn threadpool_opt(&self, command: &str, field: &str) -> Option<String> {
        self.raw(&format!("threadpool.{command}.{field}"))
    }

    /// Breaker options for one command.
    pub fn breaker_policy(&self, command: &str) -> BreakerPolicy {
        let defaults = BreakerPolicy::default();
        let rolling_window_ms = self.parse_or(
            "command.rollingWindow",
            self.command_opt(command, "rollingWindow"),
            defaults.rolling_window.as_millis() as u64,
        );
        let sleep_window_ms = self.parse_or(
            "command.sleepWindow",
            self.command_opt(command, "sleepWindow"),
            5_000u64,
        );
        BreakerPolicy {
            enabled: self.parse_or(
                "command.circuitBreakerEnabled",
                self.command_opt(command, "circuitBreakerEnabled"),
                defaults.enabled,
            ),
            error_threshold_pct: self.parse_or(
                "command.errorThresholdPercentage",
                self.command_opt(command, "errorThresholdPercentage"),
                defaults.error_threshold_pct,
            ),
            rolling_window: Duration::from_millis(rolling_window_ms),
            bucket_count: self.parse_or(
                "command.rollingWindowBuckets",
                self.command_opt(command, "rollingWindowBuckets"),
                defaults.bucket_count,
            ),
            min_request_volume: self.parse_or(
                "command.requestVolumeThreshold",
                self.command_opt(command, "requestVolumeThreshold"),
                defaults.min_request_volume,
            ),
            sleep_window: Duration::from_millis(sleep_window_ms),
            forced_open: self.parse_or(
                "command.forceOpen",
                self.command_opt(command, "forceOpen"),
                false,
            ),
            forced_closed: self.parse_or(
                "command.forceClosed",
                self.command_opt(command, "forceClosed"),
                false,
            ),
        }
    }

    /// Execution options for one command.
    pub fn execution_policy(&self, command: &str) -> ExecutionPolicy {
        let isolation = match self
            .command_opt(command, "executionIsolationStrategy")
            .as_deref()
            .map(str::trim)
        {
            Some("semaphore") | Some("SEMAPHORE") => IsolationMode::Semaphore,
            Some("thread") | Some("THREAD") | None => IsolationMode::Pool,
            Some(other) => {
                tracing::warn!(value = other, "unknown isolation strategy, using thread");
                IsolationMode::Pool
            }
        };
        let budget = match self.command_opt(command, "timeout") {
            Some(raw) => Duration::from_millis(self.parse_or(
                "command.timeout",
                Some(raw),
                self.request_timeout(Some(command)).as_millis() as u64,
            )),
            None => self.request_timeout(Some(command)),
        };
        ExecutionPolicy {
            request_timeout: budget,
            isolation,
            fallback_enabled: self.parse_or(
                "command.fallbackEnabled",
                self.command_opt(command, "fallbackEnabled"),
                false,
            ),
        }
    }

    /// Pool options for one command.
    pub fn pool_policy(&self, command: &str) -> PoolPolicy {
        let defaults = PoolPolicy::default();
        PoolPolicy {
            core_size: self.parse_or(
                "threadpool.coreSize",
                self.threadpool_opt(command, "coreSize"),
                defaults.core_size,
            ),
            max_queue_size: self.parse_or(
                "threadpool.maxQueueSize",
                self.threadpool_opt(command, "maxQueueSize"),
                defaults.max_queue_size,
            ),
            queue_rejection_threshold: self.parse_or(
                "threadpool.queueSizeRejectionThreshold",
                self.threadpool_opt(command, "queueSizeRejectionThreshold"),
                defaults.queue_rejection_threshold,
            ),
        }
    }

    /// Retry options for one command. Backoff stays at the library default;
    /// the property store only sizes the budget.
    pub fn retry_policy(&self, command: &str) -> RetryPolicy {
        RetryPolicy { max_attempts: self.num_retries(Some(command)), ..RetryPolicy::default() }
    }

    /// All four policies for one command.
    pub fn policies(&self, command: &str) -> CommandPolicies {
        CommandPolicies {
            execution: self.execution_policy(command),
            breaker: self.breaker_policy(command),
            pool: self.pool_policy(command),
            retry: self.retry_policy(command),
        }
    }

    /// Settings for one named cache.
    pub fn cache_settings(&self, name: &str) -> CacheSettings {
        let enabled =
            self.parse_or("cache.enabled", self.raw(&format!("cache.{name}.enabled")), true);
        let kind = match self.raw(&format!("cache.{name}.type")) {
            None => CacheBackendKind::Memory,
            Some(text) => match text.parse() {
                Ok(kind) => kind,
                Err(_) => {
                    tracing::warn!(cache = name, value = %text, "unknown cache type, using memory");
                    CacheBackendKind::Memory
                }
            },
        };
        let options = self
            .raw(&format!("cache.{name}.config"))
            .map(|raw| parse_kv(&raw))
            .unwrap_or_default();
        CacheSettings { enabled, kind, options }
    }

    /// Health-check threshold for the breaker-failure check.
    pub fn health_check_min_failures(&self) -> u64 {
        self.parse_or("healthCheck.minFailures", self.raw("healthCheck.minFailures"), 5u64)
    }

    /// Default media types propagated to the transport collaborator.
    pub fn default_accept_types(&self) -> Vec<String> {
        match self.raw("defaultAcceptTypes") {
            None => vec!["application/json".to_string()],
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Verbosity toggle for the HTTP logging collaborator.
    pub fn http_logging_debug(&self) -> bool {
        self.parse_or("httpLoggingDebug", self.raw("httpLoggingDebug"), false)
    }

    /// Verbosity toggle for the response-timing collaborator.
    pub fn response_timing_debug(&self) -> bool {
        self.parse_or("responseTimingDebug", self.raw("responseTimingDebug"), false)
    }
}

/// Parse a `k=v,k=v` option string. Malformed segments are dropped with a
/// warning.
pub fn parse_kv(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for segment in raw.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match segment.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                out.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => tracing::warn!(segment, "malformed config segment dropped"),
        }
    }
    out
}
