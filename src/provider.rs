//! Base-URI resolution for each attempt.
//!
//! A [`UriProvider`] resolves the base endpoint one attempt will target.
//! The engine invokes the remote callback with the resolved base and, when
//! the attempt fails retryably or times out, reports the instance back via
//! [`UriProvider::note_error`] so the pool can deprioritize it before the
//! next attempt re-enters the provider. Providers never retry internally;
//! rescheduling is the retry driver's job.

use crate::context::CommandContext;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Base endpoint for one attempt. Cheap to clone and hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseUri(Arc<str>);

impl BaseUri {
    pub fn new(uri: impl AsRef<str>) -> Self {
        Self(Arc::from(uri.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BaseUri {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for BaseUri {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

/// Resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The pool has no available instance. Retryable: discovery may
    /// repopulate between attempts.
    #[error("no available instance in pool '{pool}'")]
    NoInstance { pool: String },
}

/// Strategy resolving the base endpoint for one attempt.
#[async_trait]
pub trait UriProvider: Send + Sync + fmt::Debug {
    /// Name of the pool this provider draws from.
    fn pool_name(&self) -> &str;

    /// Resolve a base endpoint for the next attempt.
    async fn resolve(&self, ctx: &CommandContext) -> Result<BaseUri, ProviderError>;

    /// Penalize the instance behind `base` after a retryable failure.
    fn note_error(&self, _base: &BaseUri) {}
}

/// Fixed base endpoint; stateless.
#[derive(Debug, Clone)]
pub struct ConstantUriProvider {
    base: BaseUri,
}

impl ConstantUriProvider {
    pub fn new(base: impl Into<BaseUri>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl UriProvider for ConstantUriProvider {
    fn pool_name(&self) -> &str {
        self.base.as_str()
    }

    async fn resolve(&self, _ctx: &CommandContext) -> Result<BaseUri, ProviderError> {
        Ok(self.base.clone())
    }
}

/// One discovered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: String,
    pub base_uri: BaseUri,
    pub available: bool,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, base_uri: impl Into<BaseUri>) -> Self {
        Self { id: id.into(), base_uri: base_uri.into(), available: true }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// Source of service instances. Implemented over a registry client; the
/// registry protocol itself is out of scope here.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync + fmt::Debug {
    fn service_name(&self) -> &str;

    /// Snapshot of currently known instances.
    async fn instances(&self) -> Vec<ServiceInstance>;
}

/// Fixed instance list, swappable at runtime. Useful for wiring static
/// deployments and for tests.
#[derive(Debug)]
pub struct StaticDiscovery {
    name: String,
    instances: Mutex<Vec<ServiceInstance>>,
}

impl StaticDiscovery {
    pub fn new(name: impl Into<String>, instances: Vec<ServiceInstance>) -> Self {
        Self { name: name.into(), instances: Mutex::new(instances) }
    }

    /// Replace the instance list.
    pub fn set_instances(&self, instances: Vec<ServiceInstance>) {
        *self.instances.lock().unwrap_or_else(|p| p.into_inner()) = instances;
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    fn service_name(&self) -> &str {
        &self.name
    }

    async fn instances(&self) -> Vec<ServiceInstance> {
        self.instances.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// How the discovery provider picks among available instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Cycle through instances in order.
    RoundRobin,
    /// Uniform random pick.
    Random,
    /// Prefer the instance with the fewest error marks; ties cycle.
    LeastMarked,
}

/// Discovery-backed provider with instance-level error accounting.
pub struct DiscoveryUriProvider {
    discovery: Arc<dyn ServiceDiscovery>,
    strategy: SelectionStrategy,
    cursor: AtomicUsize,
    marks: Mutex<HashMap<BaseUri, u32>>,
}

impl DiscoveryUriProvider {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self::with_strategy(discovery, SelectionStrategy::RoundRobin)
    }

    pub fn with_strategy(
        discovery: Arc<dyn ServiceDiscovery>,
        strategy: SelectionStrategy,
    ) -> Self {
        Self {
            discovery,
            strategy,
            cursor: AtomicUsize::new(0),
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Error marks currently recorded against an instance.
    pub fn marks(&self, base: &BaseUri) -> u32 {
        self.marks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(base)
            .copied()
            .unwrap_or(0)
    }

    fn select(&self, available: &[ServiceInstance]) -> BaseUri {
        debug_assert!(!available.is_empty());
        match self.strategy {
            SelectionStrategy::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
                available[i].base_uri.clone()
            }
            SelectionStrategy::Random => {
                let i = rand::rng().random_range(0..available.len());
                available[i].base_uri.clone()
            }
            SelectionStrategy::LeastMarked => {
                let marks = self.marks.lock().unwrap_or_else(|p| p.into_inner());
                let least = available
                    .iter()
                    .map(|inst| marks.get(&inst.base_uri).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                let candidates: Vec<&ServiceInstance> = available
                    .iter()
                    .filter(|inst| {
                        marks.get(&inst.base_uri).copied().unwrap_or(0) == least
                    })
                    .collect();
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[i].base_uri.clone()
            }
        }
    }
}

impl fmt::Debug for DiscoveryUriProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryUriProvider")
            .field("pool", &self.discovery.service_name())
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[async_trait]
impl UriProvider for DiscoveryUriProvider {
    fn pool_name(&self) -> &str {
        self.discovery.service_name()
    }

    async fn resolve(&self, _ctx: &CommandContext) -> Result<BaseUri, ProviderError> {
        let instances = self.discovery.instances().await;
        let available: Vec<ServiceInstance> =
            instances.into_iter().filter(|inst| inst.available).collect();
        if available.is_empty() {
            return Err(ProviderError::NoInstance {
                pool: self.discovery.service_name().to_string(),
            });
        }
        Ok(self.select(&available))
    }

    fn note_error(&self, base: &BaseUri) {
        let mut marks = self.marks.lock().unwrap_or_else(|p| p.into_inner());
        let count = marks.entry(base.clone()).or_insert(0);
        *count += 1;
        tracing::debug!(instance = %base, marks = *count, "instance error noted");
    }
}
