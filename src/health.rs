//! Externally-callable health checks over engine state.

use crate::engine::CommandEngine;
use crate::provider::ServiceDiscovery;
use async_trait::async_trait;
use std::sync::Arc;

/// Tri-state health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// The check could not decide (missing state, dependency not yet used).
    Unknown,
}

/// One check's verdict with an optional operator-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: None }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, message: Some(message.into()) }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unknown, message: Some(message.into()) }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// An externally-pollable health check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn do_check(&self) -> HealthReport;
}

/// Unhealthy when a command's rolling failure count (failures + timeouts)
/// reaches the configured threshold.
pub struct BreakerFailureCheck {
    engine: CommandEngine,
    command: String,
    min_failures: u64,
}

impl BreakerFailureCheck {
    pub fn new(engine: CommandEngine, command: impl Into<String>, min_failures: u64) -> Self {
        Self { engine, command: command.into(), min_failures }
    }
}

#[async_trait]
impl HealthCheck for BreakerFailureCheck {
    fn name(&self) -> &str {
        &self.command
    }

    async fn do_check(&self) -> HealthReport {
        match self.engine.breaker(&self.command) {
            None => HealthReport::unknown(format!(
                "command '{}' has not executed yet",
                self.command
            )),
            Some(breaker) => {
                let failures = breaker.metrics().failure_count();
                if failures >= self.min_failures {
                    HealthReport::unhealthy(format!(
                        "command '{}' has {} rolling failures (threshold {})",
                        self.command, failures, self.min_failures
                    ))
                } else {
                    HealthReport::healthy()
                }
            }
        }
    }
}

/// Unhealthy when discovery reports fewer instances than required.
pub struct DiscoveryCheck {
    discovery: Arc<dyn ServiceDiscovery>,
    min_instances: usize,
}

impl DiscoveryCheck {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>, min_instances: usize) -> Self {
        Self { discovery, min_instances }
    }
}

#[async_trait]
impl HealthCheck for DiscoveryCheck {
    fn name(&self) -> &str {
        self.discovery.service_name()
    }

    async fn do_check(&self) -> HealthReport {
        let available =
            self.discovery.instances().await.iter().filter(|inst| inst.available).count();
        if available < self.min_instances {
            HealthReport::unhealthy(format!(
                "pool '{}' has {} available instances (minimum {})",
                self.discovery.service_name(),
                available,
                self.min_instances
            ))
        } else {
            HealthReport::healthy()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ServiceInstance, StaticDiscovery};

    #[tokio::test]
    async fn breaker_check_is_unknown_before_first_use() {
        let engine = CommandEngine::new();
        let check = BreakerFailureCheck::new(engine, "NeverRan", 3);
        let report = check.do_check().await;
        assert_eq!(report.status, HealthStatus::Unknown);
        assert!(report.message.unwrap().contains("NeverRan"));
    }

    #[tokio::test]
    async fn discovery_check_reports_on_available_count() {
        let discovery = Arc::new(StaticDiscovery::new(
            "svc",
            vec![
                ServiceInstance::new("a", "http://a:8080"),
                ServiceInstance::new("b", "http://b:8080").unavailable(),
            ],
        ));
        let check = DiscoveryCheck::new(discovery.clone(), 1);
        assert!(check.do_check().await.is_healthy());

        let strict = DiscoveryCheck::new(discovery.clone(), 2);
        let report = strict.do_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.message.unwrap().contains("svc"));
    }

    #[tokio::test]
    async fn discovery_check_unhealthy_when_empty() {
        let discovery = Arc::new(StaticDiscovery::new("svc", vec![]));
        let check = DiscoveryCheck::new(discovery, 1);
        assert_eq!(check.do_check().await.status, HealthStatus::Unhealthy);
    }
}
