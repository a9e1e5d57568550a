//! Dependency health registry: one circuit breaker and one sticky
//! exhaustion flag per external dependency, built once at startup and shared
//! by every worker.

use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::services::circuit_breaker::{BreakerConfig, BreakerStats, CircuitBreaker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Dependency {
    GenerativeImage,
    BackgroundRemoval,
    AssetStorage,
}

impl Dependency {
    /// Breaker presets. Background removal is slow to recover from rate
    /// limiting, storage blips are short.
    pub fn default_breaker_config(self) -> BreakerConfig {
        match self {
            Dependency::GenerativeImage => BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                open_timeout: Duration::from_secs(60),
                window: Duration::from_secs(120),
            },
            Dependency::BackgroundRemoval => BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                open_timeout: Duration::from_secs(300),
                window: Duration::from_secs(600),
            },
            Dependency::AssetStorage => BreakerConfig {
                failure_threshold: 10,
                success_threshold: 3,
                open_timeout: Duration::from_secs(30),
                window: Duration::from_secs(60),
            },
        }
    }
}

struct DependencyHealth {
    breaker: Arc<CircuitBreaker>,
    exhausted: AtomicBool,
}

/// Point-in-time view of one dependency, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub dependency: Dependency,
    pub exhausted: bool,
    pub breaker: BreakerStats,
}

pub struct DependencyHealthRegistry {
    entries: HashMap<Dependency, DependencyHealth>,
}

impl DependencyHealthRegistry {
    pub fn new() -> Self {
        Self::with_configs(|dependency| dependency.default_breaker_config())
    }

    pub fn with_configs(config_for: impl Fn(Dependency) -> BreakerConfig) -> Self {
        let entries = Dependency::iter()
            .map(|dependency| {
                let health = DependencyHealth {
                    breaker: Arc::new(CircuitBreaker::new(
                        dependency.to_string(),
                        config_for(dependency),
                    )),
                    exhausted: AtomicBool::new(false),
                };
                (dependency, health)
            })
            .collect();
        Self { entries }
    }

    fn entry(&self, dependency: Dependency) -> &DependencyHealth {
        // every variant is inserted by the constructor
        &self.entries[&dependency]
    }

    pub fn breaker(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        self.entry(dependency).breaker.clone()
    }

    pub fn is_exhausted(&self, dependency: Dependency) -> bool {
        self.entry(dependency).exhausted.load(Ordering::Acquire)
    }

    pub fn mark_exhausted(&self, dependency: Dependency) {
        let was_set = self.entry(dependency).exhausted.swap(true, Ordering::AcqRel);
        if !was_set {
            tracing::error!(
                dependency = %dependency,
                "Dependency quota exhausted, calls suspended until manual reset"
            );
        }
    }

    /// Clear the sticky exhaustion flag (after an operator tops up credits).
    pub fn reset_exhaustion(&self, dependency: Dependency) {
        self.entry(dependency).exhausted.store(false, Ordering::Release);
        tracing::info!(dependency = %dependency, "Dependency exhaustion flag reset, calls will resume");
    }

    /// Clear the sticky flag and close the breaker.
    pub fn reset(&self, dependency: Dependency) {
        self.reset_exhaustion(dependency);
        self.entry(dependency).breaker.reset();
    }

    /// Look a dependency up by its kebab-case name and reset it.
    pub fn reset_by_name(&self, name: &str) -> Option<Dependency> {
        let dependency = Dependency::from_str(name).ok()?;
        self.reset(dependency);
        Some(dependency)
    }

    pub fn report(&self) -> Vec<DependencyReport> {
        Dependency::iter()
            .map(|dependency| {
                let entry = self.entry(dependency);
                DependencyReport {
                    dependency,
                    exhausted: entry.exhausted.load(Ordering::Acquire),
                    breaker: entry.breaker.stats(),
                }
            })
            .collect()
    }
}

impl Default for DependencyHealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::circuit_breaker::CircuitState;

    #[test]
    fn test_every_dependency_gets_its_own_breaker() {
        let registry = DependencyHealthRegistry::new();
        let generative = registry.breaker(Dependency::GenerativeImage);
        let removal = registry.breaker(Dependency::BackgroundRemoval);
        assert_eq!(generative.name(), "generative-image");
        assert_eq!(removal.name(), "background-removal");
        assert_eq!(removal.config().failure_threshold, 3);
        assert!(Arc::ptr_eq(&generative, &registry.breaker(Dependency::GenerativeImage)));
    }

    #[test]
    fn test_exhaustion_is_sticky_until_reset() {
        let registry = DependencyHealthRegistry::new();
        registry.mark_exhausted(Dependency::BackgroundRemoval);
        assert!(registry.is_exhausted(Dependency::BackgroundRemoval));
        assert!(!registry.is_exhausted(Dependency::GenerativeImage));

        assert_eq!(
            registry.reset_by_name("background-removal"),
            Some(Dependency::BackgroundRemoval)
        );
        assert!(!registry.is_exhausted(Dependency::BackgroundRemoval));
    }

    #[test]
    fn test_reset_by_unknown_name() {
        let registry = DependencyHealthRegistry::new();
        assert_eq!(registry.reset_by_name("payments"), None);
    }

    #[tokio::test]
    async fn test_report_lists_all_dependencies() {
        let registry = DependencyHealthRegistry::new();
        let report = registry.report();
        assert_eq!(report.len(), 3);
        assert!(report
            .iter()
            .all(|entry| entry.breaker.state == CircuitState::Closed && !entry.exhausted));
    }
}
