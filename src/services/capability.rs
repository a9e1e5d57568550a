//! Shared failure handling for calls to external capabilities.
//!
//! Every call goes through [`guarded_call`]: the dependency's sticky
//! exhaustion flag is checked first, then the call runs inside the
//! dependency's circuit breaker, raced against a hard timeout.

use std::future::Future;
use std::time::Duration;

use crate::services::circuit_breaker::BreakerRejection;
use crate::services::health_registry::{Dependency, DependencyHealthRegistry};
use crate::services::storage::StorageError;

/// Caller-facing failure categories of an external call. `Display` is the
/// message surfaced verbatim in a failed job's `errorMessage`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    /// Credentials rejected. Not retryable.
    #[error("AUTH_FAILED: {0}")]
    AuthInvalid(String),

    /// Credits or quota used up. Sticky until an operator resets it.
    #[error("QUOTA_EXHAUSTED: {0}")]
    QuotaExhausted(String),

    #[error(transparent)]
    Unavailable(#[from] BreakerRejection),

    #[error("{dependency} call timed out after {}s", .after.as_secs())]
    Timeout { dependency: Dependency, after: Duration },

    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    /// Whether a later attempt could succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CapabilityError::AuthInvalid(_) | CapabilityError::QuotaExhausted(_)
        )
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        CapabilityError::Failed(format!("HTTP request failed: {e}"))
    }
}

impl From<StorageError> for CapabilityError {
    fn from(e: StorageError) -> Self {
        CapabilityError::Failed(format!("Asset storage error: {e}"))
    }
}

/// Run `call` against `dependency` with sticky-flag, breaker and timeout
/// protection.
pub async fn guarded_call<T, F, Fut>(
    registry: &DependencyHealthRegistry,
    dependency: Dependency,
    timeout: Duration,
    call: F,
) -> Result<T, CapabilityError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    if registry.is_exhausted(dependency) {
        tracing::warn!(dependency = %dependency, "Dependency exhausted, skipping call");
        metrics::counter!(
            "dependency_calls_rejected",
            "dependency" => dependency.to_string(),
            "reason" => "exhausted"
        )
        .increment(1);
        return Err(CapabilityError::QuotaExhausted(format!(
            "{dependency} quota exhausted; calls suspended until manual reset"
        )));
    }

    let breaker = registry.breaker(dependency);
    let result = breaker
        .execute(|| async move {
            match tokio::time::timeout(timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CapabilityError::Timeout {
                    dependency,
                    after: timeout,
                }),
            }
        })
        .await;

    match &result {
        Err(CapabilityError::QuotaExhausted(_)) => registry.mark_exhausted(dependency),
        Err(CapabilityError::Unavailable(_)) => {
            metrics::counter!(
                "dependency_calls_rejected",
                "dependency" => dependency.to_string(),
                "reason" => "circuit_open"
            )
            .increment(1);
        }
        Err(e) => tracing::warn!(dependency = %dependency, error = %e, "Dependency call failed"),
        Ok(_) => {}
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::circuit_breaker::BreakerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> DependencyHealthRegistry {
        DependencyHealthRegistry::with_configs(|_| BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_stops_network_calls() {
        let registry = registry();
        let calls = AtomicUsize::new(0);

        let first = guarded_call(&registry, Dependency::BackgroundRemoval, Duration::from_secs(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CapabilityError::QuotaExhausted("credits exhausted".into()))
        })
        .await;
        assert!(matches!(first, Err(CapabilityError::QuotaExhausted(_))));

        for _ in 0..10 {
            let next = guarded_call(&registry, Dependency::BackgroundRemoval, Duration::from_secs(5), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), CapabilityError>(())
            })
            .await;
            assert!(matches!(next, Err(CapabilityError::QuotaExhausted(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // skipped calls never reach the breaker
        assert_eq!(
            registry.breaker(Dependency::BackgroundRemoval).stats().failures,
            1
        );

        registry.reset_exhaustion(Dependency::BackgroundRemoval);
        guarded_call(&registry, Dependency::BackgroundRemoval, Duration::from_secs(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), CapabilityError>(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_breaker_failure() {
        let registry = registry();
        for _ in 0..2 {
            let result = guarded_call(&registry, Dependency::GenerativeImage, Duration::from_secs(60), || async {
                futures::future::pending::<Result<(), CapabilityError>>().await
            })
            .await;
            assert_eq!(
                result,
                Err(CapabilityError::Timeout {
                    dependency: Dependency::GenerativeImage,
                    after: Duration::from_secs(60),
                })
            );
        }

        let rejected = guarded_call(&registry, Dependency::GenerativeImage, Duration::from_secs(60), || async {
            Ok::<(), CapabilityError>(())
        })
        .await;
        assert!(matches!(rejected, Err(CapabilityError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_isolated_per_dependency() {
        let registry = registry();
        for _ in 0..2 {
            let _ = guarded_call(&registry, Dependency::GenerativeImage, Duration::from_secs(1), || async {
                Err::<(), _>(CapabilityError::Failed("500".into()))
            })
            .await;
        }
        let other = guarded_call(&registry, Dependency::AssetStorage, Duration::from_secs(1), || async {
            Ok::<u8, CapabilityError>(7)
        })
        .await;
        assert_eq!(other, Ok(7));
    }

    #[test]
    fn test_retryable_categories() {
        assert!(!CapabilityError::AuthInvalid("bad key".into()).is_retryable());
        assert!(!CapabilityError::QuotaExhausted("no credits".into()).is_retryable());
        assert!(CapabilityError::Failed("502".into()).is_retryable());
        assert_eq!(
            CapabilityError::AuthInvalid("Remove.bg API key invalid".into()).to_string(),
            "AUTH_FAILED: Remove.bg API key invalid"
        );
    }
}
