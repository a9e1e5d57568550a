//! Per-dependency circuit breaker.
//!
//! Failures are counted inside a rolling window. Reaching the threshold opens
//! the breaker; while open, calls are rejected without invoking the wrapped
//! future. Once the open timeout elapses a single trial call is let through
//! (half-open); enough successful trials close the breaker again, and any
//! failure reopens it.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures inside `window` that open the breaker
    pub failure_threshold: u32,
    /// Successful half-open trials needed to close it again
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing a trial
    pub open_timeout: Duration,
    /// Rolling window in which failures are counted
    pub window: Duration,
}

/// A call refused without touching the dependency.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRejection {
    #[error("Circuit breaker OPEN for {name}. Service temporarily unavailable. Retry in {}s.", retry_secs(.retry_after))]
    Open { name: String, retry_after: Duration },

    #[error("Circuit breaker HALF_OPEN for {name}. A recovery probe is already in flight.")]
    TrialInProgress { name: String },
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn retry_secs(d: &Duration) -> u64 {
    ceil_secs(*d)
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: usize,
    pub successes: u32,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_times: VecDeque<Instant>,
    successes: u32,
    next_attempt_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_times: VecDeque::new(),
            successes: 0,
            next_attempt_at: None,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failure_times.front() {
            if now.duration_since(oldest) >= window {
                self.failure_times.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            open_timeout_secs = config.open_timeout.as_secs(),
            window_secs = config.window.as_secs(),
            "Circuit breaker initialized"
        );
        let breaker = Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::closed()),
        };
        breaker.publish(CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `call` under breaker protection.
    ///
    /// A rejected call never invokes `call`. Every `Err` returned by the
    /// call counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, call: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BreakerRejection>,
    {
        let permit = self.admit()?;
        let outcome = call().await;
        match &outcome {
            Ok(_) => permit.succeed(),
            Err(_) => permit.fail(),
        }
        outcome
    }

    fn admit(&self) -> Result<Permit<'_>, BreakerRejection> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let next_attempt_at = inner.next_attempt_at.unwrap_or(now);
                if now < next_attempt_at {
                    let retry_after = next_attempt_at - now;
                    tracing::warn!(
                        breaker = %self.name,
                        retry_after_secs = ceil_secs(retry_after),
                        failures = inner.failure_times.len(),
                        "Circuit breaker OPEN, rejecting call"
                    );
                    return Err(BreakerRejection::Open {
                        name: self.name.clone(),
                        retry_after,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                drop(inner);
                tracing::info!(breaker = %self.name, "Circuit breaker transitioning to HALF_OPEN");
                self.publish(CircuitState::HalfOpen);
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(BreakerRejection::TrialInProgress {
                        name: self.name.clone(),
                    });
                }
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.failure_times.clear();
        if !trial {
            return;
        }
        inner.trial_in_flight = false;
        if inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.successes += 1;
        if inner.successes >= self.config.success_threshold {
            inner.state = CircuitState::Closed;
            inner.successes = 0;
            inner.next_attempt_at = None;
            drop(inner);
            tracing::info!(breaker = %self.name, "Circuit breaker CLOSED, service recovered");
            self.publish(CircuitState::Closed);
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.failure_times.push_back(now);
        inner.prune(now, self.config.window);
        if trial {
            inner.trial_in_flight = false;
        }

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.successes = 0;
                inner.next_attempt_at = Some(now + self.config.open_timeout);
                drop(inner);
                tracing::warn!(
                    breaker = %self.name,
                    retry_after_secs = self.config.open_timeout.as_secs(),
                    "Circuit breaker back to OPEN"
                );
                self.publish(CircuitState::Open);
            }
            CircuitState::Closed if inner.failure_times.len() >= self.config.failure_threshold as usize => {
                let failures = inner.failure_times.len();
                inner.state = CircuitState::Open;
                inner.next_attempt_at = Some(now + self.config.open_timeout);
                drop(inner);
                tracing::error!(
                    breaker = %self.name,
                    failures,
                    threshold = self.config.failure_threshold,
                    retry_after_secs = self.config.open_timeout.as_secs(),
                    "Circuit breaker OPENED"
                );
                self.publish(CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Releases a trial slot whose call was dropped before it finished.
    fn on_abandoned(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.prune(now, self.config.window);
        let retry_after_secs = match (inner.state, inner.next_attempt_at) {
            (CircuitState::Open, Some(at)) if at > now => Some(ceil_secs(at - now)),
            (CircuitState::Open, _) => Some(0),
            _ => None,
        };
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failure_times.len(),
            successes: inner.successes,
            retry_after_secs,
        }
    }

    /// Force the breaker back to Closed (manual recovery).
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::closed();
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset");
        self.publish(CircuitState::Closed);
    }

    fn publish(&self, state: CircuitState) {
        metrics::gauge!("dependency_circuit_state", "dependency" => self.name.clone())
            .set(state.gauge_value());
    }
}

/// Admission ticket for one call. Dropping it unresolved frees a trial slot
/// so a cancelled probe cannot wedge the breaker half-open.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_abandoned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Rejected(BreakerRejection),
        Boom,
    }

    impl From<BreakerRejection> for TestError {
        fn from(r: BreakerRejection) -> Self {
            TestError::Rejected(r)
        }
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            window: Duration::from_secs(120),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), TestError> {
        breaker.execute(|| async { Err::<(), _>(TestError::Boom) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), TestError> {
        breaker.execute(|| async { Ok::<(), TestError>(()) }).await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().failure_threshold {
            let _ = fail(breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_skips_call() {
        let breaker = CircuitBreaker::new("generative-image", config());
        trip(&breaker).await;

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TestError>(())
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        match result {
            Err(TestError::Rejected(BreakerRejection::Open { retry_after, .. })) => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected open rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_are_forgotten() {
        let breaker = CircuitBreaker::new("background-removal", config());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(121)).await;
        fail(&breaker).await.unwrap_err();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("asset-storage", config());
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("generative-image", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timeout() {
        let breaker = CircuitBreaker::new("generative-image", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().retry_after_secs, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_a_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new("background-removal", config()));
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let (release, hold) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let mut trial = tokio_test::task::spawn(async move {
            trial_breaker
                .execute(|| async move {
                    let _ = hold.await;
                    Ok::<(), TestError>(())
                })
                .await
        });
        tokio_test::assert_pending!(trial.poll());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let invoked = AtomicUsize::new(0);
        let second = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TestError>(())
            })
            .await;
        assert!(matches!(
            second,
            Err(TestError::Rejected(BreakerRejection::TrialInProgress { .. }))
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release.send(()).unwrap();
        assert!(trial.is_woken());
        tokio_test::assert_ready_ok!(trial.poll());
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_the_slot() {
        let breaker = CircuitBreaker::new("generative-image", config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        {
            let mut trial = tokio_test::task::spawn(
                breaker.execute(|| futures::future::pending::<Result<(), TestError>>()),
            );
            tokio_test::assert_pending!(trial.poll());
        }

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.stats().successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_breaker() {
        let breaker = CircuitBreaker::new("asset-storage", config());
        trip(&breaker).await;
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[test]
    fn test_rejection_message_rounds_up() {
        let rejection = BreakerRejection::Open {
            name: "generative-image".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(
            rejection.to_string(),
            "Circuit breaker OPEN for generative-image. Service temporarily unavailable. Retry in 2s."
        );
    }
}
