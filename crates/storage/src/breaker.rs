//! Circuit breaker around fallible async calls.
//!
//! Closed → Open when the rolling error rate trips, Open → HalfOpen after
//! the reset interval, HalfOpen → Closed on a successful probe (or back to
//! Open on a failed one). Every call is also bounded by a timeout, and a
//! timeout counts as a failure.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Per-call deadline.
    pub call_timeout: Duration,
    /// Error-rate threshold that opens the circuit.
    pub trip_ratio: f64,
    /// Calls observed before the ratio is trusted.
    pub min_calls: u32,
    /// How long the circuit stays open before probing.
    pub reset_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            trip_ratio: 0.10,
            min_calls: 10,
            reset_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Window {
    state: State,
    calls: u32,
    failures: u32,
    window_started: Instant,
}

/// The error surface a wrapped call can produce.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit `{name}` is open")]
    Open { name: &'static str },
    #[error("call through circuit `{name}` timed out")]
    Timeout { name: &'static str },
    #[error("{0}")]
    Inner(E),
}

/// Allow/half-open/open wrapper over any fallible async call.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    window: Mutex<Window>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            window: Mutex::new(Window {
                state: State::Closed,
                calls: 0,
                failures: 0,
                window_started: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `call` under the breaker's admission rules and timeout.
    pub async fn call<T, E, F>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            metrics::counter!("circuit_rejected_total", "circuit" => self.name).increment(1);
            return Err(BreakerError::Open { name: self.name });
        }
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(Ok(value)) => {
                self.record(true);
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record(false);
                Err(BreakerError::Inner(error))
            }
            Err(_) => {
                self.record(false);
                Err(BreakerError::Timeout { name: self.name })
            }
        }
    }

    /// Whether a call may proceed right now.
    fn admit(&self) -> bool {
        let mut window = self.window.lock();
        match window.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open { until } => {
                if Instant::now() >= until {
                    window.state = State::HalfOpen;
                    self.transition("half_open");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record(&self, success: bool) {
        let mut window = self.window.lock();

        // A half-open probe decides the next state on its own.
        if window.state == State::HalfOpen {
            if success {
                window.state = State::Closed;
                window.calls = 0;
                window.failures = 0;
                window.window_started = Instant::now();
                self.transition("closed");
            } else {
                window.state = State::Open {
                    until: Instant::now() + self.config.reset_after,
                };
                self.transition("open");
            }
            return;
        }

        // Rolling window: counts restart each reset interval so an old burst
        // of failures cannot trip a now-healthy circuit.
        if window.window_started.elapsed() > self.config.reset_after {
            window.calls = 0;
            window.failures = 0;
            window.window_started = Instant::now();
        }
        window.calls += 1;
        if !success {
            window.failures += 1;
        }

        if window.state == State::Closed
            && window.calls >= self.config.min_calls
            && f64::from(window.failures) / f64::from(window.calls) >= self.config.trip_ratio
        {
            window.state = State::Open {
                until: Instant::now() + self.config.reset_after,
            };
            self.transition("open");
        }
    }

    fn transition(&self, to: &'static str) {
        tracing::info!(circuit = self.name, state = to, "circuit transition");
        metrics::counter!("circuit_transitions_total", "circuit" => self.name, "state" => to)
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            call_timeout: Duration::from_millis(50),
            trip_ratio: 0.10,
            min_calls: 5,
            reset_after: Duration::from_millis(100),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn trips_after_error_rate_threshold() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        // Sixth call is refused without running.
        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, BreakerError::Open { .. }));
    }

    #[tokio::test]
    async fn below_min_volume_never_trips() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn half_open_probe_recloses_on_success() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open { .. })
        ));
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Probe passes; circuit closes.
        assert!(succeed(&breaker).await.is_ok());
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            fail(&breaker).await,
            Err(BreakerError::Inner("boom"))
        ));
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open { .. })
        ));
    }

    #[tokio::test]
    async fn slow_calls_count_as_failures() {
        let breaker = CircuitBreaker::new("test", fast_config());
        let err = breaker
            .call(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, &'static str>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Timeout { .. }));
    }
}
