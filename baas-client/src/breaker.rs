//! Circuit breaker around the send path.
//!
//! Closed → Open after `failure_threshold` consecutive link failures.
//! Open → Half-Open once the cooldown elapses; one trial call is let through.
//! A successful trial closes the breaker, a failed one reopens it with the
//! cooldown doubled (capped at `max_cooldown`).

use crate::error::ClientError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Per-call deadline. Elapsing counts as a failure.
    pub timeout: Duration,
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Maximum gap between two failures for them to count as consecutive.
    pub failure_window: Duration,
    /// Initial time spent open before a trial call.
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(15),
            max_cooldown: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_max_cooldown(mut self, max_cooldown: Duration) -> Self {
        self.max_cooldown = max_cooldown;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Events observable through [`CircuitBreaker::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    Tripped {
        failures: u32,
        cooldown: Duration,
        reason: String,
    },
    /// A trial call succeeded and the breaker closed.
    Recovered,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_running: bool },
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: u32,
    last_failure: Option<Instant>,
    cooldown: Duration,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: parking_lot::Mutex<Inner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: parking_lot::Mutex::new(Inner {
                state: State::Closed,
                failures: 0,
                last_failure: None,
                cooldown: config.cooldown,
            }),
            config,
            events,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Current state. An open breaker whose cooldown has elapsed reports
    /// `HalfOpen`, since the next call will be let through as the trial.
    pub fn state(&self) -> BreakerState {
        match self.inner.lock().state {
            State::Closed => BreakerState::Closed,
            State::Open { until } if Instant::now() < until => BreakerState::Open,
            State::Open { .. } | State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Consecutive failures counted so far.
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Runs `call` under the breaker.
    ///
    /// Fails with [`ClientError::BreakerOpen`] without polling `call` when the
    /// breaker rejects it, and with [`ClientError::Timeout`] when the deadline
    /// elapses first. Work already handed to the server is not cancelled.
    pub async fn call<F, T>(&self, call: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let permit = self.admit()?;
        let result = match tokio::time::timeout(self.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        };
        permit.record(&result);
        result
    }

    fn admit(&self) -> Result<Permit<'_>, ClientError> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            State::Closed => false,
            State::Open { until } if Instant::now() < until => {
                return Err(ClientError::BreakerOpen);
            }
            State::Open { .. } | State::HalfOpen { trial_running: false } => {
                tracing::debug!("Circuit breaker half-open, admitting trial call");
                inner.state = State::HalfOpen {
                    trial_running: true,
                };
                true
            }
            State::HalfOpen { trial_running: true } => {
                return Err(ClientError::BreakerOpen);
            }
        };
        Ok(Permit {
            breaker: self,
            trial,
            recorded: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.last_failure = None;
        if trial {
            inner.state = State::Closed;
            inner.cooldown = self.config.cooldown;
            drop(inner);
            tracing::info!("Circuit breaker closed after successful trial");
            let _ = self.events.send(BreakerEvent::Recovered);
        }
    }

    fn on_failure(&self, trial: bool, err: &ClientError) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if trial {
            inner.cooldown = (inner.cooldown * 2).min(self.config.max_cooldown);
        } else {
            if !matches!(inner.state, State::Closed) {
                // Admitted before the breaker opened; already accounted for.
                return;
            }
            let consecutive = inner
                .last_failure
                .is_some_and(|last| now.duration_since(last) <= self.config.failure_window);
            inner.failures = if consecutive { inner.failures + 1 } else { 1 };
            inner.last_failure = Some(now);
            if inner.failures < self.config.failure_threshold {
                return;
            }
        }

        let cooldown = inner.cooldown;
        let failures = inner.failures;
        inner.state = State::Open {
            until: now + cooldown,
        };
        drop(inner);

        tracing::warn!(
            failures,
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit breaker opened: {}",
            err
        );
        let _ = self.events.send(BreakerEvent::Tripped {
            failures,
            cooldown,
            reason: err.to_string(),
        });
    }

    /// Releases a trial slot whose call was abandoned before finishing.
    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if let State::HalfOpen { trial_running: true } = inner.state {
            inner.state = State::HalfOpen {
                trial_running: false,
            };
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission to run one call. Dropping it unrecorded frees a trial slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl Permit<'_> {
    fn record<T>(mut self, result: &Result<T, ClientError>) {
        self.recorded = true;
        match result {
            Err(e) if e.is_link_failure() => self.breaker.on_failure(self.trial, e),
            _ => self.breaker.on_success(self.trial),
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.recorded {
            self.breaker.release_trial();
        }
    }
}
