//! Circuit breaker guarding the external object-storage collaborator
//!
//! Sheds load during sustained upload failures instead of letting every
//! run queue behind a dead storage endpoint. Independent of the detection
//! pipeline; the coordinator consults it only at the point results are
//! persisted or uploaded.

use crate::error::{PlantCountError, Result};
use instant::Instant;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Tuning for the upload circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of most recent call outcomes kept in the rolling window
    pub window: usize,
    /// Minimum observations before the failure rate is evaluated
    pub min_observations: usize,
    /// Failure rate at or above which the breaker opens
    pub failure_threshold: f64,
    /// How long the breaker stays open before allowing a trial call
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 10,
            min_observations: 4,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through; outcomes are recorded
    Closed,
    /// Calls are rejected immediately until the cooldown elapses
    Open,
    /// One trial call is in flight; its outcome decides the next state
    HalfOpen,
}

/// Runtime statistics for the breaker
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerStats {
    /// Calls that completed successfully
    pub successes: u64,
    /// Calls that completed with an error
    pub failures: u64,
    /// Calls rejected without invoking the underlying operation
    pub rejected: u64,
    /// Number of closed-to-open transitions
    pub opened: u64,
}

struct BreakerInner {
    state: BreakerState,
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    stats: BreakerStats,
}

/// Circuit breaker for upload calls to the object-storage collaborator
pub struct UploadCircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl UploadCircuitBreaker {
    /// Create a breaker with the given tuning
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                stats: BreakerStats::default(),
            }),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Snapshot of runtime statistics
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        self.inner.lock().expect("breaker lock poisoned").stats
    }

    /// Run `op` through the breaker.
    ///
    /// While open, the operation is NOT invoked and the call fails fast
    /// with `PlantCountError::CircuitOpen`. After the cooldown, exactly one
    /// call becomes the half-open trial; its outcome closes or re-opens
    /// the breaker.
    ///
    /// # Errors
    /// - `CircuitOpen` when the breaker sheds the call
    /// - The operation's own error otherwise
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;
        match op().await {
            Ok(value) => {
                self.record(true);
                Ok(value)
            },
            Err(e) => {
                self.record(false);
                Err(e)
            },
        }
    }

    fn before_call(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    // This call becomes the half-open trial.
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    inner.stats.rejected += 1;
                    Err(PlantCountError::CircuitOpen(format!(
                        "cooldown {}ms remaining",
                        self.config
                            .cooldown
                            .saturating_sub(elapsed)
                            .as_millis()
                    )))
                }
            },
            BreakerState::HalfOpen => {
                inner.stats.rejected += 1;
                Err(PlantCountError::CircuitOpen(
                    "half-open trial already in flight".to_string(),
                ))
            },
        }
    }

    fn record(&self, success: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if success {
            inner.stats.successes += 1;
        } else {
            inner.stats.failures += 1;
        }

        match inner.state {
            BreakerState::HalfOpen => {
                if success {
                    inner.state = BreakerState::Closed;
                    inner.outcomes.clear();
                    inner.opened_at = None;
                    log::info!("Upload circuit breaker closed after successful trial");
                } else {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.stats.opened += 1;
                    log::warn!("Upload circuit breaker re-opened after failed trial");
                }
            },
            BreakerState::Closed => {
                inner.outcomes.push_back(success);
                while inner.outcomes.len() > self.config.window {
                    inner.outcomes.pop_front();
                }

                if inner.outcomes.len() >= self.config.min_observations {
                    let failures = inner.outcomes.iter().filter(|&&ok| !ok).count();
                    let rate = failures as f64 / inner.outcomes.len() as f64;
                    if rate >= self.config.failure_threshold {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                        inner.stats.opened += 1;
                        log::warn!(
                            "Upload circuit breaker opened: {}/{} recent calls failed",
                            failures,
                            inner.outcomes.len()
                        );
                    }
                }
            },
            // Open never records: before_call rejects or promotes to HalfOpen.
            BreakerState::Open => {},
        }
    }
}
