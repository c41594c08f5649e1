//! Rate governor shared by every worker of a run.
//!
//! Paces outbound requests with a token bucket and adapts to rejection
//! signals from the remote.
//!
//! ## Behavior
//!
//! - The bucket refills at the *effective* rate, capped at `burst` tokens.
//!   A caller that finds it empty reserves the next token and is told how
//!   long to wait, so concurrent callers receive successive slots.
//! - A rejection lowers the effective rate according to the backoff policy
//!   and blocks the bucket for a cooldown (the server's `Retry-After` when
//!   given).
//! - After `recovery_threshold` consecutive successes the effective rate is
//!   multiplied by `recovery_factor`, never exceeding the target.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::models::{BackoffPolicy, GovernorConfig};

/// Read-only view of the governor's adaptive state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateState {
    /// Requests per second currently allowed
    pub current_rate: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_adjusted_at: Instant,
}

#[derive(Debug)]
struct GovernorState {
    current_rate: f64,
    /// May go negative: each unit below zero is an outstanding reservation
    tokens: f64,
    /// Tokens accrue only after this instant
    refilled_at: Instant,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_adjusted_at: Instant,
}

impl GovernorState {
    fn refill(&mut self, now: Instant, burst: f64) {
        if now > self.refilled_at {
            let elapsed = (now - self.refilled_at).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.current_rate).min(burst);
            self.refilled_at = now;
        }
    }
}

/// Token-bucket pacer with adaptive backoff.
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    /// Create a governor with default configuration.
    pub fn new() -> Self {
        Self::with_config(GovernorConfig::default())
    }

    /// Create a governor with custom configuration.
    pub fn with_config(config: GovernorConfig) -> Self {
        let now = Instant::now();
        let state = GovernorState {
            current_rate: config.target_rate,
            tokens: f64::from(config.burst),
            refilled_at: now,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_adjusted_at: now,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        // Plain counters; a panic mid-update cannot leave them unusable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn burst(&self) -> f64 {
        f64::from(self.config.burst)
    }

    /// Reserve the next request slot.
    ///
    /// Returns how long the caller must wait before sending.
    pub fn acquire(&self) -> Duration {
        let mut state = self.lock();
        let now = Instant::now();
        state.refill(now, self.burst());
        state.tokens -= 1.0;

        let mut wait = state.refilled_at.saturating_duration_since(now);
        if state.tokens < 0.0 {
            wait += Duration::from_secs_f64(-state.tokens / state.current_rate);
        }
        wait
    }

    /// Reserve a slot and sleep until it is due.
    pub async fn throttle(&self) -> Duration {
        let wait = self.acquire();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record a request the remote accepted.
    pub fn on_success(&self, status_code: u16) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);

        if state.current_rate >= self.config.target_rate
            || state.consecutive_successes < self.config.recovery_threshold
        {
            return;
        }

        let now = Instant::now();
        state.refill(now, self.burst());
        let previous = state.current_rate;
        state.current_rate = (previous * self.config.recovery_factor).min(self.config.target_rate);
        state.consecutive_successes = 0;
        state.last_adjusted_at = now;
        log::debug!(
            "Governor: relaxing rate {:.3} -> {:.3} req/s after status {}",
            previous,
            state.current_rate,
            status_code
        );
    }

    /// Record an explicit rate-limit or server-error signal.
    ///
    /// Returns the cooldown imposed before the next request.
    pub fn on_rejection(&self, status_code: u16, retry_after: Option<Duration>) -> Duration {
        let mut state = self.lock();
        let now = Instant::now();
        state.refill(now, self.burst());
        state.consecutive_successes = 0;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        let backoff = self.backoff_delay(state.consecutive_failures);
        let cooldown = retry_after.map_or(backoff, |ra| {
            ra.max(self.config.floor_delay())
                .min(self.config.ceiling_delay())
        });

        if !backoff.is_zero() {
            let slowed = 1.0 / backoff.as_secs_f64();
            state.current_rate = state.current_rate.min(slowed);
        }

        let resume_at = now + cooldown;
        if resume_at > state.refilled_at {
            state.refilled_at = resume_at;
            state.tokens = state.tokens.min(1.0);
        }
        state.last_adjusted_at = now;

        log::warn!(
            "Governor: rejection {} (#{} in a row), cooling down {:?}, rate now {:.3} req/s",
            status_code,
            state.consecutive_failures,
            cooldown,
            state.current_rate
        );
        cooldown
    }

    /// Post-rejection delay for the given consecutive failure count.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let floor = self.config.floor_delay();
        let steps = consecutive_failures.saturating_sub(1);
        let delay = match self.config.backoff {
            BackoffPolicy::Exponential => floor.saturating_mul(1u32 << steps.min(31)),
            BackoffPolicy::Linear => {
                floor.saturating_add(self.config.linear_step().saturating_mul(steps))
            }
            BackoffPolicy::Fixed => floor,
        };
        delay.max(floor).min(self.config.ceiling_delay())
    }

    pub fn snapshot(&self) -> RateState {
        let state = self.lock();
        RateState {
            current_rate: state.current_rate,
            consecutive_successes: state.consecutive_successes,
            consecutive_failures: state.consecutive_failures,
            last_adjusted_at: state.last_adjusted_at,
        }
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new()
    }
}
