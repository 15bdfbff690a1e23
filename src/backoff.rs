//! Exponential backoff with jitter for [`crate::pool::ConnectionManager`] reconnection.

use std::time::Duration;

use rand::Rng;
use typed_builder::TypedBuilder;

/// Configuration for a connection manager's reconnection backoff.
///
/// Configured as a minimum delay, a ceiling, and a jitter fraction, reset on a successful
/// SETTINGS frame.
#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct BackoffPolicy {
    /// The delay before the first reconnection attempt.
    #[builder(default = Duration::from_millis(100))]
    pub initial: Duration,

    /// The ceiling the delay is clamped to as it grows.
    #[builder(default = Duration::from_secs(30))]
    pub max: Duration,

    /// The factor the delay is multiplied by after each failed attempt.
    #[builder(default = 2.0)]
    pub multiplier: f64,

    /// The fraction of the computed delay to randomize, in `[0.0, 1.0]`.
    #[builder(default = 0.2)]
    pub jitter: f64,

    /// Whether a successful SETTINGS frame resets the delay back to `initial`.
    #[builder(default = true)]
    pub reset_on_success: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::builder().build()
    }
}

/// Tracks the current delay for one connection manager's reconnection loop.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial,
            policy,
        }
    }

    /// Returns the delay to wait before the next reconnection attempt, then grows the delay
    /// for next time.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let jittered = jitter(self.current, self.policy.jitter);
        let next = self.current.mul_f64(self.policy.multiplier);
        self.current = next.min(self.policy.max);
        jittered
    }

    /// Resets the delay back to the policy's initial value, per `reset_on_success`.
    pub(crate) fn reset(&mut self) {
        if self.policy.reset_on_success {
            self.current = self.policy.initial;
        }
    }
}

fn jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return base;
    }
    let fraction = fraction.min(1.0);
    let delta = base.mul_f64(fraction);
    let offset_ms = rand::rng().random_range(-1.0..=1.0) * delta.as_secs_f64() * 1000.0;
    let base_ms = base.as_secs_f64() * 1000.0;
    Duration::from_secs_f64((base_ms + offset_ms).max(0.0) / 1000.0)
}
