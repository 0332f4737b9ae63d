//! # Restart delay computation.
//!
//! ```text
//! policy.backoff = None     → RestartDelay { delay: policy.delay, jitter: false }
//! policy.backoff = Some(b)  → RestartDelay { delay: b.cap(failures + 1), jitter: true }
//! ```
//!
//! A jittered delay is an upper bound: the realized wait is drawn uniformly from `[0, delay]`
//! by [`Jitter`], independently for every attempt.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fleet_model::RestartPolicy;

/// Restart delay of a slot before randomization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDelay {
    pub delay: Duration,
    /// `true` if the realized wait must be drawn from `[0, delay]`.
    pub jitter: bool,
}

impl RestartDelay {
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            jitter: false,
        }
    }

    pub const fn jittered(delay: Duration) -> Self {
        Self {
            delay,
            jitter: true,
        }
    }
}

/// Computes the restart delay for a slot with `failures` failures since its last success,
/// not counting the failure being handled.
pub fn task_restart_delay(policy: &RestartPolicy, failures: u64) -> RestartDelay {
    match &policy.backoff {
        None => RestartDelay::fixed(policy.delay),
        Some(b) => RestartDelay::jittered(b.cap(failures.saturating_add(1))),
    }
}

/// Full-jitter random source.
///
/// Seedable so callers can reproduce a sequence of waits.
#[derive(Debug)]
pub struct Jitter {
    rng: Mutex<StdRng>,
}

impl Jitter {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::seeded)
    }

    /// Turns a [`RestartDelay`] into the wait the scheduler sleeps for.
    pub fn realize(&self, delay: RestartDelay) -> Duration {
        if !delay.jitter {
            return delay.delay;
        }
        self.full(delay.delay)
    }

    /// Uniform draw from `[0, delay]`.
    pub fn full(&self, delay: Duration) -> Duration {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_nanos(rng.random_range(0..=nanos))
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::from_entropy()
    }
}
