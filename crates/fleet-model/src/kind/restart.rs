//! # Restart policy of a service's tasks.
//!
//! [`RestartPolicy`] decides whether a terminated task is replaced and how long the
//! replacement waits before it may run.
//!
//! - [`RestartCondition::None`] terminated tasks stay terminated.
//! - [`RestartCondition::OnFailure`] only `Failed` tasks are replaced.
//! - [`RestartCondition::Any`] `Failed`, `Completed` and `Rejected` tasks are replaced (default).
//!
//! ## Delay
//! ```text
//! backoff = None        → wait exactly `delay`
//! backoff = Some(b)     → cap = min(b.max, b.base + b.factor × n), wait = random[0, cap]
//!                         (n = ordinal of the failure since the last Running observation)
//! ```
//!
//! ## Limits
//! - `max_attempts = 0` → unlimited restarts.
//! - `window = 0` → every restart since the last template change counts toward `max_attempts`.
//! - `window > 0` → only restarts inside the trailing window count.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ModelError, TaskState};

/// When a terminated task should be replaced.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestartCondition {
    None,
    OnFailure,
    #[default]
    Any,
}

impl RestartCondition {
    /// Returns `true` if a task that terminated in `state` is eligible for replacement.
    pub fn allows(&self, state: TaskState) -> bool {
        match self {
            RestartCondition::None => false,
            RestartCondition::OnFailure => state == TaskState::Failed,
            RestartCondition::Any => matches!(
                state,
                TaskState::Failed | TaskState::Completed | TaskState::Rejected
            ),
        }
    }
}

/// Linear backoff: `min(max, base + factor × n)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay cap for the `n`-th failure since the last success.
    pub fn cap(&self, n: u64) -> Duration {
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        self.base
            .saturating_add(self.factor.saturating_mul(n))
            .min(self.max)
    }
}

/// Restart policy embedded in a service's task template.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    #[serde(default)]
    pub condition: RestartCondition,
    /// Fixed wait before the replacement may run; ignored when `backoff` is set.
    #[serde(default = "default_delay")]
    pub delay: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
    /// `0` = unlimited.
    #[serde(default)]
    pub max_attempts: u64,
    /// `0` = unlimited lookback.
    #[serde(default)]
    pub window: Duration,
}

/// Default fixed restart delay.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

fn default_delay() -> Duration {
    DEFAULT_RESTART_DELAY
}

impl Default for RestartPolicy {
    /// Restart on any termination after 5s, no limits.
    fn default() -> Self {
        Self {
            condition: RestartCondition::Any,
            delay: DEFAULT_RESTART_DELAY,
            backoff: None,
            max_attempts: 0,
            window: Duration::ZERO,
        }
    }
}

impl RestartPolicy {
    pub fn with_condition(mut self, condition: RestartCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Rejects policies that cannot produce a meaningful delay.
    pub fn validate(&self) -> Result<(), ModelError> {
        if let Some(b) = &self.backoff
            && b.base > b.max
        {
            return Err(ModelError::BackoffBaseExceedsMax {
                base: b.base,
                max: b.max,
            });
        }
        Ok(())
    }
}
