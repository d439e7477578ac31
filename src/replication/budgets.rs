//! Independent retry budgets per failure class.
//!
//! Each budget answers "may we retry after N prior attempts of this
//! class?"; a budget configured to zero means unlimited retries. The
//! counters ride along with the task through its re-queues instead of
//! living in mutable task arguments.

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::configuration::types::ReplicationConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryBudgets {
    pub rate_limit: u32,
    pub timeout: u32,
    pub error: u32,
    pub connection: u32,
    escalate_exhaustion: bool,
}

impl RetryBudgets {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            rate_limit: config.retry_for_ratelimiting_limit,
            timeout: config.upload_max_timeouts,
            error: config.retry_for_error_limit,
            connection: config.retry_for_confirmation_connection_error,
            escalate_exhaustion: config.exception_if_retries_exceeded,
        }
    }

    fn allows(limit: u32, prior: u32) -> bool {
        limit == 0 || limit > prior + 1
    }

    pub fn allows_rate_limit_retry(&self, prior: u32) -> bool {
        Self::allows(self.rate_limit, prior)
    }

    pub fn allows_timeout_retry(&self, prior: u32) -> bool {
        Self::allows(self.timeout, prior)
    }

    pub fn allows_error_retry(&self, prior: u32) -> bool {
        Self::allows(self.error, prior)
    }

    pub fn allows_connection_retry(&self, prior: u32) -> bool {
        prior < self.connection
    }

    /// Budget exhausted: the file stays in its current status; how loudly
    /// we say so is a deployment decision.
    pub fn log_exhausted(&self, message: &str) {
        if self.escalate_exhaustion {
            error!("{}", message);
        } else {
            warn!("{}", message);
        }
    }
}

/// Attempt counters threaded through a task's re-queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    /// Rate-limit and generic-error attempts (they share a counter, with
    /// separate limits, matching the task protocol).
    pub attempts: u32,
    pub timeouts: u32,
    pub connection_errors: u32,
}

impl RetryCounters {
    pub fn another_attempt(mut self) -> Self {
        self.attempts += 1;
        self
    }

    pub fn another_timeout(mut self) -> Self {
        self.timeouts += 1;
        self
    }

    pub fn another_connection_error(mut self) -> Self {
        self.connection_errors += 1;
        self
    }
}
