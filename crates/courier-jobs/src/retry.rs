//! Retry-by-requeue policy for failed async executions.
//!
//! A failed payload is pushed back onto its own queue with `_retry_count`
//! incremented and `_last_error` set, so retries survive a process restart.

use crate::job::AsyncJobConfig;
use crate::payload::{retry_count, Payload, LAST_ERROR_KEY, RETRY_COUNT_KEY};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why an execution failed, as far as retries are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The job's own logic returned an error.
    Error,
    /// The execution outlived its timeout.
    Timeout,
}

/// Outcome of applying the policy to a failed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Push this payload back onto the queue.
    Requeue { payload: Payload, attempt: u32 },
    /// The payload used up its retries.
    Exhausted { attempts: u32 },
    /// The job type does not retry this kind of failure.
    Disabled,
}

/// Requeue policy derived from an async job's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeuePolicy {
    /// Requeue failed payloads at all.
    pub enabled: bool,
    /// Requeues allowed per payload.
    pub max_retries: u32,
    /// Also requeue timed-out payloads.
    pub on_timeout: bool,
}

impl RequeuePolicy {
    /// Creates a policy with no retries.
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            on_timeout: false,
        }
    }

    /// Decides what to do with a payload whose execution failed.
    pub fn decide(&self, payload: &Payload, kind: FailureKind, message: &str) -> RetryDecision {
        if !self.enabled || (kind == FailureKind::Timeout && !self.on_timeout) {
            return RetryDecision::Disabled;
        }

        let attempts = retry_count(payload);
        if attempts >= self.max_retries {
            return RetryDecision::Exhausted { attempts };
        }

        let attempt = attempts + 1;
        let mut payload = payload.clone();
        payload.insert(RETRY_COUNT_KEY.to_string(), Value::from(attempt));
        payload.insert(LAST_ERROR_KEY.to_string(), Value::from(message));
        RetryDecision::Requeue { payload, attempt }
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl From<&AsyncJobConfig> for RequeuePolicy {
    fn from(config: &AsyncJobConfig) -> Self {
        Self {
            enabled: config.retry_enabled,
            max_retries: config.max_retries,
            on_timeout: config.retry_on_timeout,
        }
    }
}
