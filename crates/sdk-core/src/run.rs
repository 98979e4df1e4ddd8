// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Execution of local side effects.
//!
//! A `run` closure is registered against the index of its journal entry and executed later by
//! the progress pump, at most once per attempt. Its outcome is proposed to the runtime, which
//! owns the retries and answers with the authoritative completion.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::{debug, trace};

use restate_sdk_protocol::{EntryIndex, Message, proto};

use crate::error::{CoreError, HandlerError, codes, panic_message};
use crate::invocation::InvocationCore;

const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_FACTOR: f32 = 2.0;
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(2);

/// # Run retry policy
///
/// Every field is optional. When none is set, the runtime applies its own default policy.
/// When at least one is set, the missing ones are filled with fixed defaults.
///
/// Durations can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryPolicy {
    #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
    initial_interval: Option<humantime::Duration>,
    factor: Option<f32>,
    #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
    max_interval: Option<humantime::Duration>,
    max_attempts: Option<u32>,
    #[serde_as(as = "Option<serde_with::DisplayFromStr>")]
    max_duration: Option<humantime::Duration>,
}

impl RetryPolicy {
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = Some(interval.into());
        self
    }

    pub fn with_factor(mut self, factor: f32) -> Self {
        self.factor = Some(factor);
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration.into());
        self
    }

    fn is_unset(&self) -> bool {
        self.initial_interval.is_none()
            && self.factor.is_none()
            && self.max_interval.is_none()
            && self.max_attempts.is_none()
            && self.max_duration.is_none()
    }

    /// The policy sent to the runtime, `None` meaning the runtime default.
    ///
    /// This is the only place filling in the defaults.
    pub fn resolve(&self) -> Option<proto::RetryPolicy> {
        if self.is_unset() {
            return None;
        }
        Some(proto::RetryPolicy {
            initial_interval_millis: millis(
                self.initial_interval
                    .map(Into::into)
                    .unwrap_or(DEFAULT_INITIAL_INTERVAL),
            ),
            factor: self.factor.unwrap_or(DEFAULT_FACTOR),
            max_interval_millis: millis(
                self.max_interval
                    .map(Into::into)
                    .unwrap_or(DEFAULT_MAX_INTERVAL),
            ),
            max_attempts: self.max_attempts,
            max_duration_millis: self.max_duration.map(|d| millis(d.into())),
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) type RunClosure =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Bytes, HandlerError>> + Send>;

pub(crate) struct RunRegistration {
    pub(crate) name: String,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) closure: RunClosure,
}

/// Closures registered for `run` entries without a recorded result, keyed by entry index.
#[derive(Default)]
pub(crate) struct RunExecutor {
    pending: Mutex<BTreeMap<EntryIndex, RunRegistration>>,
}

impl RunExecutor {
    pub(crate) fn register(&self, index: EntryIndex, registration: RunRegistration) {
        let previous = self.pending.lock().insert(index, registration);
        debug_assert!(previous.is_none(), "run closure registered twice");
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Executes every registered closure in index order and proposes their outcomes.
    pub(crate) async fn execute_pending(&self, core: &InvocationCore) -> Result<(), CoreError> {
        loop {
            // The lock must not be held while the closure runs.
            let next = self.pending.lock().pop_first();
            let Some((index, registration)) = next else {
                return Ok(());
            };
            self.execute(core, index, registration).await?;
        }
    }

    async fn execute(
        &self,
        core: &InvocationCore,
        index: EntryIndex,
        registration: RunRegistration,
    ) -> Result<(), CoreError> {
        let RunRegistration {
            name,
            retry_policy,
            closure,
        } = registration;

        trace!(restate.journal.index = index, run.name = %name, "Executing run closure");
        let start = Instant::now();
        // A panicking closure is a retryable failure like any other error it returns.
        let outcome = match AssertUnwindSafe(async move { closure().await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::retryable(format!(
                "run closure '{name}' panicked: {}",
                panic_message(&*panic)
            ))),
        };
        let attempt_duration_millis = millis(start.elapsed());

        let (result, retry_policy) = match outcome {
            Ok(value) => (
                proto::propose_run_completion_message::Result::Value(value),
                None,
            ),
            Err(HandlerError::Terminal(failure)) => (
                proto::propose_run_completion_message::Result::TerminalFailure(failure.into()),
                None,
            ),
            Err(HandlerError::Core(err)) => return Err(err),
            Err(err) => {
                debug!(
                    restate.journal.index = index,
                    run.name = %name,
                    error = %err,
                    "Run closure failed, proposing a retryable failure"
                );
                let message = match err {
                    HandlerError::Retryable(err) => err.to_string(),
                    other => other.to_string(),
                };
                (
                    proto::propose_run_completion_message::Result::RetryableFailure(
                        proto::Failure {
                            code: codes::INTERNAL.into(),
                            message,
                        },
                    ),
                    retry_policy.resolve(),
                )
            }
        };

        core.send(Message::ProposeRunCompletion(
            proto::ProposeRunCompletionMessage {
                entry_index: index,
                result: Some(result),
                retry_policy,
                attempt_duration_millis,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use restate_test_util::{assert, assert_eq};

    #[test]
    fn unset_policy_defers_to_runtime() {
        assert!(RetryPolicy::default().resolve().is_none());
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let policy = RetryPolicy::default().with_max_attempts(3).resolve().unwrap();

        assert_eq!(
            policy,
            proto::RetryPolicy {
                initial_interval_millis: 50,
                factor: 2.0,
                max_interval_millis: 2000,
                max_attempts: Some(3),
                max_duration_millis: None,
            }
        );
    }

    #[test]
    fn deserialize_humantime() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"initial-interval": "100ms", "max-duration": "1m"}"#)
                .unwrap();
        let policy = policy.resolve().unwrap();

        assert_eq!(policy.initial_interval_millis, 100);
        assert_eq!(policy.max_interval_millis, 2000);
        assert_eq!(policy.max_duration_millis, Some(60_000));
    }
}
