// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

const DEFAULT_MESSAGE_SIZE_WARNING: NonZeroUsize = NonZeroUsize::new(1024 * 1024 * 10).unwrap(); // 10mb

/// # Core options
///
/// Options of the invocation engine. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CoreOptions {
    /// # Message size warning
    ///
    /// Threshold to log a warning in case protocol messages coming from the runtime are larger than the specified amount.
    message_size_warning: NonZeroUsize,

    /// # Message size limit
    ///
    /// Threshold to fail the attempt in case protocol messages coming from the runtime are larger than the specified amount.
    message_size_limit: Option<NonZeroUsize>,

    /// # Disable eager state
    ///
    /// Ignore the state shipped with the start message: every state read becomes a journal entry
    /// completed by the runtime.
    disable_eager_state: bool,
}

impl CoreOptions {
    pub fn message_size_warning(&self) -> NonZeroUsize {
        self.message_size_warning
    }

    pub fn message_size_limit(&self) -> NonZeroUsize {
        self.message_size_limit.unwrap_or(NonZeroUsize::MAX)
    }

    pub fn disable_eager_state(&self) -> bool {
        self.disable_eager_state
    }

    pub fn with_message_size_warning(mut self, warning: NonZeroUsize) -> Self {
        self.message_size_warning = warning;
        self
    }

    pub fn with_message_size_limit(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.message_size_limit = limit;
        self
    }

    pub fn with_disable_eager_state(mut self, disable: bool) -> Self {
        self.disable_eager_state = disable;
        self
    }
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            message_size_warning: DEFAULT_MESSAGE_SIZE_WARNING,
            message_size_limit: None,
            disable_eager_state: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use restate_test_util::{assert, assert_eq};

    #[test]
    fn deserialize_kebab_case() {
        let opts: CoreOptions = serde_json::from_str(
            r#"{"message-size-limit": 1024, "disable-eager-state": true}"#,
        )
        .unwrap();

        assert_eq!(opts.message_size_warning().get(), 1024 * 1024 * 10);
        assert_eq!(opts.message_size_limit().get(), 1024);
        assert!(opts.disable_eager_state());
    }

    #[test]
    fn no_limit_by_default() {
        assert_eq!(CoreOptions::default().message_size_limit(), NonZeroUsize::MAX);
    }
}
