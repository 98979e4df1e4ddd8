// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The journal of one invocation attempt: the replay prefix shipped by the runtime followed by
//! the entries created during this attempt.

mod params;

pub use params::{CallRequest, EntryParams};
pub(crate) use params::headers_from_proto;

use bytes::Bytes;
use tracing::trace;

use restate_sdk_protocol::{EntryIndex, EntryType, proto};

use crate::error::{CoreError, TerminalError};

/// Result of a completed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryResult {
    Empty,
    Value(Bytes),
    Failure(TerminalError),
}

impl From<proto::entry_result::Result> for EntryResult {
    fn from(value: proto::entry_result::Result) -> Self {
        match value {
            proto::entry_result::Result::Empty(_) => EntryResult::Empty,
            proto::entry_result::Result::Value(v) => EntryResult::Value(v),
            proto::entry_result::Result::Failure(f) => EntryResult::Failure(f.into()),
        }
    }
}

impl From<EntryResult> for proto::entry_result::Result {
    fn from(value: EntryResult) -> Self {
        match value {
            EntryResult::Empty => proto::entry_result::Result::Empty(proto::Empty {}),
            EntryResult::Value(v) => proto::entry_result::Result::Value(v),
            EntryResult::Failure(f) => proto::entry_result::Result::Failure(f.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub index: EntryIndex,
    pub params: EntryParams,
    /// Result known when the entry was created or replayed. Completions arriving later are
    /// tracked by the pending registry.
    pub result: Option<EntryResult>,
}

impl JournalEntry {
    pub fn entry_type(&self) -> EntryType {
        self.params.entry_type()
    }

    pub fn status(&self) -> EntryStatus {
        match &self.result {
            None => EntryStatus::Pending,
            Some(EntryResult::Failure(_)) => EntryStatus::Failed,
            Some(_) => EntryStatus::Completed,
        }
    }
}

/// Whether a freshly created entry of this type waits for a completion from the runtime.
pub(crate) fn expects_completion(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::GetState
            | EntryType::GetStateKeys
            | EntryType::GetPromise
            | EntryType::PeekPromise
            | EntryType::CompletePromise
            | EntryType::Sleep
            | EntryType::Call
            | EntryType::Awakeable
            | EntryType::Run
    )
}

/// Outcome of dispatching an operation against the journal.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// The operation matches the entry recorded at the cursor.
    Replayed(JournalEntry),
    /// The operation created a new entry, which must be transmitted.
    New(EntryIndex),
}

#[derive(Debug)]
pub(crate) struct Journal {
    entries: Vec<JournalEntry>,
    replay_len: usize,
    cursor: usize,
}

impl Journal {
    /// Builds the journal out of the replay prefix. The first prefix entry has index 1.
    pub(crate) fn new(prefix: Vec<JournalEntry>) -> Self {
        let replay_len = prefix.len();
        Self {
            entries: prefix,
            replay_len,
            cursor: 0,
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.cursor < self.replay_len
    }

    pub(crate) fn replay_len(&self) -> usize {
        self.replay_len
    }

    pub(crate) fn next_index(&self) -> EntryIndex {
        self.cursor as EntryIndex + 1
    }

    /// Replays the entry at the cursor if there is one, otherwise appends a new entry.
    ///
    /// A replayed entry must match the issued parameters, otherwise the handler is not
    /// deterministic and the attempt fails.
    pub(crate) fn dispatch(
        &mut self,
        params: &EntryParams,
        local_result: Option<EntryResult>,
    ) -> Result<Dispatch, CoreError> {
        let index = self.next_index();

        if self.cursor < self.replay_len {
            let recorded = &self.entries[self.cursor];
            if !params.replay_matches(&recorded.params) {
                return Err(CoreError::JournalMismatch {
                    index,
                    entry_type: recorded.entry_type(),
                    recorded: format!("{:?}", recorded.params),
                    issued: format!("{params:?}"),
                });
            }
            self.cursor += 1;
            trace!(
                restate.journal.index = index,
                restate.journal.entry_type = %recorded.entry_type(),
                "Replayed journal entry"
            );
            return Ok(Dispatch::Replayed(recorded.clone()));
        }

        trace!(
            restate.journal.index = index,
            restate.journal.entry_type = %params.entry_type(),
            "Created journal entry"
        );
        self.entries.push(JournalEntry {
            index,
            params: params.clone(),
            result: local_result,
        });
        self.cursor += 1;
        Ok(Dispatch::New(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use restate_test_util::{assert, assert_eq, let_assert};

    fn get_state(key: &'static [u8]) -> EntryParams {
        EntryParams::GetState {
            key: Bytes::from_static(key),
        }
    }

    #[test]
    fn new_entries_get_increasing_indexes() {
        let mut journal = Journal::new(vec![]);
        assert!(!journal.is_replaying());

        let_assert!(Ok(Dispatch::New(1)) = journal.dispatch(&get_state(b"a"), None));
        let_assert!(Ok(Dispatch::New(2)) = journal.dispatch(&EntryParams::Awakeable, None));
        assert_eq!(journal.next_index(), 3);
        assert_eq!(journal.replay_len(), 0);
    }

    #[test]
    fn replays_prefix_then_appends() {
        let mut journal = Journal::new(vec![JournalEntry {
            index: 1,
            params: get_state(b"a"),
            result: Some(EntryResult::Value(Bytes::from_static(b"1"))),
        }]);
        assert!(journal.is_replaying());

        let_assert!(Ok(Dispatch::Replayed(entry)) = journal.dispatch(&get_state(b"a"), None));
        assert_eq!(entry.index, 1);
        assert_eq!(entry.status(), EntryStatus::Completed);
        assert!(!journal.is_replaying());

        let_assert!(Ok(Dispatch::New(2)) = journal.dispatch(&get_state(b"b"), None));
        assert_eq!(journal.replay_len(), 1);
    }

    #[test]
    fn mismatch_is_reported_with_the_recorded_entry() {
        let mut journal = Journal::new(vec![JournalEntry {
            index: 1,
            params: get_state(b"x"),
            result: None,
        }]);

        let_assert!(
            Err(CoreError::JournalMismatch {
                index: 1,
                entry_type: EntryType::GetState,
                ..
            }) = journal.dispatch(
                &EntryParams::SetState {
                    key: Bytes::from_static(b"y"),
                    value: Default::default(),
                },
                None,
            )
        );
        assert!(journal.is_replaying());
    }
}
