// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, trace, warn};

use restate_sdk_protocol::EntryIndex;

use crate::error::{CoreError, TerminalError};
use crate::journal::EntryResult;

/// A resolved completion, tagged with its position in the delivery order.
///
/// Entries resolved by the same delivery step (e.g. a cancellation) share the same `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub seq: u64,
    pub result: EntryResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    AwaitingCompletion,
    AwaitingAck,
    Resolved(Resolution),
    Acked,
    Unknown,
}

/// State of the inbound side of the transport, as observed by the reader path.
#[derive(Debug, Clone, Default)]
pub enum InputState {
    #[default]
    Open,
    Closed,
    Failed(CoreError),
}

/// Readiness of a set of entries the handler waits on.
#[derive(Debug)]
pub(crate) enum Readiness {
    /// At least one entry is resolved. Contains every resolved entry of the set.
    Resolved(Vec<(EntryIndex, Resolution)>),
    /// Nothing resolved yet, more messages may still arrive.
    Waiting,
    /// Nothing resolved and the input stream is closed: the attempt can only suspend.
    InputClosed,
    Failed(CoreError),
}

#[derive(Debug, Default)]
struct Inner {
    completions: BTreeSet<EntryIndex>,
    acks: BTreeSet<EntryIndex>,
    resolved: HashMap<EntryIndex, Resolution>,
    acked: HashSet<EntryIndex>,
    cancelled: bool,
    input: InputState,
    // 0 is reserved for results known before the attempt started
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Entries waiting for a completion or an ack, shared by the reader path and the handler.
///
/// Every mutation takes the lock briefly and wakes up the waiting handler.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry waiting for a completion. Must happen before the entry is transmitted.
    ///
    /// After cancellation, the entry is resolved right away with the cancellation failure.
    pub fn register_completion(&self, index: EntryIndex) {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            let seq = inner.next_seq();
            inner.resolved.insert(
                index,
                Resolution {
                    seq,
                    result: EntryResult::Failure(TerminalError::cancelled()),
                },
            );
            drop(inner);
            self.notify.notify_waiters();
            return;
        }
        inner.completions.insert(index);
    }

    /// Registers an entry waiting for an ack. Must happen before the entry is transmitted.
    pub fn register_ack(&self, index: EntryIndex) {
        self.inner.lock().acks.insert(index);
    }

    /// Resolves the entry with the given result. Returns false if the completion was ignored.
    ///
    /// A completed entry never changes its result: duplicates are ignored, as are completions
    /// for entries nobody registered.
    pub fn resolve(&self, index: EntryIndex, result: EntryResult) -> bool {
        let mut inner = self.inner.lock();
        if !inner.completions.remove(&index) {
            if inner.resolved.contains_key(&index) {
                debug!(
                    restate.journal.index = index,
                    "Ignoring completion for an already completed entry"
                );
            } else {
                warn!(
                    restate.journal.index = index,
                    "Ignoring completion for an unknown entry"
                );
            }
            return false;
        }

        let seq = inner.next_seq();
        trace!(restate.journal.index = index, seq, "Resolved entry");
        inner.resolved.insert(index, Resolution { seq, result });
        drop(inner);

        self.notify.notify_waiters();
        true
    }

    /// Marks the entry as durably stored. Returns false if the ack was ignored.
    pub fn ack(&self, index: EntryIndex) -> bool {
        let mut inner = self.inner.lock();
        if !inner.acks.remove(&index) {
            warn!(
                restate.journal.index = index,
                "Ignoring ack for an unknown entry"
            );
            return false;
        }
        inner.acked.insert(index);
        drop(inner);

        self.notify.notify_waiters();
        true
    }

    /// Resolves every entry waiting for a completion with the cancellation failure, in a single
    /// delivery step. Entries registered afterwards fail right away. Entries waiting for an ack
    /// are left untouched. Returns the cancelled entries.
    pub fn cancel(&self) -> Vec<EntryIndex> {
        let mut inner = self.inner.lock();
        inner.cancelled = true;
        let seq = inner.next_seq();
        let cancelled: Vec<_> = std::mem::take(&mut inner.completions)
            .into_iter()
            .collect();
        for index in &cancelled {
            inner.resolved.insert(
                *index,
                Resolution {
                    seq,
                    result: EntryResult::Failure(TerminalError::cancelled()),
                },
            );
        }
        drop(inner);

        debug!(entries = ?cancelled, "Cancelled pending entries");
        self.notify.notify_waiters();
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    pub fn close_input(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.input, InputState::Open) {
            inner.input = InputState::Closed;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Records a fatal failure of the transport. The first failure wins.
    pub fn fail(&self, error: CoreError) {
        let mut inner = self.inner.lock();
        if !matches!(inner.input, InputState::Failed(_)) {
            inner.input = InputState::Failed(error);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn input_state(&self) -> InputState {
        self.inner.lock().input.clone()
    }

    pub fn lookup(&self, index: EntryIndex) -> Lookup {
        let inner = self.inner.lock();
        if let Some(resolution) = inner.resolved.get(&index) {
            Lookup::Resolved(resolution.clone())
        } else if inner.completions.contains(&index) {
            Lookup::AwaitingCompletion
        } else if inner.acks.contains(&index) {
            Lookup::AwaitingAck
        } else if inner.acked.contains(&index) {
            Lookup::Acked
        } else {
            Lookup::Unknown
        }
    }

    /// Indexes of the entries still waiting for a completion.
    pub fn pending_completions(&self) -> Vec<EntryIndex> {
        self.inner.lock().completions.iter().copied().collect()
    }

    pub(crate) fn readiness(&self, indexes: &[EntryIndex]) -> Readiness {
        let inner = self.inner.lock();
        let resolved: Vec<_> = indexes
            .iter()
            .filter_map(|idx| inner.resolved.get(idx).map(|r| (*idx, r.clone())))
            .collect();
        if !resolved.is_empty() {
            return Readiness::Resolved(resolved);
        }
        match &inner.input {
            InputState::Open => Readiness::Waiting,
            InputState::Closed => Readiness::InputClosed,
            InputState::Failed(err) => Readiness::Failed(err.clone()),
        }
    }

    /// Returns true once every index is acked, false if the input stream is closed before.
    pub(crate) fn ack_readiness(&self, index: EntryIndex) -> Result<Option<bool>, CoreError> {
        let inner = self.inner.lock();
        if !inner.acks.contains(&index) {
            return Ok(Some(true));
        }
        match &inner.input {
            InputState::Open => Ok(None),
            InputState::Closed => Ok(Some(false)),
            InputState::Failed(err) => Err(err.clone()),
        }
    }

    /// Future resolving at the next registry change. Enable it before checking the state to not
    /// miss a wake up.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
