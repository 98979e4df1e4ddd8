// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Racing and draining sets of handles.
//!
//! The winner of every live `select` is the candidate whose completion was delivered first,
//! ties broken by index. It is recorded in a `Select` journal entry, and on replay the recorded
//! winner is returned without looking at the delivery order of the current attempt.

use std::sync::Arc;

use tracing::trace;

use restate_sdk_protocol::EntryIndex;

use crate::error::{CoreError, HandlerError};
use crate::handle::DurableFuture;
use crate::invocation::InvocationCore;
use crate::journal::EntryParams;
use crate::registry::Resolution;

pub struct Selector {
    core: Arc<InvocationCore>,
    candidates: Vec<DurableFuture>,
}

impl Selector {
    pub(crate) fn new(core: Arc<InvocationCore>, mut candidates: Vec<DurableFuture>) -> Self {
        candidates.sort_by_key(DurableFuture::index);
        candidates.dedup_by_key(|f| f.index());
        Self { core, candidates }
    }

    /// Handles not returned yet, ordered by index.
    pub fn remaining(&self) -> &[DurableFuture] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Waits for the first candidate to complete, removes it from the set and returns it.
    /// Returns `None` once the set is exhausted.
    pub async fn select(&mut self) -> Result<Option<DurableFuture>, HandlerError> {
        if self.candidates.is_empty() {
            return Ok(None);
        }
        let indexes: Vec<EntryIndex> = self.candidates.iter().map(DurableFuture::index).collect();

        let winner = if self.core.is_replaying() {
            self.replay_winner(indexes)?
        } else {
            let (winner, resolution) = self.live_winner(&indexes).await?;
            self.core.issue_or_replay(
                EntryParams::Select {
                    candidates: indexes,
                    winner,
                },
                None,
            )?;
            if let Some(future) = self.find(winner) {
                future.handle().set_resolution(resolution);
            }
            winner
        };

        trace!(restate.journal.index = winner, "Selected winner");
        let position = self
            .candidates
            .iter()
            .position(|f| f.index() == winner)
            .ok_or_else(|| {
                self.core.fail(CoreError::ProtocolViolation(format!(
                    "select winner {winner} is not a candidate"
                )))
            })?;
        Ok(Some(self.candidates.remove(position)))
    }

    fn find(&self, index: EntryIndex) -> Option<&DurableFuture> {
        self.candidates.iter().find(|f| f.index() == index)
    }

    fn replay_winner(&self, indexes: Vec<EntryIndex>) -> Result<EntryIndex, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::Select {
                candidates: indexes,
                winner: 0,
            },
            None,
        )?;
        match issued.recorded {
            Some(EntryParams::Select { winner, .. }) => Ok(winner),
            _ => Err(self.core.fail(CoreError::ProtocolViolation(
                "select issued as new entry while replaying".to_owned(),
            ))),
        }
    }

    async fn live_winner(
        &self,
        indexes: &[EntryIndex],
    ) -> Result<(EntryIndex, Resolution), HandlerError> {
        let mut resolved: Vec<(EntryIndex, Resolution)> = self
            .candidates
            .iter()
            .filter_map(|f| f.handle().peek().map(|r| (f.index(), r)))
            .collect();
        if resolved.is_empty() {
            resolved = self.core.wait_any(indexes).await?;
        }
        resolved
            .into_iter()
            .min_by_key(|(index, resolution)| (resolution.seq, *index))
            .ok_or_else(|| HandlerError::retryable("nothing resolved"))
    }
}

/// Waits for every handle, returning them in completion order.
pub(crate) async fn wait_all(
    core: Arc<InvocationCore>,
    handles: Vec<DurableFuture>,
) -> Result<Vec<DurableFuture>, HandlerError> {
    let mut selector = Selector::new(core, handles);
    let mut completed = Vec::with_capacity(selector.remaining().len());
    while let Some(future) = selector.select().await? {
        completed.push(future);
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use restate_sdk_protocol::{EntryType, Message, proto};
    use restate_test_util::{assert, assert_eq, let_assert};
    use test_log::test;

    use crate::handle::AsyncHandle;
    use crate::invocation::tests::test_core;
    use crate::journal::{EntryResult, JournalEntry};

    fn awakeable(core: &Arc<InvocationCore>) -> DurableFuture {
        let issued = core.issue_or_replay(EntryParams::Awakeable, None).unwrap();
        DurableFuture::from_handle(AsyncHandle::new(
            core.clone(),
            issued.index,
            EntryType::Awakeable,
            issued.result,
        ))
        .unwrap()
    }

    fn complete(core: &InvocationCore, index: EntryIndex) {
        core.handle_inbound(Message::new_completion(
            index,
            proto::entry_result::Result::Value(Bytes::from(index.to_string())),
        ))
        .unwrap();
    }

    #[test(tokio::test)]
    async fn delivery_order_decides() {
        let (core, mut rx) = test_core(vec![], vec![], true);
        let core = Arc::new(core);
        let a = awakeable(&core);
        let b = awakeable(&core);

        complete(&core, 2);
        complete(&core, 1);

        let mut selector = Selector::new(core.clone(), vec![a, b]);
        let first = selector.select().await.unwrap().unwrap();
        assert_eq!(first.index(), 2);
        let second = selector.select().await.unwrap().unwrap();
        assert_eq!(second.index(), 1);
        assert!(selector.select().await.unwrap().is_none());

        let mut selects = vec![];
        while let Ok(msg) = rx.try_recv() {
            if let Message::SelectEntry(entry) = msg {
                selects.push((entry.candidates, entry.winner));
            }
        }
        assert_eq!(selects, vec![(vec![1, 2], 2), (vec![1], 1)]);
    }

    #[test(tokio::test)]
    async fn replay_uses_recorded_winner() {
        let prefix = vec![
            JournalEntry {
                index: 1,
                params: EntryParams::Awakeable,
                result: Some(EntryResult::Value(Bytes::from_static(b"1"))),
            },
            JournalEntry {
                index: 2,
                params: EntryParams::Awakeable,
                result: None,
            },
            JournalEntry {
                index: 3,
                params: EntryParams::Select {
                    candidates: vec![1, 2],
                    winner: 2,
                },
                result: None,
            },
        ];
        let (core, _rx) = test_core(prefix, vec![], true);
        let core = Arc::new(core);
        let a = awakeable(&core);
        let b = awakeable(&core);
        assert!(a.handle().is_resolved());

        complete(&core, 2);
        let mut selector = Selector::new(core.clone(), vec![a, b]);
        let winner = selector.select().await.unwrap().unwrap();
        assert_eq!(winner.index(), 2);
        assert_eq!(winner.raw().await.unwrap(), Some(Bytes::from_static(b"2")));
    }

    #[test(tokio::test)]
    async fn empty_set() {
        let (core, mut rx) = test_core(vec![], vec![], true);
        let mut selector = Selector::new(Arc::new(core), vec![]);
        assert!(selector.select().await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test(tokio::test)]
    async fn cancellation_resolves_the_whole_batch() {
        let (core, _rx) = test_core(vec![], vec![], true);
        let core = Arc::new(core);
        let handles = vec![awakeable(&core), awakeable(&core), awakeable(&core)];

        core.handle_inbound(Message::new_cancel_signal()).unwrap();

        let completed = wait_all(core.clone(), handles).await.unwrap();
        assert_eq!(
            completed.iter().map(DurableFuture::index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for future in completed {
            let_assert!(Err(HandlerError::Terminal(failure)) = future.done().await);
            assert!(failure.is_cancellation());
        }
    }
}
