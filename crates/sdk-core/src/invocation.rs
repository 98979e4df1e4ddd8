// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use restate_sdk_protocol::{EntryIndex, EntryType, Message, MessageType, proto};

use crate::error::{CoreError, HandlerError, Suspended};
use crate::error_it;
use crate::journal::{Dispatch, EntryParams, EntryResult, Journal, JournalEntry, expects_completion};
use crate::options::CoreOptions;
use crate::registry::{PendingRegistry, Readiness, Resolution};
use crate::run::RunExecutor;

/// Lifecycle state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Replaying,
    Processing,
    Suspended,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub(crate) struct InvocationMetadata {
    pub(crate) id: Bytes,
    pub(crate) debug_id: String,
    pub(crate) key: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) random_seed: u64,
}

/// Entry created or replayed by [`InvocationCore::issue_or_replay`].
#[derive(Debug)]
pub(crate) struct Issued {
    pub(crate) index: EntryIndex,
    pub(crate) result: Option<EntryResult>,
    /// Parameters recorded in the journal, set when the entry was replayed.
    pub(crate) recorded: Option<EntryParams>,
}

/// Local view of the invocation state, used to complete `GetState` without a round trip.
///
/// `None` values are keys known to be absent.
#[derive(Debug, Default)]
struct EagerState {
    enabled: bool,
    complete: bool,
    values: HashMap<Bytes, Option<Bytes>>,
}

impl EagerState {
    fn get(&self, key: &Bytes) -> Option<EntryResult> {
        if !self.enabled {
            return None;
        }
        match self.values.get(key) {
            Some(Some(value)) => Some(EntryResult::Value(value.clone())),
            Some(None) => Some(EntryResult::Empty),
            None if self.complete => Some(EntryResult::Empty),
            None => None,
        }
    }

    /// Every key with a value, sorted. Only known when the state map is complete.
    fn keys(&self) -> Option<EntryResult> {
        if !self.enabled || !self.complete {
            return None;
        }
        let mut keys: Vec<Bytes> = self
            .values
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|_| key.clone()))
            .collect();
        keys.sort();
        Some(EntryResult::Value(
            proto::StateKeys { keys }.encode_to_bytes(),
        ))
    }

    fn apply(&mut self, params: &EntryParams) {
        if !self.enabled {
            return;
        }
        match params {
            EntryParams::SetState { key, value } => {
                self.values.insert(key.clone(), Some(value.bytes().clone()));
            }
            EntryParams::ClearState { key } => {
                self.values.insert(key.clone(), None);
            }
            EntryParams::ClearAllState => {
                self.values.clear();
                self.complete = true;
            }
            _ => {}
        }
    }
}

/// Rejects overlapping use of the invocation from more than one task.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State of one invocation attempt, shared by the handler context, the handles and the
/// reader and writer tasks of the coordinator.
pub(crate) struct InvocationCore {
    metadata: InvocationMetadata,
    journal: Mutex<Journal>,
    registry: PendingRegistry,
    runs: RunExecutor,
    eager_state: Mutex<EagerState>,
    rng: Mutex<StdRng>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    busy: AtomicBool,
    fatal: Mutex<Option<CoreError>>,
    suspended: Mutex<Option<Vec<EntryIndex>>>,
    completed: AtomicBool,
}

impl InvocationCore {
    pub(crate) fn new(
        metadata: InvocationMetadata,
        prefix: Vec<JournalEntry>,
        state: impl IntoIterator<Item = (Bytes, Bytes)>,
        partial_state: bool,
        options: &CoreOptions,
        out_tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let registry = PendingRegistry::new();
        for entry in &prefix {
            if entry.result.is_none() && expects_completion(entry.entry_type()) {
                registry.register_completion(entry.index);
            }
        }

        let eager_state = if options.disable_eager_state() {
            EagerState::default()
        } else {
            EagerState {
                enabled: true,
                complete: !partial_state,
                values: state.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            }
        };

        Self {
            rng: Mutex::new(StdRng::seed_from_u64(metadata.random_seed)),
            metadata,
            journal: Mutex::new(Journal::new(prefix)),
            registry,
            runs: RunExecutor::default(),
            eager_state: Mutex::new(eager_state),
            out_tx: Mutex::new(Some(out_tx)),
            busy: AtomicBool::new(false),
            fatal: Mutex::new(None),
            suspended: Mutex::new(None),
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn metadata(&self) -> &InvocationMetadata {
        &self.metadata
    }

    pub(crate) fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    pub(crate) fn runs(&self) -> &RunExecutor {
        &self.runs
    }

    pub(crate) fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.rng.lock())
    }

    pub(crate) fn state(&self) -> InvocationState {
        if self.fatal.lock().is_some() {
            InvocationState::Failed
        } else if self.suspended.lock().is_some() {
            InvocationState::Suspended
        } else if self.completed.load(Ordering::Acquire) {
            InvocationState::Completed
        } else if self.journal.lock().is_replaying() {
            InvocationState::Replaying
        } else {
            InvocationState::Processing
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.journal.lock().is_replaying()
    }

    pub(crate) fn fatal_error(&self) -> Option<CoreError> {
        self.fatal.lock().clone()
    }

    pub(crate) fn suspended_on(&self) -> Option<Vec<EntryIndex>> {
        self.suspended.lock().clone()
    }

    pub(crate) fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Records a fatal error. The first one is kept and logged.
    pub(crate) fn fail(&self, err: CoreError) -> HandlerError {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            error_it!(
                err,
                restate.invocation.id = %self.metadata.debug_id,
                "Invocation attempt failed"
            );
            *fatal = Some(err.clone());
        }
        drop(fatal);
        // wakes up a waiter blocked on another task
        self.registry.fail(err.clone());
        HandlerError::Core(err)
    }

    fn suspend(&self, entry_indexes: Vec<EntryIndex>) -> HandlerError {
        let mut suspended = self.suspended.lock();
        let entry_indexes = suspended.get_or_insert(entry_indexes).clone();
        HandlerError::Suspended(Suspended { entry_indexes })
    }

    fn enter(&self) -> Result<BusyGuard<'_>, HandlerError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.fail(CoreError::ConcurrentUse));
        }
        Ok(BusyGuard(&self.busy))
    }

    /// Fails fast once the attempt cannot make progress anymore.
    fn check_live(&self) -> Result<(), HandlerError> {
        if let Some(err) = self.fatal.lock().clone() {
            return Err(HandlerError::Core(err));
        }
        if let Some(entry_indexes) = self.suspended.lock().clone() {
            return Err(HandlerError::Suspended(Suspended { entry_indexes }));
        }
        Ok(())
    }

    pub(crate) fn send(&self, msg: Message) -> Result<(), CoreError> {
        trace!(restate.protocol.message = ?msg, "Sending message");
        let out_tx = self.out_tx.lock();
        let Some(tx) = out_tx.as_ref() else {
            return Err(CoreError::Transport("output stream already closed".to_owned()));
        };
        tx.send(msg)
            .map_err(|_| CoreError::Transport("output stream closed".to_owned()))
    }

    /// Drops the sending side of the output channel. The writer task closes the transport once
    /// every buffered message is written.
    pub(crate) fn close_output(&self) {
        self.out_tx.lock().take();
    }

    /// Replays the next prefix entry, or creates and transmits a new entry.
    ///
    /// New entries are registered in the pending registry before being transmitted, so a
    /// completion can never arrive for an unknown entry. `local_result` completes a new entry
    /// without a round trip. It is ignored when replaying.
    pub(crate) fn issue_or_replay(
        &self,
        params: EntryParams,
        local_result: Option<EntryResult>,
    ) -> Result<Issued, HandlerError> {
        let _guard = self.enter()?;
        self.check_live()?;

        let entry_type = params.entry_type();
        let mut journal = self.journal.lock();
        let dispatch = journal
            .dispatch(&params, local_result.clone())
            .map_err(|err| self.fail(err))?;

        let issued = match dispatch {
            Dispatch::Replayed(entry) => {
                if !journal.is_replaying() {
                    debug!(
                        restate.invocation.id = %self.metadata.debug_id,
                        replayed_entries = journal.replay_len(),
                        "Replay completed"
                    );
                }
                Issued {
                    index: entry.index,
                    result: entry.result,
                    recorded: Some(entry.params),
                }
            }
            Dispatch::New(index) => {
                match entry_type {
                    EntryType::Input | EntryType::Output | EntryType::Select => {}
                    ty if MessageType::from(ty).requires_ack() => self.registry.register_ack(index),
                    ty if local_result.is_none() && expects_completion(ty) => {
                        self.registry.register_completion(index)
                    }
                    _ => {}
                }
                self.eager_state.lock().apply(&params);
                // Sending under the journal lock keeps the transmission order equal to the
                // index order.
                self.send(params.into_message(local_result.clone()))
                    .map_err(|err| self.fail(err))?;
                Issued {
                    index,
                    result: local_result,
                    recorded: None,
                }
            }
        };
        drop(journal);

        if let Some(recorded) = &issued.recorded {
            self.eager_state.lock().apply(recorded);
        }
        Ok(issued)
    }

    pub(crate) fn eager_get_state(&self, key: &Bytes) -> Option<EntryResult> {
        self.eager_state.lock().get(key)
    }

    pub(crate) fn eager_state_keys(&self) -> Option<EntryResult> {
        self.eager_state.lock().keys()
    }

    /// Waits until at least one of the given entries is resolved, and returns every resolved
    /// entry of the set.
    ///
    /// Registered run closures are executed while waiting. When the input stream is closed
    /// before anything resolves, the attempt suspends.
    pub(crate) async fn wait_any(
        &self,
        indexes: &[EntryIndex],
    ) -> Result<Vec<(EntryIndex, Resolution)>, HandlerError> {
        let _guard = self.enter()?;
        loop {
            self.check_live()?;

            let notified = self.registry.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.registry.readiness(indexes) {
                Readiness::Resolved(resolved) => return Ok(resolved),
                Readiness::Waiting | Readiness::InputClosed if self.runs.has_pending() => {
                    self.runs
                        .execute_pending(self)
                        .await
                        .map_err(|err| self.fail(err))?;
                }
                Readiness::Waiting => notified.await,
                Readiness::InputClosed => {
                    debug!(
                        restate.invocation.id = %self.metadata.debug_id,
                        entries = ?indexes,
                        "Input closed while waiting for completions"
                    );
                    return Err(self.suspend(indexes.to_vec()));
                }
                Readiness::Failed(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Waits until the entry is durably stored by the runtime.
    pub(crate) async fn wait_ack(&self, index: EntryIndex) -> Result<(), HandlerError> {
        let _guard = self.enter()?;
        loop {
            self.check_live()?;

            let notified = self.registry.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.registry.ack_readiness(index) {
                Ok(Some(true)) => return Ok(()),
                Ok(Some(false)) => return Err(self.suspend(vec![index])),
                Ok(None) => notified.await,
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    /// Applies a message received from the runtime after the start handshake.
    pub(crate) fn handle_inbound(&self, msg: Message) -> Result<(), CoreError> {
        trace!(restate.protocol.message = ?msg, "Received message");
        match msg {
            Message::Completion(proto::CompletionMessage {
                entry_index,
                result,
            }) => {
                let result = result.map(EntryResult::from).unwrap_or(EntryResult::Empty);
                self.registry.resolve(entry_index, result);
                Ok(())
            }
            Message::EntryAck(proto::EntryAckMessage { entry_index }) => {
                self.registry.ack(entry_index);
                Ok(())
            }
            Message::CancelSignal(_) => {
                info!(
                    restate.invocation.id = %self.metadata.debug_id,
                    "Received cancellation signal"
                );
                self.registry.cancel();
                Ok(())
            }
            other => Err(CoreError::UnexpectedMessage {
                expected: "Completion, EntryAck or CancelSignal",
                actual: other.ty(),
            }),
        }
    }
}
