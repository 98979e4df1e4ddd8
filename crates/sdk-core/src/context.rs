// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The handler-facing API.
//!
//! Every operation goes through the journal: it is either replayed from the prefix shipped by
//! the runtime or recorded as a new entry.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::FutureExt;
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;

use restate_sdk_protocol::{EntryIndex, EntryType, proto};

use crate::codec::{Codec, Json, Payload};
use crate::error::{CoreError, HandlerError, TerminalError};
use crate::handle::{AckHandle, AsyncHandle, DurableFuture};
use crate::invocation::{InvocationCore, InvocationState, Issued};
use crate::journal::{CallRequest, EntryParams};
use crate::run::{RetryPolicy, RunRegistration};
use crate::select::{self, Selector};

const AWAKEABLE_ID_PREFIX: &str = "prom_1";

/// Context of one invocation attempt, passed to the handler.
///
/// Cheap to clone. All the clones refer to the same attempt and must be used from one task at
/// a time.
#[derive(Clone)]
pub struct Context {
    core: Arc<InvocationCore>,
}

impl Context {
    pub(crate) fn new(core: Arc<InvocationCore>) -> Self {
        Self { core }
    }

    // --- Request metadata

    pub fn invocation_id(&self) -> &str {
        &self.core.metadata().debug_id
    }

    pub fn raw_invocation_id(&self) -> &Bytes {
        &self.core.metadata().id
    }

    /// Key of the virtual object or workflow, if any.
    pub fn key(&self) -> Option<&str> {
        self.core.metadata().key.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.core.metadata().headers
    }

    pub fn is_replaying(&self) -> bool {
        self.core.is_replaying()
    }

    pub fn state(&self) -> InvocationState {
        self.core.state()
    }

    fn completable(
        &self,
        issued: Issued,
        entry_type: EntryType,
    ) -> Result<DurableFuture, HandlerError> {
        DurableFuture::from_handle(AsyncHandle::new(
            self.core.clone(),
            issued.index,
            entry_type,
            issued.result,
        ))
        .map_err(|err| self.core.fail(err))
    }

    fn ackable(&self, issued: Issued) -> AckHandle {
        AckHandle::new(self.core.clone(), issued.index, issued.recorded.is_some())
    }

    // --- State

    /// Reads a state entry. Completed locally when the value is known from the start message.
    pub fn get_state(&self, key: &str) -> Result<DurableFuture, HandlerError> {
        let key = Bytes::copy_from_slice(key.as_bytes());
        let local = self.core.eager_get_state(&key);
        let issued = self
            .core
            .issue_or_replay(EntryParams::GetState { key }, local)?;
        self.completable(issued, EntryType::GetState)
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<Bytes>, HandlerError> {
        self.get_state(key)?.raw().await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HandlerError> {
        match self.get_raw(key).await? {
            Some(bytes) => Ok(Some(Json::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_raw(&self, key: &str, value: Payload) -> Result<AckHandle, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::SetState {
                key: Bytes::copy_from_slice(key.as_bytes()),
                value,
            },
            None,
        )?;
        Ok(self.ackable(issued))
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<AckHandle, HandlerError> {
        self.set_raw(key, Payload::encode::<Json, _>(value)?)
    }

    pub fn clear(&self, key: &str) -> Result<AckHandle, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::ClearState {
                key: Bytes::copy_from_slice(key.as_bytes()),
            },
            None,
        )?;
        Ok(self.ackable(issued))
    }

    pub fn clear_all(&self) -> Result<AckHandle, HandlerError> {
        let issued = self
            .core
            .issue_or_replay(EntryParams::ClearAllState, None)?;
        Ok(self.ackable(issued))
    }

    /// Lists the keys holding a value. Completed locally when the start message carried the
    /// whole state.
    pub fn state_keys(&self) -> Result<DurableFuture, HandlerError> {
        let local = self.core.eager_state_keys();
        let issued = self
            .core
            .issue_or_replay(EntryParams::GetStateKeys, local)?;
        self.completable(issued, EntryType::GetStateKeys)
    }

    pub async fn keys(&self) -> Result<Vec<String>, HandlerError> {
        let Some(raw) = self.state_keys()?.raw().await? else {
            return Ok(vec![]);
        };
        let state_keys = proto::StateKeys::decode_from(raw).map_err(|err| {
            self.core.fail(CoreError::ProtocolViolation(format!(
                "cannot decode state keys: {err}"
            )))
        })?;
        Ok(state_keys
            .keys
            .iter()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .collect())
    }

    // --- Timers

    pub fn sleep(&self, duration: Duration) -> Result<DurableFuture, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::Sleep {
                wake_up_time: epoch_millis_after(duration),
            },
            None,
        )?;
        self.completable(issued, EntryType::Sleep)
    }

    // --- Calls

    pub fn call(&self, request: CallRequest) -> Result<DurableFuture, HandlerError> {
        let issued = self
            .core
            .issue_or_replay(EntryParams::Call(request), None)?;
        self.completable(issued, EntryType::Call)
    }

    /// One way call, optionally delayed. The returned handle tracks the acknowledgement only.
    pub fn send(
        &self,
        request: CallRequest,
        delay: Option<Duration>,
    ) -> Result<AckHandle, HandlerError> {
        let invoke_time = delay.map(epoch_millis_after).unwrap_or_default();
        let issued = self.core.issue_or_replay(
            EntryParams::Send {
                request,
                invoke_time,
            },
            None,
        )?;
        Ok(self.ackable(issued))
    }

    // --- Awakeables

    /// Creates an awakeable. The returned id can be handed to an external system, which then
    /// completes the awakeable through the runtime.
    pub fn awakeable(&self) -> Result<(String, DurableFuture), HandlerError> {
        let issued = self.core.issue_or_replay(EntryParams::Awakeable, None)?;
        let id = awakeable_id(&self.core.metadata().id, issued.index);
        Ok((id, self.completable(issued, EntryType::Awakeable)?))
    }

    pub fn resolve_awakeable(&self, id: &str, value: Payload) -> Result<AckHandle, HandlerError> {
        self.complete_awakeable(id, Ok(value))
    }

    pub fn reject_awakeable(
        &self,
        id: &str,
        failure: TerminalError,
    ) -> Result<AckHandle, HandlerError> {
        self.complete_awakeable(id, Err(failure))
    }

    fn complete_awakeable(
        &self,
        id: &str,
        completion: Result<Payload, TerminalError>,
    ) -> Result<AckHandle, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::CompleteAwakeable {
                id: id.to_owned(),
                completion,
            },
            None,
        )?;
        Ok(self.ackable(issued))
    }

    // --- Durable promises

    pub fn promise(&self, key: &str) -> Result<DurableFuture, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::GetPromise {
                key: key.to_owned(),
            },
            None,
        )?;
        self.completable(issued, EntryType::GetPromise)
    }

    /// Reads the promise without waiting for it. Completes with empty if it is not resolved.
    pub fn peek_promise(&self, key: &str) -> Result<DurableFuture, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::PeekPromise {
                key: key.to_owned(),
            },
            None,
        )?;
        self.completable(issued, EntryType::PeekPromise)
    }

    /// Resolves the promise. The returned handle fails if the promise was already completed.
    pub fn resolve_promise(&self, key: &str, value: Payload) -> Result<DurableFuture, HandlerError> {
        self.complete_promise(key, Ok(value))
    }

    pub fn reject_promise(
        &self,
        key: &str,
        failure: TerminalError,
    ) -> Result<DurableFuture, HandlerError> {
        self.complete_promise(key, Err(failure))
    }

    fn complete_promise(
        &self,
        key: &str,
        completion: Result<Payload, TerminalError>,
    ) -> Result<DurableFuture, HandlerError> {
        let issued = self.core.issue_or_replay(
            EntryParams::CompletePromise {
                key: key.to_owned(),
                completion,
            },
            None,
        )?;
        self.completable(issued, EntryType::CompletePromise)
    }

    // --- Side effects

    /// Executes `closure` once and journals its result. On replay the recorded result is
    /// returned and the closure is dropped without running.
    ///
    /// The closure runs the next time the handler waits on any handle. A retryable error is
    /// reported to the runtime, which retries the closure with its default policy.
    pub fn run<T, F, Fut>(&self, name: &str, closure: F) -> Result<DurableFuture, HandlerError>
    where
        T: Serialize + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        self.run_with_retry(name, RetryPolicy::default(), closure)
    }

    pub fn run_with_retry<T, F, Fut>(
        &self,
        name: &str,
        retry_policy: RetryPolicy,
        closure: F,
    ) -> Result<DurableFuture, HandlerError>
    where
        T: Serialize + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        let issued = self.core.issue_or_replay(
            EntryParams::Run {
                name: name.to_owned(),
            },
            None,
        )?;

        if issued.result.is_none() {
            self.core.runs().register(
                issued.index,
                RunRegistration {
                    name: name.to_owned(),
                    retry_policy,
                    closure: Box::new(move || {
                        async move {
                            let value = closure().await?;
                            Ok::<_, HandlerError>(Json::encode(&value)?)
                        }
                        .boxed()
                    }),
                },
            );
        }
        self.completable(issued, EntryType::Run)
    }

    // --- Selection

    pub fn select(&self, futures: Vec<DurableFuture>) -> Selector {
        Selector::new(self.core.clone(), futures)
    }

    /// Waits for every future, returning them in completion order.
    pub async fn wait_all(
        &self,
        futures: Vec<DurableFuture>,
    ) -> Result<Vec<DurableFuture>, HandlerError> {
        select::wait_all(self.core.clone(), futures).await
    }

    // --- Deterministic randomness

    /// Random number from a generator seeded by the runtime. The sequence is the same on every
    /// attempt, as long as the handler asks for it in the same order.
    pub fn random_u64(&self) -> u64 {
        self.core.with_rng(|rng| rng.next_u64())
    }

    pub fn random_uuid(&self) -> uuid::Uuid {
        let mut bytes = [0u8; 16];
        self.core.with_rng(|rng| rng.fill_bytes(&mut bytes));
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

fn epoch_millis_after(duration: Duration) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from((now + duration).as_millis()).unwrap_or(u64::MAX)
}

fn awakeable_id(invocation_id: &Bytes, index: EntryIndex) -> String {
    let mut raw = Vec::with_capacity(invocation_id.len() + 4);
    raw.extend_from_slice(invocation_id);
    raw.extend_from_slice(&index.to_be_bytes());
    format!("{AWAKEABLE_ID_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use restate_sdk_protocol::Message;
    use restate_test_util::{assert, assert_eq, let_assert};
    use test_log::test;

    use crate::invocation::tests::test_core;
    use crate::journal::{EntryResult, JournalEntry};

    fn context(prefix: Vec<JournalEntry>) -> (Context, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (core, rx) = test_core(prefix, vec![(Bytes::from_static(b"count"), Bytes::from_static(b"3"))], true);
        (Context::new(Arc::new(core)), rx)
    }

    #[test]
    fn awakeable_id_format() {
        assert_eq!(
            awakeable_id(&Bytes::from_static(b"inv"), 1),
            format!("prom_1{}", URL_SAFE_NO_PAD.encode(b"inv\0\0\0\x01"))
        );
    }

    #[test(tokio::test)]
    async fn eager_get_state() {
        let (ctx, mut rx) = context(vec![]);

        assert_eq!(ctx.get::<u32>("count").await.unwrap(), Some(3));

        let_assert!(Ok(Message::GetStateEntry(entry)) = rx.try_recv());
        assert_eq!(
            entry.result,
            Some(proto::entry_result::Result::Value(Bytes::from_static(b"3")))
        );

        ctx.set("count", &4).unwrap();
        assert_eq!(ctx.get::<u32>("count").await.unwrap(), Some(4));
    }

    #[test(tokio::test)]
    async fn state_keys_from_complete_state() {
        let (core, mut rx) = test_core(
            vec![],
            vec![
                (Bytes::from_static(b"b"), Bytes::from_static(b"2")),
                (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
            ],
            false,
        );
        let ctx = Context::new(Arc::new(core));
        assert_eq!(ctx.keys().await.unwrap(), vec!["a", "b"]);
        let_assert!(Ok(Message::GetStateKeysEntry(entry)) = rx.try_recv());
        assert!(entry.result.is_some());

        ctx.set("c", &3).unwrap();
        ctx.clear("a").unwrap();
        assert_eq!(ctx.keys().await.unwrap(), vec!["b", "c"]);

        ctx.clear_all().unwrap();
        assert!(ctx.keys().await.unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn state_keys_from_partial_state() {
        let (ctx, mut rx) = context(vec![]);
        let future = ctx.state_keys().unwrap();
        let_assert!(Ok(Message::GetStateKeysEntry(entry)) = rx.try_recv());
        assert_eq!(entry.result, None);

        let keys = proto::StateKeys {
            keys: vec![Bytes::from_static(b"count"), Bytes::from_static(b"other")],
        };
        ctx.core
            .handle_inbound(Message::new_completion(
                future.index(),
                proto::entry_result::Result::Value(keys.encode_to_bytes()),
            ))
            .unwrap();
        let_assert!(Ok(Some(raw)) = future.raw().await);
        assert_eq!(proto::StateKeys::decode_from(raw).unwrap(), keys);
    }

    #[test(tokio::test)]
    async fn run_is_skipped_on_replay() {
        let (ctx, mut rx) = context(vec![JournalEntry {
            index: 1,
            params: EntryParams::Run {
                name: "side-effect".to_owned(),
            },
            result: Some(EntryResult::Value(Bytes::from_static(b"7"))),
        }]);
        let executed = Arc::new(AtomicUsize::new(0));

        let counter = executed.clone();
        let future = ctx
            .run("side-effect", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .unwrap();

        assert_eq!(future.value::<u32>().await.unwrap(), 7);
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test(tokio::test)]
    async fn run_proposes_its_result() {
        let (ctx, mut rx) = context(vec![]);
        let future = ctx.run("side-effect", || async { Ok("done") }).unwrap();
        let_assert!(Ok(Message::RunEntry(_)) = rx.try_recv());

        let waiter = tokio::spawn(async move { future.value::<String>().await });
        tokio::task::yield_now().await;

        let_assert!(Ok(Message::ProposeRunCompletion(proposal)) = rx.try_recv());
        assert_eq!(proposal.entry_index, 1);
        assert_eq!(
            proposal.result,
            Some(proto::propose_run_completion_message::Result::Value(
                Bytes::from_static(b"\"done\"")
            ))
        );

        ctx.core
            .handle_inbound(Message::new_completion(
                1,
                proto::entry_result::Result::Value(Bytes::from_static(b"\"done\"")),
            ))
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[test(tokio::test)]
    async fn retryable_run_failure_carries_the_policy() {
        let (ctx, mut rx) = context(vec![]);
        let future = ctx
            .run_with_retry(
                "flaky",
                RetryPolicy::default().with_max_attempts(2),
                || async { Err::<(), _>(HandlerError::retryable("try again")) },
            )
            .unwrap();
        let _ = rx.try_recv();

        ctx.core.registry().close_input();
        assert!(future.done().await.unwrap_err().is_suspended());

        let_assert!(Ok(Message::ProposeRunCompletion(proposal)) = rx.try_recv());
        let_assert!(
            Some(proto::propose_run_completion_message::Result::RetryableFailure(failure)) =
                proposal.result
        );
        assert_eq!(failure.message, "try again");
        assert_eq!(proposal.retry_policy.unwrap().max_attempts, Some(2));
    }

    #[test]
    fn random_is_seeded() {
        let (first, _rx1) = context(vec![]);
        let (second, _rx2) = context(vec![]);

        assert_eq!(first.random_u64(), second.random_u64());
        assert_eq!(first.random_uuid(), second.random_uuid());
        assert!(first.random_u64() != first.random_u64());
    }
}
