// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Handles on outstanding journal entries.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;

use restate_sdk_protocol::{EntryIndex, EntryType};

use crate::codec::{Codec, Json};
use crate::error::{CoreError, HandlerError};
use crate::invocation::InvocationCore;
use crate::journal::EntryResult;
use crate::registry::{Lookup, Resolution};

/// Reference to one journal entry waiting for a completion.
///
/// The result is cached the first time it is observed, so the registry is waited on at most
/// once per handle.
pub struct AsyncHandle {
    index: EntryIndex,
    entry_type: EntryType,
    core: Arc<InvocationCore>,
    cached: OnceLock<Resolution>,
}

impl AsyncHandle {
    pub(crate) fn new(
        core: Arc<InvocationCore>,
        index: EntryIndex,
        entry_type: EntryType,
        known: Option<EntryResult>,
    ) -> Self {
        let cached = OnceLock::new();
        if let Some(result) = known {
            // results known when the entry is created precede every delivered completion
            let _ = cached.set(Resolution { seq: 0, result });
        }
        Self {
            index,
            entry_type,
            core,
            cached,
        }
    }

    pub fn index(&self) -> EntryIndex {
        self.index
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    /// Returns the resolution if it is already available, without waiting.
    pub fn peek(&self) -> Option<Resolution> {
        if let Some(resolution) = self.cached.get() {
            return Some(resolution.clone());
        }
        match self.core.registry().lookup(self.index) {
            Lookup::Resolved(resolution) => Some(self.cached.get_or_init(|| resolution).clone()),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.peek().is_some()
    }

    /// Waits for the completion of the entry.
    pub async fn result(&self) -> Result<EntryResult, HandlerError> {
        if let Some(resolution) = self.peek() {
            return Ok(resolution.result);
        }
        let resolved = self.core.wait_any(&[self.index]).await?;
        let resolution = resolved
            .into_iter()
            .find_map(|(index, resolution)| (index == self.index).then_some(resolution))
            .ok_or_else(|| HandlerError::retryable("entry resolved without a result"))?;
        Ok(self.cached.get_or_init(|| resolution).result.clone())
    }

    pub(crate) fn set_resolution(&self, resolution: Resolution) {
        let _ = self.cached.set(resolution);
    }
}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("index", &self.index)
            .field("entry_type", &self.entry_type)
            .field("resolution", &self.cached.get())
            .finish()
    }
}

/// A completable operation issued by the handler.
///
/// Every variant wraps the same [`AsyncHandle`]; the variant tells which operation created it.
#[derive(Debug)]
pub enum DurableFuture {
    Sleep(AsyncHandle),
    Call(AsyncHandle),
    Awakeable(AsyncHandle),
    GetState(AsyncHandle),
    Promise(AsyncHandle),
    Run(AsyncHandle),
}

impl DurableFuture {
    /// Fails for entry kinds which never get a completion.
    pub(crate) fn from_handle(handle: AsyncHandle) -> Result<Self, CoreError> {
        let future = match handle.entry_type() {
            EntryType::Sleep => DurableFuture::Sleep(handle),
            EntryType::Call => DurableFuture::Call(handle),
            EntryType::Awakeable => DurableFuture::Awakeable(handle),
            EntryType::GetState | EntryType::GetStateKeys => DurableFuture::GetState(handle),
            EntryType::GetPromise | EntryType::PeekPromise | EntryType::CompletePromise => {
                DurableFuture::Promise(handle)
            }
            EntryType::Run => DurableFuture::Run(handle),
            other => {
                debug_assert!(false, "{other} entries are not completable");
                return Err(CoreError::ProtocolViolation(format!(
                    "{other} entry {} has no completion to wait for",
                    handle.index()
                )));
            }
        };
        Ok(future)
    }

    pub fn handle(&self) -> &AsyncHandle {
        match self {
            DurableFuture::Sleep(h)
            | DurableFuture::Call(h)
            | DurableFuture::Awakeable(h)
            | DurableFuture::GetState(h)
            | DurableFuture::Promise(h)
            | DurableFuture::Run(h) => h,
        }
    }

    pub fn index(&self) -> EntryIndex {
        self.handle().index()
    }

    pub async fn result(&self) -> Result<EntryResult, HandlerError> {
        self.handle().result().await
    }

    /// Raw value of the completion. Failures are returned as terminal errors, an empty
    /// completion as `None`.
    pub async fn raw(&self) -> Result<Option<Bytes>, HandlerError> {
        match self.result().await? {
            EntryResult::Empty => Ok(None),
            EntryResult::Value(value) => Ok(Some(value)),
            EntryResult::Failure(failure) => Err(HandlerError::Terminal(failure)),
        }
    }

    /// Value of the completion decoded as JSON. An empty completion decodes as `null`.
    pub async fn value<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let value = match self.raw().await? {
            Some(bytes) => Json::decode(&bytes)?,
            None => Json::decode(b"null")?,
        };
        Ok(value)
    }

    /// Waits for completion, discarding the value.
    pub async fn done(&self) -> Result<(), HandlerError> {
        self.raw().await.map(|_| ())
    }
}

/// Handle on an entry which gets acknowledged instead of completed.
pub struct AckHandle {
    index: EntryIndex,
    core: Arc<InvocationCore>,
    replayed: bool,
}

impl AckHandle {
    pub(crate) fn new(core: Arc<InvocationCore>, index: EntryIndex, replayed: bool) -> Self {
        Self {
            index,
            core,
            replayed,
        }
    }

    pub fn index(&self) -> EntryIndex {
        self.index
    }

    /// Waits until the runtime durably stored the entry. Replayed entries are stored already.
    pub async fn acked(&self) -> Result<(), HandlerError> {
        if self.replayed {
            return Ok(());
        }
        self.core.wait_ack(self.index).await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("index", &self.index)
            .field("replayed", &self.replayed)
            .finish()
    }
}
