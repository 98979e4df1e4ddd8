// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client-side engine running the handler of a durable invocation.
//!
//! Handler code is re-executed from the beginning on every attempt. Each operation it issues
//! through the [`Context`] is journaled: on a later attempt the journal prefix shipped by the
//! runtime is replayed instead of performing the operation again, and the attempt suspends
//! when it can only wait for results the runtime did not deliver yet.
//!
//! The [`Coordinator`] drives one attempt over any [`InputStream`]/[`OutputSink`] pair.

mod codec;
mod context;
mod coordinator;
mod error;
mod handle;
mod invocation;
mod journal;
pub mod logging;
mod options;
mod registry;
mod run;
mod select;
mod transport;

pub use codec::{Codec, CodecError, Json, Payload, UnstableJson};
pub use context::Context;
pub use coordinator::{AttemptOutcome, Coordinator, Handler};
pub use error::{
    CoreError, GenericError, HandlerError, InvocationErrorCode, Suspended, TerminalError, codes,
};
pub use handle::{AckHandle, AsyncHandle, DurableFuture};
pub use invocation::InvocationState;
pub use journal::{CallRequest, EntryParams, EntryResult, EntryStatus, JournalEntry};
pub use logging::ReplayFilter;
pub use options::CoreOptions;
pub use registry::{InputState, Lookup, PendingRegistry, Resolution};
pub use run::RetryPolicy;
pub use select::Selector;
pub use transport::{
    ChannelInput, ChannelOutput, FramedInput, FramedOutput, InputStream, OutputSink,
    TransportError,
};

pub use restate_sdk_protocol::{EntryIndex, EntryType};
