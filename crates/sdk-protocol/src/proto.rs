// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Protobuf bodies of the protocol messages.
//!
//! Every entry carrying a result uses the shared [`entry_result::Result`] oneof on tags
//! `13..=15`. The presence of the oneof marks the entry as completed.

use prost::bytes::Bytes;

// --- Common

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Failure {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

pub mod entry_result {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "13")]
        Empty(super::Empty),
        #[prost(bytes = "bytes", tag = "14")]
        Value(Bytes),
        #[prost(message, tag = "15")]
        Failure(super::Failure),
    }
}

// --- Control messages

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub id: Bytes,
    #[prost(string, tag = "2")]
    pub debug_id: String,
    /// Number of journal entries the runtime replays after this message, input entry included.
    #[prost(uint32, tag = "3")]
    pub known_entries: u32,
    #[prost(message, repeated, tag = "4")]
    pub state_map: Vec<start_message::StateEntry>,
    #[prost(bool, tag = "5")]
    pub partial_state: bool,
    #[prost(string, tag = "6")]
    pub key: String,
    #[prost(uint64, tag = "7")]
    pub random_seed: u64,
}

pub mod start_message {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StateEntry {
        #[prost(bytes = "bytes", tag = "1")]
        pub key: Bytes,
        #[prost(bytes = "bytes", tag = "2")]
        pub value: Bytes,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletionMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SuspensionMessage {
    #[prost(uint32, repeated, tag = "1")]
    pub entry_indexes: Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorMessage {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub description: String,
    #[prost(uint32, optional, tag = "4")]
    pub related_entry_index: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub related_entry_type: Option<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntryAckMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct EndMessage {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CancelSignalMessage {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProposeRunCompletionMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
    #[prost(oneof = "propose_run_completion_message::Result", tags = "14, 15, 16")]
    pub result: Option<propose_run_completion_message::Result>,
    #[prost(message, optional, tag = "4")]
    pub retry_policy: Option<RetryPolicy>,
    #[prost(uint64, tag = "5")]
    pub attempt_duration_millis: u64,
}

pub mod propose_run_completion_message {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(bytes = "bytes", tag = "14")]
        Value(Bytes),
        #[prost(message, tag = "15")]
        TerminalFailure(super::Failure),
        #[prost(message, tag = "16")]
        RetryableFailure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetryPolicy {
    #[prost(uint64, tag = "1")]
    pub initial_interval_millis: u64,
    #[prost(float, tag = "2")]
    pub factor: f32,
    #[prost(uint64, tag = "3")]
    pub max_interval_millis: u64,
    #[prost(uint32, optional, tag = "4")]
    pub max_attempts: Option<u32>,
    #[prost(uint64, optional, tag = "5")]
    pub max_duration_millis: Option<u64>,
}

// --- Entries

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InputEntryMessage {
    #[prost(message, repeated, tag = "1")]
    pub headers: Vec<Header>,
    #[prost(bytes = "bytes", tag = "14")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputEntryMessage {
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClearStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ClearAllStateEntryMessage {}

/// Completed with a value holding an encoded [`StateKeys`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStateKeysEntryMessage {
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateKeys {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub keys: Vec<Bytes>,
}

impl StateKeys {
    pub fn encode_to_bytes(&self) -> Bytes {
        ::prost::Message::encode_to_vec(self).into()
    }

    pub fn decode_from(buf: impl prost::bytes::Buf) -> Result<Self, prost::DecodeError> {
        <Self as ::prost::Message>::decode(buf)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPromiseEntryMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeekPromiseEntryMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletePromiseEntryMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "complete_promise_entry_message::Completion", tags = "2, 3")]
    pub completion: Option<complete_promise_entry_message::Completion>,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

pub mod complete_promise_entry_message {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Completion {
        #[prost(bytes = "bytes", tag = "2")]
        Value(Bytes),
        #[prost(message, tag = "3")]
        Failure(super::Failure),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SleepEntryMessage {
    /// Absolute wake up time, in milliseconds since the unix epoch.
    #[prost(uint64, tag = "1")]
    pub wake_up_time: u64,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallEntryMessage {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub handler_name: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub parameter: Bytes,
    #[prost(message, repeated, tag = "4")]
    pub headers: Vec<Header>,
    #[prost(string, tag = "5")]
    pub key: String,
    #[prost(string, optional, tag = "6")]
    pub idempotency_key: Option<String>,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OneWayCallEntryMessage {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub handler_name: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub parameter: Bytes,
    /// Absolute time the call is scheduled at, in milliseconds since the unix epoch. 0 means now.
    #[prost(uint64, tag = "4")]
    pub invoke_time: u64,
    #[prost(message, repeated, tag = "5")]
    pub headers: Vec<Header>,
    #[prost(string, tag = "6")]
    pub key: String,
    #[prost(string, optional, tag = "7")]
    pub idempotency_key: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AwakeableEntryMessage {
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompleteAwakeableEntryMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RunEntryMessage {
    #[prost(string, tag = "12")]
    pub name: String,
    #[prost(oneof = "entry_result::Result", tags = "13, 14, 15")]
    pub result: Option<entry_result::Result>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SelectEntryMessage {
    /// Indexes of the entries taking part in the selection, sorted.
    #[prost(uint32, repeated, tag = "1")]
    pub candidates: Vec<u32>,
    #[prost(uint32, tag = "2")]
    pub winner: u32,
}
