// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This crate contains the message model spoken between a handler process and the runtime
//! orchestrating it, and the framing codec to move those messages over a byte stream.
//!
//! Messages are either *control* messages (start, completion, ack, cancellation, end, ...)
//! or *entries*, the durable journal records created by handler operations.

pub mod message;
pub mod proto;

pub use message::{
    Decoder, Encoder, EncodingError, EntryType, Message, MessageHeader, MessageType,
    UnknownMessageType,
};

/// Index of a journal entry. The input entry has index 0.
pub type EntryIndex = u32;
