// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Payload codecs.
//!
//! The engine treats every payload as opaque bytes. A [`Payload`] remembers whether the codec
//! producing it is stable, i.e. whether encoding the same value twice yields the same bytes.
//! Replay compares payload bytes only when they are stable.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("cannot decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

pub trait Codec {
    /// Whether encoding the same value always produces the same bytes.
    const STABLE: bool;

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError>;

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
///
/// Output is stable as long as the encoded types serialize their fields in a fixed order, which
/// holds for structs and ordered maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Codec for Json {
    const STABLE: bool = true;

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// JSON codec for types whose serialized form is not deterministic, e.g. hash maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnstableJson;

impl Codec for UnstableJson {
    const STABLE: bool = false;

    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
        Json::encode(value)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        Json::decode(bytes)
    }
}

/// Opaque bytes plus the stability flag of the codec which produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    bytes: Bytes,
    stable: bool,
}

impl Payload {
    pub fn stable(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            stable: true,
        }
    }

    pub fn unstable(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            stable: false,
        }
    }

    pub fn encode<C: Codec, T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            bytes: C::encode(value)?,
            stable: C::STABLE,
        })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    /// Two payloads match for replay if either side is unstable or the bytes are equal.
    pub fn replay_matches(&self, other: &Payload) -> bool {
        !self.stable || !other.stable || self.bytes == other.bytes
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::stable(Bytes::new())
    }
}
