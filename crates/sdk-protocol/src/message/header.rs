// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use super::{MessageType, MessageTypeId, UnknownMessageType};

const REQUIRES_ACK_FLAG: u16 = 0x8000;

/// Header of a protocol frame: `type (16 bits) | flags (16 bits) | length (32 bits)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    ty: MessageType,
    flags: u16,
    length: u32,
}

impl MessageHeader {
    #[inline]
    pub fn new(ty: MessageType, length: u32) -> Self {
        let flags = if ty.requires_ack() {
            REQUIRES_ACK_FLAG
        } else {
            0
        };
        Self { ty, flags, length }
    }

    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    #[inline]
    pub fn requires_ack(&self) -> bool {
        self.flags & REQUIRES_ACK_FLAG != 0
    }

    #[inline]
    pub fn frame_length(&self) -> u32 {
        self.length
    }
}

impl TryFrom<u64> for MessageHeader {
    type Error = UnknownMessageType;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        let ty_code = (value >> 48) as MessageTypeId;
        let flags = (value >> 32) as u16;
        let length = value as u32;

        Ok(Self {
            ty: MessageType::try_from(ty_code)?,
            flags,
            length,
        })
    }
}

impl From<MessageHeader> for u64 {
    fn from(value: MessageHeader) -> Self {
        (u64::from(MessageTypeId::from(value.ty)) << 48)
            | (u64::from(value.flags) << 32)
            | u64::from(value.length)
    }
}
