// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use super::*;

use std::mem;
use std::num::NonZeroUsize;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_utils::SegmentedBuf;
use tracing::warn;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodingError {
    #[error("cannot decode message type {0:?}: {1}")]
    DecodeMessage(MessageType, #[source] prost::DecodeError),
    #[error(transparent)]
    UnknownMessageType(#[from] UnknownMessageType),
    #[error("hit message size limit: {0} >= {1}")]
    MessageSizeLimit(usize, NonZeroUsize),
    #[error("message of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),
}

// --- Output message encoder

#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encodes a message to bytes, header included.
    ///
    /// Each call allocates a right-sized buffer for the message.
    pub fn encode(&mut self, msg: &Message) -> Result<Bytes, EncodingError> {
        let len = msg.encoded_len();
        let frame_len = u32::try_from(len).map_err(|_| EncodingError::FrameTooLarge(len))?;

        let mut buf = BytesMut::with_capacity(8 + len);
        buf.put_u64(MessageHeader::new(msg.ty(), frame_len).into());
        // Capacity was reserved upfront, prost can't run out of space.
        msg.encode(&mut buf)
            .map_err(|_| EncodingError::FrameTooLarge(len))?;
        Ok(buf.freeze())
    }
}

// --- Input message decoder

/// Stateful decoder to decode [`Message`]s out of a chunked byte stream.
pub struct Decoder {
    buf: SegmentedBuf<Bytes>,
    state: DecoderState,
    message_size_warning: NonZeroUsize,
    message_size_limit: NonZeroUsize,
}

impl Decoder {
    pub fn new(message_size_warning: NonZeroUsize, message_size_limit: NonZeroUsize) -> Self {
        Self {
            buf: SegmentedBuf::new(),
            state: DecoderState::WaitingHeader,
            message_size_warning,
            message_size_limit,
        }
    }

    /// Whether a partial frame is buffered.
    pub fn has_remaining(&self) -> bool {
        self.buf.has_remaining() || matches!(self.state, DecoderState::WaitingPayload(_))
    }

    /// Concatenate a new chunk in the internal buffer.
    pub fn push(&mut self, buf: Bytes) {
        self.buf.push(buf)
    }

    /// Try to consume the next message in the internal buffer.
    pub fn consume_next(&mut self) -> Result<Option<(MessageHeader, Message)>, EncodingError> {
        loop {
            let remaining = self.buf.remaining();

            if remaining < self.state.needs_bytes() {
                return Ok(None);
            }

            if let Some(res) = self.state.decode(
                &mut self.buf,
                self.message_size_warning,
                self.message_size_limit,
            )? {
                return Ok(Some(res));
            }
        }
    }
}

#[derive(Default)]
enum DecoderState {
    #[default]
    WaitingHeader,
    WaitingPayload(MessageHeader),
}

impl DecoderState {
    fn needs_bytes(&self) -> usize {
        match self {
            DecoderState::WaitingHeader => 8,
            DecoderState::WaitingPayload(h) => h.frame_length() as usize,
        }
    }

    fn decode(
        &mut self,
        mut buf: impl Buf,
        message_size_warning: NonZeroUsize,
        message_size_limit: NonZeroUsize,
    ) -> Result<Option<(MessageHeader, Message)>, EncodingError> {
        let mut res = None;

        *self = match mem::take(self) {
            DecoderState::WaitingHeader => {
                let header: MessageHeader = buf.get_u64().try_into()?;
                let message_length = header.frame_length() as usize;

                if message_length >= message_size_warning.get() {
                    warn!(
                        restate.protocol.message = ?header.message_type(),
                        "Message size warning: {} >= {} bytes. \
                    You can increase the threshold to avoid this warning by changing the message-size-warning option",
                        message_length,
                        message_size_warning,
                    );
                }
                if message_length >= message_size_limit.get() {
                    return Err(EncodingError::MessageSizeLimit(
                        message_length,
                        message_size_limit,
                    ));
                }

                DecoderState::WaitingPayload(header)
            }
            DecoderState::WaitingPayload(h) => {
                let msg = h
                    .message_type()
                    .decode(buf.take(h.frame_length() as usize))
                    .map_err(|e| EncodingError::DecodeMessage(h.message_type(), e))?;
                res = Some((h, msg));
                DecoderState::WaitingHeader
            }
        };

        Ok(res)
    }
}
