// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Transport boundary of an invocation attempt.
//!
//! The engine consumes an ordered stream of decoded messages and produces one. Framed adapters
//! run the protocol codec over any tokio byte stream, channel adapters move decoded messages
//! as they are.

use std::future::Future;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

use restate_sdk_protocol::{Decoder, Encoder, EncodingError, Message};

use crate::error::CoreError;
use crate::options::CoreOptions;

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("the stream is closed")]
    Closed,
    #[error("the stream ended in the middle of a frame")]
    TruncatedFrame,
}

impl From<TransportError> for CoreError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Encoding(err) => CoreError::Encoding(err),
            other => CoreError::Transport(other.to_string()),
        }
    }
}

/// Inbound side: the messages sent by the runtime.
pub trait InputStream: Send + 'static {
    /// Next message, or `None` once the runtime closed the stream.
    fn next_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<Message>, TransportError>> + Send;
}

/// Outbound side: the messages sent to the runtime, in order.
pub trait OutputSink: Send + 'static {
    fn send(&mut self, msg: Message) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Flushes and closes the stream. No message is sent afterwards.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

// --- Framed adapters

pub struct FramedInput<R> {
    reader: R,
    decoder: Decoder,
    buf: BytesMut,
}

impl<R> FramedInput<R> {
    pub fn new(reader: R, options: &CoreOptions) -> Self {
        Self {
            reader,
            decoder: Decoder::new(options.message_size_warning(), options.message_size_limit()),
            buf: BytesMut::new(),
        }
    }
}

impl<R> InputStream for FramedInput<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some((header, message)) = self.decoder.consume_next()? {
                trace!(restate.protocol.message_header = ?header, "Decoded message");
                return Ok(Some(message));
            }

            self.buf.reserve(READ_CHUNK_SIZE);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return if self.decoder.has_remaining() {
                    Err(TransportError::TruncatedFrame)
                } else {
                    Ok(None)
                };
            }
            self.decoder.push(self.buf.split().freeze());
        }
    }
}

pub struct FramedOutput<W> {
    writer: W,
    encoder: Encoder,
}

impl<W> FramedOutput<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: Encoder::new(),
        }
    }
}

impl<W> OutputSink for FramedOutput<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let buf = self.encoder.encode(&msg)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

// --- In-memory adapters

pub struct ChannelInput(mpsc::UnboundedReceiver<Message>);

impl ChannelInput {
    pub fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self(rx)
    }
}

impl InputStream for ChannelInput {
    async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.0.recv().await)
    }
}

pub struct ChannelOutput(Option<mpsc::UnboundedSender<Message>>);

impl ChannelOutput {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self(Some(tx))
    }
}

impl OutputSink for ChannelOutput {
    async fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        self.0
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(msg)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.take();
        Ok(())
    }
}
