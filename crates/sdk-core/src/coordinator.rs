// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drives one invocation attempt from the start handshake to its terminal message.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info_span, trace, warn};

use restate_sdk_protocol::{EntryIndex, Message, proto};

use crate::codec::Payload;
use crate::context::Context;
use crate::error::{CoreError, HandlerError, TerminalError, codes, panic_message};
use crate::invocation::{InvocationCore, InvocationMetadata};
use crate::journal::{EntryParams, JournalEntry, headers_from_proto};
use crate::logging;
use crate::options::CoreOptions;
use crate::transport::{InputStream, OutputSink};
use crate::warn_it;

/// How an attempt ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The output entry and the end message were written.
    Completed,
    /// Like [`AttemptOutcome::Completed`], with the cancellation failure as output.
    Cancelled,
    /// The attempt stopped waiting on entries the runtime did not complete yet.
    Suspended { entry_indexes: Vec<EntryIndex> },
    /// The handler failed with a retryable error. The runtime retries the invocation.
    Retry { message: String },
}

/// Handler code of one invocation.
pub trait Handler: Send + 'static {
    fn handle(
        self,
        ctx: Context,
        input: Bytes,
    ) -> impl Future<Output = Result<Bytes, HandlerError>> + Send;
}

impl<F, Fut> Handler for F
where
    F: FnOnce(Context, Bytes) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send,
{
    fn handle(
        self,
        ctx: Context,
        input: Bytes,
    ) -> impl Future<Output = Result<Bytes, HandlerError>> + Send {
        self(ctx, input)
    }
}

/// Messages read before the handler starts.
struct Handshake {
    start: proto::StartMessage,
    input: proto::InputEntryMessage,
    prefix: Vec<JournalEntry>,
    /// Completions, acks and cancellation interleaved with the replayed entries.
    buffered: Vec<Message>,
}

pub struct Coordinator<I, O> {
    input: I,
    output: O,
    options: CoreOptions,
}

impl<I, O> Coordinator<I, O>
where
    I: InputStream,
    O: OutputSink,
{
    pub fn new(input: I, output: O, options: CoreOptions) -> Self {
        Self {
            input,
            output,
            options,
        }
    }

    /// Runs the attempt. Errors are fatal: the attempt is aborted and an error message is sent
    /// to the runtime on a best effort basis.
    pub async fn run<H: Handler>(self, handler: H) -> Result<AttemptOutcome, CoreError> {
        let Coordinator {
            mut input,
            mut output,
            options,
        } = self;

        let handshake = match read_handshake(&mut input).await {
            Ok(handshake) => handshake,
            Err(err) => {
                warn_it!(err, "Failed to read the start handshake");
                let _ = output.send(Message::Error(err.to_error_message())).await;
                let _ = output.close().await;
                return Err(err);
            }
        };
        let Handshake {
            start,
            input: input_entry,
            prefix,
            buffered,
        } = handshake;

        let span = info_span!(
            "invoke",
            restate.invocation.id = %start.debug_id,
            restate.invocation.key = %start.key,
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let core = Arc::new(InvocationCore::new(
            InvocationMetadata {
                id: start.id,
                debug_id: start.debug_id,
                key: (!start.key.is_empty()).then_some(start.key),
                headers: headers_from_proto(input_entry.headers),
                random_seed: start.random_seed,
            },
            prefix,
            start.state_map.into_iter().map(|e| (e.key, e.value)),
            start.partial_state,
            &options,
            out_tx,
        ));

        let writer = tokio::spawn(write_loop(output, out_rx, core.clone()).instrument(span.clone()));
        for msg in buffered {
            if let Err(err) = core.handle_inbound(msg) {
                core.fail(err);
            }
        }
        let reader = tokio::spawn(read_loop(input, core.clone()).instrument(span.clone()));

        let ctx = Context::new(core.clone());
        let handled = AssertUnwindSafe(handler.handle(ctx, input_entry.value)).catch_unwind();
        let result = logging::scope(core.clone(), handled)
            .instrument(span.clone())
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::retryable(format!(
                    "handler panicked: {}",
                    panic_message(&*panic)
                )))
            });

        let outcome = span.in_scope(|| finish(&core, result));

        core.close_output();
        let written = writer
            .await
            .map_err(|err| CoreError::Transport(format!("writer task failed: {err}")))
            .and_then(|res| res);
        reader.abort();

        let outcome = outcome?;
        written?;
        Ok(outcome)
    }
}

async fn read_handshake<I: InputStream>(input: &mut I) -> Result<Handshake, CoreError> {
    let start = match next_message(input).await? {
        Message::Start(start) => start,
        other => {
            return Err(CoreError::UnexpectedMessage {
                expected: "Start",
                actual: other.ty(),
            });
        }
    };
    debug!(
        restate.invocation.id = %start.debug_id,
        known_entries = start.known_entries,
        "Received start message"
    );
    if start.known_entries == 0 {
        return Err(CoreError::ProtocolViolation(
            "the journal must contain at least the input entry".to_owned(),
        ));
    }

    let mut buffered = vec![];
    let input_entry = loop {
        match next_message(input).await? {
            Message::InputEntry(entry) => break entry,
            msg @ (Message::Completion(_) | Message::EntryAck(_) | Message::CancelSignal(_)) => {
                buffered.push(msg)
            }
            other => {
                return Err(CoreError::UnexpectedMessage {
                    expected: "InputEntry",
                    actual: other.ty(),
                });
            }
        }
    };

    let mut prefix = Vec::with_capacity(start.known_entries as usize - 1);
    let mut index: EntryIndex = 1;
    while index < start.known_entries {
        match next_message(input).await? {
            msg @ (Message::Completion(_) | Message::EntryAck(_) | Message::CancelSignal(_)) => {
                buffered.push(msg)
            }
            msg => {
                let (params, result) = EntryParams::from_message(msg)?;
                trace!(restate.journal.index = index, "Received replayed entry");
                prefix.push(JournalEntry {
                    index,
                    params,
                    result,
                });
                index += 1;
            }
        }
    }

    Ok(Handshake {
        start,
        input: input_entry,
        prefix,
        buffered,
    })
}

async fn next_message<I: InputStream>(input: &mut I) -> Result<Message, CoreError> {
    input.next_message().await?.ok_or(CoreError::IncompleteStart)
}

/// Feeds completions, acks and cancellation into the registry until the input is closed.
async fn read_loop<I: InputStream>(mut input: I, core: Arc<InvocationCore>) {
    loop {
        match input.next_message().await {
            Ok(Some(msg)) => {
                if let Err(err) = core.handle_inbound(msg) {
                    warn_it!(err, "Unexpected message from the runtime");
                    core.registry().fail(err);
                    return;
                }
            }
            Ok(None) => {
                debug!("Input stream closed");
                core.registry().close_input();
                return;
            }
            Err(err) => {
                let err = CoreError::from(err);
                warn_it!(err, "Failed to read from the input stream");
                core.registry().fail(err);
                return;
            }
        }
    }
}

async fn write_loop<O: OutputSink>(
    mut output: O,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    core: Arc<InvocationCore>,
) -> Result<(), CoreError> {
    while let Some(msg) = out_rx.recv().await {
        if let Err(err) = output.send(msg).await {
            let err = CoreError::from(err);
            warn_it!(err, "Failed to write to the output stream");
            core.registry().fail(err.clone());
            return Err(err);
        }
    }
    output.close().await.map_err(CoreError::from)
}

/// Writes the terminal messages of the attempt.
fn finish(
    core: &InvocationCore,
    result: Result<Bytes, HandlerError>,
) -> Result<AttemptOutcome, CoreError> {
    let outcome = match terminal_messages(core, result) {
        Ok(outcome) => outcome,
        Err(err) => {
            core.fail(err.clone());
            let _ = core.send(Message::Error(err.to_error_message()));
            return Err(err);
        }
    };

    match &outcome {
        AttemptOutcome::Completed | AttemptOutcome::Cancelled => {
            core.mark_completed();
            debug!(outcome = ?outcome, "Invocation attempt completed");
        }
        AttemptOutcome::Suspended { entry_indexes } => {
            debug!(entries = ?entry_indexes, "Invocation attempt suspended");
        }
        AttemptOutcome::Retry { message } => {
            warn!(error = %message, "Invocation attempt failed with a retryable error");
        }
    }
    Ok(outcome)
}

fn terminal_messages(
    core: &InvocationCore,
    result: Result<Bytes, HandlerError>,
) -> Result<AttemptOutcome, CoreError> {
    if let Some(err) = core.fatal_error() {
        return Err(err);
    }
    if let Some(entry_indexes) = core.suspended_on() {
        return suspend(core, entry_indexes);
    }

    match result {
        Ok(value) => {
            write_output(core, Ok(Payload::unstable(value)))?;
            Ok(AttemptOutcome::Completed)
        }
        Err(HandlerError::Terminal(failure)) => {
            let cancelled = failure.is_cancellation() && core.registry().is_cancelled();
            write_output(core, Err(failure))?;
            Ok(if cancelled {
                AttemptOutcome::Cancelled
            } else {
                AttemptOutcome::Completed
            })
        }
        Err(HandlerError::Suspended(suspended)) => suspend(core, suspended.entry_indexes),
        Err(HandlerError::Core(err)) => Err(err),
        Err(HandlerError::Retryable(err)) => {
            let message = err.to_string();
            core.send(Message::Error(proto::ErrorMessage {
                code: codes::INTERNAL.into(),
                message: message.clone(),
                description: String::new(),
                related_entry_index: None,
                related_entry_type: None,
            }))?;
            Ok(AttemptOutcome::Retry { message })
        }
    }
}

fn suspend(
    core: &InvocationCore,
    entry_indexes: Vec<EntryIndex>,
) -> Result<AttemptOutcome, CoreError> {
    core.send(Message::Suspension(proto::SuspensionMessage {
        entry_indexes: entry_indexes.clone(),
    }))?;
    Ok(AttemptOutcome::Suspended { entry_indexes })
}

fn write_output(
    core: &InvocationCore,
    result: Result<Payload, TerminalError>,
) -> Result<(), CoreError> {
    core.issue_or_replay(EntryParams::Output { result }, None)
        .map_err(|err| match err {
            HandlerError::Core(err) => err,
            other => CoreError::ProtocolViolation(other.to_string()),
        })?;
    core.send(Message::End(proto::EndMessage {}))
}

#[cfg(test)]
mod tests {
    use super::*;

    use restate_test_util::{assert, assert_eq, let_assert};
    use test_log::test;

    use crate::transport::{ChannelInput, ChannelOutput};

    async fn echo(_ctx: Context, input: Bytes) -> Result<Bytes, HandlerError> {
        Ok(input)
    }

    fn start(known_entries: u32) -> Message {
        Message::new_start_message(
            Bytes::from_static(b"inv"),
            "inv_1".to_owned(),
            String::new(),
            known_entries,
            true,
            [],
            1,
        )
    }

    fn input(value: &'static [u8]) -> Message {
        Message::InputEntry(proto::InputEntryMessage {
            headers: vec![],
            value: Bytes::from_static(value),
        })
    }

    fn channels() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Message>,
        Coordinator<ChannelInput, ChannelOutput>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            ChannelInput::new(in_rx),
            ChannelOutput::new(out_tx),
            CoreOptions::default(),
        );
        (in_tx, out_rx, coordinator)
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut messages = vec![];
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        messages
    }

    #[test(tokio::test)]
    async fn echo_writes_output_and_end() {
        let (in_tx, out_rx, coordinator) = channels();
        in_tx.send(start(1)).unwrap();
        in_tx.send(input(b"hello")).unwrap();

        let outcome = coordinator.run(echo).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Completed);

        let messages = drain(out_rx).await;
        assert_eq!(
            messages,
            vec![
                Message::OutputEntry(proto::OutputEntryMessage {
                    result: Some(proto::entry_result::Result::Value(Bytes::from_static(
                        b"hello"
                    ))),
                }),
                Message::End(proto::EndMessage {}),
            ]
        );
    }

    #[test(tokio::test)]
    async fn missing_start() {
        let (in_tx, out_rx, coordinator) = channels();
        in_tx.send(input(b"hello")).unwrap();

        let_assert!(
            Err(CoreError::UnexpectedMessage { expected: "Start", .. }) =
                coordinator.run(echo).await
        );
        let messages = drain(out_rx).await;
        let_assert!([Message::Error(error)] = messages.as_slice());
        assert_eq!(error.code, 571);
    }

    #[test(tokio::test)]
    async fn input_closed_during_handshake() {
        let (in_tx, _out_rx, coordinator) = channels();
        in_tx.send(start(2)).unwrap();
        in_tx.send(input(b"hello")).unwrap();
        drop(in_tx);

        let_assert!(Err(CoreError::IncompleteStart) = coordinator.run(echo).await);
    }

    #[test(tokio::test)]
    async fn retryable_error_writes_no_output() {
        let (in_tx, out_rx, coordinator) = channels();
        in_tx.send(start(1)).unwrap();
        in_tx.send(input(b"hello")).unwrap();

        let outcome = coordinator
            .run(|_ctx: Context, _input: Bytes| async {
                Err(HandlerError::retryable("database unavailable"))
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AttemptOutcome::Retry {
                message: "database unavailable".to_owned()
            }
        );

        let messages = drain(out_rx).await;
        assert_eq!(messages.len(), 1);
        let_assert!(Message::Error(error) = &messages[0]);
        assert_eq!(error.code, 500);
        assert!(
            !messages
                .iter()
                .any(|m| matches!(m, Message::OutputEntry(_) | Message::End(_)))
        );
    }
}
