// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scripted runtime side of an invocation attempt.
//!
//! The mock speaks decoded protocol messages over channels: it ships the start handshake and a
//! journal, delivers completions, acks and cancellation in whatever order the test wants, and
//! records every message the engine sends back.

use bytes::Bytes;
use tokio::sync::mpsc;

use restate_sdk_protocol::{EntryIndex, Message, proto};

/// Start handshake of one attempt.
#[derive(Debug, Clone)]
pub struct StartInvocation {
    pub id: Bytes,
    pub debug_id: String,
    pub key: String,
    pub input: Bytes,
    pub headers: Vec<(String, String)>,
    /// Replayed entries following the input entry. The first has index 1.
    pub journal: Vec<Message>,
    pub state: Vec<(Bytes, Bytes)>,
    pub partial_state: bool,
    pub random_seed: u64,
}

impl StartInvocation {
    pub fn new(input: impl Into<Bytes>) -> Self {
        Self {
            id: Bytes::from_static(b"\x01\x02\x03\x04"),
            debug_id: "inv_1mock".to_owned(),
            key: String::new(),
            input: input.into(),
            headers: vec![],
            journal: vec![],
            state: vec![],
            partial_state: true,
            random_seed: 42,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_journal(mut self, journal: Vec<Message>) -> Self {
        self.journal = journal;
        self
    }

    /// Eager state. `complete` means no other key exists.
    pub fn with_state(mut self, state: Vec<(Bytes, Bytes)>, complete: bool) -> Self {
        self.state = state;
        self.partial_state = !complete;
        self
    }
}

pub struct MockRuntime {
    to_engine: Option<mpsc::UnboundedSender<Message>>,
    from_engine: mpsc::UnboundedReceiver<Message>,
    transmitted: Vec<Message>,
    journal: Vec<Message>,
}

impl MockRuntime {
    /// Returns the mock together with the receiver to feed the engine input with and the
    /// sender to use as engine output.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedSender<Message>,
    ) {
        let (to_engine, engine_rx) = mpsc::unbounded_channel();
        let (engine_tx, from_engine) = mpsc::unbounded_channel();
        (
            Self {
                to_engine: Some(to_engine),
                from_engine,
                transmitted: vec![],
                journal: vec![],
            },
            engine_rx,
            engine_tx,
        )
    }

    pub fn start(&mut self, start: StartInvocation) {
        self.send(Message::new_start_message(
            start.id,
            start.debug_id,
            start.key,
            start.journal.len() as u32 + 1,
            start.partial_state,
            start.state,
            start.random_seed,
        ));
        self.send(Message::InputEntry(proto::InputEntryMessage {
            headers: start
                .headers
                .into_iter()
                .map(|(key, value)| proto::Header { key, value })
                .collect(),
            value: start.input,
        }));
        for entry in start.journal {
            self.journal.push(entry.clone());
            self.send(entry);
        }
    }

    pub fn send(&self, msg: Message) {
        if let Some(tx) = &self.to_engine {
            // the engine may be gone already, the test checks its outcome
            let _ = tx.send(msg);
        }
    }

    pub fn complete(&mut self, index: EntryIndex, result: proto::entry_result::Result) {
        if let Some(entry) = index
            .checked_sub(1)
            .and_then(|i| self.journal.get_mut(i as usize))
        {
            set_result(entry, result.clone());
        }
        self.send(Message::new_completion(index, result));
    }

    pub fn complete_value(&mut self, index: EntryIndex, value: impl Into<Bytes>) {
        self.complete(index, proto::entry_result::Result::Value(value.into()));
    }

    pub fn complete_empty(&mut self, index: EntryIndex) {
        self.complete(index, proto::entry_result::Result::Empty(proto::Empty {}));
    }

    pub fn complete_failure(&mut self, index: EntryIndex, code: u32, message: impl Into<String>) {
        self.complete(
            index,
            proto::entry_result::Result::Failure(proto::Failure {
                code,
                message: message.into(),
            }),
        );
    }

    pub fn ack(&self, index: EntryIndex) {
        self.send(Message::new_entry_ack(index));
    }

    pub fn cancel(&self) {
        self.send(Message::new_cancel_signal());
    }

    /// Closes the engine input. Pending waits suspend from now on.
    pub fn close_input(&mut self) {
        self.to_engine.take();
    }

    /// Next message sent by the engine, `None` once the engine closed its output.
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.from_engine.recv().await?;
        if msg.ty().is_entry() {
            self.journal.push(msg.clone());
        }
        self.transmitted.push(msg.clone());
        Some(msg)
    }

    /// Next entry sent by the engine together with its journal index. Control messages are
    /// recorded and skipped.
    pub async fn recv_entry(&mut self) -> Option<(EntryIndex, Message)> {
        loop {
            let msg = self.recv().await?;
            if msg.ty().is_entry() {
                return Some((self.journal.len() as EntryIndex, msg));
            }
        }
    }

    /// Waits for the engine to close its output and returns every message it sent.
    pub async fn transmitted(&mut self) -> Vec<Message> {
        while self.recv().await.is_some() {}
        self.transmitted.clone()
    }

    /// Journal as the runtime stores it: replayed and new entries, with the results delivered
    /// so far. Ready to be shipped to the next attempt.
    pub fn journal(&self) -> Vec<Message> {
        self.journal.clone()
    }
}

fn set_result(entry: &mut Message, result: proto::entry_result::Result) {
    let slot = match entry {
        Message::GetStateEntry(e) => &mut e.result,
        Message::GetStateKeysEntry(e) => &mut e.result,
        Message::GetPromiseEntry(e) => &mut e.result,
        Message::PeekPromiseEntry(e) => &mut e.result,
        Message::CompletePromiseEntry(e) => &mut e.result,
        Message::SleepEntry(e) => &mut e.result,
        Message::CallEntry(e) => &mut e.result,
        Message::AwakeableEntry(e) => &mut e.result,
        Message::RunEntry(e) => &mut e.result,
        _ => return,
    };
    *slot = Some(result);
}
