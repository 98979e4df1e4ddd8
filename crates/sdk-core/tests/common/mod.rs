// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

#![allow(dead_code)]

use tokio::task::JoinHandle;

use restate_sdk_core::{
    AttemptOutcome, ChannelInput, ChannelOutput, Coordinator, CoreError, CoreOptions, Handler,
};
use restate_sdk_protocol::Message;
use restate_test_util::mock::{MockRuntime, StartInvocation};

/// Starts an attempt driven by a mock runtime.
pub fn attempt<H: Handler>(
    start: StartInvocation,
    handler: H,
) -> (MockRuntime, JoinHandle<Result<AttemptOutcome, CoreError>>) {
    let (mut runtime, engine_rx, engine_tx) = MockRuntime::new();
    runtime.start(start);
    let coordinator = Coordinator::new(
        ChannelInput::new(engine_rx),
        ChannelOutput::new(engine_tx),
        CoreOptions::default(),
    );
    (runtime, tokio::spawn(coordinator.run(handler)))
}

pub fn entries(messages: &[Message]) -> Vec<&Message> {
    messages.iter().filter(|m| m.ty().is_entry()).collect()
}

pub fn has_terminal_messages(messages: &[Message]) -> bool {
    messages
        .iter()
        .any(|m| matches!(m, Message::OutputEntry(_) | Message::End(_)))
}
