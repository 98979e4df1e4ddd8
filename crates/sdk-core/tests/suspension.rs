// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod common;

use bytes::Bytes;

use restate_sdk_core::{AttemptOutcome, Context, CoreError, HandlerError};
use restate_sdk_protocol::{Message, proto};
use restate_test_util::mock::StartInvocation;
use restate_test_util::{assert, assert_eq, let_assert};
use test_log::test;

use common::{attempt, has_terminal_messages};

async fn awaits_awakeable(ctx: Context, _input: Bytes) -> Result<Bytes, HandlerError> {
    let (_, awakeable) = ctx.awakeable()?;
    awakeable.done().await?;
    Ok(Bytes::new())
}

#[test(tokio::test)]
async fn closed_input_suspends() {
    let (mut runtime, handle) = attempt(StartInvocation::new(Bytes::new()), awaits_awakeable);
    let_assert!(Some((1, Message::AwakeableEntry(_))) = runtime.recv_entry().await);
    runtime.close_input();

    let transmitted = runtime.transmitted().await;
    assert_eq!(
        handle.await.unwrap().unwrap(),
        AttemptOutcome::Suspended {
            entry_indexes: vec![1]
        }
    );
    assert_eq!(
        transmitted,
        vec![
            Message::AwakeableEntry(proto::AwakeableEntryMessage { result: None }),
            Message::Suspension(proto::SuspensionMessage {
                entry_indexes: vec![1]
            }),
        ]
    );
}

async fn awaits_either(ctx: Context, _input: Bytes) -> Result<Bytes, HandlerError> {
    let (_, a) = ctx.awakeable()?;
    let (_, b) = ctx.awakeable()?;
    ctx.select(vec![a, b]).select().await?;
    Ok(Bytes::new())
}

#[test(tokio::test)]
async fn select_suspends_on_every_candidate() {
    let (mut runtime, handle) = attempt(StartInvocation::new(Bytes::new()), awaits_either);
    assert!(runtime.recv_entry().await.is_some());
    assert!(runtime.recv_entry().await.is_some());
    runtime.close_input();

    let transmitted = runtime.transmitted().await;
    assert_eq!(
        handle.await.unwrap().unwrap(),
        AttemptOutcome::Suspended {
            entry_indexes: vec![1, 2]
        }
    );
    assert!(!has_terminal_messages(&transmitted));
}

async fn stores_state(ctx: Context, _input: Bytes) -> Result<Bytes, HandlerError> {
    ctx.set("greeting", "hello")?.acked().await?;
    Ok(Bytes::from_static(b"stored"))
}

#[test(tokio::test)]
async fn waiting_for_an_ack() {
    let (mut runtime, handle) = attempt(StartInvocation::new(Bytes::new()), stores_state);
    let_assert!(Some((1, Message::SetStateEntry(_))) = runtime.recv_entry().await);
    runtime.ack(1);

    let transmitted = runtime.transmitted().await;
    assert_eq!(handle.await.unwrap().unwrap(), AttemptOutcome::Completed);
    let_assert!([_, Message::OutputEntry(_), Message::End(_)] = transmitted.as_slice());

    let (mut runtime, handle) = attempt(StartInvocation::new(Bytes::new()), stores_state);
    assert!(runtime.recv_entry().await.is_some());
    runtime.close_input();

    let transmitted = runtime.transmitted().await;
    assert_eq!(
        handle.await.unwrap().unwrap(),
        AttemptOutcome::Suspended {
            entry_indexes: vec![1]
        }
    );
    assert!(!has_terminal_messages(&transmitted));
}

#[test(tokio::test)]
async fn protocol_violation_fails_instead_of_suspending() {
    let (mut runtime, handle) = attempt(StartInvocation::new(Bytes::new()), awaits_awakeable);
    assert!(runtime.recv_entry().await.is_some());
    // a second start message after the handshake
    runtime.send(Message::new_start_message(
        Bytes::new(),
        String::new(),
        String::new(),
        1,
        true,
        [],
        0,
    ));

    let transmitted = runtime.transmitted().await;
    let_assert!(Err(CoreError::UnexpectedMessage { .. }) = handle.await.unwrap());
    let_assert!([Message::AwakeableEntry(_), Message::Error(error)] = transmitted.as_slice());
    assert_eq!(error.code, 571);
    assert!(
        !transmitted
            .iter()
            .any(|m| matches!(m, Message::Suspension(_)))
    );
}
