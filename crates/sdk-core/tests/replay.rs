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

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use restate_sdk_core::{
    AttemptOutcome, CallRequest, Codec, Context, CoreError, HandlerError, Json, Payload,
};
use restate_sdk_protocol::{Message, proto};
use restate_test_util::mock::StartInvocation;
use restate_test_util::{assert, assert_eq, let_assert};
use test_log::test;

use common::{attempt, has_terminal_messages};

async fn greeter(ctx: Context, input: Bytes) -> Result<Bytes, HandlerError> {
    let name: String = Json::decode(&input)?;
    let count = ctx.get::<u64>("count").await?.unwrap_or_default() + 1;
    ctx.set("count", &count)?;
    let greeting: String = ctx
        .call(CallRequest::new(
            "Greeter",
            "greet",
            Payload::encode::<Json, _>(&name)?,
        ))?
        .value()
        .await?;
    let token = ctx.random_u64();
    Ok(Json::encode(&format!("{greeting} #{count} ({token})"))?)
}

/// Runs the greeter and reports its output.
fn recording_greeter(
    tx: mpsc::UnboundedSender<Bytes>,
) -> impl FnOnce(Context, Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> + Send + 'static
{
    move |ctx: Context, input: Bytes| {
        async move {
            let output = greeter(ctx, input).await;
            if let Ok(value) = &output {
                let _ = tx.send(value.clone());
            }
            output
        }
        .boxed()
    }
}

#[test(tokio::test)]
async fn replayed_attempt_retransmits_nothing() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let input = Json::encode("Till").unwrap();

    let (mut runtime, first) = attempt(
        StartInvocation::new(input.clone()).with_key("till"),
        recording_greeter(tx.clone()),
    );
    let_assert!(Some((1, Message::GetStateEntry(_))) = runtime.recv_entry().await);
    runtime.complete_empty(1);
    let_assert!(Some((2, Message::SetStateEntry(set))) = runtime.recv_entry().await);
    assert_eq!(set.value, Bytes::from_static(b"1"));
    let_assert!(Some((3, Message::CallEntry(call))) = runtime.recv_entry().await);
    assert_eq!(call.service_name, "Greeter");
    runtime.complete_value(3, Json::encode("Hello Till").unwrap());

    let transmitted = runtime.transmitted().await;
    assert_eq!(first.await.unwrap().unwrap(), AttemptOutcome::Completed);
    let_assert!([.., Message::OutputEntry(_), Message::End(_)] = transmitted.as_slice());
    let first_output = rx.recv().await.unwrap();

    let journal = runtime.journal();
    assert_eq!(journal.len(), 4);
    let (mut runtime, second) = attempt(
        StartInvocation::new(input).with_key("till").with_journal(journal),
        recording_greeter(tx),
    );

    let transmitted = runtime.transmitted().await;
    assert_eq!(second.await.unwrap().unwrap(), AttemptOutcome::Completed);
    assert_eq!(transmitted, vec![Message::End(proto::EndMessage {})]);
    // same state, same call result and same random sequence
    assert_eq!(rx.recv().await.unwrap(), first_output);
}

async fn overwrites_state(ctx: Context, _input: Bytes) -> Result<Bytes, HandlerError> {
    ctx.set("y", "value")?;
    let (_, awakeable) = ctx.awakeable()?;
    awakeable.done().await?;
    Ok(Bytes::new())
}

#[test(tokio::test)]
async fn divergent_handler_fails_with_journal_mismatch() {
    let (mut runtime, handle) = attempt(
        StartInvocation::new(Bytes::new()).with_journal(vec![Message::GetStateEntry(
            proto::GetStateEntryMessage {
                key: Bytes::from_static(b"x"),
                result: None,
            },
        )]),
        overwrites_state,
    );

    let transmitted = runtime.transmitted().await;
    let_assert!(Err(CoreError::JournalMismatch { index: 1, .. }) = handle.await.unwrap());

    let_assert!([Message::Error(error)] = transmitted.as_slice());
    assert_eq!(error.code, 570);
    assert_eq!(error.related_entry_index, Some(1));
    assert!(!has_terminal_messages(&transmitted));
}

async fn charge(
    ctx: Context,
    executions: Arc<AtomicUsize>,
) -> Result<Bytes, HandlerError> {
    let receipt: String = ctx
        .run("charge", move || async move {
            executions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>("receipt-1".to_owned())
        })?
        .value()
        .await?;
    ctx.sleep(Duration::from_secs(60))?.done().await?;
    Ok(Bytes::from(receipt))
}

#[test(tokio::test)]
async fn run_executes_once_across_attempts() {
    let executions = Arc::new(AtomicUsize::new(0));

    let counter = executions.clone();
    let (mut runtime, first) = attempt(
        StartInvocation::new(Bytes::new()),
        move |ctx: Context, _input: Bytes| charge(ctx, counter),
    );
    let_assert!(Some((1, Message::RunEntry(run))) = runtime.recv_entry().await);
    assert_eq!(run.name, "charge");
    let_assert!(Some(Message::ProposeRunCompletion(proposal)) = runtime.recv().await);
    assert_eq!(proposal.entry_index, 1);
    assert_eq!(proposal.retry_policy, None);
    let_assert!(
        Some(proto::propose_run_completion_message::Result::Value(value)) = proposal.result
    );
    runtime.complete_value(1, value);
    let_assert!(Some((2, Message::SleepEntry(_))) = runtime.recv_entry().await);
    runtime.close_input();

    let transmitted = runtime.transmitted().await;
    assert_eq!(
        first.await.unwrap().unwrap(),
        AttemptOutcome::Suspended {
            entry_indexes: vec![2]
        }
    );
    assert!(!has_terminal_messages(&transmitted));
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let journal = runtime.journal();
    let counter = executions.clone();
    let (mut runtime, second) = attempt(
        StartInvocation::new(Bytes::new()).with_journal(journal),
        move |ctx: Context, _input: Bytes| charge(ctx, counter),
    );
    runtime.complete_empty(2);

    let transmitted = runtime.transmitted().await;
    assert_eq!(second.await.unwrap().unwrap(), AttemptOutcome::Completed);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(
        transmitted,
        vec![
            Message::OutputEntry(proto::OutputEntryMessage {
                result: Some(proto::entry_result::Result::Value(Bytes::from_static(
                    b"receipt-1"
                ))),
            }),
            Message::End(proto::EndMessage {}),
        ]
    );
}
