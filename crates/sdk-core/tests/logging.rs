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

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber, info};
use tracing_subscriber::layer::{self, Layer, SubscriberExt};

use restate_sdk_core::{AttemptOutcome, Context, HandlerError, ReplayFilter};
use restate_sdk_protocol::{Message, proto};
use restate_test_util::mock::StartInvocation;
use restate_test_util::{assert_eq, let_assert};

use common::attempt;

/// Collects the messages of the events reaching it.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<String>>>);

impl Captured {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

struct MessageField(Option<String>);

impl Visit for MessageField {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Captured {
    fn on_event(&self, event: &Event<'_>, _ctx: layer::Context<'_, S>) {
        if !event.metadata().target().starts_with("logging") {
            return;
        }
        let mut field = MessageField(None);
        event.record(&mut field);
        if let Some(message) = field.0 {
            self.0.lock().push(message);
        }
    }
}

async fn greets(ctx: Context, _input: Bytes) -> Result<Bytes, HandlerError> {
    info!("looking up the name");
    let name: Option<String> = ctx.get("name").await?;
    info!("greeting {}", name.as_deref().unwrap_or("stranger"));
    Ok(Bytes::new())
}

// Single threaded runtime: the spawned attempt runs on the thread holding the default
// subscriber.
#[tokio::test]
async fn handler_events_are_dropped_while_replaying() {
    let captured = Captured::default();
    let subscriber =
        tracing_subscriber::registry().with(captured.clone().with_filter(ReplayFilter));
    let _guard = tracing::subscriber::set_default(subscriber);

    let (mut runtime, first) = attempt(StartInvocation::new(Bytes::new()), greets);
    let_assert!(Some((1, Message::GetStateEntry(_))) = runtime.recv_entry().await);
    runtime.complete_empty(1);
    runtime.transmitted().await;
    assert_eq!(first.await.unwrap().unwrap(), AttemptOutcome::Completed);
    assert_eq!(
        captured.take(),
        vec!["looking up the name".to_owned(), "greeting stranger".to_owned()]
    );

    let journal = vec![Message::GetStateEntry(proto::GetStateEntryMessage {
        key: Bytes::from_static(b"name"),
        result: Some(proto::entry_result::Result::Value(Bytes::from_static(
            b"\"Ada\"",
        ))),
    })];
    let (mut runtime, second) = attempt(
        StartInvocation::new(Bytes::new()).with_journal(journal),
        greets,
    );
    runtime.transmitted().await;
    assert_eq!(second.await.unwrap().unwrap(), AttemptOutcome::Completed);
    assert_eq!(captured.take(), vec!["greeting Ada".to_owned()]);
}
