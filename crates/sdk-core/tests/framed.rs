// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use restate_sdk_core::{
    AttemptOutcome, Codec, Context, Coordinator, CoreOptions, FramedInput, FramedOutput,
    HandlerError, Json,
};
use restate_sdk_protocol::{Decoder, Encoder, Message, proto};
use restate_test_util::{assert_eq, let_assert};
use test_log::test;

async fn shout(ctx: Context, _input: Bytes) -> Result<Bytes, HandlerError> {
    let (_, awakeable) = ctx.awakeable()?;
    let word: String = awakeable.value().await?;
    Ok(Json::encode(&word.to_uppercase())?)
}

#[test(tokio::test)]
async fn attempt_over_a_byte_stream() {
    let options = CoreOptions::default();
    let (engine, runtime) = tokio::io::duplex(64);
    let (engine_read, engine_write) = tokio::io::split(engine);
    let (mut runtime_read, mut runtime_write) = tokio::io::split(runtime);

    let coordinator = Coordinator::new(
        FramedInput::new(engine_read, &options),
        FramedOutput::new(engine_write),
        options.clone(),
    );
    let handle = tokio::spawn(coordinator.run(shout));

    let mut encoder = Encoder::new();
    for msg in [
        Message::new_start_message(
            Bytes::from_static(b"inv"),
            "inv_1".to_owned(),
            String::new(),
            2,
            true,
            [],
            7,
        ),
        Message::InputEntry(proto::InputEntryMessage {
            headers: vec![],
            value: Bytes::new(),
        }),
        Message::AwakeableEntry(proto::AwakeableEntryMessage {
            result: Some(proto::entry_result::Result::Value(
                Json::encode("hello").unwrap(),
            )),
        }),
    ] {
        runtime_write
            .write_all(&encoder.encode(&msg).unwrap())
            .await
            .unwrap();
    }

    let mut buf = Vec::new();
    runtime_read.read_to_end(&mut buf).await.unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), AttemptOutcome::Completed);

    let mut decoder = Decoder::new(options.message_size_warning(), options.message_size_limit());
    decoder.push(Bytes::from(buf));
    let mut messages = vec![];
    while let Some((_, msg)) = decoder.consume_next().unwrap() {
        messages.push(msg);
    }
    let_assert!([Message::OutputEntry(output), Message::End(_)] = messages.as_slice());
    assert_eq!(
        output.result,
        Some(proto::entry_result::Result::Value(
            Json::encode("HELLO").unwrap()
        ))
    );
}
