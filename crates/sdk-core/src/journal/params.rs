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

use restate_sdk_protocol::{EntryIndex, EntryType, Message, proto};

use super::EntryResult;
use crate::codec::Payload;
use crate::error::{CoreError, TerminalError};

/// Target and parameter of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub service: String,
    pub handler: String,
    pub key: Option<String>,
    pub parameter: Payload,
    pub headers: Vec<(String, String)>,
    pub idempotency_key: Option<String>,
}

impl CallRequest {
    pub fn new(service: impl Into<String>, handler: impl Into<String>, parameter: Payload) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: None,
            parameter,
            headers: vec![],
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_idempotency_key(mut self, idempotency_key: impl Into<String>) -> Self {
        self.idempotency_key = Some(idempotency_key.into());
        self
    }

    fn replay_matches(&self, recorded: &CallRequest) -> bool {
        self.service == recorded.service
            && self.handler == recorded.handler
            && self.key == recorded.key
            && self.headers == recorded.headers
            && self.idempotency_key == recorded.idempotency_key
            && self.parameter.replay_matches(&recorded.parameter)
    }
}

/// Parameters of a journal entry.
///
/// These are the inputs of the operation the handler issues. Values produced by the
/// runtime or recorded by the engine (results, wake up times, select winners) are not compared
/// on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryParams {
    Output {
        result: Result<Payload, TerminalError>,
    },
    GetState {
        key: Bytes,
    },
    SetState {
        key: Bytes,
        value: Payload,
    },
    ClearState {
        key: Bytes,
    },
    ClearAllState,
    GetStateKeys,
    GetPromise {
        key: String,
    },
    PeekPromise {
        key: String,
    },
    CompletePromise {
        key: String,
        completion: Result<Payload, TerminalError>,
    },
    /// Absolute wake up time in milliseconds since the unix epoch.
    Sleep {
        wake_up_time: u64,
    },
    Call(CallRequest),
    Send {
        request: CallRequest,
        invoke_time: u64,
    },
    Awakeable,
    CompleteAwakeable {
        id: String,
        completion: Result<Payload, TerminalError>,
    },
    Run {
        name: String,
    },
    Select {
        candidates: Vec<EntryIndex>,
        winner: EntryIndex,
    },
}

fn completion_matches(
    issued: &Result<Payload, TerminalError>,
    recorded: &Result<Payload, TerminalError>,
) -> bool {
    match (issued, recorded) {
        (Ok(issued), Ok(recorded)) => issued.replay_matches(recorded),
        (Err(issued), Err(recorded)) => issued == recorded,
        _ => false,
    }
}

impl EntryParams {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryParams::Output { .. } => EntryType::Output,
            EntryParams::GetState { .. } => EntryType::GetState,
            EntryParams::SetState { .. } => EntryType::SetState,
            EntryParams::ClearState { .. } => EntryType::ClearState,
            EntryParams::ClearAllState => EntryType::ClearAllState,
            EntryParams::GetStateKeys => EntryType::GetStateKeys,
            EntryParams::GetPromise { .. } => EntryType::GetPromise,
            EntryParams::PeekPromise { .. } => EntryType::PeekPromise,
            EntryParams::CompletePromise { .. } => EntryType::CompletePromise,
            EntryParams::Sleep { .. } => EntryType::Sleep,
            EntryParams::Call(_) => EntryType::Call,
            EntryParams::Send { .. } => EntryType::OneWayCall,
            EntryParams::Awakeable => EntryType::Awakeable,
            EntryParams::CompleteAwakeable { .. } => EntryType::CompleteAwakeable,
            EntryParams::Run { .. } => EntryType::Run,
            EntryParams::Select { .. } => EntryType::Select,
        }
    }

    /// Field-wise comparison of the parameters the handler issues now against the
    /// parameters recorded in the journal.
    pub fn replay_matches(&self, recorded: &EntryParams) -> bool {
        match (self, recorded) {
            (EntryParams::Output { result: issued }, EntryParams::Output { result: recorded }) => {
                issued.is_ok() == recorded.is_ok()
            }
            (EntryParams::GetState { key: a }, EntryParams::GetState { key: b })
            | (EntryParams::ClearState { key: a }, EntryParams::ClearState { key: b }) => a == b,
            (
                EntryParams::SetState { key, value },
                EntryParams::SetState {
                    key: recorded_key,
                    value: recorded_value,
                },
            ) => key == recorded_key && value.replay_matches(recorded_value),
            (EntryParams::ClearAllState, EntryParams::ClearAllState)
            | (EntryParams::GetStateKeys, EntryParams::GetStateKeys)
            | (EntryParams::Awakeable, EntryParams::Awakeable) => true,
            (EntryParams::GetPromise { key: a }, EntryParams::GetPromise { key: b })
            | (EntryParams::PeekPromise { key: a }, EntryParams::PeekPromise { key: b }) => a == b,
            (
                EntryParams::CompletePromise { key, completion },
                EntryParams::CompletePromise {
                    key: recorded_key,
                    completion: recorded_completion,
                },
            ) => key == recorded_key && completion_matches(completion, recorded_completion),
            (EntryParams::Sleep { .. }, EntryParams::Sleep { .. }) => true,
            (EntryParams::Call(issued), EntryParams::Call(recorded)) => {
                issued.replay_matches(recorded)
            }
            (
                EntryParams::Send { request, .. },
                EntryParams::Send {
                    request: recorded, ..
                },
            ) => request.replay_matches(recorded),
            (
                EntryParams::CompleteAwakeable { id, completion },
                EntryParams::CompleteAwakeable {
                    id: recorded_id,
                    completion: recorded_completion,
                },
            ) => id == recorded_id && completion_matches(completion, recorded_completion),
            (EntryParams::Run { name }, EntryParams::Run { name: recorded }) => name == recorded,
            (
                EntryParams::Select { candidates, .. },
                EntryParams::Select {
                    candidates: recorded,
                    ..
                },
            ) => candidates == recorded,
            _ => false,
        }
    }

    /// Builds the protocol message of a freshly created entry. `result` is set when the entry
    /// is completed locally.
    pub(crate) fn into_message(self, result: Option<EntryResult>) -> Message {
        let result = result.map(proto::entry_result::Result::from);
        match self {
            EntryParams::Output { result: output } => {
                Message::OutputEntry(proto::OutputEntryMessage {
                    result: Some(completion_to_result(output)),
                })
            }
            EntryParams::GetState { key } => {
                Message::GetStateEntry(proto::GetStateEntryMessage { key, result })
            }
            EntryParams::SetState { key, value } => {
                Message::SetStateEntry(proto::SetStateEntryMessage {
                    key,
                    value: value.into_bytes(),
                })
            }
            EntryParams::ClearState { key } => {
                Message::ClearStateEntry(proto::ClearStateEntryMessage { key })
            }
            EntryParams::ClearAllState => {
                Message::ClearAllStateEntry(proto::ClearAllStateEntryMessage {})
            }
            EntryParams::GetStateKeys => {
                Message::GetStateKeysEntry(proto::GetStateKeysEntryMessage { result })
            }
            EntryParams::GetPromise { key } => {
                Message::GetPromiseEntry(proto::GetPromiseEntryMessage { key, result })
            }
            EntryParams::PeekPromise { key } => {
                Message::PeekPromiseEntry(proto::PeekPromiseEntryMessage { key, result })
            }
            EntryParams::CompletePromise { key, completion } => {
                Message::CompletePromiseEntry(proto::CompletePromiseEntryMessage {
                    key,
                    completion: Some(match completion {
                        Ok(value) => proto::complete_promise_entry_message::Completion::Value(
                            value.into_bytes(),
                        ),
                        Err(failure) => {
                            proto::complete_promise_entry_message::Completion::Failure(
                                failure.into(),
                            )
                        }
                    }),
                    result,
                })
            }
            EntryParams::Sleep { wake_up_time } => {
                Message::SleepEntry(proto::SleepEntryMessage {
                    wake_up_time,
                    result,
                })
            }
            EntryParams::Call(request) => Message::CallEntry(proto::CallEntryMessage {
                service_name: request.service,
                handler_name: request.handler,
                parameter: request.parameter.into_bytes(),
                headers: headers_to_proto(request.headers),
                key: request.key.unwrap_or_default(),
                idempotency_key: request.idempotency_key,
                result,
            }),
            EntryParams::Send {
                request,
                invoke_time,
            } => Message::OneWayCallEntry(proto::OneWayCallEntryMessage {
                service_name: request.service,
                handler_name: request.handler,
                parameter: request.parameter.into_bytes(),
                invoke_time,
                headers: headers_to_proto(request.headers),
                key: request.key.unwrap_or_default(),
                idempotency_key: request.idempotency_key,
            }),
            EntryParams::Awakeable => {
                Message::AwakeableEntry(proto::AwakeableEntryMessage { result })
            }
            EntryParams::CompleteAwakeable { id, completion } => {
                Message::CompleteAwakeableEntry(proto::CompleteAwakeableEntryMessage {
                    id,
                    result: Some(completion_to_result(completion)),
                })
            }
            EntryParams::Run { name } => Message::RunEntry(proto::RunEntryMessage { name, result }),
            EntryParams::Select { candidates, winner } => {
                Message::SelectEntry(proto::SelectEntryMessage { candidates, winner })
            }
        }
    }

    /// Splits a recorded entry message into its parameters and its result, if completed.
    ///
    /// Recorded payloads are marked stable: whether the comparison looks at the bytes is
    /// decided by the payload the handler issues.
    pub(crate) fn from_message(
        message: Message,
    ) -> Result<(EntryParams, Option<EntryResult>), CoreError> {
        let res = match message {
            Message::OutputEntry(m) => (
                EntryParams::Output {
                    result: completion_from_result(m.result)?,
                },
                None,
            ),
            Message::GetStateEntry(m) => (
                EntryParams::GetState { key: m.key },
                m.result.map(Into::into),
            ),
            Message::SetStateEntry(m) => (
                EntryParams::SetState {
                    key: m.key,
                    value: Payload::stable(m.value),
                },
                None,
            ),
            Message::ClearStateEntry(m) => (EntryParams::ClearState { key: m.key }, None),
            Message::ClearAllStateEntry(_) => (EntryParams::ClearAllState, None),
            Message::GetStateKeysEntry(m) => (EntryParams::GetStateKeys, m.result.map(Into::into)),
            Message::GetPromiseEntry(m) => (
                EntryParams::GetPromise { key: m.key },
                m.result.map(Into::into),
            ),
            Message::PeekPromiseEntry(m) => (
                EntryParams::PeekPromise { key: m.key },
                m.result.map(Into::into),
            ),
            Message::CompletePromiseEntry(m) => {
                let completion = match m.completion {
                    Some(proto::complete_promise_entry_message::Completion::Value(v)) => {
                        Ok(Payload::stable(v))
                    }
                    Some(proto::complete_promise_entry_message::Completion::Failure(f)) => {
                        Err(f.into())
                    }
                    None => {
                        return Err(CoreError::ProtocolViolation(
                            "CompletePromise entry without completion".to_owned(),
                        ));
                    }
                };
                (
                    EntryParams::CompletePromise {
                        key: m.key,
                        completion,
                    },
                    m.result.map(Into::into),
                )
            }
            Message::SleepEntry(m) => (
                EntryParams::Sleep {
                    wake_up_time: m.wake_up_time,
                },
                m.result.map(Into::into),
            ),
            Message::CallEntry(m) => (
                EntryParams::Call(CallRequest {
                    service: m.service_name,
                    handler: m.handler_name,
                    key: non_empty(m.key),
                    parameter: Payload::stable(m.parameter),
                    headers: headers_from_proto(m.headers),
                    idempotency_key: m.idempotency_key,
                }),
                m.result.map(Into::into),
            ),
            Message::OneWayCallEntry(m) => (
                EntryParams::Send {
                    request: CallRequest {
                        service: m.service_name,
                        handler: m.handler_name,
                        key: non_empty(m.key),
                        parameter: Payload::stable(m.parameter),
                        headers: headers_from_proto(m.headers),
                        idempotency_key: m.idempotency_key,
                    },
                    invoke_time: m.invoke_time,
                },
                None,
            ),
            Message::AwakeableEntry(m) => (EntryParams::Awakeable, m.result.map(Into::into)),
            Message::CompleteAwakeableEntry(m) => (
                EntryParams::CompleteAwakeable {
                    id: m.id,
                    completion: completion_from_result(m.result)?,
                },
                None,
            ),
            Message::RunEntry(m) => (EntryParams::Run { name: m.name }, m.result.map(Into::into)),
            Message::SelectEntry(m) => (
                EntryParams::Select {
                    candidates: m.candidates,
                    winner: m.winner,
                },
                None,
            ),
            other => {
                return Err(CoreError::UnexpectedMessage {
                    expected: "a journal entry",
                    actual: other.ty(),
                });
            }
        };
        Ok(res)
    }
}

fn completion_to_result(completion: Result<Payload, TerminalError>) -> proto::entry_result::Result {
    match completion {
        Ok(value) => proto::entry_result::Result::Value(value.into_bytes()),
        Err(failure) => proto::entry_result::Result::Failure(failure.into()),
    }
}

fn completion_from_result(
    result: Option<proto::entry_result::Result>,
) -> Result<Result<Payload, TerminalError>, CoreError> {
    match result {
        Some(proto::entry_result::Result::Value(v)) => Ok(Ok(Payload::stable(v))),
        Some(proto::entry_result::Result::Empty(_)) => Ok(Ok(Payload::default())),
        Some(proto::entry_result::Result::Failure(f)) => Ok(Err(f.into())),
        None => Err(CoreError::ProtocolViolation(
            "entry recorded without its value".to_owned(),
        )),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn headers_to_proto(headers: Vec<(String, String)>) -> Vec<proto::Header> {
    headers
        .into_iter()
        .map(|(key, value)| proto::Header { key, value })
        .collect()
}

pub(crate) fn headers_from_proto(headers: Vec<proto::Header>) -> Vec<(String, String)> {
    headers.into_iter().map(|h| (h.key, h.value)).collect()
}
