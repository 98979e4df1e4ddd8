// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Module containing definitions of protocol messages,
//! including encoding and decoding of headers and message payloads.

use std::fmt;

use bytes::Bytes;

use crate::EntryIndex;

mod encoding;
mod header;

pub use encoding::{Decoder, Encoder, EncodingError};
pub use header::MessageHeader;

pub mod proto {
    pub use crate::proto::*;
}

type MessageTypeId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol.message code {0:#x}")]
pub struct UnknownMessageType(pub u16);

// This macro generates:
//
// * the Message enum, containing the concrete protobuf messages.
// * the Message.encoded_len() method
// * the Message.encode() method
// * the Message.ty() method
// * the MessageType enum, containing only the type information.
// * the MessageType.requires_ack() method, true for entries flagged with requires_ack.
// * the MessageType.decode() method
// * the MessageType.entry_type() method
// * the EntryType enum, the closed set of journal entry kinds.
// * the conversions back and forth to MessageTypeId.
macro_rules! gen_message {
    (@gen_message_enum [] -> [$($body:tt)*]) => {
        #[derive(Clone, Debug, PartialEq)]
        pub enum Message {
            $($body)*
        }
    };
    (@gen_message_enum [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_enum [$($tail)*] -> [$variant(proto::[< $variant Message >]), $($body)*]); }
    };
    (@gen_message_enum [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_enum [$($tail)*] -> [[< $variant Entry >](proto::[< $variant EntryMessage >]), $($body)*]); }
    };

    (@gen_message_enum_encoded_len [] -> [$($body:tt)*]) => {
        impl Message {
            pub fn encoded_len(&self) -> usize {
                match self {
                    $($body)*
                }
            }
        }
    };
    (@gen_message_enum_encoded_len [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_message_enum_encoded_len [$($tail)*] -> [Message::$variant(msg) => prost::Message::encoded_len(msg), $($body)*]);
    };
    (@gen_message_enum_encoded_len [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_enum_encoded_len [$($tail)*] -> [Message::[< $variant Entry >](msg) => prost::Message::encoded_len(msg), $($body)*]); }
    };

    (@gen_message_enum_ty [] -> [$($body:tt)*]) => {
        impl Message {
            pub fn ty(&self) -> MessageType {
                match self {
                    $($body)*
                }
            }
        }
    };
    (@gen_message_enum_ty [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_message_enum_ty [$($tail)*] -> [Message::$variant(_) => MessageType::$variant, $($body)*]);
    };
    (@gen_message_enum_ty [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_enum_ty [$($tail)*] -> [Message::[< $variant Entry >](_) => MessageType::[< $variant Entry >], $($body)*]); }
    };

    (@gen_message_enum_encode [] -> [$($body:tt)*]) => {
        impl Message {
            pub(crate) fn encode(&self, buf: &mut impl bytes::BufMut) -> Result<(), prost::EncodeError> {
                match (self, buf) {
                    $($body)*
                };
                Ok(())
            }
        }
    };
    (@gen_message_enum_encode [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_message_enum_encode [$($tail)*] -> [(Message::$variant(msg), buf) => prost::Message::encode(msg, buf)?, $($body)*]);
    };
    (@gen_message_enum_encode [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_enum_encode [$($tail)*] -> [(Message::[< $variant Entry >](msg), buf) => prost::Message::encode(msg, buf)?, $($body)*]); }
    };

    (@gen_message_type_enum [] -> [$($body:tt)*]) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($body)*
        }
    };
    (@gen_message_type_enum [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_message_type_enum [$($tail)*] -> [$variant, $($body)*]);
    };
    (@gen_message_type_enum [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_type_enum [$($tail)*] -> [[< $variant Entry >], $($body)*]); }
    };

    (@gen_message_type_enum_requires_ack [] -> [$($variant:ident,)*]) => {
        impl MessageType {
            /// Entries of this type carry no result; the runtime confirms them with an ack.
            pub fn requires_ack(&self) -> bool {
                matches!(self, $(MessageType::$variant)|*)
            }
        }
    };
    (@gen_message_type_enum_requires_ack [$variant:ident Entry requires_ack = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_type_enum_requires_ack [$($tail)*] -> [[< $variant Entry >], $($body)*]); }
    };
    (@gen_message_type_enum_requires_ack [$variant:ident $ty:ident $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_message_type_enum_requires_ack [$($tail)*] -> [$($body)*]);
    };

    (@gen_message_type_enum_decode [] -> [$($body:tt)*]) => {
        impl MessageType {
            pub(crate) fn decode(&self, buf: impl bytes::Buf) -> Result<Message, prost::DecodeError> {
                match (self, buf) {
                    $($body)*
                }
            }
        }
    };
    (@gen_message_type_enum_decode [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_type_enum_decode [$($tail)*] -> [(MessageType::$variant, buf) => Ok(Message::$variant(<proto::[< $variant Message >] as prost::Message>::decode(buf)?)), $($body)*]); }
    };
    (@gen_message_type_enum_decode [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_message_type_enum_decode [$($tail)*] -> [(MessageType::[< $variant Entry >], buf) => Ok(Message::[< $variant Entry >](<proto::[< $variant EntryMessage >] as prost::Message>::decode(buf)?)), $($body)*]); }
    };

    (@gen_entry_type [] -> [$($variant:ident,)*]) => {
        /// Kind of a journal entry.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum EntryType {
            $($variant,)*
        }

        impl EntryType {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EntryType::$variant => stringify!($variant),)*
                }
            }
        }

        impl MessageType {
            pub fn entry_type(&self) -> Option<EntryType> {
                match self {
                    $(paste::paste! { MessageType::[< $variant Entry >] } => Some(EntryType::$variant),)*
                    _ => None,
                }
            }
        }

        impl From<EntryType> for MessageType {
            fn from(value: EntryType) -> Self {
                match value {
                    $(EntryType::$variant => paste::paste! { MessageType::[< $variant Entry >] },)*
                }
            }
        }
    };
    (@gen_entry_type [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_entry_type [$($tail)*] -> [$($body)*]);
    };
    (@gen_entry_type [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_entry_type [$($tail)*] -> [$variant, $($body)*]);
    };

    (@gen_to_id [] -> [$($variant:ident, $id:literal,)*]) => {
        impl From<MessageType> for MessageTypeId {
            fn from(mt: MessageType) -> Self {
                match mt {
                    $(MessageType::$variant => $id,)*
                }
            }
        }
    };
    (@gen_to_id [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_to_id [$($tail)*] -> [$variant, $id, $($body)*]);
    };
    (@gen_to_id [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_to_id [$($tail)*] -> [[< $variant Entry >], $id, $($body)*]); }
    };

    (@gen_from_id [] -> [$($variant:ident, $id:literal,)*]) => {
        impl TryFrom<MessageTypeId> for MessageType {
            type Error = UnknownMessageType;

            fn try_from(value: MessageTypeId) -> Result<Self, UnknownMessageType> {
                match value {
                    $($id => Ok(MessageType::$variant),)*
                    v => Err(UnknownMessageType(v)),
                }
            }
        }
    };
    (@gen_from_id [$variant:ident Control = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        gen_message!(@gen_from_id [$($tail)*] -> [$variant, $id, $($body)*]);
    };
    (@gen_from_id [$variant:ident Entry $($ignore:ident)* = $id:literal, $($tail:tt)*] -> [$($body:tt)*]) => {
        paste::paste! { gen_message!(@gen_from_id [$($tail)*] -> [[< $variant Entry >], $id, $($body)*]); }
    };

    // Entrypoint of the macro
    ($($tokens:tt)*) => {
        gen_message!(@gen_message_enum [$($tokens)*] -> []);
        gen_message!(@gen_message_enum_encoded_len [$($tokens)*] -> []);
        gen_message!(@gen_message_enum_encode [$($tokens)*] -> []);
        gen_message!(@gen_message_enum_ty [$($tokens)*] -> []);
        gen_message!(@gen_message_type_enum [$($tokens)*] -> []);
        gen_message!(@gen_message_type_enum_requires_ack [$($tokens)*] -> []);
        gen_message!(@gen_message_type_enum_decode [$($tokens)*] -> []);
        gen_message!(@gen_entry_type [$($tokens)*] -> []);
        gen_message!(@gen_to_id [$($tokens)*] -> []);
        gen_message!(@gen_from_id [$($tokens)*] -> []);
    };
}

gen_message!(
    Start Control = 0x0000,
    Completion Control = 0x0001,
    Suspension Control = 0x0002,
    Error Control = 0x0003,
    EntryAck Control = 0x0004,
    End Control = 0x0005,
    ProposeRunCompletion Control = 0x0006,
    CancelSignal Control = 0x0007,

    Input Entry = 0x0400,
    Output Entry = 0x0401,

    GetState Entry = 0x0800,
    SetState Entry requires_ack = 0x0801,
    ClearState Entry requires_ack = 0x0802,
    ClearAllState Entry requires_ack = 0x0803,
    GetStateKeys Entry = 0x0804,
    GetPromise Entry = 0x0808,
    PeekPromise Entry = 0x0809,
    CompletePromise Entry = 0x080A,

    Sleep Entry = 0x0C00,
    Call Entry = 0x0C01,
    OneWayCall Entry requires_ack = 0x0C02,
    Awakeable Entry = 0x0C03,
    CompleteAwakeable Entry requires_ack = 0x0C04,
    Run Entry = 0x0C05,
    Select Entry = 0x0C06,
);

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessageType {
    pub fn is_entry(&self) -> bool {
        self.entry_type().is_some()
    }
}

impl Message {
    pub fn new_start_message(
        id: Bytes,
        debug_id: String,
        key: String,
        known_entries: u32,
        partial_state: bool,
        state_map_entries: impl IntoIterator<Item = (Bytes, Bytes)>,
        random_seed: u64,
    ) -> Self {
        Self::Start(proto::StartMessage {
            id,
            debug_id,
            known_entries,
            partial_state,
            state_map: state_map_entries
                .into_iter()
                .map(|(key, value)| proto::start_message::StateEntry { key, value })
                .collect(),
            key,
            random_seed,
        })
    }

    pub fn new_completion(
        entry_index: EntryIndex,
        result: proto::entry_result::Result,
    ) -> Self {
        Self::Completion(proto::CompletionMessage {
            entry_index,
            result: Some(result),
        })
    }

    pub fn new_entry_ack(entry_index: EntryIndex) -> Self {
        Self::EntryAck(proto::EntryAckMessage { entry_index })
    }

    pub fn new_cancel_signal() -> Self {
        Self::CancelSignal(proto::CancelSignalMessage {})
    }

    /// Returns the entry type if this message is a journal entry.
    pub fn entry_type(&self) -> Option<EntryType> {
        self.ty().entry_type()
    }
}
