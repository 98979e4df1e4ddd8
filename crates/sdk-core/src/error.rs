// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;

use restate_sdk_protocol::{EncodingError, EntryIndex, EntryType, MessageType, proto};

/// Error type which abstracts away the actual [`std::error::Error`] type.
pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InvocationErrorCode(u16);

impl InvocationErrorCode {
    pub const fn new(code: u16) -> Self {
        InvocationErrorCode(code)
    }
}

impl From<u16> for InvocationErrorCode {
    fn from(value: u16) -> Self {
        InvocationErrorCode(value)
    }
}

impl From<u32> for InvocationErrorCode {
    fn from(value: u32) -> Self {
        value
            .try_into()
            .map(InvocationErrorCode)
            .unwrap_or(codes::INTERNAL)
    }
}

impl From<InvocationErrorCode> for u16 {
    fn from(value: InvocationErrorCode) -> Self {
        value.0
    }
}

impl From<InvocationErrorCode> for u32 {
    fn from(value: InvocationErrorCode) -> Self {
        value.0 as u32
    }
}

impl fmt::Display for InvocationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(display_str) = self.display_str() {
            write!(f, "{} {}", self.0, display_str)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for InvocationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub mod codes {
    use super::InvocationErrorCode;

    macro_rules! codes {
        ($($name:ident $num:literal $str_name:literal,)*) => {
            $(pub const $name: InvocationErrorCode = InvocationErrorCode($num);)*

            impl InvocationErrorCode {
                pub(super) fn display_str(&self) -> Option<&'static str> {
                    $(if self.0 == $name.0 { return Some($str_name) })*
                    None
                }
            }
        };
    }

    codes!(
        BAD_REQUEST 400 "Bad request",
        NOT_FOUND 404 "Not found",
        CANCELLED 409 "Cancelled",
        INTERNAL 500 "Internal",
        JOURNAL_MISMATCH 570 "Journal mismatch",
        PROTOCOL_VIOLATION 571 "Protocol violation",
    );
}

// -- Terminal failures

/// A failure which must not be retried.
///
/// Returned by handler code or run closures to complete the operation (or the whole invocation)
/// with a failure. Failures delivered by the runtime for completed entries surface as this type too.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct TerminalError {
    code: InvocationErrorCode,
    message: String,
}

impl TerminalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::new_with_code(codes::INTERNAL, message)
    }

    pub fn new_with_code(code: impl Into<InvocationErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new_with_code(codes::CANCELLED, "Cancelled")
    }

    pub fn code(&self) -> InvocationErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == codes::CANCELLED
    }
}

impl From<proto::Failure> for TerminalError {
    fn from(value: proto::Failure) -> Self {
        Self {
            code: value.code.into(),
            message: value.message,
        }
    }
}

impl From<TerminalError> for proto::Failure {
    fn from(value: TerminalError) -> Self {
        proto::Failure {
            code: value.code.into(),
            message: value.message,
        }
    }
}

// -- Suspension marker

/// The attempt cannot make progress locally: the input stream is closed while
/// the listed entries are still waiting for a completion.
///
/// This is not a failure. The runtime redelivers the journal on a later attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("suspended waiting on entries {entry_indexes:?}")]
pub struct Suspended {
    pub entry_indexes: Vec<EntryIndex>,
}

// -- Fatal engine errors

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error(
        "journal mismatch at index {index}: the journal recorded {recorded} but the handler issued {issued}. \
    This indicates the handler code is not deterministic"
    )]
    JournalMismatch {
        index: EntryIndex,
        entry_type: EntryType,
        recorded: String,
        issued: String,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("unexpected message {actual:?}, expected {expected}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: MessageType,
    },
    #[error("cannot decode protocol message: {0}")]
    Encoding(#[from] EncodingError),
    #[error("the input stream was closed before the start handshake completed")]
    IncompleteStart,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("the invocation context is being used from more than one task concurrently")]
    ConcurrentUse,
}

impl CoreError {
    pub fn code(&self) -> InvocationErrorCode {
        match self {
            CoreError::JournalMismatch { .. } => codes::JOURNAL_MISMATCH,
            CoreError::ProtocolViolation(_)
            | CoreError::UnexpectedMessage { .. }
            | CoreError::Encoding(_)
            | CoreError::IncompleteStart => codes::PROTOCOL_VIOLATION,
            CoreError::Transport(_) | CoreError::ConcurrentUse => codes::INTERNAL,
        }
    }

    pub(crate) fn related_entry(&self) -> Option<(EntryIndex, EntryType)> {
        match self {
            CoreError::JournalMismatch {
                index, entry_type, ..
            } => Some((*index, *entry_type)),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(&self) -> proto::ErrorMessage {
        let related = self.related_entry();
        proto::ErrorMessage {
            code: self.code().into(),
            message: self.to_string(),
            description: String::new(),
            related_entry_index: related.map(|(index, _)| index),
            related_entry_type: related
                .map(|(_, ty)| u32::from(u16::from(MessageType::from(ty)))),
        }
    }
}

// -- Handler errors

/// Error returned by handler code and by every context operation.
///
/// Any error type converts into it with `?`. The conversion classifies the error: a
/// [`TerminalError`] stays terminal, a [`Suspended`] marker or a [`CoreError`] pass through,
/// everything else is retryable and lets the runtime retry the invocation.
#[derive(Debug)]
pub enum HandlerError {
    Terminal(TerminalError),
    Suspended(Suspended),
    Core(CoreError),
    Retryable(GenericError),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        let message: String = message.into();
        HandlerError::Retryable(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerError::Terminal(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, HandlerError::Suspended(_))
    }

    pub fn as_terminal(&self) -> Option<&TerminalError> {
        match self {
            HandlerError::Terminal(t) => Some(t),
            _ => None,
        }
    }
}

/// Renders the payload of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Terminal(e) => write!(f, "[terminal] {e}"),
            HandlerError::Suspended(e) => fmt::Display::fmt(e, f),
            HandlerError::Core(e) => write!(f, "[fatal] {e}"),
            HandlerError::Retryable(e) => write!(f, "[retryable] {e}"),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let err: GenericError = Box::new(err);
        let err = match err.downcast::<TerminalError>() {
            Ok(terminal) => return HandlerError::Terminal(*terminal),
            Err(err) => err,
        };
        let err = match err.downcast::<Suspended>() {
            Ok(suspended) => return HandlerError::Suspended(*suspended),
            Err(err) => err,
        };
        match err.downcast::<CoreError>() {
            Ok(core) => HandlerError::Core(*core),
            Err(err) => HandlerError::Retryable(err),
        }
    }
}

/// Logs a [`CoreError`] at warn level together with its code.
#[macro_export]
macro_rules! warn_it {
    ($err:expr) => {
        tracing::warn!(error = %$err, restate.error.code = ?$err.code());
    };
    ($err:expr, $($field:tt)*) => {
        tracing::warn!(error = %$err, restate.error.code = ?$err.code(), $($field)*);
    };
}

/// Logs a [`CoreError`] at error level together with its code.
#[macro_export]
macro_rules! error_it {
    ($err:expr) => {
        tracing::error!(error = %$err, restate.error.code = ?$err.code());
    };
    ($err:expr, $($field:tt)*) => {
        tracing::error!(error = %$err, restate.error.code = ?$err.code(), $($field)*);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    use restate_test_util::{assert, assert_eq, let_assert};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn code_display() {
        assert_eq!(codes::CANCELLED.to_string(), "409 Cancelled");
        assert_eq!(InvocationErrorCode::new(599).to_string(), "599");
        assert_eq!(InvocationErrorCode::from(u32::MAX), codes::INTERNAL);
    }

    #[test]
    fn question_mark_classifies_errors() {
        fn terminal() -> Result<(), HandlerError> {
            Err(TerminalError::new_with_code(400u16, "bad"))?;
            Ok(())
        }
        fn retryable() -> Result<(), HandlerError> {
            Err(Boom)?;
            Ok(())
        }
        fn suspended() -> Result<(), HandlerError> {
            Err(Suspended {
                entry_indexes: vec![3],
            })?;
            Ok(())
        }
        fn fatal() -> Result<(), HandlerError> {
            Err(CoreError::ConcurrentUse)?;
            Ok(())
        }

        let_assert!(Err(HandlerError::Terminal(t)) = terminal());
        assert_eq!(t.code(), codes::BAD_REQUEST);
        let_assert!(Err(HandlerError::Retryable(e)) = retryable());
        assert_eq!(e.to_string(), "boom");
        assert!(suspended().unwrap_err().is_suspended());
        let_assert!(Err(HandlerError::Core(CoreError::ConcurrentUse)) = fatal());
    }

    #[test]
    fn mismatch_error_message() {
        let err = CoreError::JournalMismatch {
            index: 2,
            entry_type: EntryType::GetState,
            recorded: "GetState { key: \"x\" }".to_owned(),
            issued: "SetState { key: \"y\" }".to_owned(),
        };
        let msg = err.to_error_message();
        assert_eq!(msg.code, 570);
        assert_eq!(msg.related_entry_index, Some(2));
        assert_eq!(msg.related_entry_type, Some(0x0800));
    }
}
