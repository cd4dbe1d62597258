//! # Error Definitions
//!
//! The central ledger of every failure a runner call can surface, and the wire
//! form used to carry it across a channel.
//!
//! ## Philosophy
//!
//! - **One Taxonomy**: every layer (channel, handshake, connect protocol,
//!   environments, transfer plugins) reports through the same `Error` so a
//!   caller can match on one type.
//! - **Never Flatten**: aggregate failures keep every contributing cause in
//!   `original_errors`, recursively, on both sides of the wire.
//! - **Tagged Disconnects**: a closed connection always says *why* it closed.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Why a connection stopped being usable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    /// The channel was never run, or the handshake has not completed.
    ConnectionNotYetEstablished,
    /// The transport reported a failure.
    ConnectionError,
    /// The peer went away without a protocol-level goodbye.
    ConnectionLost,
    /// The underlying endpoint was moved to another owner.
    ConnectionTransferred,
    /// The owning resolver was destroyed.
    ResolverDestroyed,
    /// The host-side runner instance was destroyed.
    RunnerDestroyed,
    /// This proxy was disconnected from its runner.
    RunnerDisconnected,
    /// Control of this proxy was handed to another context.
    RunnerTransferred,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ConnectionNotYetEstablished => "connection not yet established",
            Self::ConnectionError => "connection error",
            Self::ConnectionLost => "connection lost",
            Self::ConnectionTransferred => "connection transferred",
            Self::ResolverDestroyed => "resolver destroyed",
            Self::RunnerDestroyed => "runner destroyed",
            Self::RunnerDisconnected => "runner disconnected",
            Self::RunnerTransferred => "runner transferred",
        };
        f.write_str(text)
    }
}

/// Wire discriminator for `Error` variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionClosed,
    RunnerNotFound,
    RunnerInitError,
    RunnerExecuteError,
    RunnerDestroyError,
    DataTransferError,
    CommonStrategyError,
    UnexpectedError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::RunnerNotFound => "RUNNER_NOT_FOUND",
            Self::RunnerInitError => "RUNNER_INIT_ERROR",
            Self::RunnerExecuteError => "RUNNER_EXECUTE_ERROR",
            Self::RunnerDestroyError => "RUNNER_DESTROY_ERROR",
            Self::DataTransferError => "DATA_TRANSFER_ERROR",
            Self::CommonStrategyError => "COMMON_STRATEGY_ERROR",
            Self::UnexpectedError => "UNEXPECTED_ERROR",
        }
    }

    /// Parses a wire code. Unknown codes yield `None`.
    pub fn parse(code: &str) -> Option<Self> {
        let code = match code {
            "CONNECTION_CLOSED" => Self::ConnectionClosed,
            "RUNNER_NOT_FOUND" => Self::RunnerNotFound,
            "RUNNER_INIT_ERROR" => Self::RunnerInitError,
            "RUNNER_EXECUTE_ERROR" => Self::RunnerExecuteError,
            "RUNNER_DESTROY_ERROR" => Self::RunnerDestroyError,
            "DATA_TRANSFER_ERROR" => Self::DataTransferError,
            "COMMON_STRATEGY_ERROR" => Self::CommonStrategyError,
            "UNEXPECTED_ERROR" => Self::UnexpectedError,
            _ => return None,
        };
        Some(code)
    }

    /// Human-facing error class name carried in `SerializedError::name`.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::ConnectionClosed => "ConnectionClosedError",
            Self::RunnerNotFound => "RunnerNotFoundError",
            Self::RunnerInitError => "RunnerInitError",
            Self::RunnerExecuteError => "RunnerExecuteError",
            Self::RunnerDestroyError => "RunnerDestroyError",
            Self::DataTransferError => "DataTransferError",
            Self::CommonStrategyError => "CommonStrategyError",
            Self::UnexpectedError => "UnexpectedError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message, optional stack and nested causes of a failure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Failure {
    pub message: String,
    pub stack: Option<String>,
    pub original_errors: Vec<Error>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            original_errors: Vec::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<Error>) -> Self {
        self.original_errors = errors;
        self
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An operation needed a channel that has been torn down.
    ConnectionClosed { reason: DisconnectReason, message: String },
    /// No runner is registered under the requested token.
    RunnerNotFound(Failure),
    /// The runner constructor (or its argument transfer) failed.
    RunnerInit(Failure),
    /// A runner method (or its argument transfer) failed.
    RunnerExecute(Failure),
    /// The runner destructor or the teardown of its arguments failed.
    RunnerDestroy(Failure),
    /// No plugin could process a value, or a collection transfer partially failed.
    DataTransfer(Failure),
    /// The handshake found no mutually supported connection strategy.
    CommonStrategy(Failure),
    /// Anything not classified above.
    Unexpected(Failure),
}

impl Error {
    pub fn connection_closed(reason: DisconnectReason, message: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason,
            message: message.into(),
        }
    }

    pub fn runner_not_found(token: &str) -> Self {
        Self::RunnerNotFound(Failure::new(format!(
            "runner with token \"{}\" is not registered",
            token
        )))
    }

    pub fn data_transfer(message: impl Into<String>) -> Self {
        Self::DataTransfer(Failure::new(message))
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(Failure::new(message))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionClosed { .. } => ErrorCode::ConnectionClosed,
            Self::RunnerNotFound(_) => ErrorCode::RunnerNotFound,
            Self::RunnerInit(_) => ErrorCode::RunnerInitError,
            Self::RunnerExecute(_) => ErrorCode::RunnerExecuteError,
            Self::RunnerDestroy(_) => ErrorCode::RunnerDestroyError,
            Self::DataTransfer(_) => ErrorCode::DataTransferError,
            Self::CommonStrategy(_) => ErrorCode::CommonStrategyError,
            Self::Unexpected(_) => ErrorCode::UnexpectedError,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ConnectionClosed { message, .. } => message,
            other => other.failure().map(|f| f.message.as_str()).unwrap_or_default(),
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::ConnectionClosed { .. } => None,
            Self::RunnerNotFound(f)
            | Self::RunnerInit(f)
            | Self::RunnerExecute(f)
            | Self::RunnerDestroy(f)
            | Self::DataTransfer(f)
            | Self::CommonStrategy(f)
            | Self::Unexpected(f) => Some(f),
        }
    }

    /// Nested causes of an aggregate error. Empty for leaf errors.
    pub fn original_errors(&self) -> &[Error] {
        self.failure()
            .map(|f| f.original_errors.as_slice())
            .unwrap_or_default()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            Self::ConnectionClosed { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }

    /// Converts a failure raised by user runner code.
    ///
    /// A crate `Error` propagated with `?` keeps its identity as the single
    /// cause; anything else becomes a leaf carrying the full context chain.
    pub fn from_runner(error: anyhow::Error, wrap: fn(Failure) -> Error) -> Self {
        match error.downcast::<Error>() {
            Ok(inner) => wrap(Failure::new(inner.to_string()).with_errors(vec![inner])),
            Err(other) => wrap(Failure::new(format!("{:#}", other))),
        }
    }

    /// Appends further causes, e.g. failed cleanups after the main failure.
    pub fn with_original_errors(mut self, extra: Vec<Error>) -> Self {
        match &mut self {
            Self::ConnectionClosed { .. } => {}
            Self::RunnerNotFound(f)
            | Self::RunnerInit(f)
            | Self::RunnerExecute(f)
            | Self::RunnerDestroy(f)
            | Self::DataTransfer(f)
            | Self::CommonStrategy(f)
            | Self::Unexpected(f) => f.original_errors.extend(extra),
        }
        self
    }

    pub fn to_serialized(&self) -> SerializedError {
        let code = self.code();
        let (stack, original_errors) = match self.failure() {
            Some(f) => (
                f.stack.clone(),
                f.original_errors.iter().map(Error::to_serialized).collect(),
            ),
            None => (None, Vec::new()),
        };

        SerializedError {
            error_code: code.as_str().to_string(),
            name: code.error_name().to_string(),
            message: self.message().to_string(),
            stack,
            original_errors,
            reason: self.disconnect_reason(),
        }
    }

    /// Rebuilds an error received from a peer.
    ///
    /// Unknown codes fall back to `Unexpected`, keeping message and stack.
    pub fn from_serialized(serialized: SerializedError) -> Self {
        let SerializedError {
            error_code,
            message,
            stack,
            original_errors,
            reason,
            ..
        } = serialized;

        let failure = Failure {
            message,
            stack,
            original_errors: original_errors.into_iter().map(Error::from_serialized).collect(),
        };

        match ErrorCode::parse(&error_code) {
            Some(ErrorCode::ConnectionClosed) => Self::ConnectionClosed {
                reason: reason.unwrap_or(DisconnectReason::ConnectionLost),
                message: failure.message,
            },
            Some(ErrorCode::RunnerNotFound) => Self::RunnerNotFound(failure),
            Some(ErrorCode::RunnerInitError) => Self::RunnerInit(failure),
            Some(ErrorCode::RunnerExecuteError) => Self::RunnerExecute(failure),
            Some(ErrorCode::RunnerDestroyError) => Self::RunnerDestroy(failure),
            Some(ErrorCode::DataTransferError) => Self::DataTransfer(failure),
            Some(ErrorCode::CommonStrategyError) => Self::CommonStrategy(failure),
            Some(ErrorCode::UnexpectedError) | None => Self::Unexpected(failure),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed { reason, message } => {
                write!(f, "Connection closed ({}): {}", reason, message)
            }
            Self::RunnerNotFound(fl) => write!(f, "Runner not found: {}", fl.message),
            Self::RunnerInit(fl) => write!(f, "Runner init error: {}", fl.message),
            Self::RunnerExecute(fl) => write!(f, "Runner execute error: {}", fl.message),
            Self::RunnerDestroy(fl) => write!(f, "Runner destroy error: {}", fl.message),
            Self::DataTransfer(fl) => write!(f, "Data transfer error: {}", fl.message),
            Self::CommonStrategy(fl) => write!(f, "Common strategy error: {}", fl.message),
            Self::Unexpected(fl) => write!(f, "Unexpected error: {}", fl.message),
        }?;

        let nested = self.original_errors().len();
        if nested > 0 {
            write!(f, " ({} nested error{})", nested, if nested == 1 { "" } else { "s" })?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::unexpected(format!("malformed payload: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serde shape of an `Error` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub error_code: String,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub original_errors: Vec<SerializedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DisconnectReason>,
}

/// Merges independent teardown results into their errors, in order.
pub(crate) fn collect_errors(results: impl IntoIterator<Item = Result<()>>) -> Vec<Error> {
    results.into_iter().filter_map(|r| r.err()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_survives_the_wire() {
        let error = Error::RunnerExecute(Failure::new("batch failed").with_errors(vec![
            Error::data_transfer("argument 3 could not be transferred"),
            Error::connection_closed(DisconnectReason::RunnerDestroyed, "gone"),
        ]));

        let json = serde_json::to_value(error.to_serialized()).unwrap();
        assert_eq!(json["errorCode"], "RUNNER_EXECUTE_ERROR");
        assert_eq!(json["name"], "RunnerExecuteError");
        assert_eq!(json["originalErrors"].as_array().unwrap().len(), 2);

        let back: SerializedError = serde_json::from_value(json).unwrap();
        let rebuilt = Error::from_serialized(back);
        assert_eq!(rebuilt, error);
        assert_eq!(
            rebuilt.original_errors()[1].disconnect_reason(),
            Some(DisconnectReason::RunnerDestroyed)
        );
    }

    #[test]
    fn test_unknown_code_falls_back_to_unexpected() {
        let serialized = SerializedError {
            error_code: "SOMETHING_NEW".into(),
            name: "SomethingNewError".into(),
            message: "boom".into(),
            stack: Some("at line 1".into()),
            original_errors: Vec::new(),
            reason: None,
        };

        match Error::from_serialized(serialized) {
            Error::Unexpected(failure) => {
                assert_eq!(failure.message, "boom");
                assert_eq!(failure.stack.as_deref(), Some("at line 1"));
            }
            other => panic!("expected unexpected error, got {:?}", other),
        }
    }

    #[test]
    fn test_runner_failure_keeps_crate_errors() {
        let inner = Error::connection_closed(DisconnectReason::ConnectionLost, "peer vanished");
        let wrapped = Error::from_runner(anyhow::Error::new(inner.clone()), Error::RunnerExecute);
        assert_eq!(wrapped.code(), ErrorCode::RunnerExecuteError);
        assert_eq!(wrapped.original_errors(), &[inner]);

        let plain = Error::from_runner(anyhow::anyhow!("division by zero"), Error::RunnerExecute);
        assert_eq!(plain.message(), "division by zero");
        assert!(plain.original_errors().is_empty());
    }
}
