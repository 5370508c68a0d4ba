//! Contains the `Error` and `Result` types used throughout the crate.

use std::{fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::{bson::Document, options::ServerAddress};

const RECOVERING_CODES: &[i32] = &[11600, 11602, 13436, 189, 91];
const NOT_PRIMARY_CODES: &[i32] = &[10107, 13435, 10058];
const SHUTTING_DOWN_CODES: &[i32] = &[11600, 91];
const RETRYABLE_WRITE_CODES: &[i32] =
    &[11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262];

/// Error label attached to write errors that may be safely retried once.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Error label attached to transaction errors where the entire transaction may be retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Error label attached to commit errors where the outcome of the commit is unknown.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while using the driver. The inner [`ErrorKind`] is wrapped in an
/// `Arc` to allow errors to be cloned when they must be delivered to several waiters at once.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
    labels: Vec<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
            labels: Vec::new(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn authentication(message: impl Into<String>) -> Self {
        ErrorKind::Authentication {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        ErrorKind::InvalidState {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Self {
        ErrorKind::Transaction {
            message: message.into(),
        }
        .into()
    }

    /// The error used to fail every request still pending on a connection when the connection
    /// encounters a fatal transport or protocol error.
    pub(crate) fn connection_closed(address: &ServerAddress) -> Self {
        ErrorKind::ConnectionClosed {
            message: format!("connection to {} closed", address),
        }
        .into()
    }

    pub(crate) fn pool_closed(address: &ServerAddress) -> Self {
        ErrorKind::ServerUnavailable {
            message: format!("connection pool for {} is closed", address),
        }
        .into()
    }

    /// Whether this error is one of the transport-level errors that make the originating
    /// connection unusable.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionClosed { .. }
        )
    }

    /// Whether this error indicates the selected server is no longer the primary.
    pub(crate) fn is_not_primary(&self) -> bool {
        self.code_and_message()
            .map(|(code, msg)| is_not_primary(code, msg))
            .unwrap_or(false)
    }

    pub(crate) fn is_recovering(&self) -> bool {
        self.code_and_message()
            .map(|(code, msg)| is_recovering(code, msg))
            .unwrap_or(false)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.code_and_message()
            .map(|(code, _)| SHUTTING_DOWN_CODES.contains(&code))
            .unwrap_or(false)
    }

    /// Whether a write that failed with this error is eligible for the single transparent retry
    /// performed by the topology layer.
    pub(crate) fn is_write_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        if self.contains_label(RETRYABLE_WRITE_ERROR) {
            return true;
        }
        match self.code_and_message() {
            Some((code, message)) => {
                RETRYABLE_WRITE_CODES.contains(&code)
                    || is_not_primary(code, message)
                    || is_recovering(code, message)
            }
            None => false,
        }
    }

    /// Whether a failed commitTransaction should be retried once before surfacing the error.
    pub(crate) fn is_commit_retryable(&self) -> bool {
        self.is_write_retryable()
            || matches!(self.kind.as_ref(), ErrorKind::WriteConcern { .. })
    }

    /// Gets the server-reported code/message pair from this error, if it carries one.
    pub(crate) fn code_and_message(&self) -> Option<(i32, &str)> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some((err.code, err.message.as_str())),
            ErrorKind::WriteConcern { ref error, .. } => Some((error.code, error.message.as_str())),
            _ => None,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &[String] {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) if !err.labels.is_empty() => &err.labels,
            _ => &self.labels,
        }
    }

    /// Whether this error carries the specified label.
    pub fn contains_label(&self, label: &str) -> bool {
        self.labels().iter().any(|l| l == label)
    }

    /// Returns a copy of this error with the specified label added.
    pub(crate) fn with_label(mut self, label: &str) -> Self {
        if !self.contains_label(label) {
            self.labels.push(label.to_string());
        }
        self
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into())
    }
}

impl std::ops::Deref for Error {
    type Target = Arc<ErrorKind>;

    fn deref(&self) -> &Self::Target {
        &self.kind
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An I/O error occurred on a connection's underlying transport.
    #[error("{0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an error in response to a command.
    #[error("command failed: {0}")]
    Command(CommandError),

    /// The server acknowledged a write but could not satisfy its write concern.
    #[error("write concern not satisfied: {}", error.message)]
    #[non_exhaustive]
    WriteConcern { error: WriteConcernError },

    /// One or more writes in a batch failed on the server.
    #[error("bulk write failed: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// The bytes received from the server could not be parsed as a wire protocol message.
    /// Fatal to the connection that produced it.
    #[error("invalid server response: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// The connection was closed (transport error, timeout, or explicit shutdown) while
    /// operations were pending on it.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionClosed { message: String },

    /// An operation was attempted against a server whose connection pool is disconnected
    /// or destroyed.
    #[error("no connection available: {message}")]
    #[non_exhaustive]
    ServerUnavailable { message: String },

    /// No server matching the selection criteria became available within the selection
    /// timeout. Distinct from a network error: no eligible server existed, none failed.
    #[error("server selection timed out: {message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A cursor, session, or transaction was used in a state that does not permit the
    /// attempted operation.
    #[error("invalid state: {message}")]
    #[non_exhaustive]
    InvalidState { message: String },

    /// An illegal transaction state transition was attempted.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// An invalid argument was provided to a driver operation.
    #[error("invalid argument: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred during authentication.
    #[error("authentication failed: {message}")]
    #[non_exhaustive]
    Authentication { message: String },

    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(Arc<bson::de::Error>),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(Arc<bson::ser::Error>),
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(Arc::new(err))
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(Arc::new(err))
    }
}

fn is_not_primary(code: i32, message: &str) -> bool {
    if NOT_PRIMARY_CODES.contains(&code) {
        return true;
    }
    if is_recovering(code, message) {
        return false;
    }
    message.contains("not master")
}

fn is_recovering(code: i32, message: &str) -> bool {
    if RECOVERING_CODES.contains(&code) {
        return true;
    }
    message.contains("not master or secondary") || message.contains("node is recovering")
}

/// An error reported by the server in response to a command, i.e. an `{ok: 0}` response body
/// or a legacy `$err` document.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// The error labels that the server returned.
    #[serde(rename = "errorLabels", default)]
    pub labels: Vec<String>,
}

impl CommandError {
    /// Builds a command error from a legacy `$err` sentinel document.
    pub(crate) fn from_legacy_err(message: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            code: code.unwrap_or(0),
            code_name: String::new(),
            message: message.into(),
            labels: Vec::new(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "({}): {}", self.code_name, self.message)
    }
}

/// An error that occurred due to the server being unable to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo", default)]
    pub details: Option<Document>,
}

/// An item-level failure within a batched write, carrying the index of the write it
/// corresponds to.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// Index into the list of operations that this error corresponds to.
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,
}

/// The aggregated outcome of a batched write that partially failed: item-level failures,
/// an optional write concern error, and the count of writes that did succeed.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The item-level error(s) that occurred.
    pub write_errors: Vec<BulkWriteError>,

    /// The error that occurred on account of write concern failure, if any.
    pub write_concern_error: Option<WriteConcernError>,

    /// How many writes in the batch were applied despite the failure.
    pub successful_writes: u64,
}
