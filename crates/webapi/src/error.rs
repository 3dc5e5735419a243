//! Error types for the webapi protocol.
//!
//! Malformed or unexpected traffic from a peer is never reported through these
//! types: it is logged and discarded. Only failures the local caller can act on
//! surface as [`Error`].

use thiserror::Error;

/// Result type alias for webapi operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for webapi operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Arguments or the outgoing packet for a call could not be encoded.
    #[error("Failed to encode call `{name}`: {source}")]
    Serialization {
        /// Operation name of the call that failed.
        name: String,
        /// The underlying codec error.
        #[source]
        source: CodecError,
    },

    /// Codec errors outside of a named call.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport errors.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handler errors from local dispatch.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// The endpoint was built without a required input.
    #[error("Invalid endpoint configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a codec error as a serialization failure for operation `name`.
    pub fn serialization(name: impl Into<String>, source: CodecError) -> Self {
        Self::Serialization {
            name: name.into(),
            source,
        }
    }
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

impl From<ciborium::de::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// The event stream of a transport was already taken by another endpoint.
    #[error("Transport events already taken")]
    AlreadyTaken,

    /// Transport specific failure.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by application handlers.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// An argument was missing or had the wrong shape.
    #[error("Invalid argument {index}: {reason}")]
    InvalidArgument {
        /// Position of the argument.
        index: usize,
        /// Why the argument was rejected.
        reason: String,
    },

    /// Handler returned an error.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    /// Build an internal handler error from anything printable.
    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::Internal(message.to_string())
    }
}
