//! Duplex transport abstraction.
//!
//! A transport carries named events between exactly two peers. Endpoints take
//! the event stream once and read it until it ends; the end of the stream is
//! treated as a disconnect.

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// Identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a random connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Something that happened on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established.
    Connected,
    /// A named event arrived from the peer.
    Message {
        /// Event name.
        event: String,
        /// Raw payload.
        payload: Bytes,
    },
    /// The connection is gone. No further events follow.
    Disconnected,
}

/// Boxed stream of transport events.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// A duplex channel to one peer.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Identity of this connection.
    fn id(&self) -> &ConnectionId;

    /// Send a named event to the peer.
    async fn emit(&self, event: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Take the stream of incoming events.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadyTaken`] if the stream was taken before.
    fn events(&self) -> Result<EventStream, TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Source of newly accepted connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next connection.
    ///
    /// # Errors
    ///
    /// Returns an error once the listener is closed.
    async fn accept(&self) -> Result<Arc<dyn Transport>, TransportError>;
}
