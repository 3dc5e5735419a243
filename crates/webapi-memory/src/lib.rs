//! In-memory transport implementation for testing
//!
//! Routes events between two endpoints within the same process. Useful for
//! tests and for embedders that run both sides of a connection locally.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_webapi::{ConnectionId, EventStream, Listener, Transport, TransportError, TransportEvent};
use tracing::{debug, info};

/// One end of an in-memory duplex connection.
pub struct MemoryTransport {
    id: ConnectionId,
    peer_tx: flume::Sender<TransportEvent>,
    self_tx: flume::Sender<TransportEvent>,
    receiver: Mutex<Option<flume::Receiver<TransportEvent>>>,
    closed: Arc<AtomicBool>,
    sent: AtomicUsize,
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("sent", &self.sent_count())
            .finish()
    }
}

impl MemoryTransport {
    /// Create two connected ends sharing a freshly generated connection id.
    ///
    /// Both ends report `Connected` first, so endpoints built on them are
    /// ready as soon as their event readers start.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        Self::pair_with_id(ConnectionId::generate())
    }

    /// Create two connected ends with the given connection id.
    #[must_use]
    pub fn pair_with_id(id: ConnectionId) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();

        // Unbounded and freshly created, so these cannot fail.
        let _ = a_tx.send(TransportEvent::Connected);
        let _ = b_tx.send(TransportEvent::Connected);

        let closed = Arc::new(AtomicBool::new(false));

        let a = Self {
            id: id.clone(),
            peer_tx: b_tx.clone(),
            self_tx: a_tx.clone(),
            receiver: Mutex::new(Some(a_rx)),
            closed: Arc::clone(&closed),
            sent: AtomicUsize::new(0),
        };
        let b = Self {
            id: id.clone(),
            peer_tx: a_tx,
            self_tx: b_tx,
            receiver: Mutex::new(Some(b_rx)),
            closed,
            sent: AtomicUsize::new(0),
        };

        debug!(connection = %id, "memory connection pair created");

        (Arc::new(a), Arc::new(b))
    }

    /// Number of messages this end has emitted.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    /// Whether either end has closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn emit(&self, event: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        debug!(
            "Memory connection {} sending {} bytes on {}",
            self.id,
            payload.len(),
            event
        );

        self.peer_tx
            .send_async(TransportEvent::Message {
                event: event.to_string(),
                payload,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn events(&self) -> Result<EventStream, TransportError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken)?;
        Ok(Box::pin(receiver.into_stream()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing memory connection {}", self.id);
            let _ = self.self_tx.send(TransportEvent::Disconnected);
            let _ = self.peer_tx.send(TransportEvent::Disconnected);
        }
        Ok(())
    }
}

/// Accepts in-memory connections made through its [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryListener {
    incoming_rx: flume::Receiver<Arc<MemoryTransport>>,
}

/// Opens connections to a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    incoming_tx: flume::Sender<Arc<MemoryTransport>>,
}

impl MemoryListener {
    /// Create a listener and the connector that reaches it.
    ///
    /// The listener reports [`TransportError::Closed`] once every connector
    /// has been dropped.
    #[must_use]
    pub fn bind() -> (Self, MemoryConnector) {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        (Self { incoming_rx }, MemoryConnector { incoming_tx })
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = self
            .incoming_rx
            .recv_async()
            .await
            .map_err(|_| TransportError::Closed)?;

        info!("Memory connection {} accepted", transport.id());
        Ok(transport)
    }
}

impl MemoryConnector {
    /// Open a connection and return the client end.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the listener has been dropped.
    pub fn connect(&self) -> Result<Arc<MemoryTransport>, TransportError> {
        let (client, server) = MemoryTransport::pair();
        self.incoming_tx
            .send(server)
            .map_err(|_| TransportError::Closed)?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryTransport::pair();
        let mut events = b.events().unwrap();

        a.emit("x", Bytes::from_static(b"1")).await.unwrap();
        a.emit("y", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(a.sent_count(), 2);

        assert!(matches!(events.next().await, Some(TransportEvent::Connected)));
        match events.next().await {
            Some(TransportEvent::Message { event, payload }) => {
                assert_eq!(event, "x");
                assert_eq!(payload, Bytes::from_static(b"1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events.next().await,
            Some(TransportEvent::Message { event, .. }) if event == "y"
        ));
    }

    #[tokio::test]
    async fn test_close_disconnects_both_ends() {
        let (a, b) = MemoryTransport::pair();
        let mut a_events = a.events().unwrap();
        let mut b_events = b.events().unwrap();

        b.close().await.unwrap();
        assert!(a.is_closed());
        assert!(matches!(
            a.emit("x", Bytes::new()).await,
            Err(TransportError::Closed)
        ));

        for events in [&mut a_events, &mut b_events] {
            assert!(matches!(events.next().await, Some(TransportEvent::Connected)));
            assert!(matches!(
                events.next().await,
                Some(TransportEvent::Disconnected)
            ));
        }
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let (a, _b) = MemoryTransport::pair();
        assert!(a.events().is_ok());
        assert!(matches!(a.events(), Err(TransportError::AlreadyTaken)));
    }

    #[tokio::test]
    async fn test_listener_accepts_connector() {
        let (listener, connector) = MemoryListener::bind();
        let client = connector.connect().unwrap();

        let server = listener.accept().await.unwrap();
        assert_eq!(server.id(), client.id());

        drop(connector);
        assert!(matches!(listener.accept().await, Err(TransportError::Closed)));
    }
}
