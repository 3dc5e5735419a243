//! In-process transport used by loopback endpoints.
//!
//! Calls the endpoint emits come straight back as calls from the peer, and the
//! replies it sends come back as replies to its own calls. No bytes leave the
//! process.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::TransportError;
use crate::packet::EventNames;
use crate::transport::{ConnectionId, EventStream, Transport, TransportEvent};

#[derive(Debug)]
pub(crate) struct LoopbackTransport {
    id: ConnectionId,
    names: EventNames,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub(crate) fn new(id: ConnectionId, names: EventNames) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        Self {
            id,
            names,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn emit(&self, event: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let event = if event == self.names.to_target {
            self.names.from_target.clone()
        } else if event == self.names.from_target_return {
            self.names.to_target_return.clone()
        } else {
            event.to_string()
        };

        self.tx
            .send(TransportEvent::Message { event, payload })
            .map_err(|_| TransportError::Closed)
    }

    fn events(&self) -> Result<EventStream, TransportError> {
        let rx = self.rx.lock().take().ok_or(TransportError::AlreadyTaken)?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(TransportEvent::Disconnected);
        }
        Ok(())
    }
}
