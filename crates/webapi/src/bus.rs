//! Local handler registry that incoming calls are dispatched to.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::HandlerError;
use crate::middleware::Locals;
use crate::packet::{CorrelationId, Meta, Role};
use crate::transport::ConnectionId;

static NEXT_HANDLER_KEY: AtomicU64 = AtomicU64::new(1);

/// Identifies one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey(u64);

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Everything a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Operation name.
    pub name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Wire metadata of the call.
    pub meta: Meta,
    /// Side-channel values set by middleware.
    pub locals: Locals,
    /// Correlation id when the call came from a peer.
    pub packet_id: Option<CorrelationId>,
    /// Connection the call arrived on.
    pub connection_id: Option<ConnectionId>,
    /// Role of the endpoint dispatching the call.
    pub role: Option<Role>,
}

impl Invocation {
    /// Create an invocation with no call context.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
            meta: Meta::new(),
            locals: Locals::new(),
            packet_id: None,
            connection_id: None,
            role: None,
        }
    }

    /// Deserialize the argument at `index`.
    ///
    /// A missing argument is read as `null`, so optional parameters can be
    /// declared as `Option<T>`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidArgument`] if the value does not fit `T`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| HandlerError::InvalidArgument {
            index,
            reason: e.to_string(),
        })
    }
}

/// Serves calls for one operation name.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle a call.
    async fn handle(&self, invocation: Invocation) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, invocation: Invocation) -> Result<Value, HandlerError> {
        (self)(invocation).await
    }
}

struct Subscription {
    key: HandlerKey,
    name: String,
    handler: Arc<dyn Handler>,
}

#[derive(Default)]
struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    parent: Option<EventBus>,
}

/// Publish/subscribe registry for application handlers.
///
/// A bus created with [`EventBus::child`] forwards every publish to its parent
/// as well, so handlers registered on a server-wide bus see calls arriving on
/// every connection.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.inner.subscriptions.read().len())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

/// Per-handler results of one publish, in subscription order.
pub type DispatchResults = IndexMap<HandlerKey, Result<Value, HandlerError>>;

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus bridged into this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::default(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Subscribe `handler` to `name`.
    pub fn on(&self, name: impl Into<String>, handler: impl Handler) -> HandlerKey {
        let key = HandlerKey(NEXT_HANDLER_KEY.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.write().push(Subscription {
            key,
            name: name.into(),
            handler: Arc::new(handler),
        });
        key
    }

    /// Remove a subscription from this bus. Returns whether it existed.
    pub fn off(&self, key: HandlerKey) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.key != key);
        subscriptions.len() != before
    }

    /// Number of handlers reachable for `name`, parents included.
    #[must_use]
    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers_for(name).len()
    }

    fn handlers_for(&self, name: &str) -> Vec<(HandlerKey, Arc<dyn Handler>)> {
        let mut handlers: Vec<_> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.name == name)
            .map(|s| (s.key, Arc::clone(&s.handler)))
            .collect();

        if let Some(parent) = &self.inner.parent {
            handlers.extend(parent.handlers_for(name));
        }

        handlers
    }

    /// Publish to every subscriber of `invocation.name` and collect their results.
    pub async fn emit_ex(&self, invocation: Invocation) -> DispatchResults {
        let handlers = self.handlers_for(&invocation.name);

        let calls = handlers.iter().map(|(_, handler)| {
            let invocation = invocation.clone();
            async move { handler.handle(invocation).await }
        });
        let results = join_all(calls).await;

        handlers
            .into_iter()
            .map(|(key, _)| key)
            .zip(results)
            .collect()
    }
}
