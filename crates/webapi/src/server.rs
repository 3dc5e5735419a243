//! Server side: one endpoint per accepted connection, plus broadcast.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{EventBus, Handler, HandlerKey};
use crate::codec::IntoArgs;
use crate::endpoint::{Endpoint, EndpointBuilder, EndpointConfig};
use crate::error::{Error, Result, TransportError};
use crate::middleware::MiddlewareRegistry;
use crate::packet::Role;
use crate::transport::{ConnectionId, Listener, Transport};

/// Per-connection results of a broadcast. `None` marks a connection that did
/// not answer within [`ServerConfig::emit_timeout`].
pub type Broadcast = BTreeMap<ConnectionId, Option<Value>>;

/// Configuration for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a broadcast waits for each connection.
    pub emit_timeout: Duration,
    /// Configuration of the endpoints created for accepted connections.
    pub endpoint: EndpointConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            emit_timeout: Duration::from_secs(5),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the broadcast timeout.
    #[must_use]
    pub const fn emit_timeout(mut self, timeout: Duration) -> Self {
        self.emit_timeout = timeout;
        self
    }

    /// Set the endpoint configuration.
    #[must_use]
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }
}

/// Builds the endpoint for an accepted connection.
///
/// The builder arrives with the server's bus bridge, middleware layers and
/// bookkeeping already applied. Implementations may add to it and must build it.
pub trait ConnectionProcessor: Send + Sync + 'static {
    /// Turn `builder` into the endpoint to register.
    ///
    /// # Errors
    ///
    /// An error rejects the connection.
    fn process(&self, builder: EndpointBuilder) -> Result<Endpoint>;
}

impl<F> ConnectionProcessor for F
where
    F: Fn(EndpointBuilder) -> Result<Endpoint> + Send + Sync + 'static,
{
    fn process(&self, builder: EndpointBuilder) -> Result<Endpoint> {
        (self)(builder)
    }
}

type ConnectionListener = Arc<dyn Fn(&ConnectionId) + Send + Sync>;

/// Builder for [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    bus: Option<EventBus>,
    processor: Option<Arc<dyn ConnectionProcessor>>,
}

impl ServerBuilder {
    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing bus instead of creating one.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Build accepted endpoints with `processor`.
    #[must_use]
    pub fn processor(mut self, processor: impl ConnectionProcessor) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Create the server.
    #[must_use]
    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                bus: self.bus.unwrap_or_default(),
                inbound: Arc::new(MiddlewareRegistry::new()),
                outbound: Arc::new(MiddlewareRegistry::new()),
                connections: DashMap::new(),
                processor: self.processor,
                connect_listeners: RwLock::default(),
                disconnect_listeners: RwLock::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    bus: EventBus,
    inbound: Arc<MiddlewareRegistry>,
    outbound: Arc<MiddlewareRegistry>,
    connections: DashMap<ConnectionId, Endpoint>,
    processor: Option<Arc<dyn ConnectionProcessor>>,
    connect_listeners: RwLock<Vec<ConnectionListener>>,
    disconnect_listeners: RwLock<Vec<ConnectionListener>>,
    shutdown: CancellationToken,
}

impl ServerInner {
    /// Drop the entry for `id` if its endpoint has shut down.
    fn remove(&self, id: &ConnectionId) {
        if self
            .connections
            .remove_if(id, |_, endpoint| endpoint.is_closed())
            .is_some()
        {
            info!(
                connection = %id,
                connections = self.connections.len(),
                "connection removed"
            );
            let listeners = self.disconnect_listeners.read().clone();
            for listener in listeners {
                listener(id);
            }
        }
    }

    fn select(&self, selector: &(dyn Fn(&ConnectionId) -> bool + Send + Sync)) -> Vec<Endpoint> {
        self.connections
            .iter()
            .filter(|entry| selector(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn broadcast(
        &self,
        name: &str,
        args: Vec<Value>,
        targets: Vec<Endpoint>,
    ) -> Result<Broadcast> {
        let window = self.config.emit_timeout;

        let calls = targets.into_iter().map(|endpoint| {
            let name = name.to_string();
            let args = args.clone();
            async move {
                let id = endpoint.connection_id().clone();
                // Spawned so a call that loses the race still runs to completion.
                let mut call = tokio::spawn(async move { endpoint.call(&name, args).await });

                let result = match timeout(window, &mut call).await {
                    Ok(Ok(result)) => result.map(Some),
                    Ok(Err(e)) => {
                        warn!(connection = %id, "broadcast call failed: {}", e);
                        Ok(None)
                    }
                    Err(_) => {
                        debug!(connection = %id, "broadcast timed out");
                        Ok(None)
                    }
                };
                (id, result)
            }
        });

        let mut broadcast = Broadcast::new();
        for (id, result) in join_all(calls).await {
            broadcast.insert(id, result?);
        }
        Ok(broadcast)
    }
}

/// Owns the endpoints of all accepted connections.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("connections", &self.inner.connections.len())
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Server {
    /// Create a server.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        ServerBuilder::default().config(config).build()
    }

    /// Start building a server.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Register a handler that serves calls from every connection.
    pub fn on(&self, name: impl Into<String>, handler: impl Handler) -> HandlerKey {
        self.inner.bus.on(name, handler)
    }

    /// The server-wide bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Inbound middleware applied to every connection.
    #[must_use]
    pub fn inbound(&self) -> &Arc<MiddlewareRegistry> {
        &self.inner.inbound
    }

    /// Outbound middleware applied to every connection.
    #[must_use]
    pub fn outbound(&self) -> &Arc<MiddlewareRegistry> {
        &self.inner.outbound
    }

    /// Call `listener` after a connection is registered.
    pub fn on_connect(&self, listener: impl Fn(&ConnectionId) + Send + Sync + 'static) {
        self.inner.connect_listeners.write().push(Arc::new(listener));
    }

    /// Call `listener` after a connection is removed.
    pub fn on_disconnect(&self, listener: impl Fn(&ConnectionId) + Send + Sync + 'static) {
        self.inner
            .disconnect_listeners
            .write()
            .push(Arc::new(listener));
    }

    fn prepare(&self, transport: Arc<dyn Transport>) -> EndpointBuilder {
        let server: Weak<ServerInner> = Arc::downgrade(&self.inner);
        EndpointBuilder::new(Role::Server)
            .transport(transport)
            .config(self.inner.config.endpoint.clone())
            .bus(self.inner.bus.child())
            .inbound_layer(Arc::clone(&self.inner.inbound))
            .outbound_layer(Arc::clone(&self.inner.outbound))
            .connected()
            .on_disconnect(move |id| {
                if let Some(server) = server.upgrade() {
                    server.remove(id);
                }
            })
    }

    /// Register an accepted connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be built, the connection
    /// processor rejects it or its id is already registered.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> Result<Endpoint> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Closed.into());
        }

        let builder = self.prepare(transport);
        let endpoint = match &self.inner.processor {
            Some(processor) => processor.process(builder)?,
            None => builder.build()?,
        };

        let id = endpoint.connection_id().clone();
        match self.inner.connections.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(connection = %id, "rejecting duplicate connection id");
                tokio::spawn(async move { endpoint.close().await });
                let reason = format!("duplicate connection id `{id}`");
                return Err(TransportError::Other(reason).into());
            }
            Entry::Vacant(entry) => {
                entry.insert(endpoint.clone());
            }
        }

        // The transport may have gone away before the entry existed.
        if endpoint.is_closed() {
            self.inner.remove(&id);
            return Ok(endpoint);
        }

        info!(
            connection = %id,
            connections = self.inner.connections.len(),
            "connection accepted"
        );
        let listeners = self.inner.connect_listeners.read().clone();
        for listener in listeners {
            listener(&id);
        }

        Ok(endpoint)
    }

    /// Accept connections from `listener` until it closes or the server shuts down.
    ///
    /// # Errors
    ///
    /// Currently infallible; accept failures other than a closed listener are
    /// logged and the loop continues.
    pub async fn serve(&self, listener: impl Listener) -> Result<()> {
        info!("server accepting connections");

        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(transport) => {
                        if let Err(e) = self.accept(transport) {
                            warn!("failed to register connection: {}", e);
                        }
                    }
                    Err(TransportError::Closed) => {
                        info!("listener closed");
                        break;
                    }
                    Err(e) => error!("failed to accept connection: {}", e),
                },
            }
        }

        Ok(())
    }

    /// Call `name` on every connection.
    ///
    /// Waits for every connection to answer or reach
    /// [`ServerConfig::emit_timeout`], whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the arguments cannot be encoded.
    #[instrument(skip(self, args))]
    pub async fn emit(&self, name: &str, args: impl IntoArgs) -> Result<Broadcast> {
        let args = args
            .into_args()
            .map_err(|e| Error::serialization(name, e))?;
        let targets = self.inner.select(&|_| true);
        self.inner.broadcast(name, args, targets).await
    }

    /// A view limited to the given connections.
    pub fn to(&self, ids: impl IntoIterator<Item = ConnectionId>) -> Scope {
        Scope::all(self.clone()).to(ids)
    }

    /// A view limited to connections matching `predicate`.
    pub fn filter(
        &self,
        predicate: impl Fn(&ConnectionId) -> bool + Send + Sync + 'static,
    ) -> Scope {
        Scope::all(self.clone()).filter(predicate)
    }

    /// Loopback endpoint wired to the server's bus and middleware.
    ///
    /// Calls on it reach the handlers registered with [`Server::on`] without
    /// any transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint configuration is invalid.
    pub fn local(&self) -> Result<Endpoint> {
        EndpointBuilder::new(Role::Server)
            .config(self.inner.config.endpoint.clone())
            .bus(self.inner.bus.clone())
            .inbound_layer(Arc::clone(&self.inner.inbound))
            .outbound_layer(Arc::clone(&self.inner.outbound))
            .build()
    }

    /// Ids of the registered connections, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// The endpoint of one connection.
    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<Endpoint> {
        self.inner
            .connections
            .get(id)
            .map(|entry| entry.value().clone())
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Stop serving and close every connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let endpoints = self.inner.select(&|_| true);
        info!(connections = endpoints.len(), "shutting down server");
        for endpoint in endpoints {
            endpoint.close().await;
        }
    }
}

type Selector = Arc<dyn Fn(&ConnectionId) -> bool + Send + Sync>;

/// A narrowed view of a server's connections.
///
/// Membership is evaluated when a broadcast is issued, so connections that
/// arrive later are included if they match.
#[derive(Clone)]
pub struct Scope {
    server: Server,
    selector: Selector,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

impl Scope {
    fn all(server: Server) -> Self {
        Self {
            server,
            selector: Arc::new(|_| true),
        }
    }

    /// Narrow further to the given connections.
    #[must_use]
    pub fn to(&self, ids: impl IntoIterator<Item = ConnectionId>) -> Self {
        let ids: HashSet<ConnectionId> = ids.into_iter().collect();
        self.filter(move |id| ids.contains(id))
    }

    /// Narrow further to connections matching `predicate`.
    #[must_use]
    pub fn filter(
        &self,
        predicate: impl Fn(&ConnectionId) -> bool + Send + Sync + 'static,
    ) -> Self {
        let outer = Arc::clone(&self.selector);
        Self {
            server: self.server.clone(),
            selector: Arc::new(move |id| outer(id) && predicate(id)),
        }
    }

    /// Call `name` on every connection in the scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the arguments cannot be encoded.
    #[instrument(skip(self, args))]
    pub async fn emit(&self, name: &str, args: impl IntoArgs) -> Result<Broadcast> {
        let args = args
            .into_args()
            .map_err(|e| Error::serialization(name, e))?;
        let targets = self.server.inner.select(self.selector.as_ref());
        self.server.inner.broadcast(name, args, targets).await
    }

    /// Ids of the connections currently in the scope, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .server
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| (self.selector)(id))
            .collect();
        ids.sort();
        ids
    }

    /// Number of connections currently in the scope.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections().len()
    }

    /// Whether the scope is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Invocation;
    use crate::endpoint::loopback::LoopbackTransport;
    use crate::error::HandlerError;
    use crate::packet::EventNames;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn loopback_transport(id: &str) -> Arc<dyn Transport> {
        let names = EventNames::new(crate::packet::DEFAULT_PREFIX, Role::Server);
        Arc::new(LoopbackTransport::new(ConnectionId::from(id), names))
    }

    #[tokio::test]
    async fn test_local_reaches_server_handlers() {
        let server = Server::default();
        server.on("sum", |inv: Invocation| async move {
            let a: i64 = inv.arg(0)?;
            let b: i64 = inv.arg(1)?;
            Ok::<_, HandlerError>(json!(a + b))
        });

        let local = server.local().unwrap();
        assert_eq!(local.call("sum", (2, 3)).await.unwrap(), json!(5));
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_emit_without_connections() {
        let server = Server::default();
        let result = server.emit("ping", ()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_with_silent_connection() {
        let _ = tracing_subscriber::fmt::try_init();

        let server = Server::new(ServerConfig::default().emit_timeout(Duration::from_millis(200)));

        for id in ["a", "b"] {
            let endpoint = server.accept(loopback_transport(id)).unwrap();
            endpoint.on("ping", move |_inv: Invocation| async move {
                Ok::<_, HandlerError>(json!(id))
            });
        }
        let silent = server.accept(loopback_transport("c")).unwrap();
        silent.on("ping", |_inv: Invocation| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, HandlerError>(json!("too late"))
        });

        let started = Instant::now();
        let result = server.emit("ping", ()).await.unwrap();
        assert!(started.elapsed() <= Duration::from_millis(250));

        let expected: Broadcast = [
            (ConnectionId::from("a"), Some(json!("a"))),
            (ConnectionId::from("b"), Some(json!("b"))),
            (ConnectionId::from("c"), None),
        ]
        .into_iter()
        .collect();
        assert_eq!(result, expected);
    }

    #[tokio::test]
    async fn test_scope_narrows() {
        let server = Server::default();
        for id in ["a", "b", "c"] {
            let endpoint = server.accept(loopback_transport(id)).unwrap();
            endpoint.on("ping", move |_inv: Invocation| async move {
                Ok::<_, HandlerError>(json!(id))
            });
        }

        let scope = server.to([ConnectionId::from("a"), ConnectionId::from("c")]);
        assert_eq!(
            scope.connections(),
            vec![ConnectionId::from("a"), ConnectionId::from("c")]
        );

        let narrower = scope.filter(|id| id.as_str() != "a");
        let result = narrower.emit("ping", ()).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[&ConnectionId::from("c")], Some(json!("c")));
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection() {
        let server = Server::default();
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removed);
        server.on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let endpoint = server.accept(loopback_transport("a")).unwrap();
        assert_eq!(server.len(), 1);
        assert!(server.connection(&ConnectionId::from("a")).is_some());

        endpoint.close().await;
        assert!(server.is_empty());
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        // Removal is idempotent.
        endpoint.close().await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_processor_rejects_connection() {
        let server = Server::builder()
            .processor(|_builder: EndpointBuilder| -> Result<Endpoint> {
                Err(Error::Config("rejected".to_string()))
            })
            .build();

        assert!(server.accept(loopback_transport("a")).is_err());
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let server = Server::default();
        let endpoint = server.accept(loopback_transport("a")).unwrap();

        server.shutdown().await;
        assert!(endpoint.is_closed());
        assert!(server.is_empty());
        assert!(server.accept(loopback_transport("b")).is_err());
    }

    #[tokio::test]
    async fn test_duplicate_connection_id_rejected() {
        let server = Server::default();
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removed);
        server.on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = server.accept(loopback_transport("a")).unwrap();
        let err = server.accept(loopback_transport("a")).unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Other(_))));

        // The rejected endpoint shuts down without evicting the first one.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.len(), 1);
        assert!(!first.is_closed());
        assert_eq!(removed.load(Ordering::SeqCst), 0);

        first.close().await;
        assert!(server.is_empty());
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_can_register_listeners() {
        let server = Server::default();
        let nested = Arc::new(AtomicUsize::new(0));

        let registrar = server.clone();
        let counter = Arc::clone(&nested);
        server.on_connect(move |_| {
            let counter = Arc::clone(&counter);
            registrar.on_disconnect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        let endpoint = server.accept(loopback_transport("a")).unwrap();
        endpoint.close().await;
        assert_eq!(nested.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_processor_connect_listener_fires() {
        let connected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connected);
        let server = Server::builder()
            .processor(move |builder: EndpointBuilder| -> Result<Endpoint> {
                let counter = Arc::clone(&counter);
                builder
                    .on_connect(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .build()
            })
            .build();

        for id in ["a", "b"] {
            server.accept(loopback_transport(id)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connected.load(Ordering::SeqCst), 2);
    }
}
