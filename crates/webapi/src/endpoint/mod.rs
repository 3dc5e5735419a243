//! Connection-scoped protocol engine.
//!
//! An [`Endpoint`] is bound to one transport. It turns local calls into
//! packets sent to the peer and waits for the correlated reply, and it
//! dispatches the peer's calls to the handlers on its [`EventBus`] and sends
//! back their results.
//!
//! Every call resolves: with the peer's reply, with a middleware short-circuit,
//! or with an empty result once it is dropped, times out or the connection
//! goes away. Only a local serialization failure is returned as an error.

pub(crate) mod loopback;
mod pending;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, interval, timeout_at};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, trace, warn};

use crate::bus::{EventBus, Handler, HandlerKey, Invocation};
use crate::codec::{CborCodec, IntoArgs, PacketCodec};
use crate::error::{Error, Result, TransportError};
use crate::middleware::{Direction, MiddlewareContext, MiddlewareRegistry, Outcome, Pipeline};
use crate::packet::{CorrelationId, DEFAULT_PREFIX, EventNames, Meta, Packet, Role, collapse};
use crate::transport::{ConnectionId, EventStream, Transport, TransportEvent};

use loopback::LoopbackTransport;
use pending::PendingCalls;

/// Meta key under which handler failures are reported in a reply.
pub const ERROR_META_KEY: &str = "error";

/// Configuration for an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Prefix of the transport event names.
    pub prefix: String,
    /// Default time to wait for a reply.
    pub call_timeout: Duration,
    /// How often abandoned calls are garbage collected.
    pub sweep_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            call_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl EndpointConfig {
    /// Set the event name prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the default call timeout.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides [`EndpointConfig::call_timeout`].
    pub timeout: Option<Duration>,
    /// Metadata merged into the outgoing packet.
    pub meta: Meta,
}

impl CallOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout for this call.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

/// How a call was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The peer replied.
    Replied,
    /// A middleware supplied the result without a network round trip.
    Broken,
    /// A middleware discarded the call or its reply.
    Dropped,
    /// No reply arrived before the deadline.
    TimedOut,
    /// The connection closed before a reply arrived.
    Disconnected,
}

/// Result of a call together with how it was obtained.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Returned value; `null` when there is none.
    pub value: Value,
    /// Metadata of the reply packet.
    pub meta: Meta,
    /// How the call was resolved.
    pub outcome: CallOutcome,
}

impl Reply {
    pub(crate) fn empty(outcome: CallOutcome) -> Self {
        Self {
            value: Value::Null,
            meta: Meta::new(),
            outcome,
        }
    }

    fn from_packet(packet: Packet, outcome: CallOutcome) -> Self {
        Self {
            meta: packet.meta,
            value: collapse(packet.args),
            outcome,
        }
    }
}

type ConnectionListener = Arc<dyn Fn(&ConnectionId) + Send + Sync>;

/// Builder for [`Endpoint`].
///
/// Everything an endpoint needs is supplied here, including middleware
/// registries shared with a server, so a built endpoint is never reconfigured.
pub struct EndpointBuilder {
    role: Role,
    transport: Option<Arc<dyn Transport>>,
    connection_id: Option<ConnectionId>,
    config: EndpointConfig,
    codec: Arc<dyn PacketCodec>,
    bus: Option<EventBus>,
    inbound_layers: Vec<Arc<MiddlewareRegistry>>,
    outbound_layers: Vec<Arc<MiddlewareRegistry>>,
    connected: bool,
    connect_listeners: Vec<ConnectionListener>,
    disconnect_listeners: Vec<ConnectionListener>,
}

impl EndpointBuilder {
    /// Start building an endpoint playing `role`.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            transport: None,
            connection_id: None,
            config: EndpointConfig::default(),
            codec: Arc::new(CborCodec),
            bus: None,
            inbound_layers: Vec::new(),
            outbound_layers: Vec::new(),
            connected: false,
            connect_listeners: Vec::new(),
            disconnect_listeners: Vec::new(),
        }
    }

    /// Bind the endpoint to a transport. Without one it runs in loopback mode.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Name the connection of a loopback endpoint.
    #[must_use]
    pub fn connection_id(mut self, id: ConnectionId) -> Self {
        self.connection_id = Some(id);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the packet codec.
    #[must_use]
    pub fn codec(mut self, codec: impl PacketCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Dispatch incoming calls to `bus`.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Run `registry` ahead of the endpoint's own inbound middleware.
    #[must_use]
    pub fn inbound_layer(mut self, registry: Arc<MiddlewareRegistry>) -> Self {
        self.inbound_layers.push(registry);
        self
    }

    /// Run `registry` ahead of the endpoint's own outbound middleware.
    #[must_use]
    pub fn outbound_layer(mut self, registry: Arc<MiddlewareRegistry>) -> Self {
        self.outbound_layers.push(registry);
        self
    }

    /// Treat the connection as established without waiting for the transport
    /// to report it.
    #[must_use]
    pub const fn connected(mut self) -> Self {
        self.connected = true;
        self
    }

    /// Call `listener` once the connection is established. Endpoints that
    /// start connected call it right after they are built.
    #[must_use]
    pub fn on_connect(mut self, listener: impl Fn(&ConnectionId) + Send + Sync + 'static) -> Self {
        self.connect_listeners.push(Arc::new(listener));
        self
    }

    /// Call `listener` once the endpoint is torn down.
    #[must_use]
    pub fn on_disconnect(
        mut self,
        listener: impl Fn(&ConnectionId) + Send + Sync + 'static,
    ) -> Self {
        self.disconnect_listeners.push(Arc::new(listener));
        self
    }

    /// Build the endpoint and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the transport's
    /// event stream was already taken.
    pub fn build(self) -> Result<Endpoint> {
        if self.config.sweep_interval.is_zero() {
            return Err(Error::Config("sweep interval must be non-zero".to_string()));
        }
        if self.config.prefix.is_empty() || self.config.prefix.contains('|') {
            return Err(Error::Config(format!(
                "invalid event prefix `{}`",
                self.config.prefix
            )));
        }

        let names = EventNames::new(&self.config.prefix, self.role);

        let (transport, connected): (Arc<dyn Transport>, bool) = match self.transport {
            Some(transport) => (transport, self.connected),
            None => {
                let id = self
                    .connection_id
                    .unwrap_or_else(|| ConnectionId::from("local"));
                (Arc::new(LoopbackTransport::new(id, names.clone())), true)
            }
        };
        let events = transport.events()?;

        let own_inbound = Arc::new(MiddlewareRegistry::new());
        let mut inbound_layers = self.inbound_layers;
        inbound_layers.push(Arc::clone(&own_inbound));
        let own_outbound = Arc::new(MiddlewareRegistry::new());
        let mut outbound_layers = self.outbound_layers;
        outbound_layers.push(Arc::clone(&own_outbound));

        let shutdown = CancellationToken::new();
        let (connected_tx, _) = watch::channel(connected);

        let inner = Arc::new(Inner {
            role: self.role,
            connection_id: transport.id().clone(),
            names,
            config: self.config,
            codec: self.codec,
            bus: self.bus.unwrap_or_default(),
            inbound: Pipeline::new(inbound_layers),
            outbound: Pipeline::new(outbound_layers),
            own_inbound,
            own_outbound,
            pending: PendingCalls::default(),
            transport,
            connected: connected_tx,
            shutdown: shutdown.clone(),
            closed: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            connect_listeners: RwLock::new(self.connect_listeners),
            disconnect_listeners: RwLock::new(self.disconnect_listeners),
        });

        debug!(
            connection = %inner.connection_id,
            role = ?inner.role,
            "endpoint started"
        );

        tokio::spawn(run_events(Arc::clone(&inner), events));
        tokio::spawn(run_sweep(
            Arc::downgrade(&inner),
            shutdown.clone(),
            inner.config.sweep_interval,
        ));

        Ok(Endpoint {
            inner,
            _guard: Arc::new(shutdown.drop_guard()),
        })
    }
}

struct Inner {
    role: Role,
    connection_id: ConnectionId,
    names: EventNames,
    config: EndpointConfig,
    codec: Arc<dyn PacketCodec>,
    bus: EventBus,
    inbound: Pipeline,
    outbound: Pipeline,
    own_inbound: Arc<MiddlewareRegistry>,
    own_outbound: Arc<MiddlewareRegistry>,
    pending: PendingCalls,
    transport: Arc<dyn Transport>,
    connected: watch::Sender<bool>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    notified: AtomicBool,
    connect_listeners: RwLock<Vec<ConnectionListener>>,
    disconnect_listeners: RwLock<Vec<ConnectionListener>>,
}

/// One side of a connection.
///
/// Cloning is cheap. When the last clone is dropped the endpoint shuts down
/// and closes its transport.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("connection_id", &self.inner.connection_id)
            .field("role", &self.inner.role)
            .field("pending_calls", &self.inner.pending.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Start building an endpoint.
    #[must_use]
    pub fn builder(role: Role) -> EndpointBuilder {
        EndpointBuilder::new(role)
    }

    /// Client endpoint over `transport` with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport's event stream was already taken.
    pub fn client(transport: Arc<dyn Transport>) -> Result<Self> {
        EndpointBuilder::new(Role::Client).transport(transport).build()
    }

    /// Call `name` on the peer and wait for its result.
    ///
    /// Resolves to `null` when the call times out, is dropped by middleware or
    /// the connection closes. Use [`Endpoint::call_with`] to tell these apart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the arguments or the packet cannot be encoded.
    pub async fn call(&self, name: &str, args: impl IntoArgs) -> Result<Value> {
        Ok(self.call_with(name, args, CallOptions::default()).await?.value)
    }

    /// Call `name` on the peer with per-call options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the arguments or the packet cannot be encoded.
    #[instrument(skip(self, args, options), fields(connection = %self.inner.connection_id))]
    pub async fn call_with(
        &self,
        name: &str,
        args: impl IntoArgs,
        options: CallOptions,
    ) -> Result<Reply> {
        let inner = &self.inner;
        let args = args
            .into_args()
            .map_err(|e| Error::serialization(name, e))?;

        let mut packet = Packet::new(CorrelationId::generate(), name, args);
        packet.meta.extend(options.meta);

        let mut ctx = inner.context(packet, Direction::Outbound, false);
        let outcome = inner.outbound.run(&mut ctx).await;
        let (packet, locals) = ctx.into_parts();

        match outcome {
            Outcome::Dropped => return Ok(Reply::empty(CallOutcome::Dropped)),
            Outcome::Broken => return Ok(Reply::from_packet(packet, CallOutcome::Broken)),
            Outcome::Pass => {}
        }

        if inner.is_closed() {
            debug!(id = %packet.id, "call on closed endpoint");
            return Ok(Reply::empty(CallOutcome::Disconnected));
        }

        let payload = inner
            .codec
            .encode(&packet)
            .map_err(|e| Error::serialization(name, e))?;

        let id = packet.id;
        let deadline = deadline_after(options.timeout.unwrap_or(inner.config.call_timeout));
        let mut reply_rx = inner.pending.insert(id.clone(), deadline, locals);

        trace!(%id, "sending call");
        if let Err(e) = inner.transport.emit(&inner.names.to_target, payload).await {
            warn!(%id, "failed to send call: {}", e);
            inner
                .pending
                .resolve(&id, Reply::empty(CallOutcome::Disconnected));
        }

        match timeout_at(deadline, &mut reply_rx).await {
            Ok(reply) => Ok(reply.unwrap_or_else(|_| Reply::empty(CallOutcome::Disconnected))),
            Err(_) => {
                if inner
                    .pending
                    .resolve(&id, Reply::empty(CallOutcome::TimedOut))
                {
                    debug!(%id, "call timed out");
                }
                // Whichever resolution won is already in the channel.
                Ok(reply_rx
                    .await
                    .unwrap_or_else(|_| Reply::empty(CallOutcome::TimedOut)))
            }
        }
    }

    /// Register a handler for calls from the peer.
    pub fn on(&self, name: impl Into<String>, handler: impl Handler) -> HandlerKey {
        self.inner.bus.on(name, handler)
    }

    /// The bus incoming calls are dispatched to.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// This endpoint's own inbound middleware.
    #[must_use]
    pub fn inbound(&self) -> &Arc<MiddlewareRegistry> {
        &self.inner.own_inbound
    }

    /// This endpoint's own outbound middleware.
    #[must_use]
    pub fn outbound(&self) -> &Arc<MiddlewareRegistry> {
        &self.inner.own_outbound
    }

    /// Wait until the transport reports the connection established.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the endpoint shuts down first.
    pub async fn ready(&self) -> Result<()> {
        let mut connected = self.inner.connected.subscribe();
        tokio::select! {
            result = connected.wait_for(|connected| *connected) => {
                result.map(|_| ()).map_err(|_| TransportError::Closed.into())
            }
            () = self.inner.shutdown.cancelled() => Err(TransportError::Closed.into()),
        }
    }

    /// Call `listener` once the connection is established.
    ///
    /// Listeners added after that are not called.
    pub fn on_connect(&self, listener: impl Fn(&ConnectionId) + Send + Sync + 'static) {
        self.inner.connect_listeners.write().push(Arc::new(listener));
    }

    /// Call `listener` when the endpoint is torn down.
    pub fn on_disconnect(&self, listener: impl Fn(&ConnectionId) + Send + Sync + 'static) {
        self.inner
            .disconnect_listeners
            .write()
            .push(Arc::new(listener));
    }

    /// Shut down, fail pending calls and close the transport.
    pub async fn close(&self) {
        self.inner.teardown();
        if let Err(e) = self.inner.transport.close().await {
            debug!(connection = %self.inner.connection_id, "error closing transport: {}", e);
        }
    }

    /// Identity of the connection.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    /// Role of this endpoint.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Event names used on the transport.
    #[must_use]
    pub fn event_names(&self) -> &EventNames {
        &self.inner.names
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether the transport has reported the connection established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Whether the endpoint has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Inner {
    fn context(&self, packet: Packet, direction: Direction, is_after: bool) -> MiddlewareContext {
        MiddlewareContext::new(packet, direction, is_after, self.role)
            .with_connection(Some(self.connection_id.clone()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Listeners only run on the first connection signal.
    fn mark_connected(&self) {
        self.connected.send_replace(true);
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(connection = %self.connection_id, "connected");
        let listeners = self.connect_listeners.read().clone();
        for listener in listeners {
            listener(&self.connection_id);
        }
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        self.connected.send_replace(false);
        let failed = self.pending.fail_all(CallOutcome::Disconnected);
        info!(
            connection = %self.connection_id,
            failed_calls = failed,
            "disconnected"
        );

        let listeners = self.disconnect_listeners.read().clone();
        for listener in listeners {
            listener(&self.connection_id);
        }
    }

    async fn send(&self, event: &str, packet: &Packet) {
        let payload = match self.codec.encode(packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id = %packet.id, name = %packet.name, "failed to encode reply: {}", e);
                return;
            }
        };

        if let Err(e) = self.transport.emit(event, payload).await {
            warn!(id = %packet.id, "failed to send reply: {}", e);
        }
    }

    /// A call arrived from the peer.
    async fn handle_call(self: Arc<Self>, payload: Bytes) {
        let packet = match self.codec.decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(connection = %self.connection_id, "discarding undecodable call: {}", e);
                return;
            }
        };

        let mut ctx = self.context(packet, Direction::Inbound, false);
        let outcome = self.inbound.run(&mut ctx).await;
        let (packet, locals) = ctx.into_parts();

        match outcome {
            Outcome::Dropped => return,
            Outcome::Broken => {
                // The context already carries the break result and flag.
                self.send(&self.names.from_target_return, &packet).await;
                return;
            }
            Outcome::Pass => {}
        }

        if !packet.check() {
            debug!(id = %packet.id, version = packet.version, "discarding malformed call");
            return;
        }

        let invocation = Invocation {
            name: packet.name.clone(),
            args: packet.args.clone(),
            meta: packet.meta.clone(),
            locals: locals.clone(),
            packet_id: Some(packet.id.clone()),
            connection_id: Some(self.connection_id.clone()),
            role: Some(self.role),
        };
        let results = self.bus.emit_ex(invocation).await;

        let mut errors = Vec::new();
        let values = results
            .into_iter()
            .map(|(key, result)| {
                result.unwrap_or_else(|e| {
                    warn!(
                        id = %packet.id,
                        name = %packet.name,
                        handler = %key,
                        "handler failed: {}",
                        e
                    );
                    errors.push(Value::String(e.to_string()));
                    Value::Null
                })
            })
            .collect();

        let mut reply = packet.reply(values);
        if !errors.is_empty() {
            reply
                .meta
                .insert(ERROR_META_KEY.to_string(), Value::Array(errors));
        }

        let mut ctx = self
            .context(reply, Direction::Inbound, true)
            .with_locals(locals);
        if self.inbound.run(&mut ctx).await == Outcome::Dropped {
            return;
        }
        let (reply, _) = ctx.into_parts();

        self.send(&self.names.from_target_return, &reply).await;
    }

    /// The peer replied to one of our calls.
    async fn handle_reply(self: Arc<Self>, payload: Bytes) {
        let packet = match self.codec.decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(connection = %self.connection_id, "discarding undecodable reply: {}", e);
                return;
            }
        };

        let id = packet.id.clone();
        let Some(locals) = self.pending.locals(&id) else {
            debug!(%id, "reply for unknown or expired call");
            return;
        };

        let mut ctx = self
            .context(packet, Direction::Outbound, true)
            .with_locals(locals);
        let outcome = self.outbound.run(&mut ctx).await;
        let (packet, _) = ctx.into_parts();

        let reply = match outcome {
            Outcome::Dropped => Reply::empty(CallOutcome::Dropped),
            _ if !packet.check() => {
                debug!(%id, version = packet.version, "discarding malformed reply");
                return;
            }
            Outcome::Broken => Reply::from_packet(packet, CallOutcome::Broken),
            Outcome::Pass if packet.breaked => Reply::from_packet(packet, CallOutcome::Broken),
            Outcome::Pass => Reply::from_packet(packet, CallOutcome::Replied),
        };

        if !self.pending.resolve(&id, reply) {
            debug!(%id, "reply arrived after the call was resolved");
        }
    }
}

async fn run_events(inner: Arc<Inner>, mut events: EventStream) {
    if *inner.connected.borrow() {
        inner.mark_connected();
    }

    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(TransportEvent::Connected) => inner.mark_connected(),
                Some(TransportEvent::Message { event, payload }) => {
                    if event == inner.names.from_target {
                        tokio::spawn(Arc::clone(&inner).handle_call(payload));
                    } else if event == inner.names.to_target_return {
                        tokio::spawn(Arc::clone(&inner).handle_reply(payload));
                    } else {
                        trace!(connection = %inner.connection_id, %event, "ignoring event");
                    }
                }
                Some(TransportEvent::Disconnected) | None => break,
            },
        }
    }

    inner.teardown();
    if let Err(e) = inner.transport.close().await {
        debug!(connection = %inner.connection_id, "error closing transport: {}", e);
    }
}

/// `Instant::now() + timeout`, or roughly 30 years from now if that overflows.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

async fn run_sweep(inner: Weak<Inner>, shutdown: CancellationToken, every: Duration) {
    let mut ticker = interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let expired = inner.pending.sweep(Instant::now());
                if expired > 0 {
                    debug!(connection = %inner.connection_id, expired, "swept timed out calls");
                }
            }
        }
    }
}
