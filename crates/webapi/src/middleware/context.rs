use std::collections::HashMap;

use serde_json::Value;

use crate::packet::{CorrelationId, Meta, Packet, Role};
use crate::transport::ConnectionId;

/// Highest index [`MiddlewareContext::set_arg`] pads the arguments up to.
pub const MAX_ARG_INDEX: usize = 255;

/// Side-channel values attached to a call. They travel with the call through
/// middleware and dispatch but are never sent to the peer.
pub type Locals = HashMap<String, Value>;

/// Which chain a packet is passing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Calls from the peer and the replies we send for them.
    Inbound,
    /// Calls we issue and the replies the peer sends for them.
    Outbound,
}

/// Mutable view of one packet passing through a middleware chain.
#[derive(Debug)]
pub struct MiddlewareContext {
    packet: Packet,
    direction: Direction,
    is_after: bool,
    role: Role,
    connection_id: Option<ConnectionId>,
    locals: Locals,
    dropped: bool,
    broken: bool,
    skip: bool,
}

impl MiddlewareContext {
    /// Create a context for `packet`.
    #[must_use]
    pub fn new(packet: Packet, direction: Direction, is_after: bool, role: Role) -> Self {
        Self {
            packet,
            direction,
            is_after,
            role,
            connection_id: None,
            locals: Locals::new(),
            dropped: false,
            broken: false,
            skip: false,
        }
    }

    /// Attach the connection the packet belongs to.
    #[must_use]
    pub fn with_connection(mut self, connection_id: Option<ConnectionId>) -> Self {
        self.connection_id = connection_id;
        self
    }

    /// Seed the side-channel values.
    #[must_use]
    pub fn with_locals(mut self, locals: Locals) -> Self {
        self.locals = locals;
        self
    }

    /// Correlation id of the packet.
    #[must_use]
    pub const fn id(&self) -> &CorrelationId {
        &self.packet.id
    }

    /// Operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.packet.name
    }

    /// Current arguments.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.packet.args
    }

    /// Replace all arguments.
    pub fn set_args(&mut self, args: Vec<Value>) {
        self.packet.args = args;
    }

    /// Replace the argument at `index`, padding with nulls if needed.
    ///
    /// Returns `false` without touching the arguments if padding would go
    /// past [`MAX_ARG_INDEX`].
    pub fn set_arg(&mut self, index: usize, value: Value) -> bool {
        if let Some(slot) = self.packet.args.get_mut(index) {
            *slot = value;
            return true;
        }
        if index > MAX_ARG_INDEX {
            return false;
        }
        self.packet.args.resize(index, Value::Null);
        self.packet.args.push(value);
        true
    }

    /// Wire metadata.
    #[must_use]
    pub const fn meta(&self) -> &Meta {
        &self.packet.meta
    }

    /// Mutable wire metadata.
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.packet.meta
    }

    /// The packet as it currently stands.
    #[must_use]
    pub const fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Store a side-channel value.
    pub fn add(&mut self, key: impl Into<String>, value: Value) {
        self.locals.insert(key.into(), value);
    }

    /// Remove a side-channel value.
    pub fn del(&mut self, key: &str) -> Option<Value> {
        self.locals.remove(key)
    }

    /// Read a side-channel value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.locals.get(key)
    }

    /// Discard the packet: nothing is sent, dispatched or replied.
    pub fn drop_packet(&mut self) {
        self.dropped = true;
    }

    /// Short-circuit the call with `result`.
    ///
    /// Remaining middleware in this chain still runs, but the transport or
    /// dispatch step that would follow is skipped.
    pub fn break_with(&mut self, result: Value) {
        self.packet.breaked = true;
        self.packet.args = vec![result];
        self.broken = true;
    }

    /// Stop running the remaining middleware of this chain.
    pub fn skip_rest(&mut self) {
        self.skip = true;
    }

    /// Whether the packet was dropped.
    #[must_use]
    pub const fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Whether a middleware short-circuited the packet in this chain run.
    #[must_use]
    pub const fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether this is the after phase (reply shaping).
    #[must_use]
    pub const fn is_after(&self) -> bool {
        self.is_after
    }

    /// Whether this is the before phase.
    #[must_use]
    pub const fn is_before(&self) -> bool {
        !self.is_after
    }

    /// Chain direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Role of the local endpoint.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Whether the local endpoint is the server side.
    #[must_use]
    pub const fn is_server(&self) -> bool {
        self.role.is_server()
    }

    /// Connection the packet belongs to, if any.
    #[must_use]
    pub const fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    pub(crate) fn take_skip(&mut self) -> bool {
        std::mem::replace(&mut self.skip, false)
    }

    pub(crate) fn into_parts(self) -> (Packet, Locals) {
        (self.packet, self.locals)
    }
}
