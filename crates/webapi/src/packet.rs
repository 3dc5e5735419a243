//! Wire packet, correlation ids and event naming.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Protocol version carried by every packet. Packets with any other version are discarded.
pub const PROTOCOL_VERSION: u32 = 2;

/// Default prefix for the transport event names.
pub const DEFAULT_PREFIX: &str = "webApi";

/// Free-form per-call metadata carried on the wire.
pub type Meta = Map<String, Value>;

/// Opaque token linking a call to its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id from a random v4 UUID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The only record that crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Protocol version, must equal [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Correlation id of the call.
    pub id: CorrelationId,
    /// Operation name.
    pub name: String,
    /// Positional call arguments, or the reply value(s).
    pub args: Vec<Value>,
    /// Per-call metadata.
    #[serde(default)]
    pub meta: Meta,
    /// Set when a middleware short-circuited the call with an immediate result.
    #[serde(default)]
    pub breaked: bool,
}

impl Packet {
    /// Build a packet for the current protocol version with empty metadata.
    pub fn new(id: CorrelationId, name: impl AsRef<str>, args: Vec<Value>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            name: name.as_ref().trim().to_string(),
            args,
            meta: Meta::new(),
            breaked: false,
        }
    }

    /// Build a reply packet for this call carrying `args`.
    #[must_use]
    pub fn reply(&self, args: Vec<Value>) -> Self {
        Self::new(self.id.clone(), &self.name, args)
    }

    /// Whether this packet is well formed for the current protocol version.
    #[must_use]
    pub fn check(&self) -> bool {
        self.version == PROTOCOL_VERSION && !self.id.is_empty() && !self.name.trim().is_empty()
    }

    /// Collapse reply arguments into the value handed to a caller.
    ///
    /// No arguments is an empty result, a single argument is unwrapped and
    /// anything longer is returned as an array.
    #[must_use]
    pub fn into_result(self) -> Value {
        collapse(self.args)
    }
}

pub(crate) fn collapse(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.pop().unwrap_or(Value::Null),
        _ => Value::Array(args),
    }
}

/// Which side of a connection an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Connecting side.
    Client,
    /// Accepting side.
    Server,
}

impl Role {
    /// The role on the other end of the connection.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }

    /// Whether this is the server role.
    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }

    const fn tag(self) -> char {
        match self {
            Self::Client => 'c',
            Self::Server => 's',
        }
    }
}

/// The four transport event names an endpoint uses.
///
/// Names are a pure function of prefix and role: calls issued by a role travel
/// on `{prefix}|{role}|c` and their replies on `{prefix}|{role}|r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNames {
    /// Outgoing calls.
    pub to_target: String,
    /// Replies to our outgoing calls.
    pub to_target_return: String,
    /// Incoming calls from the peer.
    pub from_target: String,
    /// Our replies to the peer's calls.
    pub from_target_return: String,
}

impl EventNames {
    /// Derive the event names for `role` under `prefix`.
    #[must_use]
    pub fn new(prefix: &str, role: Role) -> Self {
        let name = |role: Role, call: bool| {
            format!("{prefix}|{}|{}", role.tag(), if call { 'c' } else { 'r' })
        };

        Self {
            to_target: name(role, true),
            to_target_return: name(role, false),
            from_target: name(role.peer(), true),
            from_target_return: name(role.peer(), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_new_packet_defaults() {
        let packet = Packet::new("abc".into(), "  sum ", vec![json!(1)]);

        assert_eq!(packet.version, PROTOCOL_VERSION);
        assert_eq!(packet.name, "sum");
        assert!(packet.meta.is_empty());
        assert!(!packet.breaked);
        assert!(packet.check());
    }

    #[test]
    fn test_check_rejects_empty_fields() {
        let mut packet = Packet::new("abc".into(), "sum", vec![]);
        packet.name = "   ".to_string();
        assert!(!packet.check());

        let packet = Packet::new(CorrelationId::from(""), "sum", vec![]);
        assert!(!packet.check());
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_into_result() {
        let packet = Packet::new("a".into(), "x", vec![]);
        assert_eq!(packet.into_result(), Value::Null);

        let packet = Packet::new("a".into(), "x", vec![json!([1, 2])]);
        assert_eq!(packet.into_result(), json!([1, 2]));

        let packet = Packet::new("a".into(), "x", vec![json!(1), json!("b")]);
        assert_eq!(packet.into_result(), json!([1, "b"]));
    }

    #[test]
    fn test_event_names_pair_up() {
        let client = EventNames::new(DEFAULT_PREFIX, Role::Client);
        let server = EventNames::new(DEFAULT_PREFIX, Role::Server);

        assert_eq!(client.to_target, "webApi|c|c");
        assert_eq!(client.to_target, server.from_target);
        assert_eq!(client.to_target_return, server.from_target_return);
        assert_eq!(server.to_target, client.from_target);
        assert_eq!(server.to_target_return, client.from_target_return);

        // A side never listens on its own outbound name.
        assert_ne!(client.to_target, client.from_target);
        assert_ne!(server.to_target, server.from_target);
    }

    proptest! {
        #[test]
        fn test_check_rejects_other_versions(
            version in any::<u32>().prop_filter("other version", |v| *v != PROTOCOL_VERSION),
            name in "[a-z]{1,12}",
        ) {
            let mut packet = Packet::new(CorrelationId::generate(), &name, vec![json!(1)]);
            prop_assert!(packet.check());
            packet.version = version;
            prop_assert!(!packet.check());
        }
    }
}
