//! Bidirectional remote-call protocol over any duplex message transport.
//!
//! Either side of a connection can call a named operation on the other and
//! await the correlated reply. Middleware on both sides can observe, rewrite,
//! short-circuit or drop every packet, and a server can broadcast one call to
//! all of its connections under a shared deadline.
//!
//! # Features
//!
//! - **Correlated calls**: every call carries a unique id and resolves exactly once
//! - **Middleware**: priority-ordered before/after chains for both directions
//! - **Timeouts**: per-endpoint defaults, per-call overrides and a deadline sweep
//! - **Broadcast**: fan a call out to many connections and collect per-connection results
//! - **Loopback**: call local handlers with the same semantics as a remote peer
//! - **Pluggable wire format**: CBOR by default, JSON available
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use proven_webapi::{Endpoint, Invocation, HandlerError, Server, Transport};
//! use serde_json::json;
//!
//! async fn example(
//!     server_side: Arc<dyn Transport>,
//!     client_side: Arc<dyn Transport>,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::default();
//!     server.on("sum", |inv: Invocation| async move {
//!         let a: i64 = inv.arg(0)?;
//!         let b: i64 = inv.arg(1)?;
//!         Ok::<_, HandlerError>(json!(a + b))
//!     });
//!     server.accept(server_side)?;
//!
//!     let client = Endpoint::client(client_side)?;
//!     client.ready().await?;
//!     assert_eq!(client.call("sum", (2, 3)).await?, json!(5));
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod middleware;
pub mod packet;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use bus::{EventBus, Handler, HandlerKey, Invocation};
pub use codec::{CborCodec, IntoArgs, JsonCodec, PacketCodec};
pub use endpoint::{CallOptions, CallOutcome, Endpoint, EndpointBuilder, EndpointConfig, Reply};
pub use error::{CodecError, Error, HandlerError, Result, TransportError};
pub use middleware::{
    Direction, Middleware, MiddlewareContext, MiddlewareId, MiddlewareRegistry, Phase, from_fn,
};
pub use packet::{CorrelationId, EventNames, PROTOCOL_VERSION, Packet, Role};
pub use server::{Broadcast, ConnectionProcessor, Scope, Server, ServerBuilder, ServerConfig};
pub use transport::{ConnectionId, EventStream, Listener, Transport, TransportEvent};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use serde_json::Value;
