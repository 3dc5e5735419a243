//! Priority-bucketed middleware chains.
//!
//! Every endpoint has two chains: inbound (calls from the peer and our replies
//! to them) and outbound (calls we issue and the replies we get back). Each
//! chain runs in a before phase, ahead of the transport or dispatch step, and
//! in an after phase, when the reply is shaped.
//!
//! Entries run in ascending priority. Within a priority bucket, entries
//! registered with [`MiddlewareRegistry::before`] come first, then everything
//! else, each group in registration order.

mod context;

pub use context::{Direction, Locals, MAX_ARG_INDEX, MiddlewareContext};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

/// Priority used by the convenience registration methods.
pub const DEFAULT_PRIORITY: i32 = 0;

static NEXT_MIDDLEWARE_ID: AtomicU64 = AtomicU64::new(1);

/// Which phase a middleware participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Only before the transport or dispatch step.
    Before,
    /// Only when shaping replies.
    After,
    /// Both phases.
    Both,
}

impl Phase {
    const fn matches(self, is_after: bool) -> bool {
        match self {
            Self::Before => !is_after,
            Self::After => is_after,
            Self::Both => true,
        }
    }
}

/// Handle returned on registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareId(u64);

/// A transform applied to packets passing through a chain.
///
/// Returning `Some(value)` is shorthand for
/// [`MiddlewareContext::break_with`]`(value)`.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Inspect or transform the packet.
    async fn process(&self, ctx: &mut MiddlewareContext) -> Option<Value>;
}

/// Middleware built from a synchronous closure.
pub struct FnMiddleware<F>(F);

/// Wrap a closure as a [`Middleware`].
pub const fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&mut MiddlewareContext) -> Option<Value> + Send + Sync + 'static,
{
    FnMiddleware(f)
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut MiddlewareContext) -> Option<Value> + Send + Sync + 'static,
{
    async fn process(&self, ctx: &mut MiddlewareContext) -> Option<Value> {
        (self.0)(ctx)
    }
}

#[derive(Clone)]
struct Entry {
    id: MiddlewareId,
    priority: i32,
    phase: Phase,
    early: bool,
    middleware: Arc<dyn Middleware>,
}

/// Registered middleware for one chain.
#[derive(Default)]
pub struct MiddlewareRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl MiddlewareRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `middleware` in bucket `priority` for `phase`.
    pub fn register(
        &self,
        priority: i32,
        phase: Phase,
        middleware: impl Middleware,
    ) -> MiddlewareId {
        self.insert(priority, phase, false, Arc::new(middleware))
    }

    /// Register a before-phase middleware that runs ahead of the other entries
    /// of its bucket.
    pub fn before(&self, priority: i32, middleware: impl Middleware) -> MiddlewareId {
        self.insert(priority, Phase::Before, true, Arc::new(middleware))
    }

    /// Register an after-phase middleware.
    pub fn after(&self, priority: i32, middleware: impl Middleware) -> MiddlewareId {
        self.insert(priority, Phase::After, false, Arc::new(middleware))
    }

    /// Register a middleware that runs in both phases.
    pub fn always(&self, priority: i32, middleware: impl Middleware) -> MiddlewareId {
        self.insert(priority, Phase::Both, false, Arc::new(middleware))
    }

    /// Remove a middleware. Returns whether it was registered here.
    pub fn remove(&self, id: MiddlewareId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Whether `id` is registered here.
    #[must_use]
    pub fn contains(&self, id: MiddlewareId) -> bool {
        self.entries.read().iter().any(|entry| entry.id == id)
    }

    /// Number of registered middleware.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn insert(
        &self,
        priority: i32,
        phase: Phase,
        early: bool,
        middleware: Arc<dyn Middleware>,
    ) -> MiddlewareId {
        let id = MiddlewareId(NEXT_MIDDLEWARE_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push(Entry {
            id,
            priority,
            phase,
            early,
            middleware,
        });
        id
    }

    fn select(&self, is_after: bool, out: &mut Vec<Entry>) {
        out.extend(
            self.entries
                .read()
                .iter()
                .filter(|entry| entry.phase.matches(is_after))
                .cloned(),
        );
    }
}

/// How a chain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Continue with the normal transport or dispatch step.
    Pass,
    /// A middleware supplied an immediate result.
    Broken,
    /// A middleware discarded the packet.
    Dropped,
}

/// One or more registries run as a single chain.
///
/// Layers are merged by priority; for equal keys, earlier layers run first.
/// Server-wide registries are layered ahead of endpoint-specific ones.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    layers: Vec<Arc<MiddlewareRegistry>>,
}

impl Pipeline {
    /// Create a pipeline from its layers.
    #[must_use]
    pub const fn new(layers: Vec<Arc<MiddlewareRegistry>>) -> Self {
        Self { layers }
    }

    /// The registry that accepts new registrations (the last layer).
    #[must_use]
    pub fn own(&self) -> Option<&Arc<MiddlewareRegistry>> {
        self.layers.last()
    }

    fn snapshot(&self, is_after: bool) -> Vec<Entry> {
        let mut entries = Vec::new();
        for layer in &self.layers {
            layer.select(is_after, &mut entries);
        }
        entries.sort_by_key(|entry| (entry.priority, !entry.early));
        entries
    }

    /// Run the chain over `ctx`.
    pub async fn run(&self, ctx: &mut MiddlewareContext) -> Outcome {
        for entry in self.snapshot(ctx.is_after()) {
            if let Some(result) = entry.middleware.process(ctx).await {
                ctx.break_with(result);
            }

            if ctx.is_dropped() {
                trace!(id = %ctx.id(), name = ctx.name(), "packet dropped by middleware");
                return Outcome::Dropped;
            }

            if ctx.take_skip() {
                break;
            }
        }

        if ctx.is_broken() {
            Outcome::Broken
        } else {
            Outcome::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CorrelationId, Packet, Role};
    use parking_lot::Mutex;
    use serde_json::json;

    fn ctx(is_after: bool) -> MiddlewareContext {
        MiddlewareContext::new(
            Packet::new(CorrelationId::generate(), "op", vec![json!(1)]),
            Direction::Outbound,
            is_after,
            Role::Client,
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> impl Middleware {
        let log = Arc::clone(log);
        from_fn(move |_| {
            log.lock().push(tag);
            None
        })
    }

    fn pipeline(registry: &Arc<MiddlewareRegistry>) -> Pipeline {
        Pipeline::new(vec![Arc::clone(registry)])
    }

    #[tokio::test]
    async fn test_priority_and_before_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(MiddlewareRegistry::new());

        registry.register(10, Phase::Both, recorder(&log, "p10-normal"));
        registry.register(0, Phase::Before, recorder(&log, "p0-normal"));
        registry.before(0, recorder(&log, "p0-before-1"));
        registry.before(0, recorder(&log, "p0-before-2"));
        registry.after(0, recorder(&log, "p0-after"));
        registry.register(-5, Phase::Both, recorder(&log, "p-5"));

        pipeline(&registry).run(&mut ctx(false)).await;
        assert_eq!(
            *log.lock(),
            vec![
                "p-5",
                "p0-before-1",
                "p0-before-2",
                "p0-normal",
                "p10-normal"
            ]
        );

        log.lock().clear();
        pipeline(&registry).run(&mut ctx(true)).await;
        assert_eq!(*log.lock(), vec!["p-5", "p0-after", "p10-normal"]);
    }

    #[tokio::test]
    async fn test_drop_aborts_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(MiddlewareRegistry::new());
        registry.always(0, from_fn(|ctx| {
            ctx.drop_packet();
            None
        }));
        registry.always(1, recorder(&log, "after-drop"));

        let outcome = pipeline(&registry).run(&mut ctx(false)).await;
        assert_eq!(outcome, Outcome::Dropped);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_break_lets_later_middleware_observe() {
        let registry = Arc::new(MiddlewareRegistry::new());
        registry.always(0, from_fn(|ctx| {
            ctx.break_with(json!(41));
            None
        }));
        registry.always(1, from_fn(|ctx| {
            let seen = ctx.args()[0].as_i64().unwrap_or_default();
            ctx.set_arg(0, json!(seen + 1));
            None
        }));

        let mut ctx = ctx(false);
        let outcome = pipeline(&registry).run(&mut ctx).await;
        assert_eq!(outcome, Outcome::Broken);
        assert!(ctx.packet().breaked);
        assert_eq!(ctx.args(), &[json!(42)]);
    }

    #[tokio::test]
    async fn test_return_value_is_implicit_break() {
        let registry = Arc::new(MiddlewareRegistry::new());
        registry.before(0, from_fn(|_| Some(json!("cached"))));

        let mut ctx = ctx(false);
        assert_eq!(pipeline(&registry).run(&mut ctx).await, Outcome::Broken);
        assert_eq!(ctx.args(), &[json!("cached")]);
    }

    #[tokio::test]
    async fn test_skip_stops_only_this_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(MiddlewareRegistry::new());
        registry.always(0, from_fn(|ctx| {
            ctx.skip_rest();
            None
        }));
        registry.always(1, recorder(&log, "skipped"));

        let pipeline = pipeline(&registry);
        assert_eq!(pipeline.run(&mut ctx(false)).await, Outcome::Pass);
        assert!(log.lock().is_empty());

        // The skip flag does not leak into the next run.
        let mut second = ctx(true);
        second.add("k", json!(true));
        assert_eq!(pipeline.run(&mut second).await, Outcome::Pass);
        assert_eq!(second.get("k"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_layers_merge_by_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let server = Arc::new(MiddlewareRegistry::new());
        let own = Arc::new(MiddlewareRegistry::new());

        own.always(0, recorder(&log, "own-0"));
        server.always(0, recorder(&log, "server-0"));
        server.always(5, recorder(&log, "server-5"));
        own.before(5, recorder(&log, "own-5-before"));

        let pipeline = Pipeline::new(vec![server, Arc::clone(&own)]);
        pipeline.run(&mut ctx(false)).await;

        assert_eq!(
            *log.lock(),
            vec!["server-0", "own-0", "own-5-before", "server-5"]
        );
        assert!(Arc::ptr_eq(pipeline.own().unwrap(), &own));
    }

    #[test]
    fn test_remove() {
        let registry = MiddlewareRegistry::new();
        let id = registry.always(0, from_fn(|_| None));
        assert!(registry.contains(id));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }
}
