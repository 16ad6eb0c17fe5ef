//! Reactive side: the pure message router and the bounded task queue.

mod queue;
mod route;

pub use queue::{EnqueueResult, Queue, QueueStats, SlotGuard};
pub use route::{RouteKind, RoutingDecision, classify_tier, route_message};
