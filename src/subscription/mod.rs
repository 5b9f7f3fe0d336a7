//! Message fan-out and lifecycle observers
//!
//! This module handles:
//! - Subscribing to inbound message kinds with optional filters
//! - Isolating failing handlers from each other
//! - Token-keyed registration handles for O(1)-ish removal

mod observers;
mod registry;

pub use observers::{LifecycleCallback, Observers, Subscription};
pub use registry::{ConnectionDriver, MessageFilter, MessageHandler, SubscriptionRegistry};
