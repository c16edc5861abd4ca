//! # Subscribable Sequences
//!
//! A [`Subscribable`] is an immutable description of a stream computation
//! and a factory for subscriptions: stateless itself, created once per
//! pipeline definition, shared by every subscription derived from it.
//!
//! Subscribing wires the operator chain eagerly (each operator registers
//! itself with the [`SubscribeContext`](crate::pipeline::SubscribeContext)
//! and subscribes to its sources), but nothing flows until the pipeline
//! is started — the gap is where checkpointed state is loaded.

use std::sync::Arc;

use crate::observer::ObserverRef;
use crate::pipeline::SubscribeContext;
use crate::subscription::SubscriptionRef;

/// An immutable stream definition; a factory for subscriptions.
pub trait Subscribable<T: Send + 'static>: Send + Sync {
    /// Creates a live operator chain feeding `output`.
    ///
    /// Implementations register every stateful node they create with
    /// `ctx` (in creation order, so node keys are stable across
    /// identically shaped pipelines) and return the handle that tears
    /// the chain down.
    fn subscribe(&self, output: ObserverRef<T>, ctx: &mut SubscribeContext) -> SubscriptionRef;

    /// Returns the tunnel URI when this sequence is an addressable inner
    /// stream, letting higher-order operators persist a reference to it.
    fn tunnel_uri(&self) -> Option<String> {
        None
    }
}

/// Shared handle to a subscribable sequence.
pub type SubscribableRef<T> = Arc<dyn Subscribable<T>>;
