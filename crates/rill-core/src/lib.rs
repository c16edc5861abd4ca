//! # Rill Core
//!
//! The operator runtime for Rill: composable push-based stream
//! operators that can be checkpointed and resumed mid-stream.
//!
//! This crate provides:
//! - **Subscriptions**: disposable handles with composite, serial,
//!   single-assignment, and ref-counted variants
//! - **Operators**: aggregate, the numeric family, buffer, window,
//!   combine-latest, group-by, select-many, sequence-equal, skip-until,
//!   switch, throttle, timer, plus simple supplements (map, filter,
//!   take, scan, distinct-until-changed)
//! - **State**: an order-sensitive typed blob codec with versioned
//!   headers, driven differentially by per-operator dirty bits
//! - **Time**: a scheduler capability with a deterministic virtual
//!   implementation for tests
//!
//! ## Design Principles
//!
//! 1. **One lock per operator instance** — state mutation and downstream
//!    emission are serialized per operator, never globally
//! 2. **One terminal signal** — downstream observes completion or error,
//!    exactly once, and nothing after
//! 3. **Write order == read order** — state blobs are sequences of typed
//!    fields, replayed in dependency order at recovery
//! 4. **Errors are values** — user functions report failure through
//!    `Result`; operators turn faults into a single terminal `on_error`
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rill_core::ext::SubscribableExt;
//! use rill_core::pipeline::Pipeline;
//! use rill_core::subscribable::SubscribableRef;
//! use rill_core::testing::{test_context, PushSource, RecordingObserver};
//!
//! let (_scheduler, context) = test_context();
//! let source = PushSource::<i64>::new();
//! let batches = (source.clone() as SubscribableRef<i64>).buffer_count(3);
//! let observer = Arc::new(RecordingObserver::new());
//!
//! let pipeline = Pipeline::subscribe(batches.as_ref(), observer.clone(), context);
//! pipeline.start().unwrap();
//!
//! source.push_all([1, 2, 3, 4, 5, 6, 7]);
//! source.complete();
//!
//! assert_eq!(
//!     observer.values(),
//!     vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]
//! );
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod context;
pub mod ext;
pub mod observer;
pub mod operator;
pub mod pipeline;
pub mod scheduler;
pub mod settings;
pub mod state;
pub mod subscribable;
pub mod subscription;
pub mod testing;
pub mod tunnel;

// Re-export key types
pub use context::OperatorContext;
pub use observer::{Notification, Observer, ObserverRef};
pub use operator::OperatorError;
pub use pipeline::{Pipeline, PipelineError, SubscribeContext};
pub use scheduler::{Scheduler, SchedulerRef, Timestamp, VirtualScheduler};
pub use settings::Settings;
pub use state::{CheckpointStore, InMemoryCheckpointStore, StateError, StateReader, StateWriter};
pub use subscribable::{Subscribable, SubscribableRef};
pub use subscription::{Subscription, SubscriptionRef};
pub use tunnel::{Subject, TunnelEnvironment, TunnelRef};

/// Result type for rill-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for rill-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator faults surfaced outside a stream
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// State codec and blob errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Pipeline lifecycle errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),
}
