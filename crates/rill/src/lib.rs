//! # Rill
//!
//! Composable, checkpointable reactive stream operators.
//!
//! Rill is a push-based dataflow runtime: pipelines are built by
//! composing operators over subscribable sequences, and every operator
//! can persist its internal state to a byte-oriented store and resume an
//! equivalent computation later — including open windows and groups,
//! outstanding timers, and partially filled aggregations.
//!
//! # Quick Start
//!
//! ```rust
//! use rill::prelude::*;
//! use std::sync::Arc;
//!
//! let (scheduler, context) = rill::testing::test_context();
//! let source = rill::testing::PushSource::<i64>::new();
//!
//! let running_total = (source.clone() as SubscribableRef<i64>)
//!     .filter(|v: &i64| Ok(*v > 0))
//!     .scan(0i64, |acc: &i64, v: &i64| Ok(acc + v));
//!
//! let observer = Arc::new(rill::testing::RecordingObserver::new());
//! let pipeline = Pipeline::subscribe(running_total.as_ref(), observer.clone(), context);
//! pipeline.start().unwrap();
//!
//! source.push_all([3, -1, 4]);
//! assert_eq!(observer.values(), vec![3, 7]);
//! # let _ = scheduler;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub use rill_core::*;

// Re-export the test surface under the facade too
pub use rill_core::testing;

/// Commonly used types, traits, and functions.
///
/// ```rust,ignore
/// use rill::prelude::*;
/// ```
pub mod prelude {
    pub use rill_core::ext::{switch, SubscribableExt};
    pub use rill_core::observer::{Notification, Observer, ObserverRef};
    pub use rill_core::operator::numeric::Numeric;
    pub use rill_core::operator::OperatorError;
    pub use rill_core::pipeline::Pipeline;
    pub use rill_core::scheduler::{Scheduler, Timestamp, VirtualScheduler};
    pub use rill_core::settings::{keys, Settings};
    pub use rill_core::state::{CheckpointStore, InMemoryCheckpointStore};
    pub use rill_core::subscribable::{Subscribable, SubscribableRef};
    pub use rill_core::subscription::{
        subscribe_callback, subscribe_fn, subscribe_stream, Subscription, SubscriptionRef,
    };
    pub use rill_core::tunnel::{TunnelEnvironment, TunnelRef};
    pub use rill_core::OperatorContext;
}
