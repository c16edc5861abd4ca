//! # Operator Library
//!
//! Push-based stream operators, each a miniature state machine that can
//! persist its internal state and resume mid-stream.
//!
//! ## Operator families
//!
//! - **Stateless / simple**: map, filter, take, scan, distinct-until-changed
//! - **Stateful unary**: aggregate/reduce, the numeric accumulators
//!   (sum/min/max/average and their nullable forms), sequence-equal
//! - **N-ary join**: combine-latest over 2..=16 independently typed inputs
//! - **Buffering/windowing**: count, count+skip, duration, duration+shift,
//!   and the duration+count hybrid ("ferry")
//! - **Higher-order**: group-by, window, select-many, switch, throttle —
//!   operators whose inputs or outputs are themselves streams
//! - **Sources**: timers (one-shot and periodic with catch-up)
//!
//! ## Lifecycle
//!
//! Construct → register with the subscribe context → (optionally) load
//! checkpointed state → `on_start` → notifications flow → exactly one of
//! natural completion, error, or disposal ends the instance. Operators
//! that both receive push notifications and run scheduled tasks guard all
//! state mutation and downstream emission with one per-instance lock, and
//! re-check the disposed flag after acquiring it.

pub mod aggregate;
pub mod base;
pub mod buffer;
pub mod combine_latest;
pub mod distinct;
pub mod filter;
pub mod group_by;
pub mod map;
pub mod numeric;
pub mod scan;
pub mod select_many;
pub mod sequence_equal;
pub mod skip_until;
pub mod switch;
pub mod take;
pub mod throttle;
pub mod timer;
pub mod window;

pub use base::{OperatorBase, OperatorNode};

use std::sync::Arc;

/// Errors surfaced through a stream's terminal `on_error` notification.
///
/// Every fault is terminal for the operator that detects it: there is no
/// retry inside this layer. Upstream faults are forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperatorError {
    /// A reducer requiring at least one element saw none.
    #[error("sequence contains no elements")]
    EmptySequence,

    /// Checked numeric accumulation overflowed its representation.
    #[error("arithmetic overflow in {operator}")]
    Overflow {
        /// The operator that overflowed.
        operator: &'static str,
    },

    /// A user-supplied selector/predicate/combiner reported failure.
    #[error("user function failed: {message}")]
    UserFunction {
        /// Failure description from the user function.
        message: String,
    },

    /// A bounded collection exceeded its configured cap.
    #[error("{resource} limit exceeded: configured maximum is {limit}")]
    ResourceLimit {
        /// The bounded resource.
        resource: &'static str,
        /// The configured limit.
        limit: usize,
    },
}

impl OperatorError {
    /// Builds a user-function fault from any displayable cause.
    pub fn user(message: impl std::fmt::Display) -> Self {
        Self::UserFunction {
            message: message.to_string(),
        }
    }
}

/// A fallible selector from `T` to `R`.
pub type SelectorFn<T, R> = Arc<dyn Fn(&T) -> Result<R, OperatorError> + Send + Sync>;

/// A fallible predicate over `T`.
pub type PredicateFn<T> = Arc<dyn Fn(&T) -> Result<bool, OperatorError> + Send + Sync>;

/// A fallible binary fold of `T` into an accumulator `R`.
pub type FoldFn<R, T> = Arc<dyn Fn(&R, &T) -> Result<R, OperatorError> + Send + Sync>;

/// A fallible equality comparer.
pub type ComparerFn<T> = Arc<dyn Fn(&T, &T) -> Result<bool, OperatorError> + Send + Sync>;
