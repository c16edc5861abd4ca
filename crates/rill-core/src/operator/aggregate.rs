//! Stateful unary operators over a single accumulator.
//!
//! One engine covers the whole family: an [`UnaryAccumulator`] absorbs
//! each upstream value under the operator lock (setting the dirty bit),
//! and produces the single downstream value at upstream completion — or
//! an empty-sequence/overflow fault, per the accumulator's policy. The
//! numeric accumulators live in [`super::numeric`]; this module provides
//! the engine plus the general-purpose seeded ([`aggregate`]) and
//! unseeded ([`reduce`]) folds.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::{FoldFn, OperatorError};
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// Accumulation strategy for a stateful unary operator.
///
/// Implementations hold the running state; the engine owns locking,
/// lifecycle, and persistence framing. `save`/`load` must write and read
/// the same fields in the same order.
pub trait UnaryAccumulator: Send + 'static {
    /// Upstream element type.
    type In: Send + 'static;
    /// Downstream result type.
    type Out: Send + 'static;

    /// Operator name, used for node keys and state-blob headers.
    const NAME: &'static str;

    /// Absorbs one upstream value.
    ///
    /// # Errors
    ///
    /// Overflow and user-function faults terminate the operator.
    fn accumulate(&mut self, value: &Self::In) -> Result<(), OperatorError>;

    /// Produces the final value at upstream completion.
    ///
    /// # Errors
    ///
    /// [`OperatorError::EmptySequence`] for reducers that need at least
    /// one element.
    fn finish(&self) -> Result<Self::Out, OperatorError>;

    /// Writes the accumulator state fields.
    fn save(&self, writer: &mut StateWriter);

    /// Reads the accumulator state fields, in write order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on truncated or malformed blobs.
    fn load(&mut self, reader: &mut StateReader) -> Result<(), StateError>;
}

/// A sequence folding its source through an [`UnaryAccumulator`].
pub struct UnaryFold<A: UnaryAccumulator> {
    source: SubscribableRef<A::In>,
    factory: Arc<dyn Fn() -> A + Send + Sync>,
}

impl<A: UnaryAccumulator> UnaryFold<A> {
    /// Creates the fold; `factory` builds a fresh accumulator per
    /// subscription.
    pub fn new(
        source: SubscribableRef<A::In>,
        factory: Arc<dyn Fn() -> A + Send + Sync>,
    ) -> Self {
        Self { source, factory }
    }
}

impl<A: UnaryAccumulator> Subscribable<A::Out> for UnaryFold<A> {
    fn subscribe(
        &self,
        output: ObserverRef<A::Out>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let op = Arc::new(UnaryFoldOp {
            base: OperatorBase::new(A::NAME, 1, ctx.operator_context().clone()),
            output,
            acc: Mutex::new((self.factory)()),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct UnaryFoldOp<A: UnaryAccumulator> {
    base: OperatorBase,
    output: ObserverRef<A::Out>,
    acc: Mutex<A>,
    upstream: SingleAssignmentSubscription,
}

impl<A: UnaryAccumulator> UnaryFoldOp<A> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
    }
}

impl<A: UnaryAccumulator> Observer<A::In> for UnaryFoldOp<A> {
    fn on_next(&self, value: A::In) {
        let mut acc = self.acc.lock();
        if self.base.is_disposed() {
            return;
        }
        match acc.accumulate(&value) {
            Ok(()) => self.base.mark_dirty(),
            Err(error) => {
                self.output.on_error(error);
                drop(acc);
                self.terminate();
            }
        }
    }

    fn on_error(&self, error: OperatorError) {
        if self.base.is_disposed() {
            return;
        }
        self.output.on_error(error);
        self.terminate();
    }

    fn on_completed(&self) {
        let acc = self.acc.lock();
        if self.base.is_disposed() {
            return;
        }
        match acc.finish() {
            Ok(result) => {
                self.output.on_next(result);
                self.output.on_completed();
            }
            Err(error) => self.output.on_error(error),
        }
        drop(acc);
        self.terminate();
    }
}

impl<A: UnaryAccumulator> OperatorNode for UnaryFoldOp<A> {
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn dispose(&self) {
        self.terminate();
    }

    fn is_disposed(&self) -> bool {
        self.base.is_disposed()
    }

    fn state_changed(&self) -> bool {
        self.base.is_dirty()
    }

    fn mark_saved(&self) {
        self.base.mark_saved();
    }

    fn save_state(&self, writer: &mut StateWriter) -> Result<(), StateError> {
        self.acc.lock().save(writer);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        self.acc.lock().load(reader)
    }
}

/// Seeded fold accumulator: always has a value, never empty-faults.
pub struct SeededFold<T, R> {
    acc: R,
    fold: FoldFn<R, T>,
}

impl<T, R> UnaryAccumulator for SeededFold<T, R>
where
    T: Send + 'static,
    R: Clone + Send + StateValue + 'static,
{
    type In = T;
    type Out = R;

    const NAME: &'static str = "rill/aggregate";

    fn accumulate(&mut self, value: &T) -> Result<(), OperatorError> {
        self.acc = (self.fold)(&self.acc, value)?;
        Ok(())
    }

    fn finish(&self) -> Result<R, OperatorError> {
        Ok(self.acc.clone())
    }

    fn save(&self, writer: &mut StateWriter) {
        writer.write(&self.acc);
    }

    fn load(&mut self, reader: &mut StateReader) -> Result<(), StateError> {
        self.acc = reader.read()?;
        Ok(())
    }
}

/// Unseeded fold accumulator: the first value seeds it; empty sources
/// fault with [`OperatorError::EmptySequence`].
pub struct UnseededFold<T> {
    current: Option<T>,
    fold: FoldFn<T, T>,
}

impl<T> UnaryAccumulator for UnseededFold<T>
where
    T: Clone + Send + StateValue + 'static,
{
    type In = T;
    type Out = T;

    const NAME: &'static str = "rill/reduce";

    fn accumulate(&mut self, value: &T) -> Result<(), OperatorError> {
        self.current = Some(match &self.current {
            Some(acc) => (self.fold)(acc, value)?,
            None => value.clone(),
        });
        Ok(())
    }

    fn finish(&self) -> Result<T, OperatorError> {
        self.current.clone().ok_or(OperatorError::EmptySequence)
    }

    fn save(&self, writer: &mut StateWriter) {
        writer.write(&self.current);
    }

    fn load(&mut self, reader: &mut StateReader) -> Result<(), StateError> {
        self.current = reader.read()?;
        Ok(())
    }
}

/// Folds `source` from `seed`, emitting the final accumulator at
/// completion.
pub fn aggregate<T, R>(
    source: SubscribableRef<T>,
    seed: R,
    fold: FoldFn<R, T>,
) -> UnaryFold<SeededFold<T, R>>
where
    T: Send + 'static,
    R: Clone + Send + Sync + StateValue + 'static,
{
    UnaryFold::new(
        source,
        Arc::new(move || SeededFold {
            acc: seed.clone(),
            fold: Arc::clone(&fold),
        }),
    )
}

/// Folds `source` without a seed; errors on an empty source.
pub fn reduce<T>(source: SubscribableRef<T>, fold: FoldFn<T, T>) -> UnaryFold<UnseededFold<T>>
where
    T: Clone + Send + StateValue + 'static,
{
    UnaryFold::new(
        source,
        Arc::new(move || UnseededFold {
            current: None,
            fold: Arc::clone(&fold),
        }),
    )
}
