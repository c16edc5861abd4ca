//! Running fold: emits the accumulator after every upstream value.
//!
//! The accumulator is the persisted state; the seed is only used when no
//! checkpoint is loaded.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::{FoldFn, OperatorError};
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// The scan (running fold) sequence definition.
pub struct Scan<T, R> {
    source: SubscribableRef<T>,
    seed: R,
    fold: FoldFn<R, T>,
}

impl<T, R> Scan<T, R>
where
    T: Send + 'static,
    R: Clone + Send + StateValue + 'static,
{
    /// Creates a scan over `source`, starting from `seed`.
    pub fn new(source: SubscribableRef<T>, seed: R, fold: FoldFn<R, T>) -> Self {
        Self { source, seed, fold }
    }
}

impl<T, R> Subscribable<R> for Scan<T, R>
where
    T: Send + 'static,
    R: Clone + Send + Sync + StateValue + 'static,
{
    fn subscribe(&self, output: ObserverRef<R>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new(ScanOp {
            base: OperatorBase::new("rill/scan", 1, ctx.operator_context().clone()),
            output,
            fold: Arc::clone(&self.fold),
            state: Mutex::new(ScanState {
                acc: self.seed.clone(),
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct ScanState<R> {
    acc: R,
}

struct ScanOp<T, R> {
    base: OperatorBase,
    output: ObserverRef<R>,
    fold: FoldFn<R, T>,
    state: Mutex<ScanState<R>>,
    upstream: SingleAssignmentSubscription,
}

impl<T, R> ScanOp<T, R> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
    }
}

impl<T, R> Observer<T> for ScanOp<T, R>
where
    T: Send + 'static,
    R: Clone + Send + StateValue + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        match (self.fold)(&state.acc, &value) {
            Ok(next) => {
                state.acc = next.clone();
                self.base.mark_dirty();
                self.output.on_next(next);
            }
            Err(error) => {
                self.output.on_error(error);
                drop(state);
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
        if self.base.is_disposed() {
            return;
        }
        self.output.on_completed();
        self.terminate();
    }
}

impl<T, R> OperatorNode for ScanOp<T, R>
where
    T: Send + 'static,
    R: Clone + Send + StateValue + 'static,
{
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
        writer.write(&self.state.lock().acc);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        self.state.lock().acc = reader.read()?;
        Ok(())
    }
}
