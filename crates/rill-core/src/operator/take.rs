//! Forwards the first `count` values, then completes.
//!
//! The remaining count is persisted, so a recovered pipeline continues
//! from where the checkpoint left off instead of restarting the quota.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// The take sequence definition.
pub struct Take<T> {
    source: SubscribableRef<T>,
    count: u64,
}

impl<T: Send + 'static> Take<T> {
    /// Creates a take of the first `count` values of `source`.
    pub fn new(source: SubscribableRef<T>, count: u64) -> Self {
        Self { source, count }
    }
}

impl<T: Send + 'static> Subscribable<T> for Take<T> {
    fn subscribe(&self, output: ObserverRef<T>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new(TakeOp {
            base: OperatorBase::new("rill/take", 1, ctx.operator_context().clone()),
            output,
            state: Mutex::new(TakeState {
                remaining: self.count,
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct TakeState {
    remaining: u64,
}

struct TakeOp<T> {
    base: OperatorBase,
    output: ObserverRef<T>,
    state: Mutex<TakeState>,
    upstream: SingleAssignmentSubscription,
}

impl<T> TakeOp<T> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
    }
}

impl<T: Send + 'static> Observer<T> for TakeOp<T> {
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() || state.remaining == 0 {
            return;
        }
        state.remaining -= 1;
        self.base.mark_dirty();
        let done = state.remaining == 0;
        self.output.on_next(value);
        if done {
            self.output.on_completed();
            drop(state);
            self.terminate();
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

impl<T: Send + 'static> OperatorNode for TakeOp<T> {
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let remaining = self.state.lock().remaining;
        if remaining == 0 && !self.base.is_disposed() {
            // A zero quota (configured or fully consumed before the
            // checkpoint) completes without waiting for upstream.
            self.output.on_completed();
            self.terminate();
        }
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
        writer.write(&self.state.lock().remaining);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        self.state.lock().remaining = reader.read()?;
        Ok(())
    }
}
