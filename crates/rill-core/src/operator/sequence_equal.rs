//! Compares two sequences element-by-element, emitting one boolean.
//!
//! Each side buffers values the other side has not yet matched, in a
//! FIFO queue bounded by the `maxQueueSize` setting; at most one queue is
//! non-empty at a time. The comparer is always invoked as
//! `comparer(left, right)` — left being the first source — so an
//! asymmetric comparer sees a stable argument order.
//!
//! Result: `true` when both sources complete having matched every pair
//! (two empty completed sources compare equal); `false` on the first
//! mismatch or length difference. Either way the operator emits exactly
//! one value, completes, and releases both upstream subscriptions.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::{ComparerFn, OperatorError};
use crate::pipeline::SubscribeContext;
use crate::settings::keys;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{CompositeSubscription, Subscription, SubscriptionRef};

/// The sequence-equal definition over two sources.
pub struct SequenceEqual<T> {
    left: SubscribableRef<T>,
    right: SubscribableRef<T>,
    comparer: ComparerFn<T>,
}

impl<T> SequenceEqual<T>
where
    T: Clone + Send + StateValue + 'static,
{
    /// Creates a sequence-equal with an explicit comparer.
    pub fn new(
        left: SubscribableRef<T>,
        right: SubscribableRef<T>,
        comparer: ComparerFn<T>,
    ) -> Self {
        Self {
            left,
            right,
            comparer,
        }
    }
}

impl<T> SequenceEqual<T>
where
    T: Clone + PartialEq + Send + StateValue + 'static,
{
    /// Creates a sequence-equal using `PartialEq`.
    pub fn with_default_comparer(left: SubscribableRef<T>, right: SubscribableRef<T>) -> Self {
        Self::new(left, right, Arc::new(|l: &T, r: &T| Ok(l == r)))
    }
}

impl<T> Subscribable<bool> for SequenceEqual<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn subscribe(&self, output: ObserverRef<bool>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let max_queue = ctx
            .operator_context()
            .settings()
            .limit(keys::MAX_SEQUENCE_EQUAL_QUEUE_SIZE);
        let op = Arc::new(SequenceEqualOp {
            base: OperatorBase::new("rill/sequence-equal", 1, ctx.operator_context().clone()),
            output,
            comparer: Arc::clone(&self.comparer),
            max_queue,
            state: Mutex::new(SeqState {
                left_queue: VecDeque::new(),
                right_queue: VecDeque::new(),
                left_done: false,
                right_done: false,
            }),
            children: CompositeSubscription::new(),
        });
        ctx.register(Arc::clone(&op));

        let left_child = Arc::new(SideObserver {
            parent: Arc::clone(&op),
            side: Side::Left,
        });
        let right_child = Arc::new(SideObserver {
            parent: Arc::clone(&op),
            side: Side::Right,
        });
        op.children.add(self.left.subscribe(left_child, ctx));
        op.children.add(self.right.subscribe(right_child, ctx));
        Arc::new(NodeSubscription::new(op))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

struct SeqState<T> {
    left_queue: VecDeque<T>,
    right_queue: VecDeque<T>,
    left_done: bool,
    right_done: bool,
}

struct SequenceEqualOp<T> {
    base: OperatorBase,
    output: ObserverRef<bool>,
    comparer: ComparerFn<T>,
    max_queue: usize,
    state: Mutex<SeqState<T>>,
    children: CompositeSubscription,
}

impl<T> SequenceEqualOp<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.children.dispose();
        }
    }

    /// Emits the single result, completes, and tears down. Caller holds
    /// the state lock and must not touch state afterwards.
    fn settle(&self, result: bool) {
        self.output.on_next(result);
        self.output.on_completed();
        self.terminate();
    }

    fn fail(&self, error: OperatorError) {
        self.output.on_error(error);
        self.terminate();
    }

    fn value(&self, side: Side, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        self.base.mark_dirty();

        // The comparer argument order is fixed: (left, right).
        let compared = match side {
            Side::Left => match state.right_queue.pop_front() {
                Some(right) => Some((self.comparer)(&value, &right)),
                None => None,
            },
            Side::Right => match state.left_queue.pop_front() {
                Some(left) => Some((self.comparer)(&left, &value)),
                None => None,
            },
        };

        match compared {
            Some(Ok(true)) => {}
            Some(Ok(false)) => self.settle(false),
            Some(Err(error)) => self.fail(error),
            None => {
                // The other side has nothing buffered. If it already
                // completed, this value can never be matched.
                let other_done = match side {
                    Side::Left => state.right_done,
                    Side::Right => state.left_done,
                };
                if other_done {
                    self.settle(false);
                    return;
                }
                let queue = match side {
                    Side::Left => &mut state.left_queue,
                    Side::Right => &mut state.right_queue,
                };
                if queue.len() >= self.max_queue {
                    let limit = self.max_queue;
                    self.fail(OperatorError::ResourceLimit {
                        resource: "sequence-equal comparison queue",
                        limit,
                    });
                    return;
                }
                queue.push_back(value);
            }
        }
    }

    fn done(&self, side: Side) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        self.base.mark_dirty();
        match side {
            Side::Left => state.left_done = true,
            Side::Right => state.right_done = true,
        }

        if state.left_done && state.right_done {
            let equal = state.left_queue.is_empty() && state.right_queue.is_empty();
            self.settle(equal);
            return;
        }

        // The other side has buffered values waiting for this side, and
        // this side just finished: they can never be matched.
        let unmatchable = match side {
            Side::Left => !state.right_queue.is_empty(),
            Side::Right => !state.left_queue.is_empty(),
        };
        if unmatchable {
            self.settle(false);
        }
    }

    fn fault(&self, error: OperatorError) {
        let state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        drop(state);
        self.fail(error);
    }
}

struct SideObserver<T> {
    parent: Arc<SequenceEqualOp<T>>,
    side: Side,
}

impl<T> Observer<T> for SideObserver<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn on_next(&self, value: T) {
        self.parent.value(self.side, value);
    }

    fn on_error(&self, error: OperatorError) {
        self.parent.fault(error);
    }

    fn on_completed(&self) {
        self.parent.done(self.side);
    }
}

impl<T> OperatorNode for SequenceEqualOp<T>
where
    T: Clone + Send + StateValue + 'static,
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
        let state = self.state.lock();
        writer.write(&state.left_done);
        writer.write(&state.right_done);
        writer.write(&state.left_queue);
        writer.write(&state.right_queue);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.left_done = reader.read()?;
        state.right_done = reader.read()?;
        state.left_queue = reader.read()?;
        state.right_queue = reader.read()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::settings::Settings;
    use crate::state::InMemoryCheckpointStore;
    use crate::testing::{test_context, PushSource, RecordingObserver};

    fn build(
        context: crate::context::OperatorContext,
    ) -> (
        Arc<PushSource<i64>>,
        Arc<PushSource<i64>>,
        Arc<RecordingObserver<bool>>,
        Pipeline,
    ) {
        let left = PushSource::<i64>::new();
        let right = PushSource::<i64>::new();
        let op = SequenceEqual::with_default_comparer(
            left.clone() as SubscribableRef<i64>,
            right.clone() as SubscribableRef<i64>,
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.start().unwrap();
        (left, right, observer, pipeline)
    }

    #[test]
    fn test_two_empty_sources_are_equal() {
        let (_scheduler, context) = test_context();
        let (left, right, observer, _pipeline) = build(context);
        left.complete();
        right.complete();
        assert_eq!(observer.values(), vec![true]);
        assert!(observer.is_completed());
    }

    #[test]
    fn test_equal_sequences_interleaved() {
        let (_scheduler, context) = test_context();
        let (left, right, observer, _pipeline) = build(context);
        left.push(1);
        right.push(1);
        right.push(2);
        left.push(2);
        left.complete();
        right.complete();
        assert_eq!(observer.values(), vec![true]);
    }

    #[test]
    fn test_mismatch_settles_false_immediately() {
        let (_scheduler, context) = test_context();
        let (left, right, observer, _pipeline) = build(context);
        left.push(1);
        right.push(9);
        assert_eq!(observer.values(), vec![false]);
        assert!(observer.is_completed());
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_length_difference_is_false() {
        let (_scheduler, context) = test_context();
        let (left, right, observer, _pipeline) = build(context);
        left.push(1);
        left.push(2);
        right.push(1);
        right.complete();
        // Right completed; left's buffered 2 can never match.
        left.complete();
        assert_eq!(observer.values(), vec![false]);
    }

    #[test]
    fn test_extra_value_after_other_side_done() {
        let (_scheduler, context) = test_context();
        let (left, right, observer, _pipeline) = build(context);
        right.complete();
        left.push(1);
        assert_eq!(observer.values(), vec![false]);
    }

    #[test]
    fn test_queue_limit_faults() {
        let (_scheduler, context) = test_context();
        let context =
            context.with_settings(Settings::new().with(keys::MAX_SEQUENCE_EQUAL_QUEUE_SIZE, 2));
        let (left, _right, observer, _pipeline) = build(context);
        left.push(1);
        left.push(2);
        left.push(3);
        assert!(matches!(
            observer.error(),
            Some(OperatorError::ResourceLimit { limit: 2, .. })
        ));
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_checkpoint_resumes_buffered_queue() {
        let (_scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        {
            let (left, _right, _observer, pipeline) = build(context.clone());
            left.push(1);
            left.push(2);
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.dispose();
        }

        let (left, right, observer, _pipeline) = {
            let (l, r, o, p) = build_with_restore(context, &store);
            (l, r, o, p)
        };
        left.complete();
        right.push(1);
        right.push(2);
        right.complete();
        assert_eq!(observer.values(), vec![true]);
    }

    fn build_with_restore(
        context: crate::context::OperatorContext,
        store: &InMemoryCheckpointStore,
    ) -> (
        Arc<PushSource<i64>>,
        Arc<PushSource<i64>>,
        Arc<RecordingObserver<bool>>,
        Pipeline,
    ) {
        let left = PushSource::<i64>::new();
        let right = PushSource::<i64>::new();
        let op = SequenceEqual::with_default_comparer(
            left.clone() as SubscribableRef<i64>,
            right.clone() as SubscribableRef<i64>,
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.restore(store).unwrap();
        pipeline.start().unwrap();
        (left, right, observer, pipeline)
    }
}
