//! Suppresses consecutive duplicate values.
//!
//! The last forwarded value is persisted so recovery does not re-emit a
//! value equal to the one delivered just before the checkpoint.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// The distinct-until-changed sequence definition.
pub struct DistinctUntilChanged<T> {
    source: SubscribableRef<T>,
}

impl<T> DistinctUntilChanged<T>
where
    T: Clone + PartialEq + Send + StateValue + 'static,
{
    /// Creates a distinct-until-changed over `source`.
    pub fn new(source: SubscribableRef<T>) -> Self {
        Self { source }
    }
}

impl<T> Subscribable<T> for DistinctUntilChanged<T>
where
    T: Clone + PartialEq + Send + StateValue + 'static,
{
    fn subscribe(&self, output: ObserverRef<T>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new(DistinctOp {
            base: OperatorBase::new("rill/distinct-until-changed", 1, ctx.operator_context().clone()),
            output,
            state: Mutex::new(DistinctState { last: None }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct DistinctState<T> {
    last: Option<T>,
}

struct DistinctOp<T> {
    base: OperatorBase,
    output: ObserverRef<T>,
    state: Mutex<DistinctState<T>>,
    upstream: SingleAssignmentSubscription,
}

impl<T> DistinctOp<T> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
    }
}

impl<T> Observer<T> for DistinctOp<T>
where
    T: Clone + PartialEq + Send + StateValue + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state.last.as_ref() == Some(&value) {
            return;
        }
        state.last = Some(value.clone());
        self.base.mark_dirty();
        self.output.on_next(value);
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

impl<T> OperatorNode for DistinctOp<T>
where
    T: Clone + PartialEq + Send + StateValue + 'static,
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
        writer.write(&self.state.lock().last);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        self.state.lock().last = reader.read()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::state::InMemoryCheckpointStore;
    use crate::testing::{test_context, PushSource, RecordingObserver};

    #[test]
    fn test_distinct_suppresses_consecutive_duplicates() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let distinct = DistinctUntilChanged::new(source.clone() as SubscribableRef<i32>);
        let observer = Arc::new(RecordingObserver::new());

        let pipeline = Pipeline::subscribe(&distinct, observer.clone(), context);
        pipeline.start().unwrap();

        source.push_all([1, 1, 2, 2, 2, 1, 3]);
        source.complete();

        assert_eq!(observer.values(), vec![1, 2, 1, 3]);
    }

    #[test]
    fn test_distinct_remembers_last_across_checkpoint() {
        let (_scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        {
            let source = PushSource::<i32>::new();
            let distinct = DistinctUntilChanged::new(source.clone() as SubscribableRef<i32>);
            let observer = Arc::new(RecordingObserver::new());
            let pipeline = Pipeline::subscribe(&distinct, observer.clone(), context.clone());
            pipeline.start().unwrap();
            source.push_all([5, 5, 7]);
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.dispose();
        }

        let source = PushSource::<i32>::new();
        let distinct = DistinctUntilChanged::new(source.clone() as SubscribableRef<i32>);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&distinct, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        source.push_all([7, 8]);
        source.complete();

        // 7 was the last value before the checkpoint; it stays suppressed.
        assert_eq!(observer.values(), vec![8]);
    }
}
