//! Drops primary values until a trigger sequence fires.
//!
//! The gate opens on the trigger's first value and stays open; the
//! trigger subscription is released at that point. A trigger that
//! completes without firing leaves the gate closed forever — the primary
//! then runs to completion producing no values. A trigger error is a
//! fault for the whole operator. The open flag is persisted.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// The skip-until definition: `source` gated by `trigger`.
pub struct SkipUntil<T, U> {
    source: SubscribableRef<T>,
    trigger: SubscribableRef<U>,
}

impl<T, U> SkipUntil<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Creates a skip-until.
    pub fn new(source: SubscribableRef<T>, trigger: SubscribableRef<U>) -> Self {
        Self { source, trigger }
    }
}

impl<T, U> Subscribable<T> for SkipUntil<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, output: ObserverRef<T>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new(SkipUntilOp {
            base: OperatorBase::new("rill/skip-until", 1, ctx.operator_context().clone()),
            output,
            state: Mutex::new(GateState { open: false }),
            source_sub: SingleAssignmentSubscription::new(),
            trigger_sub: SingleAssignmentSubscription::new(),
            _trigger: PhantomData,
        });
        ctx.register(Arc::clone(&op));

        let trigger_observer = Arc::new(TriggerObserver {
            parent: Arc::clone(&op),
        });
        op.trigger_sub
            .set(self.trigger.subscribe(trigger_observer, ctx));
        op.source_sub.set(self.source.subscribe(op.clone(), ctx));
        Arc::new(NodeSubscription::new(op))
    }
}

struct GateState {
    open: bool,
}

struct SkipUntilOp<T, U> {
    base: OperatorBase,
    output: ObserverRef<T>,
    state: Mutex<GateState>,
    source_sub: SingleAssignmentSubscription,
    trigger_sub: SingleAssignmentSubscription,
    _trigger: PhantomData<fn(U)>,
}

impl<T, U> SkipUntilOp<T, U> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.source_sub.dispose();
            self.trigger_sub.dispose();
        }
    }
}

impl<T, U> Observer<T> for SkipUntilOp<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_next(&self, value: T) {
        let state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state.open {
            self.output.on_next(value);
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

struct TriggerObserver<T, U> {
    parent: Arc<SkipUntilOp<T, U>>,
}

impl<T, U> Observer<U> for TriggerObserver<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_next(&self, _value: U) {
        {
            let mut state = self.parent.state.lock();
            if self.parent.base.is_disposed() || state.open {
                return;
            }
            state.open = true;
            self.parent.base.mark_dirty();
        }
        // The trigger has served its purpose.
        self.parent.trigger_sub.dispose();
    }

    fn on_error(&self, error: OperatorError) {
        if self.parent.base.is_disposed() {
            return;
        }
        self.parent.output.on_error(error);
        self.parent.terminate();
    }

    fn on_completed(&self) {
        // A trigger that never fired leaves the gate closed; the primary
        // still runs to its own completion.
    }
}

impl<T, U> OperatorNode for SkipUntilOp<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
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
        writer.write(&self.state.lock().open);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        self.state.lock().open = reader.read()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::state::InMemoryCheckpointStore;
    use crate::testing::{test_context, PushSource, RecordingObserver};

    fn build(
        context: crate::context::OperatorContext,
    ) -> (
        Arc<PushSource<i64>>,
        Arc<PushSource<()>>,
        Arc<RecordingObserver<i64>>,
        Pipeline,
    ) {
        let source = PushSource::<i64>::new();
        let trigger = PushSource::<()>::new();
        let op = SkipUntil::new(
            source.clone() as SubscribableRef<i64>,
            trigger.clone() as SubscribableRef<()>,
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.start().unwrap();
        (source, trigger, observer, pipeline)
    }

    #[test]
    fn test_values_dropped_until_trigger_fires() {
        let (_scheduler, context) = test_context();
        let (source, trigger, observer, _pipeline) = build(context);

        source.push(1);
        source.push(2);
        trigger.push(());
        source.push(3);
        source.push(4);
        source.complete();

        assert_eq!(observer.values(), vec![3, 4]);
        assert!(observer.is_completed());
        // Trigger subscription was released once the gate opened.
        assert_eq!(trigger.observer_count(), 0);
    }

    #[test]
    fn test_silent_trigger_yields_no_values() {
        let (_scheduler, context) = test_context();
        let (source, trigger, observer, _pipeline) = build(context);

        source.push(1);
        trigger.complete();
        source.push(2);
        source.complete();

        assert!(observer.values().is_empty());
        assert!(observer.is_completed());
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_trigger_error_faults_operator() {
        let (_scheduler, context) = test_context();
        let (source, trigger, observer, _pipeline) = build(context);

        trigger.error(OperatorError::user("trigger failed"));
        source.push(1);

        assert!(matches!(
            observer.error(),
            Some(OperatorError::UserFunction { .. })
        ));
        assert!(observer.values().is_empty());
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn test_open_gate_survives_checkpoint() {
        let (_scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        {
            let (source, trigger, _observer, pipeline) = build(context.clone());
            source.push(1);
            trigger.push(());
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.dispose();
        }

        // The recovered gate is already open: no trigger fire is needed.
        let source = PushSource::<i64>::new();
        let trigger = PushSource::<()>::new();
        let op = SkipUntil::new(
            source.clone() as SubscribableRef<i64>,
            trigger.clone() as SubscribableRef<()>,
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        source.push(7);
        source.complete();
        assert_eq!(observer.values(), vec![7]);
        assert!(observer.is_completed());
    }
}
