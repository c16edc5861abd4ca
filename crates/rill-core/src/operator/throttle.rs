//! Throttles (debounces) a stream against per-item indicator sequences.
//!
//! Exactly one pending value is buffered, replaced by every new upstream
//! item. Each item derives an indicator sequence through the selector;
//! when the indicator fires or completes — and no newer item has
//! superseded it, checked by generation id — the pending value is
//! emitted. Upstream completion flushes the pending value.
//!
//! Persisted: the pending value and the generation counter. Recovery
//! re-derives the indicator from the pending value, re-arming the
//! throttle interval.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{
    SerialSubscription, SingleAssignmentSubscription, Subscription, SubscriptionRef,
};

/// A fallible selector deriving an indicator sequence from a value.
pub type IndicatorSelectorFn<T, U> =
    Arc<dyn Fn(&T) -> Result<SubscribableRef<U>, OperatorError> + Send + Sync>;

/// The throttle definition.
pub struct Throttle<T, U> {
    source: SubscribableRef<T>,
    selector: IndicatorSelectorFn<T, U>,
}

impl<T, U> Throttle<T, U>
where
    T: Clone + Send + StateValue + 'static,
    U: Send + 'static,
{
    /// Creates a throttle over `source`.
    pub fn new(source: SubscribableRef<T>, selector: IndicatorSelectorFn<T, U>) -> Self {
        Self { source, selector }
    }
}

impl<T, U> Subscribable<T> for Throttle<T, U>
where
    T: Clone + Send + StateValue + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, output: ObserverRef<T>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new_cyclic(|this: &Weak<ThrottleOp<T, U>>| ThrottleOp {
            this: this.clone(),
            base: OperatorBase::new("rill/throttle", 1, ctx.operator_context().clone()),
            output,
            selector: Arc::clone(&self.selector),
            state: Mutex::new(ThrottleState {
                pending: None,
                generation: 0,
                loaded: false,
            }),
            upstream: SingleAssignmentSubscription::new(),
            indicator_sub: SerialSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct ThrottleState<T> {
    pending: Option<T>,
    generation: u64,
    loaded: bool,
}

struct ThrottleOp<T, U> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<T>,
    selector: IndicatorSelectorFn<T, U>,
    state: Mutex<ThrottleState<T>>,
    upstream: SingleAssignmentSubscription,
    indicator_sub: SerialSubscription,
}

impl<T, U> ThrottleOp<T, U>
where
    T: Clone + Send + StateValue + 'static,
    U: Send + 'static,
{
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
            self.indicator_sub.dispose();
        }
    }

    fn fail(&self, error: OperatorError) {
        self.output.on_error(error);
        self.terminate();
    }

    fn attach_indicator(&self, indicator: &SubscribableRef<U>, generation: u64) {
        let observer = Arc::new(IndicatorObserver {
            parent: self.this.clone(),
            generation,
        });
        let mut inner_ctx = SubscribeContext::new(self.base.context().clone());
        let sub = indicator.subscribe(observer, &mut inner_ctx);
        self.indicator_sub.replace(sub);
    }

    /// Indicator fired or completed: emit the pending value unless a
    /// newer item superseded this generation.
    ///
    /// The fired indicator's subscription stays in the serial slot until
    /// the next item replaces it; its further notifications are inert
    /// (no pending value, matching generation or not).
    fn indicator_fired(&self, generation: u64) {
        let mut state = self.state.lock();
        if self.base.is_disposed() || state.generation != generation {
            return;
        }
        if let Some(value) = state.pending.take() {
            self.base.mark_dirty();
            self.output.on_next(value);
        }
    }

    fn indicator_error(&self, generation: u64, error: OperatorError) {
        let state = self.state.lock();
        if self.base.is_disposed() || state.generation != generation {
            return;
        }
        drop(state);
        self.fail(error);
    }
}

struct IndicatorObserver<T, U> {
    parent: Weak<ThrottleOp<T, U>>,
    generation: u64,
}

impl<T, U> Observer<U> for IndicatorObserver<T, U>
where
    T: Clone + Send + StateValue + 'static,
    U: Send + 'static,
{
    fn on_next(&self, _value: U) {
        if let Some(parent) = self.parent.upgrade() {
            parent.indicator_fired(self.generation);
        }
    }

    fn on_error(&self, error: OperatorError) {
        if let Some(parent) = self.parent.upgrade() {
            parent.indicator_error(self.generation, error);
        }
    }

    fn on_completed(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.indicator_fired(self.generation);
        }
    }
}

impl<T, U> Observer<T> for ThrottleOp<T, U>
where
    T: Clone + Send + StateValue + 'static,
    U: Send + 'static,
{
    fn on_next(&self, value: T) {
        let (generation, indicator) = {
            let mut state = self.state.lock();
            if self.base.is_disposed() {
                return;
            }
            let indicator = match (self.selector)(&value) {
                Ok(indicator) => indicator,
                Err(error) => {
                    drop(state);
                    self.fail(error);
                    return;
                }
            };
            state.pending = Some(value);
            state.generation += 1;
            self.base.mark_dirty();
            (state.generation, indicator)
        };
        self.attach_indicator(&indicator, generation);
    }

    fn on_error(&self, error: OperatorError) {
        if self.base.is_disposed() {
            return;
        }
        self.output.on_error(error);
        self.terminate();
    }

    fn on_completed(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if let Some(value) = state.pending.take() {
            self.output.on_next(value);
        }
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T, U> OperatorNode for ThrottleOp<T, U>
where
    T: Clone + Send + StateValue + 'static,
    U: Send + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let rearm = {
            let state = self.state.lock();
            if self.base.is_disposed() || !state.loaded {
                None
            } else {
                state.pending.clone().map(|value| (value, state.generation))
            }
        };
        // Re-derive the indicator for a recovered pending value; the
        // throttle interval restarts rather than resuming mid-flight.
        if let Some((value, generation)) = rearm {
            match (self.selector)(&value) {
                Ok(indicator) => self.attach_indicator(&indicator, generation),
                Err(error) => self.fail(error),
            }
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
        let state = self.state.lock();
        writer.write(&state.pending);
        writer.write(&state.generation);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.pending = reader.read()?;
        state.generation = reader.read()?;
        state.loaded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::state::InMemoryCheckpointStore;
    use crate::testing::{test_context, PushSource, RecordingObserver};
    use crate::tunnel::TunnelRef;

    /// Routes each value to one of two indicator tunnels by parity.
    fn parity_selector(
        even: TunnelRef<()>,
        odd: TunnelRef<()>,
    ) -> IndicatorSelectorFn<i64, ()> {
        Arc::new(move |v: &i64| {
            Ok(if v % 2 == 0 {
                Arc::new(even.clone()) as SubscribableRef<()>
            } else {
                Arc::new(odd.clone()) as SubscribableRef<()>
            })
        })
    }

    fn build(
        context: crate::context::OperatorContext,
    ) -> (
        Arc<PushSource<i64>>,
        TunnelRef<()>,
        TunnelRef<()>,
        Arc<RecordingObserver<i64>>,
        Pipeline,
    ) {
        let environment = context.environment().clone();
        let even = environment.create_tunnel::<()>("indicator");
        let odd = environment.create_tunnel::<()>("indicator");
        let source = PushSource::<i64>::new();
        let throttle = Throttle::new(
            source.clone() as SubscribableRef<i64>,
            parity_selector(even.clone(), odd.clone()),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&throttle, observer.clone(), context);
        pipeline.start().unwrap();
        (source, even, odd, observer, pipeline)
    }

    #[test]
    fn test_emits_pending_on_indicator_fire() {
        let (_scheduler, context) = test_context();
        let (source, even, _odd, observer, _pipeline) = build(context);

        source.push(2);
        assert!(observer.is_empty());
        even.subject().on_next(());
        assert_eq!(observer.values(), vec![2]);
    }

    #[test]
    fn test_newer_value_supersedes_pending() {
        let (_scheduler, context) = test_context();
        let (source, even, odd, observer, _pipeline) = build(context);

        source.push(2);
        source.push(3);
        // The first indicator is now a stale generation.
        even.subject().on_next(());
        assert!(observer.is_empty());

        odd.subject().on_next(());
        assert_eq!(observer.values(), vec![3]);
    }

    #[test]
    fn test_indicator_completion_counts_as_fire() {
        let (_scheduler, context) = test_context();
        let (source, even, _odd, observer, _pipeline) = build(context);

        source.push(4);
        even.subject().on_completed();
        assert_eq!(observer.values(), vec![4]);
    }

    #[test]
    fn test_completion_flushes_pending() {
        let (_scheduler, context) = test_context();
        let (source, _even, _odd, observer, _pipeline) = build(context);

        source.push(1);
        source.complete();

        assert_eq!(observer.values(), vec![1]);
        assert!(observer.is_completed());
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_each_settled_value_emits_once() {
        let (_scheduler, context) = test_context();
        let (source, even, odd, observer, _pipeline) = build(context);

        source.push(2);
        even.subject().on_next(());
        source.push(3);
        odd.subject().on_next(());
        // Firing again with no pending value emits nothing.
        odd.subject().on_next(());

        assert_eq!(observer.values(), vec![2, 3]);
    }

    #[test]
    fn test_pending_value_recovers_and_rearms() {
        let (_scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        let (even_uri, odd_uri) = {
            let (source, even, odd, observer, pipeline) = build(context.clone());
            source.push(2);
            assert!(observer.is_empty());
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.unload();
            (even.uri().to_string(), odd.uri().to_string())
        };

        // Rebuild over the same environment; the selector re-resolves
        // the same indicator tunnels.
        let environment = context.environment().clone();
        let even = environment.resolve::<()>(&even_uri).unwrap();
        let odd = environment.resolve::<()>(&odd_uri).unwrap();
        let source = PushSource::<i64>::new();
        let throttle = Throttle::new(
            source.clone() as SubscribableRef<i64>,
            parity_selector(even.clone(), odd),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&throttle, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        // The recovered pending value emits when its re-armed indicator
        // fires.
        even.subject().on_next(());
        assert_eq!(observer.values(), vec![2]);
    }
}
