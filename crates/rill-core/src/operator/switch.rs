//! Switches to the most recent inner sequence.
//!
//! At most one inner subscription is live at a time, keyed by a
//! monotonically increasing generation id: a new inner arriving
//! invalidates the previous generation, so a late value or completion
//! from a stale inner is recognized by id mismatch and ignored. The
//! output completes once the upstream has completed *and* the current
//! inner (if any) has completed.
//!
//! Persisted: the generation counter, the completion flags, and the
//! current inner's tunnel URI when it has one — re-resolved on recovery,
//! with unresolvable inners treated as already finished.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::state::{StateError, StateReader, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{
    SerialSubscription, SingleAssignmentSubscription, Subscription, SubscriptionRef,
};

/// The switch definition over a stream of inner sequences.
pub struct Switch<R> {
    source: SubscribableRef<SubscribableRef<R>>,
}

impl<R: Clone + Send + 'static> Switch<R> {
    /// Creates a switch over `source`.
    pub fn new(source: SubscribableRef<SubscribableRef<R>>) -> Self {
        Self { source }
    }
}

impl<R: Clone + Send + 'static> Subscribable<R> for Switch<R> {
    fn subscribe(&self, output: ObserverRef<R>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let op = Arc::new_cyclic(|this: &Weak<SwitchOp<R>>| SwitchOp {
            this: this.clone(),
            base: OperatorBase::new("rill/switch", 1, ctx.operator_context().clone()),
            output,
            state: Mutex::new(SwitchState {
                generation: 0,
                has_inner: false,
                inner_done: false,
                upstream_done: false,
                inner_uri: None,
                loaded: false,
            }),
            upstream: SingleAssignmentSubscription::new(),
            inner_sub: SerialSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct SwitchState {
    generation: u64,
    has_inner: bool,
    inner_done: bool,
    upstream_done: bool,
    inner_uri: Option<String>,
    loaded: bool,
}

struct SwitchOp<R> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<R>,
    state: Mutex<SwitchState>,
    upstream: SingleAssignmentSubscription,
    inner_sub: SerialSubscription,
}

impl<R: Clone + Send + 'static> SwitchOp<R> {
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
            self.inner_sub.dispose();
        }
    }

    fn fail(&self, error: OperatorError) {
        self.output.on_error(error);
        self.terminate();
    }

    fn attach_inner(&self, inner: &SubscribableRef<R>, generation: u64) {
        let observer = Arc::new(SwitchInner {
            parent: self.this.clone(),
            generation,
        });
        let mut inner_ctx = SubscribeContext::new(self.base.context().clone());
        let sub = inner.subscribe(observer, &mut inner_ctx);
        // Replacing disposes the previous generation's subscription.
        self.inner_sub.replace(sub);
    }

    fn inner_value(&self, generation: u64, value: R) {
        let state = self.state.lock();
        if self.base.is_disposed() || state.generation != generation {
            return;
        }
        self.output.on_next(value);
    }

    fn inner_completed(&self, generation: u64) {
        let mut state = self.state.lock();
        if self.base.is_disposed() || state.generation != generation {
            return;
        }
        state.inner_done = true;
        self.base.mark_dirty();
        if state.upstream_done {
            self.output.on_completed();
            drop(state);
            self.terminate();
        }
    }

    fn inner_error(&self, generation: u64, error: OperatorError) {
        let state = self.state.lock();
        if self.base.is_disposed() || state.generation != generation {
            return;
        }
        drop(state);
        self.fail(error);
    }
}

struct SwitchInner<R> {
    parent: Weak<SwitchOp<R>>,
    generation: u64,
}

impl<R: Clone + Send + 'static> Observer<R> for SwitchInner<R> {
    fn on_next(&self, value: R) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_value(self.generation, value);
        }
    }

    fn on_error(&self, error: OperatorError) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_error(self.generation, error);
        }
    }

    fn on_completed(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_completed(self.generation);
        }
    }
}

impl<R: Clone + Send + 'static> Observer<SubscribableRef<R>> for SwitchOp<R> {
    fn on_next(&self, inner: SubscribableRef<R>) {
        let generation = {
            let mut state = self.state.lock();
            if self.base.is_disposed() {
                return;
            }
            state.generation += 1;
            state.has_inner = true;
            state.inner_done = false;
            state.inner_uri = inner.tunnel_uri();
            self.base.mark_dirty();
            state.generation
        };
        // Subscribe outside the lock: a synchronously completing inner
        // re-enters through the generation-checked paths above.
        self.attach_inner(&inner, generation);
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
        state.upstream_done = true;
        self.base.mark_dirty();
        if !state.has_inner || state.inner_done {
            self.output.on_completed();
            drop(state);
            self.terminate();
        }
    }
}

impl<R: Clone + Send + 'static> OperatorNode for SwitchOp<R> {
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let (resubscribe, generation) = {
            let mut state = self.state.lock();
            if self.base.is_disposed() || !state.loaded {
                return;
            }
            let st = &mut *state;
            if !st.has_inner || st.inner_done {
                (None, 0)
            } else {
                match &st.inner_uri {
                    Some(uri) => (Some(uri.clone()), st.generation),
                    None => {
                        // Non-addressable inner: presumed finished.
                        st.inner_done = true;
                        (None, 0)
                    }
                }
            }
        };
        if let Some(uri) = resubscribe {
            let resolved = self.base.context().environment().resolve::<R>(&uri);
            match resolved {
                Some(tunnel) => {
                    let inner: SubscribableRef<R> = Arc::new(tunnel);
                    self.attach_inner(&inner, generation);
                    return;
                }
                None => {
                    debug!(uri, "persisted inner no longer resolves; dropped");
                    self.state.lock().inner_done = true;
                }
            }
        }
        // With the inner gone, a done upstream means we are done.
        let state = self.state.lock();
        if !self.base.is_disposed() && state.upstream_done && (!state.has_inner || state.inner_done)
        {
            self.output.on_completed();
            drop(state);
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
        let state = self.state.lock();
        writer.write(&state.generation);
        writer.write(&state.has_inner);
        writer.write(&state.inner_done);
        writer.write(&state.upstream_done);
        writer.write(&state.inner_uri);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.generation = reader.read()?;
        state.has_inner = reader.read()?;
        state.inner_done = reader.read()?;
        state.upstream_done = reader.read()?;
        state.inner_uri = reader.read()?;
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

    #[test]
    fn test_switch_follows_latest_inner() {
        let (_scheduler, context) = test_context();
        let environment = context.environment().clone();
        let a = environment.create_tunnel::<i64>("inner");
        let b = environment.create_tunnel::<i64>("inner");

        let source = PushSource::<SubscribableRef<i64>>::new();
        let switch = Switch::new(source.clone() as SubscribableRef<SubscribableRef<i64>>);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&switch, observer.clone(), context);
        pipeline.start().unwrap();

        source.push(Arc::new(a.clone()) as SubscribableRef<i64>);
        a.subject().on_next(1);
        source.push(Arc::new(b.clone()) as SubscribableRef<i64>);
        // Stale generation: ignored.
        a.subject().on_next(2);
        b.subject().on_next(10);

        assert_eq!(observer.values(), vec![1, 10]);
    }

    #[test]
    fn test_stale_inner_completion_is_ignored() {
        let (_scheduler, context) = test_context();
        let environment = context.environment().clone();
        let a = environment.create_tunnel::<i64>("inner");
        let b = environment.create_tunnel::<i64>("inner");

        let source = PushSource::<SubscribableRef<i64>>::new();
        let switch = Switch::new(source.clone() as SubscribableRef<SubscribableRef<i64>>);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&switch, observer.clone(), context);
        pipeline.start().unwrap();

        source.push(Arc::new(a.clone()) as SubscribableRef<i64>);
        source.push(Arc::new(b.clone()) as SubscribableRef<i64>);
        source.complete();
        // The stale inner completing must not complete the switch.
        a.subject().on_completed();
        assert!(!observer.is_completed());

        b.subject().on_next(5);
        b.subject().on_completed();
        assert_eq!(observer.values(), vec![5]);
        assert!(observer.is_completed());
    }

    #[test]
    fn test_upstream_completion_without_inner_completes() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<SubscribableRef<i64>>::new();
        let switch = Switch::new(source.clone() as SubscribableRef<SubscribableRef<i64>>);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&switch, observer.clone(), context);
        pipeline.start().unwrap();

        source.complete();
        assert!(observer.is_completed());
    }

    #[test]
    fn test_switch_recovers_current_inner_by_uri() {
        let (_scheduler, context) = test_context();
        let environment = context.environment().clone();
        let a = environment.create_tunnel::<i64>("inner");
        let mut store = InMemoryCheckpointStore::new();

        {
            let source = PushSource::<SubscribableRef<i64>>::new();
            let switch = Switch::new(source.clone() as SubscribableRef<SubscribableRef<i64>>);
            let observer = Arc::new(RecordingObserver::new());
            let pipeline = Pipeline::subscribe(&switch, observer.clone(), context.clone());
            pipeline.start().unwrap();
            source.push(Arc::new(a.clone()) as SubscribableRef<i64>);
            a.subject().on_next(1);
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.unload();
        }

        let source = PushSource::<SubscribableRef<i64>>::new();
        let switch = Switch::new(source.clone() as SubscribableRef<SubscribableRef<i64>>);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&switch, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        a.subject().on_next(2);
        source.complete();
        a.subject().on_completed();

        assert_eq!(observer.values(), vec![2]);
        assert!(observer.is_completed());
    }
}
