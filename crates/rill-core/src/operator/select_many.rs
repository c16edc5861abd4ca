//! Maps each upstream value to an inner sequence and merges the inner
//! notifications into one output stream.
//!
//! Inner subscriptions are bounded by the `maxInnerSubscriptionCount`
//! setting. Delivery from any inner, creation of new inners, and
//! completion tracking are serialized by the operator's lock. The merged
//! stream completes when the upstream has completed *and* every inner
//! has drained; an error from any inner (or the upstream, or the
//! selector) tears everything down.
//!
//! ## Recovery
//!
//! Inner sequences that expose a tunnel URI are persisted by URI and
//! re-subscribed on recovery; ad-hoc inners produced by the selector
//! have no address and are dropped silently, consistent with the rule
//! that URIs which no longer resolve are presumed collected.

use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::settings::keys;
use crate::state::{StateError, StateReader, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

/// A fallible selector from a value to an inner sequence.
pub type InnerSelectorFn<T, R> =
    Arc<dyn Fn(&T) -> Result<SubscribableRef<R>, OperatorError> + Send + Sync>;

/// The select-many (flat-map) sequence definition.
pub struct SelectMany<T, R> {
    source: SubscribableRef<T>,
    selector: InnerSelectorFn<T, R>,
}

impl<T, R> SelectMany<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Creates a select-many over `source`.
    pub fn new(source: SubscribableRef<T>, selector: InnerSelectorFn<T, R>) -> Self {
        Self { source, selector }
    }
}

impl<T, R> Subscribable<R> for SelectMany<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn subscribe(&self, output: ObserverRef<R>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let max_inner = ctx
            .operator_context()
            .settings()
            .limit(keys::MAX_INNER_SUBSCRIPTION_COUNT);
        let op = Arc::new_cyclic(|this: &Weak<SelectManyOp<T, R>>| SelectManyOp {
            this: this.clone(),
            base: OperatorBase::new("rill/select-many", 1, ctx.operator_context().clone()),
            output,
            selector: Arc::clone(&self.selector),
            max_inner,
            state: Mutex::new(MergeState {
                active: FxHashMap::default(),
                next_inner: 0,
                upstream_done: false,
                pending_uris: Vec::new(),
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct InnerEntry {
    sub: Arc<SingleAssignmentSubscription>,
    uri: Option<String>,
}

struct MergeState {
    active: FxHashMap<u64, InnerEntry>,
    next_inner: u64,
    upstream_done: bool,
    /// URIs loaded from a checkpoint, re-subscribed at start.
    pending_uris: Vec<String>,
}

struct SelectManyOp<T, R> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<R>,
    selector: InnerSelectorFn<T, R>,
    max_inner: usize,
    state: Mutex<MergeState>,
    upstream: SingleAssignmentSubscription,
}

impl<T, R> SelectManyOp<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
            let entries: Vec<InnerEntry> = {
                let mut state = self.state.lock();
                state.active.drain().map(|(_, entry)| entry).collect()
            };
            for entry in entries {
                entry.sub.dispose();
            }
        }
    }

    fn fail(&self, error: OperatorError) {
        self.output.on_error(error);
        self.terminate();
    }

    /// Registers and subscribes one inner sequence.
    ///
    /// Returns the subscription slot so a synchronous inner completion
    /// (which removes the entry and disposes the slot) is handled by the
    /// single-assignment contract.
    fn add_inner(&self, inner: &SubscribableRef<R>) -> Result<(), OperatorError> {
        let (id, slot) = {
            let mut state = self.state.lock();
            if state.active.len() >= self.max_inner {
                return Err(OperatorError::ResourceLimit {
                    resource: "inner subscription",
                    limit: self.max_inner,
                });
            }
            let id = state.next_inner;
            state.next_inner += 1;
            let slot = Arc::new(SingleAssignmentSubscription::new());
            state.active.insert(
                id,
                InnerEntry {
                    sub: Arc::clone(&slot),
                    uri: inner.tunnel_uri(),
                },
            );
            self.base.mark_dirty();
            (id, slot)
        };
        let observer = Arc::new(InnerObserver {
            parent: self.this.clone(),
            id,
        });
        // Inner chains are wired outside the owning pipeline; their
        // nodes are not checkpointed (only tunnel URIs are).
        let mut inner_ctx = SubscribeContext::new(self.base.context().clone());
        let sub = inner.subscribe(observer, &mut inner_ctx);
        slot.set(sub);
        Ok(())
    }

    fn inner_value(&self, id: u64, value: R) {
        let state = self.state.lock();
        if self.base.is_disposed() || !state.active.contains_key(&id) {
            return;
        }
        self.output.on_next(value);
    }

    fn inner_completed(&self, id: u64) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let Some(entry) = state.active.remove(&id) else {
            return;
        };
        self.base.mark_dirty();
        entry.sub.dispose();
        if state.upstream_done && state.active.is_empty() {
            self.output.on_completed();
            drop(state);
            self.terminate();
        }
    }

    fn inner_error(&self, id: u64, error: OperatorError) {
        let state = self.state.lock();
        if self.base.is_disposed() || !state.active.contains_key(&id) {
            return;
        }
        drop(state);
        self.fail(error);
    }
}

struct InnerObserver<T, R> {
    parent: Weak<SelectManyOp<T, R>>,
    id: u64,
}

impl<T, R> Observer<R> for InnerObserver<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn on_next(&self, value: R) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_value(self.id, value);
        }
    }

    fn on_error(&self, error: OperatorError) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_error(self.id, error);
        }
    }

    fn on_completed(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_completed(self.id);
        }
    }
}

impl<T, R> Observer<T> for SelectManyOp<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn on_next(&self, value: T) {
        if self.base.is_disposed() {
            return;
        }
        let inner = match (self.selector)(&value) {
            Ok(inner) => inner,
            Err(error) => {
                self.fail(error);
                return;
            }
        };
        if let Err(error) = self.add_inner(&inner) {
            self.fail(error);
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
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        state.upstream_done = true;
        self.base.mark_dirty();
        if state.active.is_empty() {
            self.output.on_completed();
            drop(state);
            self.terminate();
        }
    }
}

impl<T, R> OperatorNode for SelectManyOp<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let (pending, upstream_done) = {
            let mut state = self.state.lock();
            if self.base.is_disposed() {
                return;
            }
            (std::mem::take(&mut state.pending_uris), state.upstream_done)
        };
        let environment = self.base.context().environment().clone();
        for uri in pending {
            match environment.resolve::<R>(&uri) {
                Some(tunnel) => {
                    let inner: SubscribableRef<R> = Arc::new(tunnel);
                    if let Err(error) = self.add_inner(&inner) {
                        self.fail(error);
                        return;
                    }
                }
                None => debug!(uri, "persisted inner no longer resolves; dropped"),
            }
        }
        // Every persisted inner may have vanished while the upstream was
        // already done; the merge then has nothing left to wait for.
        let state = self.state.lock();
        if !self.base.is_disposed() && upstream_done && state.active.is_empty() {
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
        writer.write(&state.upstream_done);
        let mut uris: Vec<String> = state
            .active
            .values()
            .filter_map(|entry| entry.uri.clone())
            .collect();
        uris.sort_unstable();
        writer.write(&uris);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.upstream_done = reader.read()?;
        state.pending_uris = reader.read()?;
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
    use crate::tunnel::TunnelRef;

    /// Selector that resolves a pre-registered tunnel by index.
    fn tunnel_selector(
        tunnels: Vec<TunnelRef<i64>>,
    ) -> InnerSelectorFn<usize, i64> {
        Arc::new(move |index: &usize| {
            tunnels
                .get(*index)
                .map(|tunnel| Arc::new(tunnel.clone()) as SubscribableRef<i64>)
                .ok_or_else(|| OperatorError::user("unknown inner index"))
        })
    }

    #[test]
    fn test_merges_inner_values() {
        let (_scheduler, context) = test_context();
        let environment = context.environment().clone();
        let t0 = environment.create_tunnel::<i64>("inner");
        let t1 = environment.create_tunnel::<i64>("inner");

        let source = PushSource::<usize>::new();
        let op = SelectMany::new(
            source.clone() as SubscribableRef<usize>,
            tunnel_selector(vec![t0.clone(), t1.clone()]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.start().unwrap();

        source.push(0);
        source.push(1);
        t0.subject().on_next(10);
        t1.subject().on_next(20);
        t0.subject().on_next(11);

        assert_eq!(observer.values(), vec![10, 20, 11]);
    }

    #[test]
    fn test_completes_when_upstream_and_inners_drain() {
        let (_scheduler, context) = test_context();
        let environment = context.environment().clone();
        let t0 = environment.create_tunnel::<i64>("inner");

        let source = PushSource::<usize>::new();
        let op = SelectMany::new(
            source.clone() as SubscribableRef<usize>,
            tunnel_selector(vec![t0.clone()]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.start().unwrap();

        source.push(0);
        source.complete();
        // Upstream is done but the inner is still live.
        assert!(!observer.is_completed());

        t0.subject().on_next(1);
        t0.subject().on_completed();
        assert_eq!(observer.values(), vec![1]);
        assert!(observer.is_completed());
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_inner_limit_faults() {
        let (_scheduler, context) = test_context();
        let context =
            context.with_settings(Settings::new().with(keys::MAX_INNER_SUBSCRIPTION_COUNT, 1));
        let environment = context.environment().clone();
        let t0 = environment.create_tunnel::<i64>("inner");
        let t1 = environment.create_tunnel::<i64>("inner");

        let source = PushSource::<usize>::new();
        let op = SelectMany::new(
            source.clone() as SubscribableRef<usize>,
            tunnel_selector(vec![t0, t1]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.start().unwrap();

        source.push(0);
        source.push(1);

        assert!(matches!(
            observer.error(),
            Some(OperatorError::ResourceLimit { limit: 1, .. })
        ));
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_inner_error_tears_down_merge() {
        let (_scheduler, context) = test_context();
        let environment = context.environment().clone();
        let t0 = environment.create_tunnel::<i64>("inner");

        let source = PushSource::<usize>::new();
        let op = SelectMany::new(
            source.clone() as SubscribableRef<usize>,
            tunnel_selector(vec![t0.clone()]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.start().unwrap();

        source.push(0);
        t0.subject().on_error(OperatorError::user("inner failed"));

        assert!(matches!(
            observer.error(),
            Some(OperatorError::UserFunction { .. })
        ));
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn test_recovery_resubscribes_tunnel_inners() {
        let (_scheduler, context) = test_context();
        let environment = context.environment().clone();
        let t0 = environment.create_tunnel::<i64>("inner");
        let mut store = InMemoryCheckpointStore::new();

        {
            let source = PushSource::<usize>::new();
            let op = SelectMany::new(
                source.clone() as SubscribableRef<usize>,
                tunnel_selector(vec![t0.clone()]),
            );
            let observer = Arc::new(RecordingObserver::new());
            let pipeline = Pipeline::subscribe(&op, observer.clone(), context.clone());
            pipeline.start().unwrap();
            source.push(0);
            t0.subject().on_next(1);
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.unload();
            assert_eq!(observer.values(), vec![1]);
        }

        let source = PushSource::<usize>::new();
        let op = SelectMany::new(
            source.clone() as SubscribableRef<usize>,
            tunnel_selector(vec![t0.clone()]),
        );
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&op, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        // The persisted inner URI re-resolved; its traffic flows again.
        t0.subject().on_next(2);
        source.complete();
        t0.subject().on_completed();

        assert_eq!(observer.values(), vec![2]);
        assert!(observer.is_completed());
    }
}
