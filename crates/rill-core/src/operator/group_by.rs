//! Partitions a stream into per-key nested streams.
//!
//! The first occurrence of a key opens a tunnel and emits a
//! [`GroupedStream`] downstream; every later value with the same key is
//! fed into that tunnel. Groups are checkpoint dependencies: the
//! `(key, uri)` pairs are persisted, re-resolved on recovery, and
//! silently dropped when the URI no longer resolves. A collect signal
//! drops the group *and forgets the key*, so a later occurrence opens a
//! fresh group.
//!
//! The group map is bounded by the `maxGroupCount` setting; exceeding it
//! is a fatal operator error.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::{OperatorError, SelectorFn};
use crate::pipeline::SubscribeContext;
use crate::settings::keys;
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};
use crate::tunnel::TunnelRef;

/// A per-key nested stream, as handed downstream by [`GroupBy`].
pub struct GroupedStream<K, T> {
    key: K,
    tunnel: TunnelRef<T>,
}

impl<K: Clone, T: Clone + Send + 'static> GroupedStream<K, T> {
    /// Returns the group key.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the group's tunnel URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        self.tunnel.uri()
    }

    /// Attaches an observer to the group without a subscribe context.
    ///
    /// Dynamically received groups are consumed outside any pipeline
    /// construction, so this is the usual way to read one.
    pub fn subscribe_observer(&self, observer: ObserverRef<T>) -> SubscriptionRef {
        self.tunnel.subject().subscribe_observer(observer)
    }
}

impl<K: Clone, T> Clone for GroupedStream<K, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            tunnel: self.tunnel.clone(),
        }
    }
}

impl<K, T> std::fmt::Debug for GroupedStream<K, T>
where
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupedStream")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<K, T> Subscribable<T> for GroupedStream<K, T>
where
    K: Clone + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    fn subscribe(&self, output: ObserverRef<T>, _ctx: &mut SubscribeContext) -> SubscriptionRef {
        self.tunnel.subject().subscribe_observer(output)
    }

    fn tunnel_uri(&self) -> Option<String> {
        Some(self.tunnel.uri().to_string())
    }
}

/// The group-by sequence definition.
pub struct GroupBy<T, K> {
    source: SubscribableRef<T>,
    key_selector: SelectorFn<T, K>,
}

impl<T, K> GroupBy<T, K>
where
    T: Clone + Send + 'static,
    K: Clone + Eq + Hash + Send + Sync + StateValue + 'static,
{
    /// Creates a group-by over `source`.
    pub fn new(source: SubscribableRef<T>, key_selector: SelectorFn<T, K>) -> Self {
        Self {
            source,
            key_selector,
        }
    }
}

impl<T, K> Subscribable<GroupedStream<K, T>> for GroupBy<T, K>
where
    T: Clone + Send + 'static,
    K: Clone + Eq + Hash + Send + Sync + StateValue + 'static,
{
    fn subscribe(
        &self,
        output: ObserverRef<GroupedStream<K, T>>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let max_groups = ctx
            .operator_context()
            .settings()
            .limit(keys::MAX_GROUP_COUNT);
        let op = Arc::new_cyclic(|this: &Weak<GroupByOp<T, K>>| GroupByOp {
            this: this.clone(),
            base: OperatorBase::new("rill/group-by", 1, ctx.operator_context().clone()),
            output,
            key_selector: Arc::clone(&self.key_selector),
            max_groups,
            state: Mutex::new(Groups {
                by_key: FxHashMap::default(),
                order: Vec::new(),
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct Groups<T, K> {
    by_key: FxHashMap<K, TunnelRef<T>>,
    /// Keys in creation order, for deterministic persistence.
    order: Vec<K>,
}

struct GroupByOp<T, K> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<GroupedStream<K, T>>,
    key_selector: SelectorFn<T, K>,
    max_groups: usize,
    state: Mutex<Groups<T, K>>,
    upstream: SingleAssignmentSubscription,
}

impl<T, K> GroupByOp<T, K>
where
    T: Clone + Send + 'static,
    K: Clone + Eq + Hash + Send + Sync + StateValue + 'static,
{
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
    }

    fn fail(&self, error: OperatorError) {
        self.output.on_error(error);
        self.terminate();
    }

    fn install_collect_handler(&self, uri: &str) {
        let weak = self.this.clone();
        self.base.context().environment().set_collect_handler(
            uri,
            Arc::new(move |uri| {
                if let Some(op) = weak.upgrade() {
                    op.on_collect(uri);
                }
            }),
        );
    }

    fn on_collect(&self, uri: &str) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let collected: Option<K> = state
            .by_key
            .iter()
            .find(|(_, tunnel)| tunnel.uri() == uri)
            .map(|(key, _)| key.clone());
        if let Some(key) = collected {
            state.by_key.remove(&key);
            state.order.retain(|k| *k != key);
            self.base.mark_dirty();
            debug!(uri, "group collected; key forgotten");
        }
    }

    /// Drives every group to a terminal. Caller holds the lock.
    fn drain_groups(&self, state: &mut Groups<T, K>, error: Option<&OperatorError>) {
        let environment = self.base.context().environment().clone();
        for (_, tunnel) in state.by_key.drain() {
            match error {
                Some(error) => tunnel.subject().on_error(error.clone()),
                None => tunnel.subject().on_completed(),
            }
            environment.remove(tunnel.uri());
        }
        state.order.clear();
    }
}

impl<T, K> Observer<T> for GroupByOp<T, K>
where
    T: Clone + Send + 'static,
    K: Clone + Eq + Hash + Send + Sync + StateValue + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let key = match (self.key_selector)(&value) {
            Ok(key) => key,
            Err(error) => {
                drop(state);
                self.fail(error);
                return;
            }
        };
        if let Some(tunnel) = state.by_key.get(&key) {
            tunnel.subject().on_next(value);
            return;
        }
        if state.by_key.len() >= self.max_groups {
            let limit = self.max_groups;
            drop(state);
            self.fail(OperatorError::ResourceLimit {
                resource: "group",
                limit,
            });
            return;
        }
        let tunnel = self
            .base
            .context()
            .environment()
            .create_tunnel::<T>("group");
        self.install_collect_handler(tunnel.uri());
        state.by_key.insert(key.clone(), tunnel.clone());
        state.order.push(key.clone());
        self.base.mark_dirty();
        self.output.on_next(GroupedStream {
            key,
            tunnel: tunnel.clone(),
        });
        tunnel.subject().on_next(value);
    }

    fn on_error(&self, error: OperatorError) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        self.drain_groups(&mut state, Some(&error));
        self.output.on_error(error);
        drop(state);
        self.terminate();
    }

    fn on_completed(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        self.drain_groups(&mut state, None);
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T, K> OperatorNode for GroupByOp<T, K>
where
    T: Clone + Send + 'static,
    K: Clone + Eq + Hash + Send + Sync + StateValue + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        self.drain_groups(&mut state, None);
        drop(state);
        self.terminate();
    }

    fn unload(&self) {
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
        writer.write(&state.order.len());
        for key in &state.order {
            let tunnel = state
                .by_key
                .get(key)
                .expect("ordered key missing from group map");
            writer.write(key);
            writer.write(&tunnel.uri().to_string());
        }
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        let count: usize = reader.read()?;
        state.by_key.clear();
        state.order.clear();
        let environment = self.base.context().environment().clone();
        for _ in 0..count {
            let key: K = reader.read()?;
            let uri: String = reader.read()?;
            if let Some(tunnel) = environment.resolve::<T>(&uri) {
                self.install_collect_handler(&uri);
                state.by_key.insert(key.clone(), tunnel);
                state.order.push(key);
            } else {
                debug!(uri, "persisted group no longer resolves; dropped");
            }
        }
        Ok(())
    }
}
