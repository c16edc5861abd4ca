//! Windowing: hands downstream live nested streams instead of lists.
//!
//! Structurally the mirror of [`super::buffer`]: the same count,
//! duration+shift, and duration+count ("ferry") trigger algebra, but
//! each accumulation is a [`TunnelRef`] opened through the environment
//! and emitted downstream *when the window opens*; items are fanned into
//! every open window's subject as they arrive, and closing a window
//! completes its subject.
//!
//! Windows are higher-order resources: each is URI-addressed, tracked as
//! a checkpoint dependency while open, and released either by natural
//! close, by operator terminal (all open windows complete), or by an
//! explicit collect signal from the consumer (the window stops being fed
//! and is dropped from the dependency set). On recovery, persisted
//! window URIs re-resolve against the environment; URIs that no longer
//! resolve are dropped silently.
//!
//! The first count-window opens at start; later ones open every `skip`
//! items. Exceeding `maxWindowCount` is a fatal operator error.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::observer::{Observer, ObserverRef};
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::scheduler::Timestamp;
use crate::settings::keys;
use crate::state::{StateError, StateReader, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};
use crate::tunnel::TunnelRef;

// ---------------------------------------------------------------------------
// WindowCount
// ---------------------------------------------------------------------------

/// Count-triggered windowing, with an optional opening stride.
pub struct WindowCount<T> {
    source: SubscribableRef<T>,
    count: usize,
    skip: usize,
}

impl<T> WindowCount<T>
where
    T: Clone + Send + 'static,
{
    /// Windows of `count` consecutive items, back to back.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn new(source: SubscribableRef<T>, count: usize) -> Self {
        Self::with_skip(source, count, count)
    }

    /// Windows of `count` items, a new one opening every `skip` items.
    ///
    /// # Panics
    ///
    /// Panics if `count` or `skip` is zero.
    pub fn with_skip(source: SubscribableRef<T>, count: usize, skip: usize) -> Self {
        assert!(count > 0, "window count must be positive");
        assert!(skip > 0, "window skip must be positive");
        Self {
            source,
            count,
            skip,
        }
    }
}

impl<T> Subscribable<TunnelRef<T>> for WindowCount<T>
where
    T: Clone + Send + 'static,
{
    fn subscribe(
        &self,
        output: ObserverRef<TunnelRef<T>>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let settings = ctx.operator_context().settings();
        let op = Arc::new_cyclic(|this: &Weak<WindowCountOp<T>>| WindowCountOp {
            this: this.clone(),
            base: OperatorBase::new("rill/window/count", 1, ctx.operator_context().clone()),
            output,
            count: self.count,
            skip: self.skip,
            max_windows: settings.limit(keys::MAX_WINDOW_COUNT),
            state: Mutex::new(CountWindows {
                open: VecDeque::new(),
                items_seen: 0,
                loaded: false,
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct CountWindow<T> {
    tunnel: TunnelRef<T>,
    received: u64,
}

struct CountWindows<T> {
    open: VecDeque<CountWindow<T>>,
    items_seen: u64,
    loaded: bool,
}

struct WindowCountOp<T> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<TunnelRef<T>>,
    count: usize,
    skip: usize,
    max_windows: usize,
    state: Mutex<CountWindows<T>>,
    upstream: SingleAssignmentSubscription,
}

impl<T> WindowCountOp<T>
where
    T: Clone + Send + 'static,
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

    /// Opens a window and hands it downstream. Caller holds the lock.
    fn open_window(&self, state: &mut CountWindows<T>) -> Result<(), OperatorError> {
        if state.open.len() >= self.max_windows {
            return Err(OperatorError::ResourceLimit {
                resource: "open window",
                limit: self.max_windows,
            });
        }
        let tunnel = self
            .base
            .context()
            .environment()
            .create_tunnel::<T>("window");
        self.install_collect_handler(tunnel.uri());
        state.open.push_back(CountWindow {
            tunnel: tunnel.clone(),
            received: 0,
        });
        self.base.mark_dirty();
        self.output.on_next(tunnel);
        Ok(())
    }

    fn on_collect(&self, uri: &str) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        state.open.retain(|window| window.tunnel.uri() != uri);
        self.base.mark_dirty();
        debug!(uri, "window collected by consumer");
    }

    /// Completes and releases every open window. Caller holds the lock.
    fn drain_open(&self, state: &mut CountWindows<T>) {
        let environment = self.base.context().environment().clone();
        for window in std::mem::take(&mut state.open) {
            window.tunnel.subject().on_completed();
            environment.remove(window.tunnel.uri());
        }
    }
}

impl<T> Observer<T> for WindowCountOp<T>
where
    T: Clone + Send + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state.items_seen > 0 && state.items_seen % self.skip as u64 == 0 {
            if let Err(error) = self.open_window(&mut state) {
                drop(state);
                self.fail(error);
                return;
            }
        }
        state.items_seen += 1;
        self.base.mark_dirty();
        for window in &mut state.open {
            window.tunnel.subject().on_next(value.clone());
            window.received += 1;
        }
        let environment = self.base.context().environment().clone();
        while state
            .open
            .front()
            .is_some_and(|window| window.received >= self.count as u64)
        {
            let full = state.open.pop_front().expect("front window present");
            full.tunnel.subject().on_completed();
            environment.remove(full.tunnel.uri());
        }
    }

    fn on_error(&self, error: OperatorError) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        // Open windows observe the same fault.
        let environment = self.base.context().environment().clone();
        for window in std::mem::take(&mut state.open) {
            window.tunnel.subject().on_error(error.clone());
            environment.remove(window.tunnel.uri());
        }
        self.output.on_error(error);
        drop(state);
        self.terminate();
    }

    fn on_completed(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        self.drain_open(&mut state);
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T> OperatorNode for WindowCountOp<T>
where
    T: Clone + Send + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if !state.loaded {
            // The first window opens eagerly so items have somewhere to
            // land from the start.
            if let Err(error) = self.open_window(&mut state) {
                drop(state);
                self.fail(error);
            }
        }
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        self.drain_open(&mut state);
        drop(state);
        self.terminate();
    }

    fn unload(&self) {
        // Recovery teardown: open windows stay registered for the
        // successor to re-resolve.
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
        writer.write(&state.items_seen);
        writer.write(&state.open.len());
        for window in &state.open {
            writer.write(&window.tunnel.uri().to_string());
            writer.write(&window.received);
        }
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.items_seen = reader.read()?;
        let open_count: usize = reader.read()?;
        state.open.clear();
        let environment = self.base.context().environment().clone();
        for _ in 0..open_count {
            let uri: String = reader.read()?;
            let received: u64 = reader.read()?;
            // A URI that no longer resolves was already collected.
            if let Some(tunnel) = environment.resolve::<T>(&uri) {
                self.install_collect_handler(&uri);
                state.open.push_back(CountWindow { tunnel, received });
            } else {
                debug!(uri, "persisted window no longer resolves; dropped");
            }
        }
        state.loaded = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WindowTime
// ---------------------------------------------------------------------------

/// Duration-triggered windowing, with an optional opening shift.
pub struct WindowTime<T> {
    source: SubscribableRef<T>,
    duration: i64,
    shift: i64,
}

impl<T> WindowTime<T>
where
    T: Clone + Send + 'static,
{
    /// Windows of `duration` milliseconds, back to back.
    ///
    /// # Panics
    ///
    /// Panics if `duration` is not positive.
    pub fn new(source: SubscribableRef<T>, duration: i64) -> Self {
        Self::with_shift(source, duration, duration)
    }

    /// Windows of `duration` milliseconds, a new one opening every
    /// `shift` milliseconds.
    ///
    /// # Panics
    ///
    /// Panics if `duration` or `shift` is not positive.
    pub fn with_shift(source: SubscribableRef<T>, duration: i64, shift: i64) -> Self {
        assert!(duration > 0, "window duration must be positive");
        assert!(shift > 0, "window shift must be positive");
        Self {
            source,
            duration,
            shift,
        }
    }
}

impl<T> Subscribable<TunnelRef<T>> for WindowTime<T>
where
    T: Clone + Send + 'static,
{
    fn subscribe(
        &self,
        output: ObserverRef<TunnelRef<T>>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let settings = ctx.operator_context().settings();
        let op = Arc::new_cyclic(|this: &Weak<WindowTimeOp<T>>| WindowTimeOp {
            this: this.clone(),
            base: OperatorBase::new("rill/window/time", 1, ctx.operator_context().clone()),
            output,
            duration: self.duration,
            shift: self.shift,
            max_windows: settings.limit(keys::MAX_WINDOW_COUNT),
            state: Mutex::new(TimeWindows {
                open: VecDeque::new(),
                next_open_due: 0,
                epoch: 0,
                loaded: false,
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct TimeWindow<T> {
    tunnel: TunnelRef<T>,
    close_due: Timestamp,
}

struct TimeWindows<T> {
    open: VecDeque<TimeWindow<T>>,
    next_open_due: Timestamp,
    epoch: u64,
    loaded: bool,
}

struct WindowTimeOp<T> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<TunnelRef<T>>,
    duration: i64,
    shift: i64,
    max_windows: usize,
    state: Mutex<TimeWindows<T>>,
    upstream: SingleAssignmentSubscription,
}

impl<T> WindowTimeOp<T>
where
    T: Clone + Send + 'static,
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
        state.open.retain(|window| window.tunnel.uri() != uri);
        self.base.mark_dirty();
        debug!(uri, "window collected by consumer");
    }

    /// Caller holds the lock.
    fn open_window(&self, state: &mut TimeWindows<T>, close_due: Timestamp) -> Result<(), OperatorError> {
        if state.open.len() >= self.max_windows {
            return Err(OperatorError::ResourceLimit {
                resource: "open window",
                limit: self.max_windows,
            });
        }
        let tunnel = self
            .base
            .context()
            .environment()
            .create_tunnel::<T>("window");
        self.install_collect_handler(tunnel.uri());
        state.open.push_back(TimeWindow {
            tunnel: tunnel.clone(),
            close_due,
        });
        self.base.mark_dirty();
        self.output.on_next(tunnel);
        Ok(())
    }

    /// Caller holds the lock.
    fn schedule_tick(&self, state: &mut TimeWindows<T>) {
        let mut due = state.next_open_due;
        if let Some(front) = state.open.front() {
            due = due.min(front.close_due);
        }
        state.epoch += 1;
        let epoch = state.epoch;
        let weak = self.this.clone();
        self.base.context().scheduler().schedule_at(
            due,
            Box::new(move || {
                if let Some(op) = weak.upgrade() {
                    op.on_tick(epoch, due);
                }
            }),
        );
    }

    fn on_tick(&self, epoch: u64, due: Timestamp) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state.epoch != epoch {
            debug!(epoch, "stale window tick discarded");
            return;
        }
        let environment = self.base.context().environment().clone();
        // Closes strictly precede opens at a coincident boundary.
        while state
            .open
            .front()
            .is_some_and(|window| window.close_due <= due)
        {
            let closed = state.open.pop_front().expect("front window present");
            closed.tunnel.subject().on_completed();
            environment.remove(closed.tunnel.uri());
        }
        while state.next_open_due <= due {
            let close_due = state.next_open_due + self.duration;
            if let Err(error) = self.open_window(&mut state, close_due) {
                drop(state);
                self.fail(error);
                return;
            }
            state.next_open_due += self.shift;
        }
        self.base.mark_dirty();
        self.schedule_tick(&mut state);
    }

    /// Caller holds the lock.
    fn drain_open(&self, state: &mut TimeWindows<T>) {
        let environment = self.base.context().environment().clone();
        for window in std::mem::take(&mut state.open) {
            window.tunnel.subject().on_completed();
            environment.remove(window.tunnel.uri());
        }
    }
}

impl<T> Observer<T> for WindowTimeOp<T>
where
    T: Clone + Send + 'static,
{
    fn on_next(&self, value: T) {
        let state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        for window in &state.open {
            window.tunnel.subject().on_next(value.clone());
        }
    }

    fn on_error(&self, error: OperatorError) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let environment = self.base.context().environment().clone();
        for window in std::mem::take(&mut state.open) {
            window.tunnel.subject().on_error(error.clone());
            environment.remove(window.tunnel.uri());
        }
        self.output.on_error(error);
        drop(state);
        self.terminate();
    }

    fn on_completed(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        self.drain_open(&mut state);
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T> OperatorNode for WindowTimeOp<T>
where
    T: Clone + Send + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let required = usize::try_from((self.duration + self.shift - 1) / self.shift)
            .unwrap_or(usize::MAX);
        if required > self.max_windows {
            let limit = self.max_windows;
            drop(state);
            self.fail(OperatorError::ResourceLimit {
                resource: "open window",
                limit,
            });
            return;
        }
        if !state.loaded {
            let now = self.base.context().now();
            if let Err(error) = self.open_window(&mut state, now + self.duration) {
                drop(state);
                self.fail(error);
                return;
            }
            state.next_open_due = now + self.shift;
        }
        self.schedule_tick(&mut state);
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        self.drain_open(&mut state);
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
        writer.write(&state.next_open_due);
        writer.write(&state.open.len());
        for window in &state.open {
            writer.write(&window.tunnel.uri().to_string());
            writer.write(&window.close_due);
        }
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.next_open_due = reader.read()?;
        let open_count: usize = reader.read()?;
        state.open.clear();
        let environment = self.base.context().environment().clone();
        for _ in 0..open_count {
            let uri: String = reader.read()?;
            let close_due: Timestamp = reader.read()?;
            if let Some(tunnel) = environment.resolve::<T>(&uri) {
                self.install_collect_handler(&uri);
                state.open.push_back(TimeWindow { tunnel, close_due });
            } else {
                debug!(uri, "persisted window no longer resolves; dropped");
            }
        }
        state.loaded = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WindowFerry
// ---------------------------------------------------------------------------

/// Hybrid duration+count windowing: the single open window closes on
/// whichever trigger fires first, and both re-arm.
pub struct WindowFerry<T> {
    source: SubscribableRef<T>,
    duration: i64,
    count: usize,
}

impl<T> WindowFerry<T>
where
    T: Clone + Send + 'static,
{
    /// Creates the hybrid window.
    ///
    /// # Panics
    ///
    /// Panics if `duration` or `count` is not positive.
    pub fn new(source: SubscribableRef<T>, duration: i64, count: usize) -> Self {
        assert!(duration > 0, "window duration must be positive");
        assert!(count > 0, "window count must be positive");
        Self {
            source,
            duration,
            count,
        }
    }
}

impl<T> Subscribable<TunnelRef<T>> for WindowFerry<T>
where
    T: Clone + Send + 'static,
{
    fn subscribe(
        &self,
        output: ObserverRef<TunnelRef<T>>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let op = Arc::new_cyclic(|this: &Weak<WindowFerryOp<T>>| WindowFerryOp {
            this: this.clone(),
            base: OperatorBase::new("rill/window/ferry", 1, ctx.operator_context().clone()),
            output,
            duration: self.duration,
            count: self.count,
            state: Mutex::new(FerryWindowState {
                window: None,
                deadline: 0,
                epoch: 0,
                loaded: false,
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct FerryWindow<T> {
    tunnel: TunnelRef<T>,
    received: u64,
}

struct FerryWindowState<T> {
    window: Option<FerryWindow<T>>,
    deadline: Timestamp,
    epoch: u64,
    loaded: bool,
}

struct WindowFerryOp<T> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<TunnelRef<T>>,
    duration: i64,
    count: usize,
    state: Mutex<FerryWindowState<T>>,
    upstream: SingleAssignmentSubscription,
}

impl<T> WindowFerryOp<T>
where
    T: Clone + Send + 'static,
{
    fn terminate(&self) {
        if self.base.begin_dispose() {
            self.upstream.dispose();
        }
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
        if state
            .window
            .as_ref()
            .is_some_and(|window| window.tunnel.uri() == uri)
        {
            state.window = None;
            self.base.mark_dirty();
            debug!(uri, "window collected by consumer");
        }
    }

    /// Caller holds the lock.
    fn open_window(&self, state: &mut FerryWindowState<T>) {
        let tunnel = self
            .base
            .context()
            .environment()
            .create_tunnel::<T>("window");
        self.install_collect_handler(tunnel.uri());
        state.window = Some(FerryWindow {
            tunnel: tunnel.clone(),
            received: 0,
        });
        self.base.mark_dirty();
        self.output.on_next(tunnel);
    }

    /// Caller holds the lock.
    fn close_and_reopen(&self, state: &mut FerryWindowState<T>) {
        let environment = self.base.context().environment().clone();
        if let Some(window) = state.window.take() {
            window.tunnel.subject().on_completed();
            environment.remove(window.tunnel.uri());
        }
        self.open_window(state);
        state.deadline = self.base.context().now() + self.duration;
        self.schedule_tick(state);
    }

    /// Caller holds the lock.
    fn schedule_tick(&self, state: &mut FerryWindowState<T>) {
        state.epoch += 1;
        let epoch = state.epoch;
        let due = state.deadline;
        let weak = self.this.clone();
        self.base.context().scheduler().schedule_at(
            due,
            Box::new(move || {
                if let Some(op) = weak.upgrade() {
                    op.on_tick(epoch);
                }
            }),
        );
    }

    fn on_tick(&self, epoch: u64) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state.epoch != epoch {
            debug!(epoch, "stale window tick discarded");
            return;
        }
        self.close_and_reopen(&mut state);
    }
}

impl<T> Observer<T> for WindowFerryOp<T>
where
    T: Clone + Send + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let full = match &mut state.window {
            Some(window) => {
                window.tunnel.subject().on_next(value);
                window.received += 1;
                self.base.mark_dirty();
                window.received >= self.count as u64
            }
            // The only window was collected; nothing to feed until the
            // next boundary opens a fresh one.
            None => false,
        };
        if full {
            self.close_and_reopen(&mut state);
        }
    }

    fn on_error(&self, error: OperatorError) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let environment = self.base.context().environment().clone();
        if let Some(window) = state.window.take() {
            window.tunnel.subject().on_error(error.clone());
            environment.remove(window.tunnel.uri());
        }
        self.output.on_error(error);
        drop(state);
        self.terminate();
    }

    fn on_completed(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        let environment = self.base.context().environment().clone();
        if let Some(window) = state.window.take() {
            window.tunnel.subject().on_completed();
            environment.remove(window.tunnel.uri());
        }
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T> OperatorNode for WindowFerryOp<T>
where
    T: Clone + Send + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if !state.loaded {
            state.deadline = self.base.context().now() + self.duration;
        }
        if state.window.is_none() {
            // Fresh start, or the persisted window did not resolve.
            self.open_window(&mut state);
        }
        self.schedule_tick(&mut state);
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        let environment = self.base.context().environment().clone();
        if let Some(window) = state.window.take() {
            window.tunnel.subject().on_completed();
            environment.remove(window.tunnel.uri());
        }
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
        writer.write(&state.deadline);
        match &state.window {
            Some(window) => {
                writer.write(&Some(window.tunnel.uri().to_string()));
                writer.write(&window.received);
            }
            None => writer.write(&Option::<String>::None),
        }
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.deadline = reader.read()?;
        let uri: Option<String> = reader.read()?;
        state.window = None;
        if let Some(uri) = uri {
            let received: u64 = reader.read()?;
            let environment = self.base.context().environment().clone();
            if let Some(tunnel) = environment.resolve::<T>(&uri) {
                self.install_collect_handler(&uri);
                state.window = Some(FerryWindow { tunnel, received });
            } else {
                debug!(uri, "persisted window no longer resolves; dropped");
            }
        }
        state.loaded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
