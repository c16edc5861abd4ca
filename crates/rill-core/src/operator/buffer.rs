//! Bounded buffering: batches upstream values into materialized lists.
//!
//! Three trigger families, all emitting `Vec<T>` downstream:
//!
//! - [`BufferCount`] — close after `count` items; with a `skip` stride,
//!   a new accumulation opens every `skip` items, so accumulations
//!   overlap (`skip < count`) or leave gaps (`skip > count`). The overlap
//!   queue never exceeds `ceil(count / skip)` accumulations.
//! - [`BufferTime`] — close on a scheduler timer after `duration`; with
//!   a `shift` stride a new accumulation opens every `shift`
//!   milliseconds (queue bound `ceil(duration / shift)`). When a close
//!   and an open fall on the same instant, the close happens first and
//!   both happen in one tick, so no item lands in zero or two
//!   accumulations at the boundary.
//! - [`BufferFerry`] — duration *or* count, whichever comes first; the
//!   loser resets. A monotonically bumped epoch discards scheduler ticks
//!   made stale by an item-triggered early close.
//!
//! Exceeding `maxBufferSize` (per accumulation) or `maxBufferCount`
//! (open accumulations) is a fatal operator error, not a silent drop.
//!
//! Persisted state: the open accumulations (contents plus, for timed
//! variants, their absolute close deadlines), the item/opening cursor,
//! and the next open deadline. Recovery reschedules from the persisted
//! absolute deadlines; deadlines already in the past fire at the first
//! opportunity.

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
use crate::state::{StateError, StateReader, StateValue, StateWriter};
use crate::subscribable::{Subscribable, SubscribableRef};
use crate::subscription::{SingleAssignmentSubscription, Subscription, SubscriptionRef};

// ---------------------------------------------------------------------------
// BufferCount
// ---------------------------------------------------------------------------

/// Count-triggered buffering, with an optional opening stride.
pub struct BufferCount<T> {
    source: SubscribableRef<T>,
    count: usize,
    skip: usize,
}

impl<T> BufferCount<T>
where
    T: Clone + Send + StateValue + 'static,
{
    /// Buffers every `count` consecutive items (no overlap, no gaps).
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn new(source: SubscribableRef<T>, count: usize) -> Self {
        Self::with_skip(source, count, count)
    }

    /// Buffers `count` items per accumulation, opening a new one every
    /// `skip` items.
    ///
    /// # Panics
    ///
    /// Panics if `count` or `skip` is zero.
    pub fn with_skip(source: SubscribableRef<T>, count: usize, skip: usize) -> Self {
        assert!(count > 0, "buffer count must be positive");
        assert!(skip > 0, "buffer skip must be positive");
        Self {
            source,
            count,
            skip,
        }
    }
}

impl<T> Subscribable<Vec<T>> for BufferCount<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn subscribe(
        &self,
        output: ObserverRef<Vec<T>>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let settings = ctx.operator_context().settings();
        let op = Arc::new(BufferCountOp {
            base: OperatorBase::new("rill/buffer/count", 1, ctx.operator_context().clone()),
            output,
            count: self.count,
            skip: self.skip,
            max_size: settings.limit(keys::MAX_BUFFER_SIZE),
            max_open: settings.limit(keys::MAX_BUFFER_COUNT),
            state: Mutex::new(CountState {
                open: VecDeque::new(),
                items_seen: 0,
            }),
            upstream: SingleAssignmentSubscription::new(),
        });
        ctx.register(Arc::clone(&op));
        let upstream = self.source.subscribe(op.clone(), ctx);
        op.upstream.set(upstream);
        Arc::new(NodeSubscription::new(op))
    }
}

struct CountState<T> {
    open: VecDeque<Vec<T>>,
    items_seen: u64,
}

struct BufferCountOp<T> {
    base: OperatorBase,
    output: ObserverRef<Vec<T>>,
    count: usize,
    skip: usize,
    max_size: usize,
    max_open: usize,
    state: Mutex<CountState<T>>,
    upstream: SingleAssignmentSubscription,
}

impl<T> BufferCountOp<T>
where
    T: Clone + Send + StateValue + 'static,
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
}

impl<T> Observer<T> for BufferCountOp<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state.items_seen % self.skip as u64 == 0 {
            if state.open.len() >= self.max_open {
                let limit = self.max_open;
                drop(state);
                self.fail(OperatorError::ResourceLimit {
                    resource: "open buffer",
                    limit,
                });
                return;
            }
            state.open.push_back(Vec::new());
        }
        state.items_seen += 1;
        for buffer in &mut state.open {
            buffer.push(value.clone());
        }
        self.base.mark_dirty();
        while state
            .open
            .front()
            .is_some_and(|buffer| buffer.len() >= self.count)
        {
            let full = state.open.pop_front().expect("front buffer present");
            self.output.on_next(full);
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
        let open = std::mem::take(&mut state.open);
        for buffer in open {
            self.output.on_next(buffer);
        }
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T> OperatorNode for BufferCountOp<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        if self.base.is_disposed() {
            return;
        }
        if self.count > self.max_size {
            let limit = self.max_size;
            self.fail(OperatorError::ResourceLimit {
                resource: "buffer size",
                limit,
            });
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
        writer.write(&state.items_seen);
        writer.write(&Vec::from_iter(state.open.iter().cloned()));
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.items_seen = reader.read()?;
        let open: Vec<Vec<T>> = reader.read()?;
        state.open = open.into();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BufferTime
// ---------------------------------------------------------------------------

/// Duration-triggered buffering, with an optional opening shift.
pub struct BufferTime<T> {
    source: SubscribableRef<T>,
    duration: i64,
    shift: i64,
}

impl<T> BufferTime<T>
where
    T: Clone + Send + StateValue + 'static,
{
    /// Buffers `duration` milliseconds per accumulation, back to back.
    ///
    /// # Panics
    ///
    /// Panics if `duration` is not positive.
    pub fn new(source: SubscribableRef<T>, duration: i64) -> Self {
        Self::with_shift(source, duration, duration)
    }

    /// Buffers `duration` milliseconds per accumulation, opening a new
    /// one every `shift` milliseconds.
    ///
    /// # Panics
    ///
    /// Panics if `duration` or `shift` is not positive.
    pub fn with_shift(source: SubscribableRef<T>, duration: i64, shift: i64) -> Self {
        assert!(duration > 0, "buffer duration must be positive");
        assert!(shift > 0, "buffer shift must be positive");
        Self {
            source,
            duration,
            shift,
        }
    }
}

impl<T> Subscribable<Vec<T>> for BufferTime<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn subscribe(
        &self,
        output: ObserverRef<Vec<T>>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let settings = ctx.operator_context().settings();
        let op = Arc::new_cyclic(|this: &Weak<BufferTimeOp<T>>| BufferTimeOp {
            this: this.clone(),
            base: OperatorBase::new("rill/buffer/time", 1, ctx.operator_context().clone()),
            output,
            duration: self.duration,
            shift: self.shift,
            max_size: settings.limit(keys::MAX_BUFFER_SIZE),
            max_open: settings.limit(keys::MAX_BUFFER_COUNT),
            state: Mutex::new(TimeState {
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

struct TimedBuffer<T> {
    items: Vec<T>,
    close_due: Timestamp,
}

struct TimeState<T> {
    open: VecDeque<TimedBuffer<T>>,
    next_open_due: Timestamp,
    epoch: u64,
    loaded: bool,
}

struct BufferTimeOp<T> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<Vec<T>>,
    duration: i64,
    shift: i64,
    max_size: usize,
    max_open: usize,
    state: Mutex<TimeState<T>>,
    upstream: SingleAssignmentSubscription,
}

impl<T> BufferTimeOp<T>
where
    T: Clone + Send + StateValue + 'static,
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

    /// Schedules the next boundary tick. Caller holds the state lock.
    fn schedule_tick(&self, state: &mut TimeState<T>) {
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
            // Obsolete tick from before a reschedule.
            debug!(epoch, "stale buffer tick discarded");
            return;
        }

        // Closes strictly precede opens at a coincident boundary.
        while state
            .open
            .front()
            .is_some_and(|buffer| buffer.close_due <= due)
        {
            let closed = state.open.pop_front().expect("front buffer present");
            self.output.on_next(closed.items);
        }
        while state.next_open_due <= due {
            if state.open.len() >= self.max_open {
                let limit = self.max_open;
                drop(state);
                self.fail(OperatorError::ResourceLimit {
                    resource: "open buffer",
                    limit,
                });
                return;
            }
            let close_due = state.next_open_due + self.duration;
            state.open.push_back(TimedBuffer {
                items: Vec::new(),
                close_due,
            });
            state.next_open_due += self.shift;
        }
        self.base.mark_dirty();
        self.schedule_tick(&mut state);
    }
}

impl<T> Observer<T> for BufferTimeOp<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state
            .open
            .iter()
            .any(|buffer| buffer.items.len() >= self.max_size)
        {
            let limit = self.max_size;
            drop(state);
            self.fail(OperatorError::ResourceLimit {
                resource: "buffer size",
                limit,
            });
            return;
        }
        for buffer in &mut state.open {
            buffer.items.push(value.clone());
        }
        self.base.mark_dirty();
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
        let open = std::mem::take(&mut state.open);
        for buffer in open {
            self.output.on_next(buffer.items);
        }
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T> OperatorNode for BufferTimeOp<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        // Pre-size check: the overlap queue depth is fixed by the
        // duration/shift ratio.
        let required = usize::try_from((self.duration + self.shift - 1) / self.shift)
            .unwrap_or(usize::MAX);
        if required > self.max_open {
            let limit = self.max_open;
            drop(state);
            self.fail(OperatorError::ResourceLimit {
                resource: "open buffer",
                limit,
            });
            return;
        }
        if !state.loaded {
            let now = self.base.context().now();
            state.open.push_back(TimedBuffer {
                items: Vec::new(),
                close_due: now + self.duration,
            });
            state.next_open_due = now + self.shift;
        }
        self.schedule_tick(&mut state);
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
        writer.write(&state.next_open_due);
        writer.write(&state.open.len());
        for buffer in &state.open {
            writer.write(&buffer.close_due);
            writer.write(&buffer.items);
        }
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.next_open_due = reader.read()?;
        let open_count: usize = reader.read()?;
        state.open.clear();
        for _ in 0..open_count {
            let close_due = reader.read()?;
            let items = reader.read()?;
            state.open.push_back(TimedBuffer { items, close_due });
        }
        state.loaded = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BufferFerry
// ---------------------------------------------------------------------------

/// Hybrid duration+count buffering: closes on whichever trigger fires
/// first and resets the other.
pub struct BufferFerry<T> {
    source: SubscribableRef<T>,
    duration: i64,
    count: usize,
}

impl<T> BufferFerry<T>
where
    T: Clone + Send + StateValue + 'static,
{
    /// Creates the hybrid buffer.
    ///
    /// # Panics
    ///
    /// Panics if `duration` or `count` is not positive.
    pub fn new(source: SubscribableRef<T>, duration: i64, count: usize) -> Self {
        assert!(duration > 0, "buffer duration must be positive");
        assert!(count > 0, "buffer count must be positive");
        Self {
            source,
            duration,
            count,
        }
    }
}

impl<T> Subscribable<Vec<T>> for BufferFerry<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn subscribe(
        &self,
        output: ObserverRef<Vec<T>>,
        ctx: &mut SubscribeContext,
    ) -> SubscriptionRef {
        let settings = ctx.operator_context().settings();
        let op = Arc::new_cyclic(|this: &Weak<BufferFerryOp<T>>| BufferFerryOp {
            this: this.clone(),
            base: OperatorBase::new("rill/buffer/ferry", 1, ctx.operator_context().clone()),
            output,
            duration: self.duration,
            count: self.count,
            max_size: settings.limit(keys::MAX_BUFFER_SIZE),
            state: Mutex::new(FerryState {
                items: Vec::new(),
                remaining: self.count,
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

struct FerryState<T> {
    items: Vec<T>,
    remaining: usize,
    deadline: Timestamp,
    epoch: u64,
    loaded: bool,
}

struct BufferFerryOp<T> {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<Vec<T>>,
    duration: i64,
    count: usize,
    max_size: usize,
    state: Mutex<FerryState<T>>,
    upstream: SingleAssignmentSubscription,
}

impl<T> BufferFerryOp<T>
where
    T: Clone + Send + StateValue + 'static,
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

    /// Emits the current accumulation and re-arms both triggers.
    /// Caller holds the state lock.
    fn close_and_reopen(&self, state: &mut FerryState<T>) {
        let batch = std::mem::take(&mut state.items);
        self.output.on_next(batch);
        state.remaining = self.count;
        state.deadline = self.base.context().now() + self.duration;
        self.base.mark_dirty();
        self.schedule_tick(state);
    }

    /// Caller holds the state lock.
    fn schedule_tick(&self, state: &mut FerryState<T>) {
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
            // An item-triggered close got there first.
            debug!(epoch, "stale ferry tick discarded");
            return;
        }
        self.close_and_reopen(&mut state);
    }
}

impl<T> Observer<T> for BufferFerryOp<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if state.items.len() >= self.max_size {
            let limit = self.max_size;
            drop(state);
            self.fail(OperatorError::ResourceLimit {
                resource: "buffer size",
                limit,
            });
            return;
        }
        state.items.push(value);
        state.remaining = state.remaining.saturating_sub(1);
        self.base.mark_dirty();
        if state.remaining == 0 {
            self.close_and_reopen(&mut state);
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
        let batch = std::mem::take(&mut state.items);
        self.output.on_next(batch);
        self.output.on_completed();
        drop(state);
        self.terminate();
    }
}

impl<T> OperatorNode for BufferFerryOp<T>
where
    T: Clone + Send + StateValue + 'static,
{
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if self.count > self.max_size {
            let limit = self.max_size;
            drop(state);
            self.fail(OperatorError::ResourceLimit {
                resource: "buffer size",
                limit,
            });
            return;
        }
        if !state.loaded {
            state.deadline = self.base.context().now() + self.duration;
            state.remaining = self.count;
        }
        self.schedule_tick(&mut state);
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
        writer.write(&state.items);
        writer.write(&state.remaining);
        writer.write(&state.deadline);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.items = reader.read()?;
        state.remaining = reader.read()?;
        state.deadline = reader.read()?;
        state.loaded = true;
        Ok(())
    }
}
