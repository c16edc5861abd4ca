//! Timer sources: one-shot and periodic ticks with recovery catch-up.
//!
//! Both absolute and relative due times normalize to an absolute
//! next-fire instant against the scheduler's clock at start. Periodic
//! timers advance `next_due` by `previous + period` — never
//! `now + period` — so load or slow pumping does not accumulate drift.
//!
//! ## Catch-up
//!
//! When a periodic timer starts (typically after recovering a long-paused
//! checkpoint) with its next fire a full period or more in the past, the
//! next-fire instant advances by the largest whole number of periods
//! that still leaves one overdue tick: the timer fires exactly once
//! immediately, then resumes its regular cadence. A zero period fires as
//! fast as the scheduler allows and gets no catch-up adjustment.
//!
//! Disposal cancels future firing; a task that executes after disposal
//! is a muted no-op. Fire, mute, creation, and catch-up are all traced
//! with the timer's per-runtime instance id.
//!
//! Persisted: the fired flag, the tick counter, and the next-due
//! instant.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::observer::ObserverRef;
use crate::operator::base::{NodeSubscription, OperatorBase, OperatorNode};
use crate::pipeline::SubscribeContext;
use crate::scheduler::Timestamp;
use crate::state::{StateError, StateReader, StateWriter};
use crate::subscribable::Subscribable;
use crate::subscription::SubscriptionRef;

/// When a timer first fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueTime {
    /// At an absolute scheduler instant.
    Absolute(Timestamp),
    /// This many milliseconds after start.
    Relative(i64),
}

/// A timer sequence emitting its tick counter (`0, 1, 2, ...`).
///
/// One-shot timers emit a single `0` and complete; periodic timers tick
/// forever (until disposed).
pub struct Timer {
    due: DueTime,
    period: Option<i64>,
}

impl Timer {
    /// A timer that fires once and completes.
    #[must_use]
    pub fn one_shot(due: DueTime) -> Self {
        Self { due, period: None }
    }

    /// A timer that first fires at `due`, then every `period`
    /// milliseconds.
    ///
    /// # Panics
    ///
    /// Panics if `period` is negative (zero is permitted).
    #[must_use]
    pub fn periodic(due: DueTime, period: i64) -> Self {
        assert!(period >= 0, "timer period must not be negative");
        Self {
            due,
            period: Some(period),
        }
    }
}

impl Subscribable<i64> for Timer {
    fn subscribe(&self, output: ObserverRef<i64>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let id = ctx.operator_context().next_timer_id();
        let op = Arc::new_cyclic(|this: &Weak<TimerOp>| TimerOp {
            this: this.clone(),
            base: OperatorBase::new("rill/timer", 1, ctx.operator_context().clone()),
            output,
            due: self.due,
            period: self.period,
            id,
            state: Mutex::new(TimerState {
                next_due: 0,
                count: 0,
                fired: false,
                loaded: false,
            }),
        });
        ctx.register(Arc::clone(&op));
        Arc::new(NodeSubscription::new(op))
    }
}

struct TimerState {
    next_due: Timestamp,
    count: i64,
    fired: bool,
    loaded: bool,
}

struct TimerOp {
    this: Weak<Self>,
    base: OperatorBase,
    output: ObserverRef<i64>,
    due: DueTime,
    period: Option<i64>,
    id: u64,
    state: Mutex<TimerState>,
}

impl TimerOp {
    fn terminate(&self) {
        let _ = self.base.begin_dispose();
    }

    fn schedule_fire(&self, due: Timestamp) {
        let weak = self.this.clone();
        self.base.context().scheduler().schedule_at(
            due,
            Box::new(move || {
                if let Some(op) = weak.upgrade() {
                    op.on_fire();
                }
            }),
        );
    }

    fn on_fire(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            debug!(timer = self.id, "timer muted");
            return;
        }
        match self.period {
            None => {
                if state.fired {
                    return;
                }
                state.fired = true;
                self.base.mark_dirty();
                debug!(timer = self.id, tick = 0, "timer fired");
                self.output.on_next(0);
                self.output.on_completed();
                drop(state);
                self.terminate();
            }
            Some(period) => {
                let tick = state.count;
                state.count += 1;
                state.next_due = if period == 0 {
                    self.base.context().now()
                } else {
                    state.next_due + period
                };
                self.base.mark_dirty();
                debug!(timer = self.id, tick, "timer fired");
                self.output.on_next(tick);
                self.schedule_fire(state.next_due);
            }
        }
    }
}

impl OperatorNode for TimerOp {
    fn node_name(&self) -> &'static str {
        self.base.name()
    }

    fn on_start(&self) {
        let mut state = self.state.lock();
        if self.base.is_disposed() {
            return;
        }
        if !state.loaded {
            state.next_due = match self.due {
                DueTime::Absolute(at) => at,
                DueTime::Relative(delay) => self.base.context().now() + delay,
            };
            debug!(timer = self.id, due = state.next_due, "timer created");
        }
        if self.period.is_none() && state.fired {
            // Fired before the checkpoint; the terminal was already
            // delivered by the previous incarnation.
            return;
        }
        if let Some(period) = self.period {
            if period > 0 {
                let now = self.base.context().now();
                let behind = now - state.next_due;
                if behind >= period {
                    // Skip whole periods, leaving exactly one overdue
                    // tick instead of a burst.
                    let skipped = behind / period;
                    state.next_due += skipped * period;
                    debug!(timer = self.id, skipped, due = state.next_due, "timer catch-up");
                }
            }
        }
        self.schedule_fire(state.next_due);
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
        writer.write(&state.fired);
        writer.write(&state.count);
        writer.write(&state.next_due);
        Ok(())
    }

    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let mut state = self.state.lock();
        state.fired = reader.read()?;
        state.count = reader.read()?;
        state.next_due = reader.read()?;
        state.loaded = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::state::InMemoryCheckpointStore;
    use crate::testing::{test_context, RecordingObserver};

    #[test]
    fn test_one_shot_fires_once_and_completes() {
        let (scheduler, context) = test_context();
        let timer = Timer::one_shot(DueTime::Relative(50));
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&timer, observer.clone(), context);
        pipeline.start().unwrap();

        scheduler.advance_to(49);
        assert!(observer.is_empty());
        scheduler.advance_to(50);

        assert_eq!(observer.values(), vec![0]);
        assert!(observer.is_completed());
        assert_eq!(observer.terminal_count(), 1);

        // Nothing further, ever.
        scheduler.advance_to(500);
        assert_eq!(observer.len(), 2);
    }

    #[test]
    fn test_absolute_due_time() {
        let (scheduler, context) = test_context();
        scheduler.advance_to(30);
        let timer = Timer::one_shot(DueTime::Absolute(40));
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&timer, observer.clone(), context);
        pipeline.start().unwrap();

        scheduler.advance_to(40);
        assert_eq!(observer.values(), vec![0]);
    }

    #[test]
    fn test_periodic_ticks_without_drift() {
        let (scheduler, context) = test_context();
        let timer = Timer::periodic(DueTime::Relative(10), 10);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&timer, observer.clone(), context);
        pipeline.start().unwrap();

        // A single late pump still delivers every elapsed tick at its
        // nominal instant (next = previous + period).
        scheduler.advance_to(35);
        assert_eq!(observer.values(), vec![0, 1, 2]);

        scheduler.advance_to(40);
        assert_eq!(observer.values(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_disposed_timer_is_muted() {
        let (scheduler, context) = test_context();
        let timer = Timer::one_shot(DueTime::Relative(10));
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&timer, observer.clone(), context);
        pipeline.start().unwrap();

        pipeline.dispose();
        scheduler.advance_to(100);

        assert!(observer.is_empty());
    }

    #[test]
    fn test_zero_period_mutes_cleanly_on_dispose() {
        let (scheduler, context) = test_context();
        let timer = Timer::periodic(DueTime::Relative(0), 0);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&timer, observer.clone(), context);
        pipeline.start().unwrap();

        // Disposing before pumping: the queued task must be a no-op and
        // must not reschedule, or this advance would never finish.
        pipeline.dispose();
        scheduler.advance_to(10);
        assert!(observer.is_empty());
    }

    #[test]
    fn test_periodic_catch_up_fires_exactly_once() {
        let (scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        {
            let timer = Timer::periodic(DueTime::Relative(10), 10);
            let observer = Arc::new(RecordingObserver::new());
            let pipeline = Pipeline::subscribe(&timer, observer.clone(), context.clone());
            pipeline.start().unwrap();
            scheduler.advance_to(10);
            assert_eq!(observer.values(), vec![0]);
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.unload();
        }

        // A long pause: the recovered next-due (20) is far in the past.
        scheduler.advance_to(95);

        let timer = Timer::periodic(DueTime::Relative(10), 10);
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&timer, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        // Exactly one overdue tick, not one per elapsed period.
        scheduler.run_until_idle();
        assert_eq!(observer.values(), vec![1]);

        // The regular cadence resumes from the caught-up instant (90).
        scheduler.advance_to(100);
        assert_eq!(observer.values(), vec![1, 2]);
    }

    #[test]
    fn test_one_shot_already_fired_stays_silent_after_recovery() {
        let (scheduler, context) = test_context();
        let mut store = InMemoryCheckpointStore::new();

        {
            let timer = Timer::one_shot(DueTime::Relative(10));
            let observer = Arc::new(RecordingObserver::new());
            let pipeline = Pipeline::subscribe(&timer, observer.clone(), context.clone());
            pipeline.start().unwrap();
            scheduler.advance_to(10);
            assert!(observer.is_completed());
            pipeline.checkpoint(&mut store).unwrap();
            pipeline.unload();
        }

        let timer = Timer::one_shot(DueTime::Relative(10));
        let observer = Arc::new(RecordingObserver::new());
        let pipeline = Pipeline::subscribe(&timer, observer.clone(), context);
        pipeline.restore(&store).unwrap();
        pipeline.start().unwrap();

        scheduler.advance_to(200);
        assert!(observer.is_empty());
    }
}
