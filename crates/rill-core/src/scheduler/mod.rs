//! # Scheduler Capability
//!
//! Operators consume time through a single abstraction: a monotonic
//! [`Scheduler::now`] and [`Scheduler::schedule`]/[`Scheduler::schedule_at`]
//! for immediate or timed task execution. The production scheduler lives
//! outside this crate; the contract is all the operators see.
//!
//! Scheduled tasks may run concurrently with upstream-triggered operator
//! callbacks, so operators guard shared state with their own lock and
//! re-check their disposed flag after acquiring it — a task that fires
//! after disposal must be a no-op.
//!
//! [`VirtualScheduler`] is the deterministic implementation used by tests
//! and examples: a priority queue of due tasks driven by explicit
//! `advance_*` calls, with FIFO ordering among tasks due at the same
//! instant.

mod virtual_scheduler;

pub use virtual_scheduler::VirtualScheduler;

use std::sync::Arc;

/// Monotonic reference time, in milliseconds.
pub type Timestamp = i64;

/// A unit of deferred work.
pub type ScheduledTask = Box<dyn FnOnce() + Send>;

/// The time capability handed to every operator.
pub trait Scheduler: Send + Sync {
    /// Returns the current monotonic time in milliseconds.
    fn now(&self) -> Timestamp;

    /// Schedules a task for immediate execution.
    fn schedule(&self, task: ScheduledTask);

    /// Schedules a task to run at an absolute due time.
    ///
    /// A due time at or before [`Scheduler::now`] runs at the earliest
    /// opportunity; it is never dropped.
    fn schedule_at(&self, due: Timestamp, task: ScheduledTask);
}

/// Shared handle to a scheduler.
pub type SchedulerRef = Arc<dyn Scheduler>;
