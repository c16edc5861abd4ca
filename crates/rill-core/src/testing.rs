//! # Test Utilities
//!
//! Deterministic building blocks for exercising operator pipelines:
//!
//! - [`PushSource`] — a hand-driven source; `push`/`complete`/`error`
//!   deliver to whatever pipelines are subscribed and started
//! - [`RecordingObserver`] — records every notification for assertions
//! - [`test_context`] — a [`VirtualScheduler`] plus a context over it
//!
//! These are first-class API (not `cfg(test)`): hosts embedding the
//! runtime use them to validate their own pipelines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::OperatorContext;
use crate::observer::{Notification, Observer, ObserverRef};
use crate::operator::base::OperatorNode;
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::scheduler::VirtualScheduler;
use crate::subscribable::Subscribable;
use crate::subscription::{Subscription, SubscriptionRef};

/// Creates a fresh virtual scheduler and an operator context over it.
#[must_use]
pub fn test_context() -> (Arc<VirtualScheduler>, OperatorContext) {
    let scheduler = Arc::new(VirtualScheduler::new());
    let context = OperatorContext::new(scheduler.clone());
    (scheduler, context)
}

struct PushState<T> {
    observers: Vec<(u64, ObserverRef<T>)>,
    next_key: u64,
    started: bool,
    terminated: bool,
}

/// A hand-driven source for tests.
///
/// Values are delivered synchronously to every subscribed observer.
/// Delivery is only legal once the owning pipeline has started; pushing
/// earlier is a test-ordering bug and panics.
pub struct PushSource<T> {
    state: Arc<Mutex<PushState<T>>>,
}

impl<T: Clone + Send + 'static> PushSource<T> {
    /// Creates a new source.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(PushState {
                observers: Vec::new(),
                next_key: 0,
                started: false,
                terminated: false,
            })),
        })
    }

    /// Delivers a value to every subscriber.
    ///
    /// # Panics
    ///
    /// Panics if no subscribing pipeline has been started yet.
    pub fn push(&self, value: T) {
        let observers = {
            let state = self.state.lock();
            assert!(state.started, "PushSource::push before pipeline start");
            if state.terminated {
                return;
            }
            state.observers.clone()
        };
        for (_, observer) in &observers {
            observer.on_next(value.clone());
        }
    }

    /// Delivers every value in order.
    ///
    /// # Panics
    ///
    /// Panics if no subscribing pipeline has been started yet.
    pub fn push_all(&self, values: impl IntoIterator<Item = T>) {
        for value in values {
            self.push(value);
        }
    }

    /// Completes the stream. Further pushes are ignored.
    pub fn complete(&self) {
        let observers = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            observer.on_completed();
        }
    }

    /// Fails the stream. Further pushes are ignored.
    pub fn error(&self, error: OperatorError) {
        let observers = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            observer.on_error(error.clone());
        }
    }

    /// Returns whether a subscribing pipeline has started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Returns the number of attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }
}

impl<T: Clone + Send + 'static> Subscribable<T> for PushSource<T> {
    fn subscribe(&self, output: ObserverRef<T>, ctx: &mut SubscribeContext) -> SubscriptionRef {
        let key = {
            let mut state = self.state.lock();
            let key = state.next_key;
            state.next_key += 1;
            state.observers.push((key, output));
            key
        };
        ctx.register(Arc::new(PushSourceNode {
            state: Arc::clone(&self.state),
            disposed: AtomicBool::new(false),
        }));
        Arc::new(PushSourceSubscription {
            state: Arc::downgrade(&self.state),
            key,
            disposed: AtomicBool::new(false),
        })
    }
}

struct PushSourceNode<T> {
    state: Arc<Mutex<PushState<T>>>,
    disposed: AtomicBool,
}

impl<T: Clone + Send + 'static> OperatorNode for PushSourceNode<T> {
    fn node_name(&self) -> &'static str {
        "rill/testing/push-source"
    }

    fn on_start(&self) {
        self.state.lock().started = true;
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

struct PushSourceSubscription<T> {
    state: std::sync::Weak<Mutex<PushState<T>>>,
    key: u64,
    disposed: AtomicBool,
}

impl<T: Send> Subscription for PushSourceSubscription<T> {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            state.lock().observers.retain(|(key, _)| *key != self.key);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Records every notification for later assertions.
pub struct RecordingObserver<T> {
    notes: Mutex<Vec<Notification<T>>>,
}

impl<T> RecordingObserver<T> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            notes: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of recorded notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notes.lock().len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notes.lock().is_empty()
    }

    /// Returns whether a completion was recorded.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.notes
            .lock()
            .iter()
            .any(|n| matches!(n, Notification::Completed))
    }

    /// Returns the recorded error, if any.
    #[must_use]
    pub fn error(&self) -> Option<OperatorError> {
        self.notes.lock().iter().find_map(|n| match n {
            Notification::Error(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Returns the number of terminal notifications recorded.
    ///
    /// Correct streams record exactly one.
    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.notes
            .lock()
            .iter()
            .filter(|n| n.is_terminal())
            .count()
    }
}

impl<T: Clone> RecordingObserver<T> {
    /// Returns the recorded values, in delivery order.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.notes
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Next(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns every recorded notification, in delivery order.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification<T>> {
        self.notes.lock().clone()
    }
}

impl<T> Default for RecordingObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Observer<T> for RecordingObserver<T> {
    fn on_next(&self, value: T) {
        self.notes.lock().push(Notification::Next(value));
    }

    fn on_error(&self, error: OperatorError) {
        self.notes.lock().push(Notification::Error(error));
    }

    fn on_completed(&self) {
        self.notes.lock().push(Notification::Completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;

    #[test]
    fn test_push_source_round_trip() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let observer = Arc::new(RecordingObserver::new());

        let pipeline = Pipeline::subscribe(source.as_ref(), observer.clone(), context);
        assert!(!source.is_started());
        pipeline.start().unwrap();
        assert!(source.is_started());

        source.push_all([1, 2, 3]);
        source.complete();

        assert_eq!(observer.values(), vec![1, 2, 3]);
        assert!(observer.is_completed());
        assert_eq!(observer.terminal_count(), 1);
    }

    #[test]
    fn test_push_source_drops_observer_on_dispose() {
        let (_scheduler, context) = test_context();
        let source = PushSource::<i32>::new();
        let observer = Arc::new(RecordingObserver::new());

        let pipeline = Pipeline::subscribe(source.as_ref(), observer.clone(), context);
        pipeline.start().unwrap();
        assert_eq!(source.observer_count(), 1);

        pipeline.dispose();
        assert_eq!(source.observer_count(), 0);
    }
}
