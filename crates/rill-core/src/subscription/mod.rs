//! # Subscription Primitives
//!
//! Disposable handles representing an active flow. Disposal is always
//! idempotent (an atomic swap decides the single winner) and synchronous:
//! once `dispose` returns, the handle reports disposed and any resource it
//! guards has been released or scheduled for release.
//!
//! Composition variants:
//!
//! - [`SingleAssignmentSubscription`] — a slot assigned at most once;
//!   assigning after disposal disposes the assignee immediately
//! - [`SerialSubscription`] — a swappable slot; replacing disposes the
//!   previous occupant
//! - [`CompositeSubscription`] — a bag of children disposed together
//! - [`RefCountSubscription`] — keeps an underlying subscription alive
//!   until the primary *and* every acquired handle have been released

mod callback;
mod stream;

pub use callback::{subscribe_callback, subscribe_fn};
pub use stream::{subscribe_stream, EventStream};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A disposable handle for an active flow.
pub trait Subscription: Send + Sync {
    /// Releases the resources held by this subscription.
    ///
    /// Idempotent: only the first call has any effect.
    fn dispose(&self);

    /// Returns `true` once [`Subscription::dispose`] has been called.
    fn is_disposed(&self) -> bool;
}

/// Shared handle to a subscription.
pub type SubscriptionRef = Arc<dyn Subscription>;

/// A subscription holding no resources.
#[derive(Debug, Default)]
pub struct NopSubscription {
    disposed: AtomicBool,
}

impl NopSubscription {
    /// Creates a new empty subscription.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Subscription for NopSubscription {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Runs a callback exactly once on disposal.
pub struct CallbackSubscription {
    disposed: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallbackSubscription {
    /// Creates a subscription that invokes `callback` when disposed.
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposed: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }
}

impl Subscription for CallbackSubscription {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// A slot that can be assigned exactly once.
///
/// If the slot was disposed before assignment, the assigned subscription
/// is disposed on the spot; the late assignee never leaks.
#[derive(Default)]
pub struct SingleAssignmentSubscription {
    disposed: AtomicBool,
    inner: Mutex<Option<SubscriptionRef>>,
}

impl SingleAssignmentSubscription {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the underlying subscription.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already assigned; single assignment is a
    /// structural invariant, not a recoverable condition.
    pub fn set(&self, subscription: SubscriptionRef) {
        if self.disposed.load(Ordering::Acquire) {
            subscription.dispose();
            return;
        }
        let mut slot = self.inner.lock();
        assert!(
            slot.is_none(),
            "SingleAssignmentSubscription assigned twice"
        );
        if self.disposed.load(Ordering::Acquire) {
            drop(slot);
            subscription.dispose();
            return;
        }
        *slot = Some(subscription);
    }
}

impl Subscription for SingleAssignmentSubscription {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.lock().take();
        if let Some(inner) = inner {
            inner.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// A slot whose occupant can be replaced; replacing disposes the previous
/// occupant, and disposing the slot disposes current and future occupants.
#[derive(Default)]
pub struct SerialSubscription {
    disposed: AtomicBool,
    inner: Mutex<Option<SubscriptionRef>>,
}

impl SerialSubscription {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new occupant, disposing the previous one.
    pub fn replace(&self, subscription: SubscriptionRef) {
        if self.disposed.load(Ordering::Acquire) {
            subscription.dispose();
            return;
        }
        let previous = {
            let mut slot = self.inner.lock();
            if self.disposed.load(Ordering::Acquire) {
                drop(slot);
                subscription.dispose();
                return;
            }
            slot.replace(subscription)
        };
        if let Some(previous) = previous {
            previous.dispose();
        }
    }

    /// Disposes and removes the current occupant, leaving the slot usable.
    pub fn clear(&self) {
        let current = self.inner.lock().take();
        if let Some(current) = current {
            current.dispose();
        }
    }
}

impl Subscription for SerialSubscription {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.lock().take();
        if let Some(inner) = inner {
            inner.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// A bag of subscriptions disposed together.
///
/// Adding to a disposed composite disposes the newcomer immediately.
#[derive(Default)]
pub struct CompositeSubscription {
    disposed: AtomicBool,
    children: Mutex<Vec<SubscriptionRef>>,
}

impl CompositeSubscription {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a child.
    pub fn add(&self, subscription: SubscriptionRef) {
        if self.disposed.load(Ordering::Acquire) {
            subscription.dispose();
            return;
        }
        let mut children = self.children.lock();
        if self.disposed.load(Ordering::Acquire) {
            drop(children);
            subscription.dispose();
            return;
        }
        children.push(subscription);
    }

    /// Returns the number of live children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    /// Returns `true` if the composite holds no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }
}

impl Subscription for CompositeSubscription {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            child.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Keeps an underlying subscription alive until the primary and every
/// acquired handle have been disposed.
///
/// Higher-order operators use this to let outstanding inner-stream
/// consumers hold the operator open slightly past upstream completion.
pub struct RefCountSubscription {
    underlying: SubscriptionRef,
    handles: AtomicUsize,
    primary_disposed: AtomicBool,
    disposed: AtomicBool,
}

impl RefCountSubscription {
    /// Wraps `underlying` in a reference-counted shell.
    #[must_use]
    pub fn new(underlying: SubscriptionRef) -> Arc<Self> {
        Arc::new(Self {
            underlying,
            handles: AtomicUsize::new(0),
            primary_disposed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Acquires a handle that must be disposed before the underlying
    /// subscription can be released.
    ///
    /// Returns `None` if the underlying subscription is already gone.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> Option<SubscriptionRef> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        self.handles.fetch_add(1, Ordering::AcqRel);
        Some(Arc::new(RefCountHandle {
            owner: Arc::clone(self),
            disposed: AtomicBool::new(false),
        }))
    }

    fn release(&self) {
        let remaining = self.handles.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.primary_disposed.load(Ordering::Acquire) {
            self.dispose_underlying();
        }
    }

    fn dispose_underlying(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.underlying.dispose();
    }
}

impl Subscription for RefCountSubscription {
    fn dispose(&self) {
        if self.primary_disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.handles.load(Ordering::Acquire) == 0 {
            self.dispose_underlying();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

struct RefCountHandle {
    owner: Arc<RefCountSubscription>,
    disposed: AtomicBool,
}

impl Subscription for RefCountHandle {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.owner.release();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting() -> (SubscriptionRef, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub: SubscriptionRef = Arc::new(CallbackSubscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        (sub, count)
    }

    #[test]
    fn test_callback_runs_once() {
        let (sub, count) = counting();
        sub.dispose();
        sub.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sub.is_disposed());
    }

    #[test]
    fn test_single_assignment_disposes_late_assignee() {
        let slot = SingleAssignmentSubscription::new();
        slot.dispose();
        let (sub, count) = counting();
        slot.set(sub);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serial_replaces_and_disposes_previous() {
        let slot = SerialSubscription::new();
        let (first, first_count) = counting();
        let (second, second_count) = counting();
        slot.replace(first);
        slot.replace(second);
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
        slot.dispose();
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_serial_clear_leaves_slot_usable() {
        let slot = SerialSubscription::new();
        let (first, first_count) = counting();
        slot.replace(first);
        slot.clear();
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert!(!slot.is_disposed());

        let (second, second_count) = counting();
        slot.replace(second);
        slot.dispose();
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_composite_disposes_all() {
        let composite = CompositeSubscription::new();
        let (a, a_count) = counting();
        let (b, b_count) = counting();
        composite.add(a);
        composite.add(b);
        assert_eq!(composite.len(), 2);
        composite.dispose();
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);

        let (late, late_count) = counting();
        composite.add(late);
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ref_count_waits_for_handles() {
        let (inner, count) = counting();
        let rc = RefCountSubscription::new(inner);
        let handle = rc.acquire().expect("not disposed yet");

        rc.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        handle.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(rc.acquire().is_none());
    }

    #[test]
    fn test_ref_count_without_handles_disposes_immediately() {
        let (inner, count) = counting();
        let rc = RefCountSubscription::new(inner);
        rc.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
