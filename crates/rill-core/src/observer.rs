//! # Observer Contract
//!
//! The push boundary of the runtime. An [`Observer`] receives notifications
//! from an upstream producer through three terminal-aware callbacks:
//!
//! - [`Observer::on_next`] — a value (zero or more per stream)
//! - [`Observer::on_error`] — a terminal fault
//! - [`Observer::on_completed`] — terminal, natural end of stream
//!
//! Exactly one of error/completed is ever delivered; nothing follows a
//! terminal notification. Observers are shared across threads (upstream
//! callbacks and scheduler tasks may race), so all methods take `&self`
//! and implementations guard their own state.
//!
//! Faults travel as explicit [`OperatorError`] values rather than panics;
//! user-supplied functions report failure through `Result` and operators
//! convert those into a single terminal `on_error`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::operator::OperatorError;

/// A push-based consumer of a stream of `T`.
///
/// Implementations must tolerate concurrent invocation: the runtime
/// serializes deliveries *per operator* with that operator's lock, but an
/// observer attached to several producers (or to a producer plus a timer)
/// can be entered from more than one thread over its lifetime.
pub trait Observer<T>: Send + Sync {
    /// Delivers the next value.
    fn on_next(&self, value: T);

    /// Delivers a terminal fault. No further notifications follow.
    fn on_error(&self, error: OperatorError);

    /// Signals natural completion. No further notifications follow.
    fn on_completed(&self);
}

/// Shared handle to an observer.
pub type ObserverRef<T> = Arc<dyn Observer<T>>;

/// A materialized notification, as recorded or forwarded through channels.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    /// A value.
    Next(T),
    /// Terminal fault.
    Error(OperatorError),
    /// Terminal completion.
    Completed,
}

impl<T> Notification<T> {
    /// Returns `true` for [`Notification::Error`] and
    /// [`Notification::Completed`].
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }
}

/// An observer that discards everything.
pub struct NopObserver<T> {
    _marker: PhantomData<fn(T)>,
}

impl<T> NopObserver<T> {
    /// Creates a new discarding observer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NopObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NopObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NopObserver")
    }
}

impl<T: Send> Observer<T> for NopObserver<T> {
    fn on_next(&self, _value: T) {}
    fn on_error(&self, _error: OperatorError) {}
    fn on_completed(&self) {}
}

/// An observer built from closures.
///
/// The error and completion callbacks default to no-ops; see
/// [`FnObserver::with_error`] and [`FnObserver::with_completed`].
pub struct FnObserver<T> {
    next: Box<dyn Fn(T) + Send + Sync>,
    error: Box<dyn Fn(OperatorError) + Send + Sync>,
    completed: Box<dyn Fn() + Send + Sync>,
}

impl<T> FnObserver<T> {
    /// Creates an observer from a value callback.
    pub fn new(next: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            next: Box::new(next),
            error: Box::new(|_| {}),
            completed: Box::new(|| {}),
        }
    }

    /// Sets the fault callback.
    #[must_use]
    pub fn with_error(mut self, error: impl Fn(OperatorError) + Send + Sync + 'static) -> Self {
        self.error = Box::new(error);
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn with_completed(mut self, completed: impl Fn() + Send + Sync + 'static) -> Self {
        self.completed = Box::new(completed);
        self
    }
}

impl<T> fmt::Debug for FnObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnObserver")
    }
}

impl<T: Send> Observer<T> for FnObserver<T> {
    fn on_next(&self, value: T) {
        (self.next)(value);
    }

    fn on_error(&self, error: OperatorError) {
        (self.error)(error);
    }

    fn on_completed(&self) {
        (self.completed)();
    }
}
