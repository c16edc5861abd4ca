//! # Inner-Stream Tunnels
//!
//! Higher-order operators (group-by, window, select-many, switch,
//! throttle) hand nested streams to their consumers as first-class
//! values. Each nested stream is a *tunnel*: a [`Subject`] registered in
//! the [`TunnelEnvironment`] under a URI in the
//! `rill://tunnel/<kind>/<n>` namespace.
//!
//! Ownership is joint. The creating operator feeds the subject and tracks
//! the URI as a checkpoint dependency; the consumer subscribes to it (or
//! never does). A [`TunnelEnvironment::collect`] call signals that the
//! consumer has released the tunnel — the entry is removed and the
//! creator's collect handler runs so it can drop the dependency. On
//! recovery, persisted URIs are re-resolved against the environment;
//! URIs that no longer resolve are dropped silently (the tunnel is
//! presumed already collected).

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::observer::{Observer, ObserverRef};
use crate::operator::OperatorError;
use crate::pipeline::SubscribeContext;
use crate::subscribable::Subscribable;
use crate::subscription::{Subscription, SubscriptionRef};

enum Terminal {
    Completed,
    Error(OperatorError),
}

struct SubjectState<T> {
    observers: SmallVec<[(u64, ObserverRef<T>); 4]>,
    next_key: u64,
    terminal: Option<Terminal>,
}

/// A multicast inner stream.
///
/// Values pushed into the subject fan out to every current observer; a
/// terminal notification latches, detaches all observers, and replays to
/// late subscribers so no consumer hangs on an already-finished tunnel.
pub struct Subject<T> {
    state: Arc<Mutex<SubjectState<T>>>,
    uri: Option<String>,
}

impl<T: Clone + Send + 'static> Subject<T> {
    /// Creates an anonymous subject.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a subject addressed by `uri`.
    #[must_use]
    pub fn with_uri(uri: String) -> Self {
        Self::build(Some(uri))
    }

    fn build(uri: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SubjectState {
                observers: SmallVec::new(),
                next_key: 0,
                terminal: None,
            })),
            uri,
        }
    }

    /// Returns the tunnel URI, if addressed.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Attaches an observer, returning its detach handle.
    ///
    /// If the subject already terminated, the terminal notification is
    /// replayed immediately and the returned handle is inert.
    pub fn subscribe_observer(&self, observer: ObserverRef<T>) -> SubscriptionRef {
        let key = {
            let mut state = self.state.lock();
            match &state.terminal {
                Some(Terminal::Completed) => {
                    drop(state);
                    observer.on_completed();
                    return Arc::new(crate::subscription::NopSubscription::new());
                }
                Some(Terminal::Error(error)) => {
                    let error = error.clone();
                    drop(state);
                    observer.on_error(error);
                    return Arc::new(crate::subscription::NopSubscription::new());
                }
                None => {
                    let key = state.next_key;
                    state.next_key += 1;
                    state.observers.push((key, observer));
                    key
                }
            }
        };
        Arc::new(SubjectSubscription {
            state: Arc::downgrade(&self.state),
            key,
            disposed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Returns the number of attached observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Returns `true` once a terminal notification has been delivered.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Observer<T> for Subject<T> {
    fn on_next(&self, value: T) {
        let observers = {
            let state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.observers.clone()
        };
        for (_, observer) in &observers {
            observer.on_next(value.clone());
        }
    }

    fn on_error(&self, error: OperatorError) {
        let observers = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(Terminal::Error(error.clone()));
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            observer.on_error(error.clone());
        }
    }

    fn on_completed(&self) {
        let observers = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(Terminal::Completed);
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            observer.on_completed();
        }
    }
}

impl<T: Clone + Send + 'static> Subscribable<T> for Subject<T> {
    fn subscribe(&self, output: ObserverRef<T>, _ctx: &mut SubscribeContext) -> SubscriptionRef {
        self.subscribe_observer(output)
    }

    fn tunnel_uri(&self) -> Option<String> {
        self.uri.clone()
    }
}

struct SubjectSubscription<T> {
    state: Weak<Mutex<SubjectState<T>>>,
    key: u64,
    disposed: std::sync::atomic::AtomicBool,
}

impl<T: Send> Subscription for SubjectSubscription<T> {
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

/// A value-shaped reference to an addressed tunnel.
///
/// This is what higher-order operators emit downstream: the consumer can
/// subscribe to it like any sequence, and the creator can persist just
/// the URI.
pub struct TunnelRef<T> {
    uri: String,
    subject: Arc<Subject<T>>,
}

impl<T: Clone + Send + 'static> TunnelRef<T> {
    pub(crate) fn new(uri: String, subject: Arc<Subject<T>>) -> Self {
        Self { uri, subject }
    }

    /// Returns the tunnel URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the underlying subject.
    #[must_use]
    pub fn subject(&self) -> &Arc<Subject<T>> {
        &self.subject
    }
}

impl<T> Clone for TunnelRef<T> {
    fn clone(&self) -> Self {
        Self {
            uri: self.uri.clone(),
            subject: Arc::clone(&self.subject),
        }
    }
}

impl<T> std::fmt::Debug for TunnelRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRef").field("uri", &self.uri).finish()
    }
}

impl<T: Clone + Send + 'static> Subscribable<T> for TunnelRef<T> {
    fn subscribe(&self, output: ObserverRef<T>, _ctx: &mut SubscribeContext) -> SubscriptionRef {
        self.subject.subscribe_observer(output)
    }

    fn tunnel_uri(&self) -> Option<String> {
        Some(self.uri.clone())
    }
}

type CollectHandler = Arc<dyn Fn(&str) + Send + Sync>;

struct TunnelEntry {
    subject: Arc<dyn Any + Send + Sync>,
    on_collect: Option<CollectHandler>,
}

/// The URI-addressed registry of live tunnels.
pub struct TunnelEnvironment {
    entries: Mutex<FxHashMap<String, TunnelEntry>>,
    next_id: AtomicU64,
}

impl TunnelEnvironment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Creates and registers a fresh tunnel under
    /// `rill://tunnel/<kind>/<n>`.
    pub fn create_tunnel<T: Clone + Send + 'static>(&self, kind: &str) -> TunnelRef<T> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let uri = format!("rill://tunnel/{kind}/{n}");
        let subject = Arc::new(Subject::<T>::with_uri(uri.clone()));
        self.entries.lock().insert(
            uri.clone(),
            TunnelEntry {
                subject: subject.clone(),
                on_collect: None,
            },
        );
        TunnelRef::new(uri, subject)
    }

    /// Resolves a persisted URI back to its live tunnel.
    ///
    /// Returns `None` when the URI is unknown or the element type does
    /// not match — callers drop such references silently.
    #[must_use]
    pub fn resolve<T: Clone + Send + 'static>(&self, uri: &str) -> Option<TunnelRef<T>> {
        let entries = self.entries.lock();
        let entry = entries.get(uri)?;
        let subject = Arc::clone(&entry.subject).downcast::<Subject<T>>().ok()?;
        Some(TunnelRef::new(uri.to_string(), subject))
    }

    /// Installs the creating operator's collect handler for `uri`.
    ///
    /// Returns `false` if the tunnel is not (or no longer) registered.
    pub fn set_collect_handler(&self, uri: &str, handler: CollectHandler) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(uri) {
            Some(entry) => {
                entry.on_collect = Some(handler);
                true
            }
            None => false,
        }
    }

    /// Signals that the consumer has released the tunnel.
    ///
    /// Removes the entry and invokes the creator's collect handler (after
    /// the registry lock is released, so the handler may take the
    /// creating operator's lock). Returns `true` if the tunnel existed.
    pub fn collect(&self, uri: &str) -> bool {
        let entry = self.entries.lock().remove(uri);
        match entry {
            Some(entry) => {
                if let Some(handler) = entry.on_collect {
                    handler(uri);
                }
                true
            }
            None => false,
        }
    }

    /// Removes a tunnel without signaling collection (creator teardown).
    pub fn remove(&self, uri: &str) -> bool {
        self.entries.lock().remove(uri).is_some()
    }

    /// Returns `true` if `uri` is registered.
    #[must_use]
    pub fn contains(&self, uri: &str) -> bool {
        self.entries.lock().contains_key(uri)
    }

    /// Returns the number of registered tunnels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no tunnels are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for TunnelEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TunnelEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEnvironment")
            .field("tunnels", &self.len())
            .finish()
    }
}
