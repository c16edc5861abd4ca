//! Common operator state machine: lifecycle flags, dirty-bit tracking,
//! and the node contract the pipeline drives for start, disposal, and
//! versioned state save/load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::OperatorContext;
use crate::state::{StateError, StateReader, StateWriter};
use crate::subscription::Subscription;

/// Shared lifecycle state embedded in every operator instance.
///
/// Holds the `(name, version)` identity used for state-blob headers, the
/// dirty bit gating differential checkpoints, the disposed flag checked
/// on every delivery path, and the operator's context.
pub struct OperatorBase {
    name: &'static str,
    version: u32,
    context: OperatorContext,
    dirty: AtomicBool,
    disposed: AtomicBool,
    started: AtomicBool,
}

impl OperatorBase {
    /// Creates the base for an operator named `name` at state `version`.
    #[must_use]
    pub fn new(name: &'static str, version: u32, context: OperatorContext) -> Self {
        Self {
            name,
            version,
            context,
            dirty: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Returns the operator name (state-blob identity).
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the state-blob version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the operator context.
    #[must_use]
    pub fn context(&self) -> &OperatorContext {
        &self.context
    }

    /// Records that persisted state has changed since the last save.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears the dirty bit (called after a successful save).
    pub fn mark_saved(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Returns whether a checkpoint write is needed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Returns whether the operator has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Claims disposal. Returns `true` for exactly one caller.
    pub fn begin_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Claims the start transition. Returns `true` for the first caller.
    pub fn begin_start(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Returns whether the operator has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for OperatorBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorBase")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("dirty", &self.is_dirty())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// The lifecycle contract every operator node implements.
///
/// The pipeline calls these in a fixed order: `load_state` (only when
/// recovering, before start), `on_start` once, then `save_state` on each
/// checkpoint of a dirty node, and `dispose` at teardown. Default
/// implementations cover stateless operators.
pub trait OperatorNode: Send + Sync {
    /// The node's stable name, used in state-blob headers and node keys.
    fn node_name(&self) -> &'static str;

    /// The node's state-blob version.
    fn node_version(&self) -> u32 {
        1
    }

    /// Begins active operation: schedule timers, arm sources.
    ///
    /// Called exactly once, after any state load. Subscriptions to
    /// upstream sources are wired earlier, at subscribe time; sources
    /// hold all emission until started.
    fn on_start(&self) {}

    /// Releases the operator and everything it owns. Idempotent.
    ///
    /// Disposal is terminal: still-open inner streams are driven to
    /// completion and dropped from the environment.
    fn dispose(&self);

    /// Releases the operator *without* terminating its inner streams.
    ///
    /// This is the checkpoint-recovery teardown: tunnels stay registered
    /// in the environment so a successor incarnation can re-resolve
    /// their persisted URIs. Operators that own no inner streams just
    /// dispose.
    fn unload(&self) {
        self.dispose();
    }

    /// Returns whether the operator has been disposed.
    fn is_disposed(&self) -> bool;

    /// Returns whether persisted state changed since the last save.
    fn state_changed(&self) -> bool {
        false
    }

    /// Clears the dirty bit after a save.
    fn mark_saved(&self) {}

    /// Writes the operator's state fields, in dependency order.
    ///
    /// # Errors
    ///
    /// Implementations report codec failures as [`StateError`].
    fn save_state(&self, writer: &mut StateWriter) -> Result<(), StateError> {
        let _ = writer;
        Ok(())
    }

    /// Reads the operator's state fields, in the order they were written.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the blob is truncated or malformed.
    fn load_state(&self, reader: &mut StateReader) -> Result<(), StateError> {
        let _ = reader;
        Ok(())
    }
}

/// Adapts an operator node into the subscription returned to its
/// downstream: disposing the subscription disposes the node.
pub(crate) struct NodeSubscription {
    node: Arc<dyn OperatorNode>,
}

impl NodeSubscription {
    pub(crate) fn new(node: Arc<dyn OperatorNode>) -> Self {
        Self { node }
    }
}

impl Subscription for NodeSubscription {
    fn dispose(&self) {
        self.node.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.node.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::VirtualScheduler;

    fn base() -> OperatorBase {
        OperatorBase::new(
            "rill/test",
            1,
            OperatorContext::new(Arc::new(VirtualScheduler::new())),
        )
    }

    #[test]
    fn test_dirty_bit() {
        let base = base();
        assert!(!base.is_dirty());
        base.mark_dirty();
        assert!(base.is_dirty());
        base.mark_saved();
        assert!(!base.is_dirty());
    }

    #[test]
    fn test_dispose_claimed_once() {
        let base = base();
        assert!(base.begin_dispose());
        assert!(!base.begin_dispose());
        assert!(base.is_disposed());
    }

    #[test]
    fn test_start_claimed_once() {
        let base = base();
        assert!(!base.is_started());
        assert!(base.begin_start());
        assert!(!base.begin_start());
        assert!(base.is_started());
    }
}
