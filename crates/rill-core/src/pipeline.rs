//! # Pipeline Lifecycle
//!
//! A [`Pipeline`] is the live realization of a subscribable chain for one
//! observer. Subscribing wires the operators and registers every node in
//! creation order; the node index plus operator name forms a stable key,
//! so an identically shaped pipeline built later maps onto the same
//! checkpoint blobs.
//!
//! Lifecycle order is strict:
//!
//! 1. [`Pipeline::subscribe`] — construct and wire operators
//! 2. [`Pipeline::restore`] — optional, load checkpointed state
//! 3. [`Pipeline::start`] — sources and timers arm; notifications flow
//! 4. [`Pipeline::checkpoint`] — any time after start; differential
//!    (dirty nodes only) or [`Pipeline::checkpoint_full`]
//! 5. [`Pipeline::dispose`] — idempotent teardown
//!
//! Restoring after start is rejected: state must land before the first
//! notification or timer can observe it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::context::OperatorContext;
use crate::observer::ObserverRef;
use crate::operator::base::OperatorNode;
use crate::state::{CheckpointStore, StateError, StateReader, StateWriter};
use crate::subscribable::Subscribable;
use crate::subscription::{Subscription, SubscriptionRef};

/// Errors from pipeline lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Restore attempted after the pipeline started.
    #[error("pipeline already started; state must be restored before start")]
    AlreadyStarted,

    /// An operation was attempted on a disposed pipeline.
    #[error("pipeline disposed")]
    Disposed,

    /// A state blob failed to encode or decode.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Collects the operator nodes created while subscribing a chain.
///
/// Operators register themselves in creation order; the resulting keys
/// (`<index>/<name>`) are deterministic for a given pipeline shape and
/// independent of element values, which is what makes checkpoints from
/// one incarnation loadable into the next.
pub struct SubscribeContext {
    context: OperatorContext,
    nodes: Vec<RegisteredNode>,
}

pub(crate) struct RegisteredNode {
    key: String,
    node: Arc<dyn OperatorNode>,
}

impl SubscribeContext {
    /// Creates a context for a new pipeline.
    #[must_use]
    pub fn new(context: OperatorContext) -> Self {
        Self {
            context,
            nodes: Vec::new(),
        }
    }

    /// Returns the operator context for this runtime.
    #[must_use]
    pub fn operator_context(&self) -> &OperatorContext {
        &self.context
    }

    /// Registers a node, assigning its stable key.
    pub fn register<N: OperatorNode + 'static>(&mut self, node: Arc<N>) {
        let key = format!("{}/{}", self.nodes.len(), node.node_name());
        self.nodes.push(RegisteredNode { key, node });
    }
}

/// The live, stateful realization of a subscribable chain.
pub struct Pipeline {
    nodes: Vec<RegisteredNode>,
    root: SubscriptionRef,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl Pipeline {
    /// Wires `source` to `observer`, collecting every operator node.
    ///
    /// Nothing flows until [`Pipeline::start`].
    pub fn subscribe<T: Send + 'static>(
        source: &dyn Subscribable<T>,
        observer: ObserverRef<T>,
        context: OperatorContext,
    ) -> Self {
        let mut ctx = SubscribeContext::new(context);
        let root = source.subscribe(observer, &mut ctx);
        Self {
            nodes: ctx.nodes,
            root,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Starts every node, in registration order (sink-most first, so no
    /// source can emit into an unstarted downstream).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Disposed`] after disposal. A second start
    /// is a no-op.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PipelineError::Disposed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for entry in &self.nodes {
            entry.node.on_start();
        }
        Ok(())
    }

    /// Loads checkpointed state into the nodes, before start.
    ///
    /// Nodes whose key has no blob in `store` stay fresh. Returns the
    /// number of nodes restored.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyStarted`] after start, and
    /// [`PipelineError::State`] when a blob's `(name, version)` header
    /// does not match or its fields fail to decode.
    pub fn restore(&self, store: &dyn CheckpointStore) -> Result<usize, PipelineError> {
        if self.started.load(Ordering::Acquire) {
            return Err(PipelineError::AlreadyStarted);
        }
        let mut restored = 0;
        for entry in &self.nodes {
            let Some(blob) = store.get(&entry.key) else {
                continue;
            };
            let mut reader = StateReader::new(blob);
            reader.read_header(entry.node.node_name(), entry.node.node_version())?;
            entry.node.load_state(&mut reader)?;
            restored += 1;
        }
        debug!(restored, total = self.nodes.len(), "pipeline state restored");
        Ok(restored)
    }

    /// Writes the state of every dirty node, clearing its dirty bit.
    ///
    /// Unchanged nodes keep their previous blob in `store`, so the store
    /// always holds a consistent full snapshot. Returns the number of
    /// blobs written.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] when a node fails to serialize.
    pub fn checkpoint(&self, store: &mut dyn CheckpointStore) -> Result<usize, PipelineError> {
        self.save(store, false)
    }

    /// Writes the state of every node regardless of dirty bits.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::State`] when a node fails to serialize.
    pub fn checkpoint_full(&self, store: &mut dyn CheckpointStore) -> Result<usize, PipelineError> {
        self.save(store, true)
    }

    fn save(&self, store: &mut dyn CheckpointStore, full: bool) -> Result<usize, PipelineError> {
        let mut written = 0;
        for entry in &self.nodes {
            if !full && !entry.node.state_changed() {
                continue;
            }
            let mut writer = StateWriter::new();
            writer.write_header(entry.node.node_name(), entry.node.node_version());
            entry.node.save_state(&mut writer)?;
            store.put(&entry.key, writer.into_blob());
            entry.node.mark_saved();
            written += 1;
        }
        debug!(written, full, "pipeline checkpoint");
        Ok(written)
    }

    /// Tears the pipeline down. Idempotent; synchronously stops further
    /// downstream emission. Still-open inner streams are driven to
    /// completion.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.root.dispose();
        for entry in &self.nodes {
            entry.node.dispose();
        }
    }

    /// Releases the pipeline for checkpoint recovery: subscriptions are
    /// dropped but inner streams stay open and registered, so a
    /// successor built over the same environment can re-resolve them.
    ///
    /// Checkpoint first; a successor then restores from the store and
    /// continues the computation.
    pub fn unload(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in &self.nodes {
            entry.node.unload();
        }
    }

    /// Returns whether the pipeline has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Returns whether the pipeline has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns the number of registered operator nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the stable checkpoint keys, in registration order.
    #[must_use]
    pub fn node_keys(&self) -> Vec<String> {
        self.nodes.iter().map(|entry| entry.key.clone()).collect()
    }

    /// Returns whether any node needs a checkpoint write.
    #[must_use]
    pub fn any_state_changed(&self) -> bool {
        self.nodes.iter().any(|entry| entry.node.state_changed())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}
