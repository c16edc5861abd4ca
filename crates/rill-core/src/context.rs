//! # Operator Context
//!
//! The capability bundle handed to every operator at subscribe time: the
//! scheduler, the settings map, the tunnel environment for higher-order
//! operators, and a per-runtime timer-id counter.
//!
//! The context is cheap to clone (all members are shared handles) and a
//! pipeline's operators all see the same instance, so ids minted through
//! it are unique within one runtime without any global mutable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::scheduler::{Scheduler, SchedulerRef};
use crate::settings::Settings;
use crate::tunnel::TunnelEnvironment;

/// Shared capabilities for one runtime's operators.
#[derive(Clone)]
pub struct OperatorContext {
    scheduler: SchedulerRef,
    settings: Arc<Settings>,
    environment: Arc<TunnelEnvironment>,
    timer_ids: Arc<AtomicU64>,
}

impl OperatorContext {
    /// Creates a context over `scheduler` with default (unbounded)
    /// settings and a fresh tunnel environment.
    #[must_use]
    pub fn new(scheduler: SchedulerRef) -> Self {
        Self {
            scheduler,
            settings: Arc::new(Settings::default()),
            environment: Arc::new(TunnelEnvironment::new()),
            timer_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replaces the settings map.
    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    /// Replaces the tunnel environment.
    ///
    /// Sharing one environment across contexts lets a recovered pipeline
    /// re-resolve tunnels created by a previous incarnation.
    #[must_use]
    pub fn with_environment(mut self, environment: Arc<TunnelEnvironment>) -> Self {
        self.environment = environment;
        self
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &SchedulerRef {
        &self.scheduler
    }

    /// Returns the current scheduler time, in milliseconds.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.scheduler.now()
    }

    /// Returns the settings map.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Returns the tunnel environment.
    #[must_use]
    pub fn environment(&self) -> &Arc<TunnelEnvironment> {
        &self.environment
    }

    /// Mints the next timer instance id for this runtime.
    #[must_use]
    pub fn next_timer_id(&self) -> u64 {
        self.timer_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OperatorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorContext")
            .field("now", &self.scheduler.now())
            .finish_non_exhaustive()
    }
}
