//! # Bounded-Resource Settings
//!
//! Operators look up their limits through a named-settings map. Every
//! recognized key resolves with the same rule: a value greater than zero
//! is the limit; anything else (absent, zero, negative) means "use the
//! maximum representable value", i.e. effectively unbounded.
//!
//! Keys are URI-shaped strings under the `rill://operators/...` namespace
//! (see [`keys`]). The map derives `serde` so hosts can ship limit
//! configuration as JSON or TOML.

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Well-known setting keys.
pub mod keys {
    /// Maximum element count of a single buffer accumulation.
    pub const MAX_BUFFER_SIZE: &str = "rill://operators/buffer/settings/maxBufferSize";
    /// Maximum number of concurrently open buffer accumulations.
    pub const MAX_BUFFER_COUNT: &str = "rill://operators/buffer/settings/maxBufferCount";
    /// Maximum number of groups a group-by operator may hold.
    pub const MAX_GROUP_COUNT: &str = "rill://operators/groupby/settings/maxGroupCount";
    /// Maximum number of concurrently open windows.
    pub const MAX_WINDOW_COUNT: &str = "rill://operators/window/settings/maxWindowCount";
    /// Maximum number of concurrent inner subscriptions in select-many.
    pub const MAX_INNER_SUBSCRIPTION_COUNT: &str =
        "rill://operators/selectmany/settings/maxInnerSubscriptionCount";
    /// Maximum depth of a sequence-equal comparison queue.
    pub const MAX_SEQUENCE_EQUAL_QUEUE_SIZE: &str =
        "rill://operators/sequenceequal/settings/maxQueueSize";
}

/// A named-settings map with "positive integer or unbounded" semantics.
///
/// # Example
///
/// ```rust
/// use rill_core::settings::{keys, Settings};
///
/// let settings = Settings::new().with(keys::MAX_BUFFER_SIZE, 1024);
/// assert_eq!(settings.limit(keys::MAX_BUFFER_SIZE), 1024);
/// // Unset or non-positive keys resolve to "unbounded".
/// assert_eq!(settings.limit(keys::MAX_GROUP_COUNT), usize::MAX);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: FxHashMap<String, i64>,
}

impl Settings {
    /// Creates an empty settings map (everything unbounded).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: i64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Sets a value in place.
    pub fn set(&mut self, key: impl Into<String>, value: i64) {
        self.values.insert(key.into(), value);
    }

    /// Returns the raw value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    /// Resolves `key` as a resource limit.
    ///
    /// A stored value greater than zero is the limit; otherwise the
    /// maximum representable value is returned.
    #[must_use]
    pub fn limit(&self, key: &str) -> usize {
        match self.values.get(key) {
            Some(&v) if v > 0 => usize::try_from(v).unwrap_or(usize::MAX),
            _ => usize::MAX,
        }
    }
}
