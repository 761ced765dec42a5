//! Engine configuration.

use std::time::Duration;

/// Tuning knobs for the sync engine and cache.
///
/// The defaults are sized for interactive edit surfaces: a burst of slot
/// edits from one user action settles within the debounce window, and the
/// store is never left more than one flush interval behind the cache.
#[derive(Debug, Clone)]
pub struct Config {
    /// Settling delay after a change notification before diff+broadcast.
    /// Each new notification within the window resets the clock.
    pub debounce_window: Duration,
    /// Delay before the forced initial sync of a newly registered
    /// observer. Shorter than the debounce window so late joiners see
    /// state quickly.
    pub register_delay: Duration,
    /// Interval of the background reconciliation sweep that catches
    /// mutations which bypassed [`crate::engine::Engine::notify_mutated`].
    pub sweep_interval: Duration,
    /// Interval of the cache flush cycle persisting dirty owner entries.
    pub flush_interval: Duration,
    /// How long a clean cache entry is served without revalidation
    /// against the store.
    pub freshness_window: Duration,
    /// Maximum number of resident owner entries before eviction starts.
    pub max_resident_owners: usize,
    /// Upper bound on how long [`crate::engine::Engine::force_save`]
    /// waits for the save to complete.
    pub force_save_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(50),
            register_delay: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(100),
            flush_interval: Duration::from_secs(5),
            freshness_window: Duration::from_secs(30),
            max_resident_owners: 256,
            force_save_timeout: Duration::from_secs(3),
        }
    }
}
