//! Metrics for vault-sync.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked for the sync engine and cache.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "vaultsync")]
pub struct Metrics {
    /*
     * Sync pipeline
     */
    /// Number of diff+broadcast cycles that committed a new version.
    pub broadcasts_sent: Counter,
    /// Number of sync cycles that found contents unchanged.
    pub broadcasts_suppressed: Counter,
    /// Number of updates delivered to observers.
    pub pushes_delivered: Counter,
    /// Number of observer pushes that failed.
    pub pushes_failed: Counter,
    /// Number of observers dropped after reporting invalid.
    pub observers_pruned: Counter,
    /// Number of syncs requested by the reconciliation sweep.
    pub sweep_syncs: Counter,

    /*
     * Cache and store
     */
    /// Number of reads served from a fresh resident entry.
    pub cache_hits: Counter,
    /// Number of reads that triggered a store load.
    pub cache_misses: Counter,
    /// Number of clean entries evicted under capacity pressure.
    pub cache_evictions: Counter,
    /// Number of owner documents written to the store.
    pub store_saves: Counter,
    /// Number of owner document saves that failed.
    pub store_save_failures: Counter,
    /// Number of owner documents loaded from the store.
    pub store_loads: Counter,
    /// Number of owner document loads that failed.
    pub store_load_failures: Counter,

    /*
     * Actors
     */
    /// Number of times the sync actor loop ticked.
    pub sync_ticks: Counter,
    /// Number of times the flush actor loop ticked.
    pub flush_ticks: Counter,
}
