//! Write-back cache of owner vault sets.
//!
//! Reads are served from resident entries while they are fresh; writes
//! mutate the resident entry in place and mark it dirty. Dirty entries
//! are persisted by the periodic flush cycle (or an explicit force save)
//! and are never evicted before they reach the store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::keys::OwnerId;
use crate::metrics::Metrics;
use crate::store::{OwnerVaultsDoc, VaultStore};
use crate::vault::OwnerVaults;

/// A resident cache entry: one owner's full vault set plus write-back
/// bookkeeping.
///
/// The entry is shared; edit surfaces mutate the vaults through
/// [`OwnerEntry::vaults_mut`] and then signal the engine, which marks the
/// entry dirty and schedules synchronization.
#[derive(Debug)]
pub struct OwnerEntry {
    owner: OwnerId,
    vaults: RwLock<OwnerVaults>,
    dirty: AtomicBool,
    /// Bumped on every dirty marking; lets a flush detect mutations that
    /// raced the save and must keep the entry dirty.
    generation: AtomicU64,
    last_sync: Mutex<Instant>,
}

impl OwnerEntry {
    fn new(owner: OwnerId, vaults: OwnerVaults) -> Self {
        Self {
            owner,
            vaults: RwLock::new(vaults),
            dirty: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            last_sync: Mutex::new(Instant::now()),
        }
    }

    /// The owner this entry belongs to.
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Read access to the vault set.
    pub fn vaults(&self) -> RwLockReadGuard<'_, OwnerVaults> {
        self.vaults.read().expect("poisoned")
    }

    /// Write access to the vault set.
    ///
    /// After mutating, signal the engine via
    /// [`crate::engine::Engine::notify_mutated`] so the change is marked
    /// dirty and synchronized to observers.
    pub fn vaults_mut(&self) -> RwLockWriteGuard<'_, OwnerVaults> {
        self.vaults.write().expect("poisoned")
    }

    /// Whether the entry has mutations not yet persisted to the store.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// When the entry last agreed with the store.
    pub fn last_sync(&self) -> Instant {
        *self.last_sync.lock().expect("poisoned")
    }

    pub(crate) fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Record a successful save. The dirty flag is only cleared if no new
    /// mutation arrived while the save was in flight.
    fn finish_sync(&self, saved_generation: u64) {
        *self.last_sync.lock().expect("poisoned") = Instant::now();
        if self.generation() == saved_generation {
            self.dirty.store(false, Ordering::Release);
        }
    }

    fn refresh(&self) {
        *self.last_sync.lock().expect("poisoned") = Instant::now();
    }
}

/// In-memory cache of owner vault sets over a [`VaultStore`].
#[derive(Debug, Clone)]
pub struct VaultCache<S: VaultStore> {
    inner: Arc<CacheInner<S>>,
}

#[derive(Debug)]
struct CacheInner<S> {
    entries: DashMap<OwnerId, Arc<OwnerEntry>>,
    store: S,
    freshness_window: Duration,
    max_resident: usize,
    metrics: Arc<Metrics>,
}

impl<S: VaultStore> VaultCache<S> {
    /// Create a cache over `store`.
    pub fn new(store: S, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                store,
                freshness_window: config.freshness_window,
                max_resident: config.max_resident_owners,
                metrics,
            }),
        }
    }

    /// The resident entry for `owner`, if any, without validity checks.
    pub fn resident(&self, owner: &OwnerId) -> Option<Arc<OwnerEntry>> {
        self.inner.entries.get(owner).map(|e| e.value().clone())
    }

    /// The entry for `owner`, loading from the store as needed.
    ///
    /// A fresh, clean resident entry is returned as is. A dirty entry is
    /// written back to the store first (never reloaded over, which would
    /// drop unsaved mutations) and returned. A stale clean entry is
    /// revalidated against the store in place.
    pub async fn get(&self, owner: &OwnerId) -> Arc<OwnerEntry> {
        if let Some(entry) = self.resident(owner) {
            if entry.is_dirty() {
                self.inner.metrics.cache_hits.inc();
                if let Err(err) = self.flush_entry(&entry).await {
                    warn!(owner = %owner.fmt_short(), "write-back on read failed: {err:#}");
                }
                return entry;
            }
            if entry.last_sync().elapsed() <= self.inner.freshness_window {
                self.inner.metrics.cache_hits.inc();
                return entry;
            }
            trace!(owner = %owner.fmt_short(), "revalidating stale entry");
            self.inner.metrics.cache_misses.inc();
            let generation = entry.generation();
            match self.load(owner).await {
                Ok(vaults) => {
                    // a mutation that raced the load owns the entry now
                    if entry.generation() == generation {
                        *entry.vaults_mut() = vaults;
                        entry.refresh();
                    }
                }
                // keep serving the resident copy; retried on the next get
                Err(err) => error!(owner = %owner.fmt_short(), "revalidation load failed: {err:#}"),
            }
            return entry;
        }

        self.load_and_insert(owner).await
    }

    /// The entry for `owner` for internal pipeline reads: the resident
    /// copy as is (dirty or not), loading only on a miss.
    ///
    /// No revalidation happens here. A dirty resident entry is the
    /// authority the sync pipeline must broadcast; persisting it is the
    /// flush cycle's job, not the reader's.
    pub(crate) async fn resident_or_load(&self, owner: &OwnerId) -> Arc<OwnerEntry> {
        match self.resident(owner) {
            Some(entry) => entry,
            None => self.load_and_insert(owner).await,
        }
    }

    async fn load_and_insert(&self, owner: &OwnerId) -> Arc<OwnerEntry> {
        self.inner.metrics.cache_misses.inc();
        let vaults = match self.load(owner).await {
            Ok(vaults) => vaults,
            Err(err) => {
                // not fatal: treated as "no data yet", the store copy wins
                // again once it is reachable and the entry goes stale
                error!(owner = %owner.fmt_short(), "load failed, starting empty: {err:#}");
                OwnerVaults::new()
            }
        };
        let entry = Arc::new(OwnerEntry::new(owner.clone(), vaults));
        match self.inner.entries.entry(owner.clone()) {
            // lost a racing load; the earlier entry wins
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                entry
            }
        }
    }

    /// Mark the resident entry for `owner` dirty.
    ///
    /// Returns false if the owner is not resident (nothing to mark; a
    /// non-resident entry cannot have unsaved mutations).
    pub fn mark_dirty(&self, owner: &OwnerId) -> bool {
        match self.resident(owner) {
            Some(entry) => {
                entry.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Persist every dirty resident entry, one save at a time.
    ///
    /// A failed save is logged and leaves its entry dirty for the next
    /// cycle; it does not abort the pass. Returns the number of entries
    /// flushed.
    pub async fn flush_dirty(&self) -> usize {
        let dirty: Vec<Arc<OwnerEntry>> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.is_dirty())
            .map(|e| e.value().clone())
            .collect();
        let mut flushed = 0;
        for entry in dirty {
            match self.flush_entry(&entry).await {
                Ok(()) => flushed += 1,
                Err(err) => {
                    error!(
                        owner = %entry.owner().fmt_short(),
                        "flush failed, left dirty for retry: {err:#}",
                    );
                }
            }
        }
        flushed
    }

    /// Persist the entry for `owner` now, if it is resident and dirty.
    pub async fn flush_owner(&self, owner: &OwnerId) -> Result<()> {
        let Some(entry) = self.resident(owner) else {
            return Ok(());
        };
        if !entry.is_dirty() {
            return Ok(());
        }
        self.flush_entry(&entry).await
    }

    /// Evict the least-recently-synced clean entries once the resident
    /// count exceeds the configured maximum.
    ///
    /// Dirty entries are never evicted; they hold the only copy of their
    /// mutations until a flush succeeds. Returns the number of entries
    /// removed.
    pub fn evict_if_over_capacity(&self) -> usize {
        let resident = self.inner.entries.len();
        if resident <= self.inner.max_resident {
            return 0;
        }
        let mut candidates: Vec<(OwnerId, Instant)> = self
            .inner
            .entries
            .iter()
            .filter(|e| !e.is_dirty())
            .map(|e| (e.owner().clone(), e.last_sync()))
            .collect();
        candidates.sort_by_key(|(_, last_sync)| *last_sync);

        let target = resident.div_ceil(5);
        let mut evicted = 0;
        for (owner, _) in candidates.into_iter().take(target) {
            // the entry may have been dirtied since we collected it
            if self
                .inner
                .entries
                .remove_if(&owner, |_, entry| !entry.is_dirty())
                .is_some()
            {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, resident, "evicted cache entries");
            self.inner.metrics.cache_evictions.inc_by(evicted as u64);
        }
        evicted
    }

    /// Drop the resident entry for `owner` regardless of dirty state.
    ///
    /// The next read reloads from the store. For callers that know the
    /// store has been externally modified and the resident copy is wrong.
    pub fn invalidate(&self, owner: &OwnerId) -> bool {
        let removed = self.inner.entries.remove(owner).is_some();
        if removed {
            debug!(owner = %owner.fmt_short(), "invalidated cache entry");
        }
        removed
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// True if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Number of resident entries with unsaved mutations.
    pub fn dirty_count(&self) -> usize {
        self.inner.entries.iter().filter(|e| e.is_dirty()).count()
    }

    async fn load(&self, owner: &OwnerId) -> Result<OwnerVaults> {
        let doc = match self.inner.store.load(owner).await {
            Ok(doc) => doc,
            Err(err) => {
                self.inner.metrics.store_load_failures.inc();
                return Err(err);
            }
        };
        self.inner.metrics.store_loads.inc();
        Ok(doc.map(OwnerVaults::from).unwrap_or_default())
    }

    async fn flush_entry(&self, entry: &OwnerEntry) -> Result<()> {
        let generation = entry.generation();
        let doc = OwnerVaultsDoc::from(&*entry.vaults());
        match self.inner.store.save(entry.owner(), doc).await {
            Ok(()) => {
                self.inner.metrics.store_saves.inc();
                entry.finish_sync(generation);
                trace!(owner = %entry.owner().fmt_short(), "flushed entry");
                Ok(())
            }
            Err(err) => {
                self.inner.metrics.store_save_failures.inc();
                Err(err)
            }
        }
    }
}
