//! Last-broadcast snapshots and per-vault version counters.
//!
//! A [`Snapshot`] is the immutable copy of a vault's slots as it was last
//! pushed to observers. Deciding whether to broadcast at all is a
//! structural diff against this copy, so a burst of mutations that nets
//! out to no change produces no push.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::keys::VaultKey;
use crate::vault::Item;

/// Immutable copy of a vault's slots at broadcast time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The slots as broadcast. Shared, never mutated.
    pub slots: Arc<[Option<Item>]>,
    /// Version allocated for this broadcast, strictly increasing per vault.
    pub version: u64,
    /// When the snapshot was captured.
    pub captured_at: Instant,
}

/// Stores the last-broadcast snapshot per vault.
///
/// Version counters are tracked separately from snapshot presence: a
/// snapshot may be discarded (last observer left) and later recreated, but
/// a version number is never reused.
#[derive(Debug, Default, Clone)]
pub struct SnapshotStore(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    snapshots: DashMap<VaultKey, Snapshot>,
    versions: DashMap<VaultKey, u64>,
}

impl SnapshotStore {
    /// Create an empty snapshot store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `current` differs structurally from the stored snapshot.
    ///
    /// A missing snapshot and a slot-count mismatch both count as
    /// different, so the first sync for a key always broadcasts.
    pub fn is_different(&self, key: &VaultKey, current: &[Option<Item>]) -> bool {
        match self.0.snapshots.get(key) {
            Some(snapshot) => snapshot.slots.as_ref() != current,
            None => true,
        }
    }

    /// Store `slots` as the new snapshot for `key` under the next version.
    ///
    /// The caller hands over an exclusive copy of the current contents;
    /// the snapshot keeps it immutable from here on.
    pub fn commit(&self, key: &VaultKey, slots: Arc<[Option<Item>]>) -> Snapshot {
        let mut version = self.0.versions.entry(key.clone()).or_insert(0);
        *version += 1;
        let snapshot = Snapshot {
            slots,
            version: *version,
            captured_at: Instant::now(),
        };
        self.0.snapshots.insert(key.clone(), snapshot.clone());
        snapshot
    }

    /// The current snapshot for `key`, if one is stored.
    pub fn get(&self, key: &VaultKey) -> Option<Snapshot> {
        self.0.snapshots.get(key).map(|s| s.value().clone())
    }

    /// Drop the stored snapshot but keep the version counter.
    ///
    /// Used when the last observer for a key leaves: the contents are no
    /// longer needed, but a later recommit must not reuse version numbers.
    pub fn discard(&self, key: &VaultKey) {
        self.0.snapshots.remove(key);
    }

    /// Drop the snapshot and the version counter.
    ///
    /// Only valid once the vault itself is deleted.
    pub fn forget(&self, key: &VaultKey) {
        self.0.snapshots.remove(key);
        self.0.versions.remove(key);
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.0.snapshots.len()
    }

    /// True if no snapshots are stored.
    pub fn is_empty(&self) -> bool {
        self.0.snapshots.is_empty()
    }
}
