//! End-to-end tests of the sync engine: debounce coalescing, observer
//! delivery, reconciliation, and persistence.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::time::sleep;
use vault_sync::{
    Capability, ChannelObserver, Config, Engine, Item, MemStore, OwnerEntry, OwnerId,
    OwnerVaultsDoc, PushError, Vault, VaultKey, VaultObserver, VaultStore,
};

/// A [`MemStore`] that fails the next `fail_saves` save calls.
#[derive(Debug, Clone)]
struct FlakyStore {
    inner: MemStore,
    fail_saves: Arc<AtomicUsize>,
}

impl FlakyStore {
    fn new(fail_saves: usize) -> Self {
        Self {
            inner: MemStore::new(),
            fail_saves: Arc::new(AtomicUsize::new(fail_saves)),
        }
    }
}

#[async_trait]
impl VaultStore for FlakyStore {
    async fn load(&self, owner: &OwnerId) -> Result<Option<OwnerVaultsDoc>> {
        self.inner.load(owner).await
    }

    async fn save(&self, owner: &OwnerId, doc: OwnerVaultsDoc) -> Result<()> {
        let failed = self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("injected save failure");
        }
        self.inner.save(owner, doc).await
    }
}

/// An observer whose push always panics; it must not take the broadcast
/// down with it.
#[derive(Debug)]
struct PanickyObserver {
    id: String,
    viewer: OwnerId,
    target: VaultKey,
}

impl VaultObserver for PanickyObserver {
    fn id(&self) -> &str {
        &self.id
    }

    fn viewer(&self) -> &OwnerId {
        &self.viewer
    }

    fn target(&self) -> &VaultKey {
        &self.target
    }

    fn capability(&self) -> Capability {
        Capability::PrivilegedView
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn push(&self, _slots: Arc<[Option<Item>]>, _version: u64) -> Result<(), PushError> {
        panic!("observer blew up");
    }
}

fn observer(
    id: &str,
    key: &VaultKey,
    capability: Capability,
) -> (
    Box<dyn VaultObserver>,
    tokio::sync::mpsc::Receiver<vault_sync::VaultUpdate>,
) {
    let (obs, updates) = ChannelObserver::new(id, key.owner.clone(), key.clone(), capability);
    (Box::new(obs), updates)
}

fn set_slot(entry: &OwnerEntry, vault_id: u32, slot: usize, item: Item) {
    entry
        .vaults_mut()
        .get_mut(vault_id)
        .expect("vault exists")
        .set_slot(slot, Some(item));
}

#[tokio::test(start_paused = true)]
async fn test_debounce_coalesces_burst() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 3);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(3, Vault::new("Loot", 27).unwrap());
    engine.notify_mutated(&key);

    // three slot edits inside one debounce window
    set_slot(&entry, 3, 0, Item::new("stone", 1));
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(15)).await;
    set_slot(&entry, 3, 1, Item::new("dirt", 1));
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(15)).await;
    set_slot(&entry, 3, 0, Item::new("emerald", 1));
    engine.notify_mutated(&key);

    sleep(Duration::from_millis(200)).await;

    // exactly one broadcast, reflecting the state after the last edit
    let update = o1_updates.recv().await.unwrap();
    assert_eq!(update.version, 1);
    assert_eq!(update.key, key);
    assert_eq!(update.slots.len(), 27);
    assert_eq!(update.slots[0], Some(Item::new("emerald", 1)));
    assert_eq!(update.slots[1], Some(Item::new("dirt", 1)));
    assert!(update.slots[2..].iter().all(|slot| slot.is_none()));
    assert!(o1_updates.try_recv().is_err());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_current_snapshot() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 3);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(3, Vault::new("Loot", 27).unwrap());
    set_slot(&entry, 3, 0, Item::new("emerald", 3));
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(100)).await;

    let first = o1_updates.recv().await.unwrap();
    assert_eq!(first.version, 1);

    // a second viewer joins after the burst settled: it gets the same
    // version 1 snapshot, not a stale empty view
    let (o2, mut o2_updates) = observer("o2", &key, Capability::PrivilegedView);
    engine.register_observer(o2);
    sleep(Duration::from_millis(50)).await;

    let update = o2_updates.recv().await.unwrap();
    assert_eq!(update.version, 1);
    assert_eq!(update.slots[0], Some(Item::new("emerald", 3)));
    assert!(o2_updates.try_recv().is_err());
    // the owner view saw nothing new
    assert!(o1_updates.try_recv().is_err());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_contents_produce_no_broadcast() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Chest", 9).unwrap());
    set_slot(&entry, 0, 4, Item::new("apple", 2));
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(o1_updates.recv().await.unwrap().version, 1);

    // notify without changing anything: suppressed, no version bump
    engine.notify_mutated(&key);
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(300)).await;
    assert!(o1_updates.try_recv().is_err());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_versions_are_strictly_increasing() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Chest", 9).unwrap());

    for count in 1..=5 {
        set_slot(&entry, 0, 0, Item::new("stone", count));
        engine.notify_mutated(&key);
        sleep(Duration::from_millis(100)).await;
    }

    let mut versions = Vec::new();
    while let Ok(update) = o1_updates.try_recv() {
        versions.push(update.version);
    }
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_random_burst_settles_to_final_state() {
    use rand::{Rng, SeedableRng};

    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Big chest", 54).unwrap());

    // a drag-and-drop style burst: every gap is shorter than the
    // debounce window, so the whole thing coalesces into one broadcast
    for _ in 0..40 {
        let slot = rng.gen_range(0..54);
        let count = rng.gen_range(1..=64);
        set_slot(&entry, 0, slot, Item::new("stone", count));
        engine.notify_mutated(&key);
        sleep(Duration::from_millis(rng.gen_range(0..20))).await;
    }
    sleep(Duration::from_millis(200)).await;

    let update = o1_updates.recv().await.unwrap();
    assert_eq!(update.version, 1);
    assert_eq!(
        update.slots.as_ref(),
        entry.vaults().get(0).unwrap().slots()
    );
    assert!(o1_updates.try_recv().is_err());

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_observer_does_not_block_others() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    engine.register_observer(Box::new(PanickyObserver {
        id: "bomb".into(),
        viewer: OwnerId::new("staff"),
        target: key.clone(),
    }));
    let (healthy, mut healthy_updates) = observer("healthy", &key, Capability::OwnerView);
    engine.register_observer(healthy);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Chest", 9).unwrap());
    set_slot(&entry, 0, 0, Item::new("tnt", 1));
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(healthy_updates.recv().await.unwrap().version, 1);

    // and the engine keeps working afterwards
    set_slot(&entry, 0, 1, Item::new("sand", 1));
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(healthy_updates.recv().await.unwrap().version, 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_sweep_catches_unnotified_mutations() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Chest", 9).unwrap());
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(o1_updates.recv().await.unwrap().version, 1);

    // mutate without calling notify_mutated; the reconciliation sweep
    // finds the drift on its own
    set_slot(&entry, 0, 8, Item::new("compass", 1));
    sleep(Duration::from_millis(400)).await;

    let update = o1_updates.recv().await.unwrap();
    assert_eq!(update.version, 2);
    assert_eq!(update.slots[8], Some(Item::new("compass", 1)));

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_version_counter_survives_observer_churn() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Chest", 9).unwrap());
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(o1_updates.recv().await.unwrap().version, 1);

    // the last observer leaving discards the snapshot but not the
    // version counter
    engine.unregister_observer("o1");
    sleep(Duration::from_millis(100)).await;

    let (o2, mut o2_updates) = observer("o2", &key, Capability::OwnerView);
    engine.register_observer(o2);
    sleep(Duration::from_millis(100)).await;

    // the recreated snapshot continues the version sequence
    assert_eq!(o2_updates.recv().await.unwrap().version, 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_force_save_failure_and_retry() {
    let store = FlakyStore::new(1);
    let config = Config {
        // keep the periodic cycle out of the way
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let engine = Engine::spawn(store.clone(), config);
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let entry = engine.owner_vaults(&owner).await;
    let mut vault = Vault::new("Chest", 9).unwrap();
    vault.set_slot(0, Some(Item::new("gold", 12)));
    entry.vaults_mut().insert(0, vault);
    engine.notify_mutated(&key);

    // first save fails; the entry stays dirty
    assert!(engine.force_save(&owner).await.is_err());
    assert!(entry.is_dirty());
    assert!(!store.inner.contains(&owner));

    // retry succeeds and clears the flag
    engine.force_save(&owner).await.unwrap();
    assert!(!entry.is_dirty());
    assert!(store.inner.contains(&owner));

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush_persists_mutations() {
    let store = MemStore::new();
    let config = Config {
        flush_interval: Duration::from_millis(500),
        ..Default::default()
    };
    let engine = Engine::spawn(store.clone(), config);
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Chest", 9).unwrap());
    engine.notify_mutated(&key);
    assert!(entry.is_dirty());

    sleep(Duration::from_millis(700)).await;
    assert!(!entry.is_dirty());
    assert!(store.contains(&owner));

    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_dirty_entries() {
    let store = MemStore::new();
    let engine = Engine::spawn(store.clone(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let entry = engine.owner_vaults(&owner).await;
    let mut vault = Vault::new("Chest", 9).unwrap();
    vault.set_slot(3, Some(Item::new("book", 1)));
    entry.vaults_mut().insert(0, vault);
    engine.notify_mutated(&key);

    engine.shutdown().await.unwrap();
    assert!(store.contains(&owner));

    // the engine refuses further explicit work after shutdown
    assert!(engine.force_save(&owner).await.is_err());
    // repeated shutdown is a no-op
    engine.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remove_vault_drops_observers_and_versions() {
    let engine = Engine::spawn(MemStore::new(), Config::default());
    let owner = OwnerId::new("piet");
    let key = VaultKey::new(owner.clone(), 0);

    let (o1, mut o1_updates) = observer("o1", &key, Capability::OwnerView);
    engine.register_observer(o1);

    let entry = engine.owner_vaults(&owner).await;
    entry.vaults_mut().insert(0, Vault::new("Chest", 9).unwrap());
    engine.notify_mutated(&key);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(o1_updates.recv().await.unwrap().version, 1);

    let removed = engine.remove_vault(&key).await;
    assert!(removed.is_some());
    assert!(engine.owner_vaults(&owner).await.vaults().get(0).is_none());
    sleep(Duration::from_millis(300)).await;
    assert!(o1_updates.try_recv().is_err());

    // recreating the vault starts a fresh version sequence
    engine
        .owner_vaults(&owner)
        .await
        .vaults_mut()
        .insert(0, Vault::new("Chest again", 9).unwrap());
    engine.notify_mutated(&key);
    let (o2, mut o2_updates) = observer("o2", &key, Capability::OwnerView);
    engine.register_observer(o2);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(o2_updates.recv().await.unwrap().version, 1);

    engine.shutdown().await.unwrap();
}
