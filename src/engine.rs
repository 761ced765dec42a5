//! The synchronization engine service object.
//!
//! The [`Engine`] owns the observer registry, the snapshot store, the
//! write-back cache and the two actor tasks driving them. It is an
//! explicitly constructed service with a [`spawn`](Engine::spawn) /
//! [`shutdown`](Engine::shutdown) lifecycle: collaborators get a clone
//! injected instead of reaching for process-wide state, and independent
//! instances (one per test, one per shard) do not interfere.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use self::flush::{FlushActor, ToFlushActor};
use self::live::{SyncActor, ToSyncActor};
use crate::cache::{OwnerEntry, VaultCache};
use crate::config::Config;
use crate::keys::{OwnerId, VaultKey};
use crate::metrics::Metrics;
use crate::observer::{Registry, VaultObserver};
use crate::snapshot::SnapshotStore;
use crate::store::VaultStore;
use crate::vault::Vault;

mod flush;
mod live;
mod timers;

/// Capacity of the channel for [`ToSyncActor`] messages.
const SYNC_CHANNEL_CAP: usize = 64;
/// Capacity of the channel for [`ToFlushActor`] messages.
const FLUSH_CHANNEL_CAP: usize = 16;

/// The vault synchronization engine.
///
/// Keeps every open view of a vault eventually consistent with the
/// authoritative in-memory state, and writes that state back to a
/// [`VaultStore`] with bounded staleness. Cheap to clone; all clones
/// drive the same instance.
#[derive(Debug, Clone)]
pub struct Engine<S: VaultStore> {
    registry: Registry,
    snapshots: SnapshotStore,
    cache: VaultCache<S>,
    to_sync: mpsc::Sender<ToSyncActor>,
    to_flush: mpsc::Sender<ToFlushActor>,
    config: Config,
    metrics: Arc<Metrics>,
    actor_handles: Arc<Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>>,
}

impl<S: VaultStore> Engine<S> {
    /// Start the engine over `store`.
    ///
    /// Spawns two tokio tasks: the sync actor (debounce scheduling, diff
    /// and broadcast, reconciliation sweep) and the flush actor (periodic
    /// write-back and eviction). Must be called from within a runtime.
    pub fn spawn(store: S, config: Config) -> Self {
        let metrics = Arc::new(Metrics::default());
        let registry = Registry::new();
        let snapshots = SnapshotStore::new();
        let cache = VaultCache::new(store, &config, metrics.clone());

        let (to_sync, sync_inbox) = mpsc::channel(SYNC_CHANNEL_CAP);
        let (to_flush, flush_inbox) = mpsc::channel(FLUSH_CHANNEL_CAP);

        let sync_actor = SyncActor::new(
            sync_inbox,
            registry.clone(),
            snapshots.clone(),
            cache.clone(),
            config.clone(),
            metrics.clone(),
        );
        let sync_handle = tokio::task::spawn(async move {
            if let Err(err) = sync_actor.run().await {
                error!("sync actor failed: {err:?}");
            }
        });

        let flush_actor = FlushActor::new(
            flush_inbox,
            cache.clone(),
            config.clone(),
            metrics.clone(),
        );
        let flush_handle = tokio::task::spawn(flush_actor.run());

        debug!("engine started");
        Self {
            registry,
            snapshots,
            cache,
            to_sync,
            to_flush,
            config,
            metrics,
            actor_handles: Arc::new(Mutex::new(Some((sync_handle, flush_handle)))),
        }
    }

    /// Signal that the contents of `key` changed.
    ///
    /// Fire and forget: marks the owning cache entry dirty and schedules
    /// a debounced sync. The mutation is already applied to the
    /// authoritative state, so no error is reported back; delivery and
    /// persistence happen eventually on background tasks.
    pub fn notify_mutated(&self, key: &VaultKey) {
        self.cache.mark_dirty(&key.owner);
        self.send_sync(ToSyncActor::RequestSync { key: key.clone() });
    }

    /// Register an observer for its target vault.
    ///
    /// Idempotent on the observer id. The observer receives the current
    /// state via a forced initial sync shortly after registration rather
    /// than waiting for the next mutation.
    pub fn register_observer(&self, observer: Box<dyn VaultObserver>) {
        let observer_id = observer.id().to_string();
        let key = self.registry.register(observer);
        self.send_sync(ToSyncActor::ObserverRegistered { key, observer_id });
    }

    /// Remove an observer by id.
    ///
    /// When the last observer for a key leaves, the key's snapshot is
    /// discarded (the version counter survives) and pending sync work
    /// for it is cancelled.
    pub fn unregister_observer(&self, observer_id: &str) {
        if let Some((key, now_empty)) = self.registry.unregister(observer_id) {
            if now_empty {
                self.snapshots.discard(&key);
                self.send_sync(ToSyncActor::CancelSync { key });
            }
        }
    }

    /// Cache-backed access to an owner's vault set.
    ///
    /// Mutate through [`OwnerEntry::vaults_mut`] and then call
    /// [`notify_mutated`](Self::notify_mutated) for each changed vault.
    pub async fn owner_vaults(&self, owner: &OwnerId) -> Arc<OwnerEntry> {
        self.cache.get(owner).await
    }

    /// Persist `owner`'s pending mutations now, bypassing the periodic
    /// flush cycle.
    ///
    /// The only operation that reports persistence failure to the
    /// caller; bounded by [`Config::force_save_timeout`].
    pub async fn force_save(&self, owner: &OwnerId) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_flush
            .send(ToFlushActor::ForceSave {
                owner: owner.clone(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("engine is shut down"))?;
        match timeout(self.config.force_save_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow!("flush actor dropped the reply")),
            Err(_) => Err(anyhow!("force save timed out")),
        }
    }

    /// Drop the resident cache entry for `owner`, discarding unsaved
    /// mutations.
    ///
    /// For callers that know the store has been externally modified; the
    /// next read reloads from the store.
    pub fn invalidate(&self, owner: &OwnerId) -> bool {
        self.cache.invalidate(owner)
    }

    /// Delete a vault.
    ///
    /// Removes it from the owner's set and drops its snapshot, version
    /// counter, observers and pending sync work. Returns the removed
    /// vault if it existed.
    pub async fn remove_vault(&self, key: &VaultKey) -> Option<Vault> {
        let entry = self.cache.resident_or_load(&key.owner).await;
        let removed = entry.vaults_mut().remove(key.id);
        if removed.is_some() {
            self.cache.mark_dirty(&key.owner);
        }
        let dropped = self.registry.remove_key(key);
        if dropped > 0 {
            debug!(key = %key.fmt_short(), dropped, "dropped observers of deleted vault");
        }
        self.snapshots.forget(key);
        self.send_sync(ToSyncActor::VaultRemoved { key: key.clone() });
        removed
    }

    /// Metrics collected by this engine instance.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The configuration the engine was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shut the engine down.
    ///
    /// Drains both actors, flushing all dirty cache entries to the store
    /// before returning. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let handles = self.actor_handles.lock().expect("poisoned").take();
        let Some((sync_handle, flush_handle)) = handles else {
            return Ok(());
        };
        debug!("shutting down engine");

        let (reply, reply_rx) = oneshot::channel();
        if self.to_sync.send(ToSyncActor::Shutdown { reply }).await.is_ok() {
            reply_rx.await.ok();
        }
        let (reply, reply_rx) = oneshot::channel();
        if self
            .to_flush
            .send(ToFlushActor::Shutdown { reply })
            .await
            .is_ok()
        {
            reply_rx.await.ok();
        }

        sync_handle.await.context("sync actor panicked")?;
        flush_handle.await.context("flush actor panicked")?;
        Ok(())
    }

    fn send_sync(&self, msg: ToSyncActor) {
        match self.to_sync.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                // the reconciliation sweep repairs anything dropped here
                warn!(%msg, "sync inbox full, dropping message");
            }
            Err(TrySendError::Closed(msg)) => {
                debug!(%msg, "engine is shut down, dropping message");
            }
        }
    }
}
