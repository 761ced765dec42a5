//! The sync actor: per-vault debounce state machine and reconciliation
//! sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

use super::timers::Timers;
use crate::cache::VaultCache;
use crate::config::Config;
use crate::keys::VaultKey;
use crate::metrics::Metrics;
use crate::observer::{BroadcastOutcome, Registry};
use crate::snapshot::SnapshotStore;
use crate::store::VaultStore;
use crate::vault::Item;

/// Messages to the sync actor.
#[derive(derive_more::Debug, strum::Display)]
pub(super) enum ToSyncActor {
    /// A vault's contents changed; schedule a debounced sync.
    RequestSync { key: VaultKey },
    /// An observer joined; hand it current state and schedule a quick
    /// sync for the key.
    ObserverRegistered { key: VaultKey, observer_id: String },
    /// The last observer for a key left; pending sync work is pointless.
    CancelSync { key: VaultKey },
    /// The vault was deleted; drop its scheduling state.
    VaultRemoved { key: VaultKey },
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// Per-key scheduling state. Absence from the state map is `Idle`.
#[derive(Debug)]
enum SyncState {
    /// A debounce timer is running. `fire_at` is the authoritative
    /// deadline; timers that fire earlier were superseded and are
    /// ignored.
    Pending { fire_at: Instant },
    /// A diff+broadcast is in flight. `rerun` queues a follow-up for
    /// contents that changed mid-flight.
    Syncing { rerun: bool },
}

#[derive(Debug)]
enum SyncOutcome {
    /// Contents changed; a new version was committed and broadcast.
    Broadcast {
        version: u64,
        outcome: BroadcastOutcome,
    },
    /// Contents equal the stored snapshot; nothing was sent.
    Unchanged,
    /// Nobody is watching this key; no snapshot is kept for it.
    Unobserved,
    /// The vault no longer exists under this key.
    Missing,
}

pub(super) struct SyncActor<S: VaultStore> {
    inbox: mpsc::Receiver<ToSyncActor>,
    registry: Registry,
    snapshots: SnapshotStore,
    cache: VaultCache<S>,
    config: Config,
    metrics: Arc<Metrics>,
    /// Scheduling state per key; absent means idle.
    states: HashMap<VaultKey, SyncState>,
    /// Debounce deadlines feeding [`Self::on_timer`].
    timers: Timers<VaultKey>,
    /// In-flight diff+broadcast tasks, at most one per key.
    running: JoinSet<(VaultKey, SyncOutcome)>,
}

impl<S: VaultStore> SyncActor<S> {
    pub(super) fn new(
        inbox: mpsc::Receiver<ToSyncActor>,
        registry: Registry,
        snapshots: SnapshotStore,
        cache: VaultCache<S>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inbox,
            registry,
            snapshots,
            cache,
            config,
            metrics,
            states: HashMap::new(),
            timers: Timers::default(),
            running: JoinSet::new(),
        }
    }

    /// Run the actor loop until shutdown or until the engine is dropped.
    pub(super) async fn run(mut self) -> Result<()> {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown_reply = loop {
            self.metrics.sync_ticks.inc();
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else { break None };
                    trace!(%msg, "tick: inbox");
                    match msg {
                        ToSyncActor::Shutdown { reply } => break Some(reply),
                        msg => self.on_message(msg),
                    }
                }
                expired = self.timers.wait_and_drain() => {
                    trace!(count = expired.len(), "tick: timers");
                    for (fired, key) in expired {
                        self.on_timer(fired, key);
                    }
                }
                Some(res) = self.running.join_next(), if !self.running.is_empty() => {
                    let (key, outcome) = res.context("sync task panicked")?;
                    self.on_sync_finished(key, outcome);
                }
                _ = sweep.tick() => {
                    self.on_sweep();
                }
            }
        };

        // let in-flight syncs finish so committed versions are not lost
        while let Some(res) = self.running.join_next().await {
            match res {
                Ok((key, outcome)) => {
                    self.states.remove(&key);
                    self.record_outcome(&key, &outcome);
                }
                Err(err) => error!("sync task failed during shutdown: {err:#}"),
            }
        }
        if let Some(reply) = shutdown_reply {
            reply.send(()).ok();
        }
        debug!("sync actor stopped");
        Ok(())
    }

    fn on_message(&mut self, msg: ToSyncActor) {
        match msg {
            ToSyncActor::RequestSync { key } => {
                self.request_sync(key, self.config.debounce_window);
            }
            ToSyncActor::ObserverRegistered { key, observer_id } => {
                // Late joiner: hand it the current snapshot directly. A
                // scheduled sync alone would suppress the broadcast when
                // contents are unchanged, leaving the newcomer blank.
                if let Some(snapshot) = self.snapshots.get(&key) {
                    if self.registry.push_to(&key, &observer_id, &snapshot) {
                        self.metrics.pushes_delivered.inc();
                        trace!(
                            key = %key.fmt_short(),
                            id = %observer_id,
                            version = snapshot.version,
                            "pushed snapshot to new observer",
                        );
                    }
                }
                // and reconcile shortly in case contents drifted
                self.request_sync(key, self.config.register_delay);
            }
            ToSyncActor::CancelSync { key } => {
                let drop_state = match self.states.get_mut(&key) {
                    Some(SyncState::Pending { .. }) => true,
                    Some(SyncState::Syncing { rerun }) => {
                        // let the in-flight sync finish, but nobody is
                        // left to care about a follow-up
                        *rerun = false;
                        false
                    }
                    None => false,
                };
                if drop_state {
                    trace!(key = %key.fmt_short(), "cancelled pending sync");
                    self.states.remove(&key);
                }
            }
            ToSyncActor::VaultRemoved { key } => {
                self.states.remove(&key);
            }
            ToSyncActor::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    /// The debounce state machine entry point.
    fn request_sync(&mut self, key: VaultKey, delay: Duration) {
        let fire_at = Instant::now() + delay;
        match self.states.get_mut(&key) {
            Some(SyncState::Syncing { rerun }) => {
                trace!(key = %key.fmt_short(), "sync in flight, queueing follow-up");
                *rerun = true;
            }
            Some(SyncState::Pending { fire_at: deadline }) => {
                // trailing-edge debounce: the newest request owns the clock
                *deadline = fire_at;
                self.timers.insert(fire_at, key);
            }
            None => {
                self.states.insert(key.clone(), SyncState::Pending { fire_at });
                self.timers.insert(fire_at, key);
            }
        }
    }

    fn on_timer(&mut self, fired: Instant, key: VaultKey) {
        match self.states.get(&key) {
            Some(SyncState::Pending { fire_at }) if *fire_at <= fired => self.start_sync(key),
            // superseded by a newer deadline, or cancelled
            _ => trace!(key = %key.fmt_short(), "stale timer"),
        }
    }

    fn start_sync(&mut self, key: VaultKey) {
        self.states
            .insert(key.clone(), SyncState::Syncing { rerun: false });
        let cache = self.cache.clone();
        let snapshots = self.snapshots.clone();
        let registry = self.registry.clone();
        self.running.spawn(async move {
            let outcome = sync_one(&cache, &snapshots, &registry, &key).await;
            (key, outcome)
        });
    }

    fn on_sync_finished(&mut self, key: VaultKey, outcome: SyncOutcome) {
        self.record_outcome(&key, &outcome);
        let rerun = matches!(
            self.states.remove(&key),
            Some(SyncState::Syncing { rerun: true })
        );
        if rerun {
            self.request_sync(key, self.config.debounce_window);
        }
    }

    fn record_outcome(&self, key: &VaultKey, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Broadcast { version, outcome } => {
                self.metrics.broadcasts_sent.inc();
                self.metrics.pushes_delivered.inc_by(outcome.delivered as u64);
                self.metrics.pushes_failed.inc_by(outcome.failed as u64);
                self.metrics.observers_pruned.inc_by(outcome.pruned as u64);
                debug!(
                    key = %key.fmt_short(),
                    version,
                    delivered = outcome.delivered,
                    failed = outcome.failed,
                    "broadcast new version",
                );
            }
            SyncOutcome::Unchanged => {
                self.metrics.broadcasts_suppressed.inc();
            }
            SyncOutcome::Unobserved | SyncOutcome::Missing => {}
        }
    }

    /// Reconciliation: prune invalid observers and re-diff watched keys
    /// whose contents changed through a path that never notified us.
    ///
    /// Keys with a pending debounce timer are left alone; resetting their
    /// clock from here could starve the trailing edge.
    fn on_sweep(&mut self) {
        let (pruned, emptied) = self.registry.sweep_invalid();
        self.metrics.observers_pruned.inc_by(pruned as u64);
        for key in emptied {
            self.snapshots.discard(&key);
            self.states.remove(&key);
        }

        for key in self.registry.keys() {
            if self.states.contains_key(&key) {
                continue;
            }
            // only resident owners can have drifted in memory; an evicted
            // entry was clean, so the store copy still matches
            let Some(entry) = self.cache.resident(&key.owner) else {
                continue;
            };
            let differs = {
                let vaults = entry.vaults();
                match vaults.get(key.id) {
                    Some(vault) => self.snapshots.is_different(&key, vault.slots()),
                    None => false,
                }
            };
            if differs {
                self.metrics.sweep_syncs.inc();
                debug!(key = %key.fmt_short(), "sweep found drifted contents");
                self.request_sync(key, self.config.debounce_window);
            }
        }
    }
}

/// One diff+broadcast cycle for a single key.
async fn sync_one<S: VaultStore>(
    cache: &VaultCache<S>,
    snapshots: &SnapshotStore,
    registry: &Registry,
    key: &VaultKey,
) -> SyncOutcome {
    // snapshots are kept only for watched keys; without observers there
    // is nothing to diff against and nobody to push to
    if !registry.has_observers(key) {
        snapshots.discard(key);
        return SyncOutcome::Unobserved;
    }
    let entry = cache.resident_or_load(&key.owner).await;
    let slots: Option<Arc<[Option<Item>]>> = {
        let vaults = entry.vaults();
        vaults.get(key.id).map(|vault| vault.slots().to_vec().into())
    };
    let Some(slots) = slots else {
        snapshots.discard(key);
        return SyncOutcome::Missing;
    };
    if !snapshots.is_different(key, &slots) {
        return SyncOutcome::Unchanged;
    }
    let snapshot = snapshots.commit(key, slots);
    let outcome = registry.broadcast(key, &snapshot);
    SyncOutcome::Broadcast {
        version: snapshot.version,
        outcome,
    }
}
