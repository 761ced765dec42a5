//! Observers and the per-vault observer registry.
//!
//! An observer is one open view of a vault: the owner's own view or a
//! privileged third-party view. The registry tracks observers per vault
//! key and delivers pushed updates to exactly the currently-valid ones.
//! Observers are weak references in spirit: the registry never extends
//! their lifetime beyond validity, and an invalid observer is dropped on
//! the next broadcast or sweep without explicit unregistration.

use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::keys::{OwnerId, VaultKey};
use crate::snapshot::Snapshot;
use crate::vault::Item;

/// Default queue depth for [`ChannelObserver`] updates.
pub const UPDATE_CHANNEL_CAP: usize = 256;

/// What kind of view an observer represents.
///
/// The engine is agnostic to the difference; the capability travels with
/// the observer so consuming surfaces can render accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Capability {
    /// The vault's owner viewing their own vault.
    OwnerView,
    /// A privileged third party viewing someone else's vault.
    PrivilegedView,
}

/// Delivery of an update to a single observer failed.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The observer's queue is full; the update was dropped.
    #[error("observer queue full")]
    Full,
    /// The observer is gone and can no longer receive updates.
    #[error("observer closed")]
    Closed,
}

/// One open view of a vault.
///
/// Implementations decide what `push` actually does downstream; the
/// engine only requires that it is quick and non-blocking. `is_valid`
/// is the observer's self-reported liveness; once it returns false the
/// registry drops the observer on the next broadcast or sweep.
pub trait VaultObserver: Debug + Send + Sync + 'static {
    /// Unique id of this observer. Registering a second observer with the
    /// same id replaces the first.
    fn id(&self) -> &str;

    /// The principal doing the viewing (not necessarily the vault owner).
    fn viewer(&self) -> &OwnerId;

    /// The vault this observer watches.
    fn target(&self) -> &VaultKey;

    /// Owner view or privileged view.
    fn capability(&self) -> Capability;

    /// Self-reported liveness.
    fn is_valid(&self) -> bool;

    /// Deliver a new version of the vault contents.
    fn push(&self, slots: Arc<[Option<Item>]>, version: u64) -> Result<(), PushError>;
}

/// An update pushed to a [`ChannelObserver`]'s receiver.
#[derive(Debug, Clone)]
pub struct VaultUpdate {
    /// The vault the update is for.
    pub key: VaultKey,
    /// Full contents at the broadcast version.
    pub slots: Arc<[Option<Item>]>,
    /// The broadcast version.
    pub version: u64,
}

/// A [`VaultObserver`] backed by an mpsc channel.
///
/// Valid for as long as the receiver half is alive; dropping the receiver
/// invalidates the observer and the registry prunes it lazily. A full
/// queue drops the single update rather than blocking the broadcast; the
/// observer will catch up on the next one.
#[derive(Debug)]
pub struct ChannelObserver {
    id: String,
    viewer: OwnerId,
    target: VaultKey,
    capability: Capability,
    updates: mpsc::Sender<VaultUpdate>,
}

impl ChannelObserver {
    /// Create an observer and the receiver its updates arrive on.
    pub fn new(
        id: impl Into<String>,
        viewer: OwnerId,
        target: VaultKey,
        capability: Capability,
    ) -> (Self, mpsc::Receiver<VaultUpdate>) {
        let (updates, recv) = mpsc::channel(UPDATE_CHANNEL_CAP);
        (
            Self {
                id: id.into(),
                viewer,
                target,
                capability,
                updates,
            },
            recv,
        )
    }
}

impl VaultObserver for ChannelObserver {
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
        self.capability
    }

    fn is_valid(&self) -> bool {
        !self.updates.is_closed()
    }

    fn push(&self, slots: Arc<[Option<Item>]>, version: u64) -> Result<(), PushError> {
        let update = VaultUpdate {
            key: self.target.clone(),
            slots,
            version,
        };
        match self.updates.try_send(update) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PushError::Full),
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }
}

/// Counts out of a single [`Registry::broadcast`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Observers that received the push.
    pub delivered: usize,
    /// Valid observers whose push failed; they stay registered.
    pub failed: usize,
    /// Invalid observers removed as a side effect.
    pub pruned: usize,
}

/// Deliver one push, isolating errors and panics to this observer.
///
/// A misbehaving observer must not prevent delivery to the others in the
/// same broadcast pass. Returns true if the push was delivered.
fn push_isolated(observer: &dyn VaultObserver, snapshot: &Snapshot) -> bool {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        observer.push(snapshot.slots.clone(), snapshot.version)
    }));
    match result {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(
                key = %observer.target().fmt_short(),
                id = observer.id(),
                version = snapshot.version,
                "push failed: {err:#}",
            );
            false
        }
        Err(_) => {
            warn!(
                key = %observer.target().fmt_short(),
                id = observer.id(),
                version = snapshot.version,
                "push panicked",
            );
            false
        }
    }
}

/// Tracks, per vault key, the set of registered observers.
#[derive(Debug, Default, Clone)]
pub struct Registry(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    observers: DashMap<VaultKey, Vec<Box<dyn VaultObserver>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer under its target key.
    ///
    /// Idempotent on the observer id: a previous observer with the same id
    /// is replaced. Returns the key the observer was registered under.
    pub fn register(&self, observer: Box<dyn VaultObserver>) -> VaultKey {
        let key = observer.target().clone();
        trace!(key = %key.fmt_short(), id = observer.id(), "registering observer");
        let mut set = self.0.observers.entry(key.clone()).or_default();
        if let Some(existing) = set.iter_mut().find(|o| o.id() == observer.id()) {
            debug!(key = %key.fmt_short(), id = observer.id(), "replacing observer with same id");
            *existing = observer;
        } else {
            set.push(observer);
        }
        key
    }

    /// Remove the observer with the given id from whichever key holds it.
    ///
    /// Linear in the total number of observers, which is expected to be
    /// small (typically 1-3 per key). Returns the key it was registered
    /// under and whether that key's set is now empty.
    pub fn unregister(&self, observer_id: &str) -> Option<(VaultKey, bool)> {
        let mut found = None;
        for mut entry in self.0.observers.iter_mut() {
            if let Some(pos) = entry.iter().position(|o| o.id() == observer_id) {
                entry.remove(pos);
                found = Some((entry.key().clone(), entry.is_empty()));
                break;
            }
        }
        if let Some((key, now_empty)) = &found {
            trace!(key = %key.fmt_short(), id = observer_id, now_empty, "unregistered observer");
            if *now_empty {
                self.0.observers.remove_if(key, |_, set| set.is_empty());
            }
        }
        found
    }

    /// Push a snapshot to every currently-valid observer of `key`.
    ///
    /// Invalid observers are removed before delivery. A failed push is
    /// logged and does not prevent delivery to the remaining observers.
    pub fn broadcast(&self, key: &VaultKey, snapshot: &Snapshot) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let Some(mut set) = self.0.observers.get_mut(key) else {
            return outcome;
        };
        let before = set.len();
        set.retain(|observer| observer.is_valid());
        outcome.pruned = before - set.len();

        for observer in set.iter() {
            if push_isolated(observer.as_ref(), snapshot) {
                outcome.delivered += 1;
            } else {
                outcome.failed += 1;
            }
        }
        trace!(
            key = %key.fmt_short(),
            version = snapshot.version,
            delivered = outcome.delivered,
            failed = outcome.failed,
            pruned = outcome.pruned,
            "broadcast",
        );
        outcome
    }

    /// Push a snapshot to a single observer, if it is registered and valid.
    ///
    /// Used for the forced initial sync of a late joiner. Returns true if
    /// the push was delivered.
    pub fn push_to(&self, key: &VaultKey, observer_id: &str, snapshot: &Snapshot) -> bool {
        let Some(set) = self.0.observers.get(key) else {
            return false;
        };
        let Some(observer) = set.iter().find(|o| o.id() == observer_id) else {
            return false;
        };
        if !observer.is_valid() {
            return false;
        }
        push_isolated(observer.as_ref(), snapshot)
    }

    /// Remove invalid observers from every key and drop emptied keys.
    ///
    /// This is the fallback cleanup for observers that never explicitly
    /// unregister (abrupt disconnection). Returns the number of observers
    /// pruned and the keys whose sets became empty.
    pub fn sweep_invalid(&self) -> (usize, Vec<VaultKey>) {
        let mut pruned = 0;
        let mut emptied = Vec::new();
        for mut entry in self.0.observers.iter_mut() {
            let before = entry.len();
            entry.retain(|observer| observer.is_valid());
            pruned += before - entry.len();
            if entry.is_empty() && before > 0 {
                emptied.push(entry.key().clone());
            }
        }
        for key in &emptied {
            self.0.observers.remove_if(key, |_, set| set.is_empty());
        }
        if pruned > 0 {
            debug!(pruned, emptied = emptied.len(), "swept invalid observers");
        }
        (pruned, emptied)
    }

    /// Drop all observers for a key, returning how many were removed.
    ///
    /// Used when the vault itself is deleted.
    pub fn remove_key(&self, key: &VaultKey) -> usize {
        self.0
            .observers
            .remove(key)
            .map(|(_, set)| set.len())
            .unwrap_or_default()
    }

    /// Whether any observer is registered for `key`.
    pub fn has_observers(&self, key: &VaultKey) -> bool {
        self.0
            .observers
            .get(key)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// All keys with at least one registered observer.
    pub fn keys(&self) -> Vec<VaultKey> {
        self.0.observers.iter().map(|e| e.key().clone()).collect()
    }

    /// Total number of registered observers across all keys.
    pub fn observer_count(&self) -> usize {
        self.0.observers.iter().map(|e| e.len()).sum()
    }
}
