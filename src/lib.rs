//! Live synchronization of owned item vaults across multiple viewers.
//!
//! Each vault is a small fixed-size container of item slots owned by one
//! principal. The owner and any number of privileged third parties can
//! have the same vault open at once through independent views; this crate
//! keeps every open view eventually consistent with the authoritative
//! in-memory state, and maintains a dirty-tracking write-back cache over
//! a slower document store so reads come from memory and writes are
//! batched.
//!
//! The [`engine::Engine`] is the entry point. Edit surfaces mutate vault
//! contents through the cache-backed
//! [`owner_vaults`](engine::Engine::owner_vaults) handle and signal
//! [`notify_mutated`](engine::Engine::notify_mutated); the engine
//! debounces bursts of signals per vault, diffs against the last
//! broadcast [`snapshot::Snapshot`], and pushes changed contents to every
//! valid [`observer::VaultObserver`]. A background sweep reconciles
//! mutations that bypassed notification, and a flush cycle persists
//! dirty owner entries to the [`store::VaultStore`] with bounded
//! staleness.
//!
//! Authorization is out of scope: callers decide who may view or edit a
//! vault before reaching this API.

pub mod cache;
pub mod config;
pub mod engine;
pub mod keys;
pub mod metrics;
pub mod observer;
pub mod snapshot;
pub mod store;
pub mod vault;

pub use self::cache::{OwnerEntry, VaultCache};
pub use self::config::Config;
pub use self::engine::Engine;
pub use self::keys::{OwnerId, VaultKey};
pub use self::observer::{
    Capability, ChannelObserver, PushError, Registry, VaultObserver, VaultUpdate,
};
pub use self::snapshot::{Snapshot, SnapshotStore};
pub use self::store::{MemStore, OwnerVaultsDoc, VaultDoc, VaultStore};
pub use self::vault::{Item, OwnerVaults, Vault};
