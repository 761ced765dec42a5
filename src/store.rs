//! Persistence of owner vault sets to a document-oriented store.
//!
//! The store holds one document per owner containing all of their vaults.
//! Only occupied slots are serialized; empty slots are implicit in the
//! slot count. Loads and saves are point-in-time and idempotent, and the
//! adapter must tolerate overlapping calls for the same owner with
//! last-write-wins semantics; the cache's single-pass flush keeps at most
//! one in-flight save per owner in practice.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::keys::OwnerId;
use crate::vault::{Item, OwnerVaults, Vault};

/// Serialized form of a single vault. Only occupied slots are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDoc {
    /// Display name shown by viewing surfaces.
    pub display_name: String,
    /// Total slot count, including empty slots.
    pub slot_count: u16,
    /// Occupied slots as (index, item) pairs.
    pub slots: Vec<(u16, Item)>,
    /// The icon item, if set.
    pub icon: Option<Item>,
}

impl From<&Vault> for VaultDoc {
    fn from(vault: &Vault) -> Self {
        Self {
            display_name: vault.display_name().to_string(),
            slot_count: vault.slot_count() as u16,
            slots: vault
                .slots()
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.as_ref().map(|item| (index as u16, item.clone()))
                })
                .collect(),
            icon: vault.icon().cloned(),
        }
    }
}

impl VaultDoc {
    /// Rebuild the in-memory vault.
    ///
    /// Stored data is not trusted to uphold the slot-count invariant: an
    /// invalid count is clamped and out-of-range slot entries are dropped.
    pub fn into_vault(self) -> Vault {
        let mut vault = Vault::new_clamped(self.display_name, self.slot_count as usize);
        let slot_count = vault.slot_count();
        for (index, item) in self.slots {
            let index = index as usize;
            if index < slot_count {
                vault.set_slot(index, Some(item));
            }
        }
        vault.set_icon(self.icon);
        vault
    }
}

/// Serialized form of an owner's full vault set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerVaultsDoc {
    /// All vaults as (vault id, vault) pairs.
    pub vaults: Vec<(u32, VaultDoc)>,
}

impl From<&OwnerVaults> for OwnerVaultsDoc {
    fn from(vaults: &OwnerVaults) -> Self {
        let mut vaults: Vec<(u32, VaultDoc)> = vaults
            .iter()
            .map(|(id, vault)| (id, VaultDoc::from(vault)))
            .collect();
        // stable document bytes regardless of map iteration order
        vaults.sort_by_key(|(id, _)| *id);
        Self { vaults }
    }
}

impl From<OwnerVaultsDoc> for OwnerVaults {
    fn from(doc: OwnerVaultsDoc) -> Self {
        let mut out = OwnerVaults::new();
        for (id, vault) in doc.vaults {
            out.insert(id, vault.into_vault());
        }
        out
    }
}

/// Backing store for owner vault documents.
///
/// Both operations are idempotent and safe to retry; failures are
/// reported to the caller and retried by the cache's flush cycle.
#[async_trait]
pub trait VaultStore: std::fmt::Debug + Clone + Send + Sync + 'static {
    /// Load the stored document for `owner`, or `None` if absent.
    async fn load(&self, owner: &OwnerId) -> Result<Option<OwnerVaultsDoc>>;

    /// Save `doc` as the full replacement document for `owner`.
    async fn save(&self, owner: &OwnerId, doc: OwnerVaultsDoc) -> Result<()>;
}

/// An in-memory [`VaultStore`], useful for testing and short lived nodes.
///
/// Documents are kept postcard-encoded, so anything that would not
/// round-trip through a real store does not round-trip here either.
#[derive(Debug, Default, Clone)]
pub struct MemStore(Arc<DashMap<OwnerId, Vec<u8>>>);

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a document is stored for `owner`.
    pub fn contains(&self, owner: &OwnerId) -> bool {
        self.0.contains_key(owner)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no documents are stored.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait]
impl VaultStore for MemStore {
    async fn load(&self, owner: &OwnerId) -> Result<Option<OwnerVaultsDoc>> {
        let Some(bytes) = self.0.get(owner).map(|b| b.value().clone()) else {
            trace!(owner = %owner.fmt_short(), "no stored document");
            return Ok(None);
        };
        let doc = postcard::from_bytes(&bytes).context("decoding vault document")?;
        Ok(Some(doc))
    }

    async fn save(&self, owner: &OwnerId, doc: OwnerVaultsDoc) -> Result<()> {
        let bytes = postcard::to_stdvec(&doc).context("encoding vault document")?;
        trace!(owner = %owner.fmt_short(), len = bytes.len(), "storing document");
        self.0.insert(owner.clone(), bytes);
        Ok(())
    }
}
