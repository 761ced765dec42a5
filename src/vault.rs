//! The vault data model: items, single vaults, and per-owner vault sets.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Smallest allowed vault size.
pub const MIN_SLOTS: usize = 9;
/// Largest allowed vault size.
pub const MAX_SLOTS: usize = 54;
/// Vault sizes must be a whole number of rows.
pub const SLOTS_PER_ROW: usize = 9;

/// An item occupying a vault slot.
///
/// The engine treats items as opaque values; equality is structural over
/// identity, count and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Identity of the item kind.
    pub ident: String,
    /// Stack size.
    pub count: u32,
    /// Opaque metadata blob, uninterpreted by the engine.
    pub meta: Bytes,
}

impl Item {
    /// Create an item without metadata.
    pub fn new(ident: impl Into<String>, count: u32) -> Self {
        Self {
            ident: ident.into(),
            count,
            meta: Bytes::new(),
        }
    }

    /// Attach a metadata blob.
    pub fn with_meta(mut self, meta: impl Into<Bytes>) -> Self {
        self.meta = meta.into();
        self
    }
}

/// The requested slot count is not a whole number of rows between
/// [`MIN_SLOTS`] and [`MAX_SLOTS`].
#[derive(Debug, thiserror::Error)]
#[error("invalid slot count {0}: must be a multiple of {SLOTS_PER_ROW} between {MIN_SLOTS} and {MAX_SLOTS}")]
pub struct InvalidSlotCount(pub usize);

/// Round an arbitrary slot count to the nearest valid one, rounding down.
pub(crate) fn clamp_slot_count(count: usize) -> usize {
    let count = count.clamp(MIN_SLOTS, MAX_SLOTS);
    count - count % SLOTS_PER_ROW
}

/// A single storage unit: a fixed number of item slots plus display
/// metadata.
///
/// The slot array never changes length after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vault {
    display_name: String,
    slots: Vec<Option<Item>>,
    icon: Option<Item>,
}

impl Vault {
    /// Create an empty vault with the given number of slots.
    pub fn new(display_name: impl Into<String>, slot_count: usize) -> Result<Self, InvalidSlotCount> {
        if slot_count < MIN_SLOTS || slot_count > MAX_SLOTS || slot_count % SLOTS_PER_ROW != 0 {
            return Err(InvalidSlotCount(slot_count));
        }
        Ok(Self {
            display_name: display_name.into(),
            slots: vec![None; slot_count],
            icon: None,
        })
    }

    /// Create a vault from data of unknown provenance, clamping an invalid
    /// slot count to the nearest valid one instead of failing.
    pub(crate) fn new_clamped(display_name: impl Into<String>, slot_count: usize) -> Self {
        let clamped = clamp_slot_count(slot_count);
        if clamped != slot_count {
            warn!(slot_count, clamped, "clamping invalid slot count");
        }
        Self {
            display_name: display_name.into(),
            slots: vec![None; clamped],
            icon: None,
        }
    }

    /// Number of slots; fixed for the lifetime of the vault.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// All slots in order.
    pub fn slots(&self) -> &[Option<Item>] {
        &self.slots
    }

    /// The item in a slot, if the slot is occupied.
    pub fn slot(&self, index: usize) -> Option<&Item> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// Replace the contents of a slot, returning the previous contents.
    ///
    /// An out-of-range index is ignored (and returns `None`).
    pub fn set_slot(&mut self, index: usize, item: Option<Item>) -> Option<Item> {
        debug_assert!(index < self.slots.len(), "slot index {index} out of range");
        match self.slots.get_mut(index) {
            Some(slot) => std::mem::replace(slot, item),
            None => {
                warn!(index, slot_count = self.slots.len(), "ignoring out of range slot write");
                None
            }
        }
    }

    /// Display name shown by viewing surfaces.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Rename the vault.
    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = name.into();
    }

    /// The icon item, if one is set.
    pub fn icon(&self) -> Option<&Item> {
        self.icon.as_ref()
    }

    /// Replace the icon item.
    pub fn set_icon(&mut self, icon: Option<Item>) {
        self.icon = icon;
    }

    /// True if no slot holds an item.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

/// All vaults belonging to one owner, keyed by the owner-local vault id.
///
/// While resident this lives inside the cache; the persistent store owns
/// the durable copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerVaults {
    vaults: HashMap<u32, Vault>,
}

impl OwnerVaults {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vaults in the set.
    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    /// True if the owner has no vaults.
    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// The vault with the given id.
    pub fn get(&self, id: u32) -> Option<&Vault> {
        self.vaults.get(&id)
    }

    /// Mutable access to the vault with the given id.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Vault> {
        self.vaults.get_mut(&id)
    }

    /// Insert or replace a vault, returning the previous one.
    pub fn insert(&mut self, id: u32, vault: Vault) -> Option<Vault> {
        self.vaults.insert(id, vault)
    }

    /// Remove a vault, returning it if present.
    pub fn remove(&mut self, id: u32) -> Option<Vault> {
        self.vaults.remove(&id)
    }

    /// Iterate over all vaults.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Vault)> {
        self.vaults.iter().map(|(id, vault)| (*id, vault))
    }

    /// All vault ids in the set, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.vaults.keys().copied()
    }
}
