//! Identifiers for vault owners and individual vaults.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a principal that owns vaults.
///
/// The engine never interprets the contents; collaborators supply whatever
/// identity scheme they use (account ids, public keys, ...).
#[derive(
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create an owner id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The full identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for logging.
    pub fn fmt_short(&self) -> &str {
        let mut end = self.0.len().min(8);
        while !self.0.is_char_boundary(end) {
            end -= 1;
        }
        &self.0[..end]
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.0)
    }
}

/// Identifies a single vault: the owning principal plus the owner-local
/// vault id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultKey {
    /// The principal the vault belongs to.
    pub owner: OwnerId,
    /// Owner-local vault id, unique within the owner's set.
    pub id: u32,
}

impl VaultKey {
    /// Create a key from an owner id and a vault id.
    pub fn new(owner: impl Into<OwnerId>, id: u32) -> Self {
        Self {
            owner: owner.into(),
            id,
        }
    }

    /// Shortened form for logging.
    pub fn fmt_short(&self) -> String {
        format!("{}/{}", self.owner.fmt_short(), self.id)
    }
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.id)
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey({}/{})", self.owner, self.id)
    }
}
