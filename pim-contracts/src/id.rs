//! Entity identifiers: a small newtype around the wire representation,
//! with the invariants spelled out once instead of re-checked at every
//! call site.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The reserved id of the root collection. Every top-level collection's
/// `parent` is `ROOT_ID`.
pub const ROOT_ID: EntityId = EntityId(0);

/// Sentinel meaning "no entity" (e.g. `source_collection` on a notification
/// that isn't a move).
pub const INVALID_ID: EntityId = EntityId(-1);

/// A 64-bit signed identifier for a collection, item, or tag.
///
/// `-1` is [`INVALID_ID`], `0` is [`ROOT_ID`]. Both are ordinary values of
/// this type rather than a separate `Option` layer, matching the wire
/// protocol where entity ids are always present and these two values carry
/// meaning in-band.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EntityId(pub i64);

impl EntityId {
    /// `true` for any id other than [`INVALID_ID`].
    pub fn is_valid(self) -> bool {
        self != INVALID_ID
    }

    /// `true` for the reserved root collection id.
    pub fn is_root(self) -> bool {
        self == ROOT_ID
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque byte string chosen by the owning resource. Unique within a
/// resource (flat) or within a parent (hierarchical); see
/// [`crate::scope::EntityScope::RemoteIdChain`].
pub type RemoteId = Vec<u8>;

/// A resource identifier, e.g. `b"imap-account-1"`.
pub type ResourceId = Vec<u8>;
