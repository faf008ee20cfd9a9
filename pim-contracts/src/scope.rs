//! Wire-level addressing: how an entity set is encoded for a command,
//! and the fetch-scope knobs the server understands.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::id::{EntityId, RemoteId};

/// An entity set, encoded one of the ways the protocol supports.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntityScope {
    Single(EntityId),
    List(Vec<EntityId>),
    /// Inclusive `[start, end]` contiguous id interval.
    Interval(EntityId, EntityId),
    /// Flat remote ids, unique within the resource.
    RemoteIds(Vec<RemoteId>),
    /// A chain of remote ids from an entity up to the root, used when
    /// remote ids are only unique within a parent. Ordered child-to-root;
    /// terminated implicitly by [`crate::id::ROOT_ID`].
    RemoteIdChain(Vec<RemoteId>),
}

/// `FETCH COLLECTIONS` depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FetchDepth {
    Base,
    #[default]
    FirstLevel,
    Recursive,
}

/// `FETCH COLLECTIONS` list-filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ListFilter {
    #[default]
    Display,
    Sync,
    Index,
    Enabled,
    NoFilter,
}

/// `FETCH ITEMS` item-scope flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ItemFetchOptions {
    pub full_payload: bool,
    pub all_attributes: bool,
    pub flags: bool,
    pub size: bool,
    pub remote_id: bool,
    pub remote_revision: bool,
    pub modification_time: bool,
    pub ignore_errors: bool,
    pub ancestor_depth: u32,
}

impl ItemFetchOptions {
    /// The scope the entity cache uses to hydrate a notification's
    /// referenced items: enough to resolve identity and flags, not the
    /// full payload (hydration must stay cheap).
    pub fn cache_hydration() -> Self {
        Self {
            flags: true,
            remote_id: true,
            remote_revision: true,
            modification_time: true,
            ..Self::default()
        }
    }

    /// The scope an item sync diff needs to compare a remote listing
    /// against the local mirror.
    pub fn diff_scope() -> Self {
        Self {
            full_payload: true,
            all_attributes: true,
            flags: true,
            remote_id: true,
            remote_revision: true,
            modification_time: true,
            ..Self::default()
        }
    }
}
