//! Collections: the tree nodes that hold items and/or other collections.

use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::id::{EntityId, RemoteId, ResourceId, ROOT_ID};
use crate::rights::CollectionRights;

/// The well-known mime type meaning "this collection only holds
/// sub-collections, not items". A collection is a leaf iff
/// `content_mime_types` is non-empty and contains something other than
/// this token.
pub const COLLECTION_MIME_TYPE: &str = "inode/directory";

/// Retrieval scope recorded in a collection's cache policy: how much of an
/// item should be kept locally by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CachePolicyScope {
    /// Headers/metadata only.
    #[default]
    Metadata,
    /// Metadata plus full payload.
    Full,
}

/// Local caching policy for the items inside a collection.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CachePolicy {
    /// When set, `interval_minutes`/`scope` are inherited from the parent
    /// collection instead of being read from this struct.
    pub inherit_from_parent: bool,
    /// Re-check interval in minutes; `0` means "never expire".
    pub interval_minutes: u32,
    pub scope: CachePolicyScope,
}

/// A node in the collection tree.
///
/// Invariant: every non-root collection has a `parent` reachable by
/// finitely many hops back to [`ROOT_ID`] (enforced by the synchronizer,
/// not by this type — see `pim_core::sync::collection`).
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Collection {
    pub id: EntityId,
    pub remote_id: RemoteId,
    pub parent: EntityId,
    pub name: String,
    pub resource: ResourceId,
    pub content_mime_types: BTreeSet<String>,
    pub rights: CollectionRights,
    pub cache_policy: CachePolicy,
    /// Arbitrary typed attributes, keyed by attribute type.
    pub attributes: BTreeMap<Vec<u8>, Vec<u8>>,
    /// A virtual collection may reference items it does not own (e.g. a
    /// saved search); the item sync still diffs it, but deletes never
    /// propagate to the owning collection.
    pub is_virtual: bool,
}

impl Collection {
    /// A bare collection under the root, with no mime types (thus not yet
    /// a leaf) and no rights. Used as the starting point when applying a
    /// remote listing entry.
    pub fn new(id: EntityId, remote_id: RemoteId, parent: EntityId) -> Self {
        Self {
            id,
            remote_id,
            parent,
            name: String::new(),
            resource: ResourceId::new(),
            content_mime_types: BTreeSet::new(),
            rights: CollectionRights::empty(),
            cache_policy: CachePolicy::default(),
            attributes: BTreeMap::new(),
            is_virtual: false,
        }
    }

    /// A leaf holds items: it declares mime types beyond the
    /// collection-only marker.
    pub fn is_leaf(&self) -> bool {
        !self.content_mime_types.is_empty()
            && self
                .content_mime_types
                .iter()
                .any(|mime| mime != COLLECTION_MIME_TYPE)
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }
}
