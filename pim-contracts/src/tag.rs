//! Tags: cross-resource labels attached to items.

use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::id::{EntityId, RemoteId};

/// The lightweight reference an [`crate::item::Item`] keeps to a tag: just
/// enough to identify it without pulling in the full attribute bag.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TagRef {
    pub id: EntityId,
    /// Globally unique within a resource; the cross-resource identity.
    /// Two resources may expose the same tag under different
    /// [`Tag::remote_id`]s while sharing this `gid`.
    pub gid: Vec<u8>,
}

/// A cross-resource label.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tag {
    pub id: EntityId,
    pub gid: Vec<u8>,
    pub remote_id: RemoteId,
    pub tag_type: String,
    pub attributes: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Tag {
    pub fn as_ref(&self) -> TagRef {
        TagRef {
            id: self.id,
            gid: self.gid.clone(),
        }
    }
}
