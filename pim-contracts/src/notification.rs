//! The notification record: one change event from the server's change
//! stream, as consumed by [`crate`]'s monitor and change recorder.

use std::collections::BTreeSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::id::{EntityId, ResourceId, INVALID_ID};

/// Which kind of entity a notification refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum NotificationType {
    Item = 0,
    Collection = 1,
    Tag = 2,
}

/// What happened to the referenced entities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(i32)]
pub enum NotificationOperation {
    Add = 0,
    Modify = 1,
    ModifyFlags = 2,
    Move = 3,
    Remove = 4,
    Link = 5,
    Unlink = 6,
    Subscribe = 7,
    Unsubscribe = 8,
}

/// The literal token [`crate::notification`] rewrites a split
/// `ModifyFlags` into: a `Modify` whose `changed_parts` carries this and
/// nothing else.
pub const FLAGS_CHANGED_PART: &str = "FLAGS";

/// A set of opaque part names, e.g. `{"PAYLOAD", "FLAGS"}`.
pub type ChangedParts = BTreeSet<Vec<u8>>;

/// One change event from the server's change stream.
///
/// `items` always has at least one entry once parsed (see
/// `pim_core::notification_source`); an empty `items` on a freshly
/// constructed notification is only valid before the first item is
/// pushed.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Notification {
    pub notification_type: NotificationType,
    pub operation: NotificationOperation,
    /// Originating session, used for self-filtering by the monitor and the
    /// change recorder.
    pub session_id: Vec<u8>,
    pub resource: ResourceId,
    /// Only meaningful for `Move`.
    pub destination_resource: ResourceId,
    pub source_collection: EntityId,
    pub destination_collection: EntityId,
    pub items: Vec<EntityId>,
    pub changed_parts: ChangedParts,
    pub added_flags: BTreeSet<Vec<u8>>,
    pub removed_flags: BTreeSet<Vec<u8>>,
    pub mime_type: String,
}

impl Notification {
    pub fn new(
        notification_type: NotificationType,
        operation: NotificationOperation,
        resource: ResourceId,
    ) -> Self {
        Self {
            notification_type,
            operation,
            session_id: Vec::new(),
            resource,
            destination_resource: ResourceId::new(),
            source_collection: INVALID_ID,
            destination_collection: INVALID_ID,
            items: Vec::new(),
            changed_parts: ChangedParts::new(),
            added_flags: BTreeSet::new(),
            removed_flags: BTreeSet::new(),
            mime_type: String::new(),
        }
    }

    /// `true` for `Move` operations, which need both resources considered
    /// independently by the monitor's filter.
    pub fn is_move(&self) -> bool {
        matches!(self.operation, NotificationOperation::Move)
    }

    /// The single item id this notification carries, for code paths that
    /// only make sense for single-item records (legacy journal entries,
    /// per-item replay after a batch split).
    pub fn single_item(&self) -> Option<EntityId> {
        match self.items.as_slice() {
            [id] => Some(*id),
            _ => None,
        }
    }
}
