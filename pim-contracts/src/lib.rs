//! Shared data model for the PIM synchronization core: entity ids, the
//! collection/item/tag types, notification records, and the scope
//! encodings used to address entities on the wire.
//!
//! This crate has no knowledge of the transport, the cache, or the
//! synchronizers built on top of it; it only defines the vocabulary they
//! share, so that the command channel, cache, and synchronizer layers can
//! depend on one stable set of types without depending on each other.

pub mod collection;
pub mod error;
pub mod id;
pub mod item;
pub mod notification;
pub mod rights;
pub mod scope;
pub mod tag;

/// Frequently used combinators for crates building on top of the model.
pub mod prelude {
    pub use super::collection::{CachePolicy, CachePolicyScope, Collection};
    pub use super::error::{ContractError, ContractResult};
    pub use super::id::{EntityId, INVALID_ID, ROOT_ID};
    pub use super::item::{validate_flags, Item, ReservedFlag};
    pub use super::notification::{
        ChangedParts, Notification, NotificationOperation, NotificationType,
    };
    pub use super::rights::CollectionRights;
    pub use super::scope::{EntityScope, FetchDepth, ItemFetchOptions, ListFilter};
    pub use super::tag::Tag;
}
