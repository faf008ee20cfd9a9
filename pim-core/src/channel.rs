//! The opaque command-channel abstraction the core sends requests
//! through and receives tagged responses from. The core never parses a
//! transport frame, a literal block, or the `+` continuation token —
//! this trait is the entire surface the cache, the notification source,
//! and the synchronizers consume; everything below it belongs to the
//! transport implementation.

use async_trait::async_trait;

use pim_contracts::collection::Collection;
use pim_contracts::id::{EntityId, ResourceId};
use pim_contracts::item::Item;
use pim_contracts::scope::{EntityScope, FetchDepth, ItemFetchOptions, ListFilter};
use pim_contracts::tag::Tag;

use crate::error::Result;

/// One outstanding request tag. Implementations must guarantee at most
/// one in-flight request per tag; a second `call` under the same tag
/// while the first is outstanding is a logic error on the caller's
/// part, not something this trait arbitrates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

/// A request the core can issue. Variants map onto the verbs actually
/// used by the core; argument shapes mirror the scopes and fetch
/// options in [`pim_contracts::scope`].
#[derive(Clone, Debug)]
pub enum Command {
    Subscribe {
        client_id: Vec<u8>,
    },
    /// Opens a server-side transaction; every following command on this
    /// channel is part of it until `CommitTransaction` or
    /// `RollbackTransaction`. Used by the synchronizers so a sync that
    /// fails partway leaves the local mirror untouched.
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
    FetchCollections {
        scope: EntityScope,
        depth: FetchDepth,
        resource: Option<ResourceId>,
        mime_filter: Vec<String>,
        list_filter: ListFilter,
        fetch_stats: bool,
        ancestor_depth: u32,
    },
    FetchItems {
        scope: EntityScope,
        options: ItemFetchOptions,
        /// Restricts the fetch to one collection's direct children.
        /// `scope` still narrows which of those are returned; pass
        /// `EntityScope::List(Vec::new())` as "no id filter" when
        /// listing a whole collection.
        collection: Option<EntityId>,
    },
    FetchTags {
        scope: EntityScope,
    },
    CreateCollection(Collection),
    ModifyCollection(Collection),
    MoveCollection {
        id: EntityId,
        new_parent: EntityId,
    },
    DeleteCollection(EntityId),
    CreateItem(Item),
    /// `Some(revision)` encodes `MODIFY ITEM …REV <n>`; `None` encodes
    /// the `NOREV` form used when the caller accepts last-write-wins.
    ModifyItem {
        item: Item,
        expected_revision: Option<u64>,
    },
    MoveItem {
        id: EntityId,
        new_parent: EntityId,
    },
    DeleteItem(EntityId),
    Link {
        collection: EntityId,
        items: Vec<EntityId>,
    },
    Unlink {
        collection: EntityId,
        items: Vec<EntityId>,
    },
}

/// The payload half of a tagged response.
#[derive(Clone, Debug)]
pub enum Response {
    SubscriptionHandle(Vec<u8>),
    Collections(Vec<Collection>),
    Items(Vec<Item>),
    Tags(Vec<Tag>),
    /// `<tag> OK` with no payload: collection/item mutations that don't
    /// echo the resulting entity.
    Ack,
}

/// "Send a command, get a tagged response back." Subscription to the
/// server's change stream is a separate concern, see
/// [`crate::notification_source`]; this trait only covers request/response
/// traffic.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn call(&self, command: Command) -> Result<Response>;
}

/// Test doubles standing in for a live transport.
pub mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{Command, CommandChannel, Response};
    use crate::error::{Result, SyncError};

    /// Records every [`Command`] it receives and replays a scripted
    /// sequence of [`Response`]s (or a scripted error) in order. Panics
    /// if called more times than it was scripted for — a test bug, not
    /// something to hide behind a default.
    pub struct RecordingChannel {
        calls: Mutex<Vec<Command>>,
        scripted: Mutex<Vec<Result<Response>>>,
    }

    impl RecordingChannel {
        pub fn new(scripted: Vec<Result<Response>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                scripted: Mutex::new(scripted.into_iter().rev().collect()),
            }
        }

        pub fn calls(&self) -> Vec<Command> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandChannel for RecordingChannel {
        async fn call(&self, command: Command) -> Result<Response> {
            self.calls.lock().unwrap().push(command);
            self.scripted
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(SyncError::TransportFailure("no script left".into())))
        }
    }
}
