//! Bounded, FIFO-evicting entity caches used by the notification path to
//! resolve entity ids to full entities before delivery (single-entity
//! [`EntityCache`] and batch-coalescing [`EntityListCache`]).
//!
//! Both caches hide fetch latency behind a two-phase contract: `request`
//! enqueues a fetch and returns immediately; `drive_one` performs the
//! next queued fetch and applies its result, emitting on
//! [`EntityCache::data_available`]/[`EntityListCache::data_available`]
//! when it does. An embedder's cooperative event loop calls `drive_one`
//! as one of its suspension points rather than this crate spawning
//! background work itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use pim_contracts::collection::Collection;
use pim_contracts::id::{EntityId, INVALID_ID};
use pim_contracts::item::Item;
use pim_contracts::scope::{EntityScope, FetchDepth, ItemFetchOptions, ListFilter};
use tokio::sync::broadcast;

use crate::channel::{Command, CommandChannel, Response};
use crate::error::Result;

/// An entity type a cache can hold: knows its own id, how to produce a
/// placeholder "not there" value, and how to turn a fetch scope into a
/// [`Command`] and parse the matching [`Response`] back.
#[async_trait]
pub trait CacheEntity: Clone + Send + Sync + 'static {
    /// The fetch-scope knobs this entity type's `FETCH` command accepts.
    type Scope: Clone + Send + Sync + 'static;

    fn id(&self) -> EntityId;

    /// The value `retrieve` reports for an id that isn't cached, or
    /// whose cached node is invalid: "valid-looking id, empty payload".
    fn empty(id: EntityId) -> Self;

    async fn fetch(
        channel: &dyn CommandChannel,
        ids: &[EntityId],
        scope: &Self::Scope,
    ) -> Result<Vec<Self>>;
}

/// Fetch knobs for a collection lookup; narrower than the full
/// `FETCH COLLECTIONS` surface exposed on [`crate::channel::Command`]
/// since the cache only ever resolves one notification-referenced id
/// (or a handful) at a time.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectionFetchScope {
    pub depth: FetchDepth,
    pub list_filter: ListFilter,
}

#[async_trait]
impl CacheEntity for Collection {
    type Scope = CollectionFetchScope;

    fn id(&self) -> EntityId {
        self.id
    }

    fn empty(id: EntityId) -> Self {
        Collection::new(id, Vec::new(), INVALID_ID)
    }

    async fn fetch(
        channel: &dyn CommandChannel,
        ids: &[EntityId],
        scope: &Self::Scope,
    ) -> Result<Vec<Self>> {
        let response = channel
            .call(Command::FetchCollections {
                scope: EntityScope::List(ids.to_vec()),
                depth: scope.depth,
                resource: None,
                mime_filter: Vec::new(),
                list_filter: scope.list_filter,
                fetch_stats: false,
                ancestor_depth: 0,
            })
            .await?;
        match response {
            Response::Collections(collections) => Ok(collections),
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl CacheEntity for Item {
    type Scope = ItemFetchOptions;

    fn id(&self) -> EntityId {
        self.id
    }

    fn empty(id: EntityId) -> Self {
        Item::new(id, INVALID_ID)
    }

    async fn fetch(
        channel: &dyn CommandChannel,
        ids: &[EntityId],
        scope: &Self::Scope,
    ) -> Result<Vec<Self>> {
        let response = channel
            .call(Command::FetchItems {
                scope: EntityScope::List(ids.to_vec()),
                options: *scope,
                collection: None,
            })
            .await?;
        match response {
            Response::Items(items) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Clone, Debug)]
struct CacheNode<E> {
    entity: E,
    pending: bool,
    invalid: bool,
}

/// Bounded single-entity cache with FIFO eviction.
pub struct EntityCache<E: CacheEntity> {
    channel: Arc<dyn CommandChannel>,
    nodes: DashMap<EntityId, CacheNode<E>>,
    order: Mutex<VecDeque<EntityId>>,
    max_capacity: usize,
    pending_fetches: Mutex<VecDeque<(EntityId, E::Scope)>>,
    data_available: broadcast::Sender<EntityId>,
}

impl<E: CacheEntity> EntityCache<E> {
    pub fn new(channel: Arc<dyn CommandChannel>, max_capacity: usize) -> Self {
        let (data_available, _) = broadcast::channel(max_capacity.max(16));
        Self {
            channel,
            nodes: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_capacity,
            pending_fetches: Mutex::new(VecDeque::new()),
            data_available,
        }
    }

    pub fn subscribe_data_available(&self) -> broadcast::Receiver<EntityId> {
        self.data_available.subscribe()
    }

    pub fn is_cached(&self, id: EntityId) -> bool {
        self.nodes.get(&id).is_some_and(|node| !node.pending)
    }

    pub fn is_requested(&self, id: EntityId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Returns the cached entity if present and valid; otherwise a
    /// placeholder the caller must not mistake for a real payload.
    pub fn retrieve(&self, id: EntityId) -> E {
        match self.nodes.get(&id) {
            Some(node) if !node.pending && !node.invalid => node.entity.clone(),
            _ => E::empty(id),
        }
    }

    /// Precondition: `!is_requested(id)`. Evicts head-of-queue,
    /// non-pending nodes until capacity allows, enqueues a pending node,
    /// and queues the fetch for a future [`Self::drive_one`] call.
    pub fn request(&self, id: EntityId, scope: E::Scope) {
        debug_assert!(
            !self.is_requested(id),
            "EntityCache::request called for an id already requested: {id}"
        );
        self.evict_to_capacity();
        self.nodes.insert(
            id,
            CacheNode {
                entity: E::empty(id),
                pending: true,
                invalid: false,
            },
        );
        self.order.lock().unwrap().push_back(id);
        self.pending_fetches.lock().unwrap().push_back((id, scope));
    }

    /// `true` iff already cached non-pending; otherwise starts a
    /// request and returns `false`.
    pub fn ensure_cached(&self, id: EntityId, scope: E::Scope) -> bool {
        if self.is_cached(id) {
            return true;
        }
        if !self.is_requested(id) {
            self.request(id, scope);
        }
        false
    }

    /// Removes the current node; if it was pending, restarts the fetch.
    pub fn update(&self, id: EntityId, scope: E::Scope) {
        let was_pending = self
            .nodes
            .remove(&id)
            .map(|(_, node)| node.pending)
            .unwrap_or(false);
        self.order.lock().unwrap().retain(|&queued| queued != id);
        if was_pending {
            self.request(id, scope);
        }
    }

    /// Marks the node invalid without removing it.
    pub fn invalidate(&self, id: EntityId) {
        if let Some(mut node) = self.nodes.get_mut(&id) {
            node.invalid = true;
        }
    }

    /// Performs the next queued fetch, applies its result, and emits on
    /// [`Self::subscribe_data_available`]. Returns the id that settled,
    /// or `None` if nothing was queued.
    pub async fn drive_one(&self) -> Option<EntityId> {
        let (id, scope) = self.pending_fetches.lock().unwrap().pop_front()?;
        let result = E::fetch(self.channel.as_ref(), &[id], &scope).await;
        self.apply_result(id, result);
        let _ = self.data_available.send(id);
        Some(id)
    }

    fn apply_result(&self, requested_id: EntityId, result: Result<Vec<E>>) {
        let fetched = match result {
            Ok(mut entities) => entities.pop(),
            Err(error) => {
                tracing::warn!(id = %requested_id, %error, "entity cache fetch failed");
                None
            }
        };
        if let Some(mut node) = self.nodes.get_mut(&requested_id) {
            node.pending = false;
            match fetched {
                Some(entity) if entity.id() == requested_id => {
                    node.entity = entity;
                    node.invalid = false;
                }
                _ => node.invalid = true,
            }
        }
    }

    fn evict_to_capacity(&self) {
        let mut order = self.order.lock().unwrap();
        let mut idx = 0;
        while self.nodes.len() >= self.max_capacity && idx < order.len() {
            let id = order[idx];
            let pending = self.nodes.get(&id).is_some_and(|node| node.pending);
            if pending {
                idx += 1;
                continue;
            }
            order.remove(idx);
            self.nodes.remove(&id);
        }
    }
}

/// Batch-coalescing variant: a single `request` may cover many ids, and
/// they share one fetch command when [`Self::drive_one`] runs.
pub struct EntityListCache<E: CacheEntity> {
    channel: Arc<dyn CommandChannel>,
    nodes: DashMap<EntityId, CacheNode<E>>,
    order: Mutex<VecDeque<EntityId>>,
    max_capacity: usize,
    pending_batches: Mutex<VecDeque<(Vec<EntityId>, E::Scope)>>,
    data_available: broadcast::Sender<EntityId>,
}

impl<E: CacheEntity> EntityListCache<E> {
    pub fn new(channel: Arc<dyn CommandChannel>, max_capacity: usize) -> Self {
        let (data_available, _) = broadcast::channel(max_capacity.max(16));
        Self {
            channel,
            nodes: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_capacity,
            pending_batches: Mutex::new(VecDeque::new()),
            data_available,
        }
    }

    pub fn subscribe_data_available(&self) -> broadcast::Receiver<EntityId> {
        self.data_available.subscribe()
    }

    pub fn is_cached(&self, id: EntityId) -> bool {
        self.nodes.get(&id).is_some_and(|node| !node.pending)
    }

    pub fn is_requested(&self, id: EntityId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn retrieve(&self, id: EntityId) -> E {
        match self.nodes.get(&id) {
            Some(node) if !node.pending && !node.invalid => node.entity.clone(),
            _ => E::empty(id),
        }
    }

    /// Coalesces every id not already requested into one batch fetch.
    pub fn request(&self, ids: &[EntityId], scope: E::Scope) {
        let new_ids: Vec<EntityId> = ids
            .iter()
            .copied()
            .filter(|id| !self.is_requested(*id))
            .collect();
        if new_ids.is_empty() {
            return;
        }
        for _ in 0..new_ids.len() {
            self.evict_to_capacity();
        }
        let mut order = self.order.lock().unwrap();
        for &id in &new_ids {
            self.nodes.insert(
                id,
                CacheNode {
                    entity: E::empty(id),
                    pending: true,
                    invalid: false,
                },
            );
            order.push_back(id);
        }
        drop(order);
        self.pending_batches.lock().unwrap().push_back((new_ids, scope));
    }

    pub fn ensure_cached(&self, ids: &[EntityId], scope: E::Scope) -> bool {
        let all_cached = ids.iter().all(|&id| self.is_cached(id));
        if !all_cached {
            self.request(ids, scope);
        }
        all_cached
    }

    /// Performs the next queued batch fetch. Ids covered by the batch
    /// that the response didn't return are marked invalid, the same
    /// "gone remotely" treatment a single-entity cache gives a renamed
    /// id. Returns the batch's ids, or `None` if nothing was queued.
    pub async fn drive_one(&self) -> Option<Vec<EntityId>> {
        let (ids, scope) = self.pending_batches.lock().unwrap().pop_front()?;
        let result = E::fetch(self.channel.as_ref(), &ids, &scope).await;
        match result {
            Ok(entities) => {
                let mut by_id = entities
                    .into_iter()
                    .map(|entity| (entity.id(), entity))
                    .collect::<std::collections::HashMap<_, _>>();
                for &id in &ids {
                    if let Some(mut node) = self.nodes.get_mut(&id) {
                        node.pending = false;
                        match by_id.remove(&id) {
                            Some(entity) => {
                                node.entity = entity;
                                node.invalid = false;
                            }
                            None => node.invalid = true,
                        }
                    }
                }
            }
            Err(error) => {
                tracing::warn!(?ids, %error, "entity list cache batch fetch failed");
                for &id in &ids {
                    if let Some(mut node) = self.nodes.get_mut(&id) {
                        node.pending = false;
                        node.invalid = true;
                    }
                }
            }
        }
        for &id in &ids {
            let _ = self.data_available.send(id);
        }
        Some(ids)
    }

    /// Evicts non-pending, non-preserved nodes down to capacity. Used by
    /// the Monitor's purge buffer to protect a pinned collection's
    /// cached items while still trimming everything else.
    pub fn shrink_preserving(&self, preserve: &[EntityId]) {
        let mut order = self.order.lock().unwrap();
        let mut idx = 0;
        while self.nodes.len() >= self.max_capacity && idx < order.len() {
            let id = order[idx];
            if preserve.contains(&id) {
                idx += 1;
                continue;
            }
            let pending = self.nodes.get(&id).is_some_and(|node| node.pending);
            if pending {
                idx += 1;
                continue;
            }
            order.remove(idx);
            self.nodes.remove(&id);
        }
    }

    fn evict_to_capacity(&self) {
        let mut order = self.order.lock().unwrap();
        let mut idx = 0;
        while self.nodes.len() >= self.max_capacity && idx < order.len() {
            let id = order[idx];
            let pending = self.nodes.get(&id).is_some_and(|node| node.pending);
            if pending {
                idx += 1;
                continue;
            }
            order.remove(idx);
            self.nodes.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;

    fn item_response(ids: &[i64]) -> Result<Response> {
        Ok(Response::Items(
            ids.iter()
                .map(|&id| Item::new(EntityId::from(id), EntityId::from(1)))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn fifo_eviction_skips_pending_nodes() {
        // One scripted response per drive_one call: ids 1, 2, 3 resolve
        // (pushed in request order), 4 and 5 are never driven so they
        // stay pending, matching the cache FIFO scenario.
        let channel = Arc::new(RecordingChannel::new(vec![
            item_response(&[1]),
            item_response(&[2]),
            item_response(&[3]),
            item_response(&[6]),
        ]));
        let cache: EntityCache<Item> = EntityCache::new(channel, 3);

        for id in 1..=5 {
            cache.request(EntityId::from(id), ItemFetchOptions::cache_hydration());
        }
        cache.drive_one().await;
        cache.drive_one().await;
        cache.drive_one().await;

        assert!(cache.is_cached(EntityId::from(1)));
        assert!(cache.is_cached(EntityId::from(2)));
        assert!(cache.is_cached(EntityId::from(3)));
        assert!(!cache.is_cached(EntityId::from(4)));
        assert!(!cache.is_cached(EntityId::from(5)));

        cache.request(EntityId::from(6), ItemFetchOptions::cache_hydration());
        cache.drive_one().await;

        assert!(!cache.is_requested(EntityId::from(1)));
        assert!(!cache.is_requested(EntityId::from(2)));
        assert!(!cache.is_requested(EntityId::from(3)));
        assert!(cache.is_requested(EntityId::from(4)) && !cache.is_cached(EntityId::from(4)));
        assert!(cache.is_requested(EntityId::from(5)) && !cache.is_cached(EntityId::from(5)));
        assert!(cache.is_cached(EntityId::from(6)));
    }

    #[tokio::test]
    async fn vanished_entity_marks_node_invalid_but_findable() {
        let channel = Arc::new(RecordingChannel::new(vec![item_response(&[])]));
        let cache: EntityCache<Item> = EntityCache::new(channel, 8);

        cache.request(EntityId::from(42), ItemFetchOptions::cache_hydration());
        cache.drive_one().await;

        assert!(cache.is_requested(EntityId::from(42)));
        assert!(!cache.is_cached(EntityId::from(42)));
        assert_eq!(cache.retrieve(EntityId::from(42)), Item::empty(EntityId::from(42)));
    }

    #[tokio::test]
    async fn list_cache_marks_missing_ids_invalid_without_failing_the_rest() {
        let channel = Arc::new(RecordingChannel::new(vec![item_response(&[1, 3])]));
        let cache: EntityListCache<Item> = EntityListCache::new(channel, 16);

        cache.request(
            &[EntityId::from(1), EntityId::from(2), EntityId::from(3)],
            ItemFetchOptions::cache_hydration(),
        );
        cache.drive_one().await;

        assert!(cache.is_cached(EntityId::from(1)));
        assert!(cache.is_requested(EntityId::from(2)) && !cache.is_cached(EntityId::from(2)));
        assert!(cache.is_cached(EntityId::from(3)));
    }
}
