//! Filters, fans out, and compresses a stream of notifications for a set
//! of listeners: the Monitor (see the governing design's Monitor
//! component). A [`crate::recorder::ChangeRecorder`] is a Monitor
//! subclass in spirit — it reuses everything here and additionally
//! journals before delivery.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use pim_contracts::id::{EntityId, ResourceId};
use pim_contracts::item::Item;
use pim_contracts::notification::{Notification, NotificationOperation, NotificationType};
use pim_contracts::scope::ItemFetchOptions;
use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::cache::{CacheEntity, CollectionFetchScope, EntityCache};

/// Statistics-refresh debounce. Load-bearing for UI smoothness; keep in
/// sync with any embedder-visible documentation if it ever changes.
pub const STATISTICS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Purge buffer capacity: how many recently-unpinned collections stay
/// evictable-but-present before the oldest is forced out.
pub const PURGE_BUFFER_CAPACITY: usize = 10;

/// Collections past this item count are candidates for purge once
/// unpinned and outside the purge buffer.
pub const PURGE_ITEM_THRESHOLD: u64 = 10_000;

/// Filter configuration: the sets and flags a notification is checked
/// against before it reaches any listener.
#[derive(Clone, Debug, Default)]
pub struct FilterConfig {
    pub monitored_collections: BTreeSet<EntityId>,
    pub monitored_items: BTreeSet<EntityId>,
    pub monitored_resources: BTreeSet<ResourceId>,
    pub monitored_mime_types: BTreeSet<String>,
    /// `alias -> canonical mime types it also matches`, for the
    /// "is-a" mime matching the filter performs.
    pub mime_aliases: BTreeMap<String, BTreeSet<String>>,
    pub ignored_sessions: BTreeSet<Vec<u8>>,
    pub monitor_all: bool,
    /// When set, cross-boundary collection moves are delivered
    /// unchanged instead of being rewritten to Add/Remove.
    pub disable_collection_move_translation: bool,
}

impl FilterConfig {
    fn mime_matches(&self, mime_type: &str) -> bool {
        if mime_type.is_empty() {
            return false;
        }
        if self.monitored_mime_types.contains(mime_type) {
            return true;
        }
        self.monitored_mime_types.iter().any(|monitored| {
            self.mime_aliases
                .get(monitored)
                .is_some_and(|aliases| aliases.contains(mime_type))
        })
    }

    fn side_matches(
        &self,
        collection: EntityId,
        resource: &ResourceId,
        items: &[EntityId],
        mime_type: &str,
    ) -> bool {
        if self.monitor_all {
            return true;
        }
        let collection_ok = collection.is_valid()
            && (collection.is_root() || self.monitored_collections.contains(&collection));
        collection_ok
            || self.monitored_resources.contains(resource)
            || items.iter().any(|id| self.monitored_items.contains(id))
            || self.mime_matches(mime_type)
    }

    /// `true` iff `notification` should reach at least one listener,
    /// modulo per-listener signal subscriptions (handled separately by
    /// [`batch_shape`]).
    pub fn passes(&self, notification: &Notification) -> bool {
        if self.ignored_sessions.contains(&notification.session_id) {
            return false;
        }
        if self.monitor_all {
            return true;
        }
        let source_ok = self.side_matches(
            notification.source_collection,
            &notification.resource,
            &notification.items,
            &notification.mime_type,
        );
        if notification.is_move() {
            let dest_ok = self.side_matches(
                notification.destination_collection,
                &notification.destination_resource,
                &notification.items,
                &notification.mime_type,
            );
            source_ok || dest_ok
        } else {
            source_ok
        }
    }

    /// Rewrites a cross-boundary `Move` per the translation rule: drop
    /// to `Remove` if only the source side is monitored, to `Add` (at
    /// the destination) if only the destination side is, leave
    /// untouched if both sides are monitored or translation is disabled
    /// for collection moves.
    pub fn translate_move(&self, notification: &Notification) -> Notification {
        if !notification.is_move() {
            return notification.clone();
        }
        let source_ok = self.side_matches(
            notification.source_collection,
            &notification.resource,
            &notification.items,
            &notification.mime_type,
        );
        let dest_ok = self.side_matches(
            notification.destination_collection,
            &notification.destination_resource,
            &notification.items,
            &notification.mime_type,
        );
        if source_ok == dest_ok {
            return notification.clone();
        }
        if notification.notification_type == NotificationType::Collection
            && self.disable_collection_move_translation
        {
            return notification.clone();
        }
        let mut rewritten = notification.clone();
        if source_ok {
            rewritten.operation = NotificationOperation::Remove;
        } else {
            rewritten.operation = NotificationOperation::Add;
            rewritten.source_collection = notification.destination_collection;
            rewritten.resource = notification.destination_resource.clone();
        }
        rewritten
    }
}

/// Which delivery shapes a listener wants for one operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalSubscription {
    pub batch: bool,
    pub single: bool,
}

/// The per-operation signal subscriptions one connected listener holds.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListenerCapabilities {
    pub add: SignalSubscription,
    pub modify: SignalSubscription,
    pub modify_flags: SignalSubscription,
    pub move_op: SignalSubscription,
    pub remove: SignalSubscription,
    pub link: SignalSubscription,
    pub unlink: SignalSubscription,
}

impl ListenerCapabilities {
    fn subscription_for(self, operation: NotificationOperation) -> SignalSubscription {
        match operation {
            NotificationOperation::Add => self.add,
            NotificationOperation::Modify => self.modify,
            NotificationOperation::ModifyFlags => self.modify_flags,
            NotificationOperation::Move => self.move_op,
            NotificationOperation::Remove => self.remove,
            NotificationOperation::Link => self.link,
            NotificationOperation::Unlink => self.unlink,
            NotificationOperation::Subscribe | NotificationOperation::Unsubscribe => {
                SignalSubscription::default()
            }
        }
    }
}

/// The two flags batch detection computes for one operation: whether
/// any listener wants per-item delivery, and whether any wants the
/// whole batch at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchShape {
    pub needs_split: bool,
    pub supports_batch: bool,
}

fn batch_shape(listeners: &[ListenerCapabilities], operation: NotificationOperation) -> BatchShape {
    let mut shape = BatchShape::default();
    for listener in listeners {
        let subscription = listener.subscription_for(operation);
        shape.needs_split |= subscription.single;
        shape.supports_batch |= subscription.batch;
    }
    shape
}

/// Splits `notification` into one record per referenced item, rewriting
/// a batch-unsupported `ModifyFlags` into per-item `Modify`s whose
/// `changed_parts` carries only the literal `FLAGS` token.
fn split_per_item(notification: &Notification, rewrite_flags: bool) -> Vec<Notification> {
    notification
        .items
        .iter()
        .map(|&item| {
            let mut shard = notification.clone();
            shard.items = vec![item];
            if rewrite_flags {
                shard.operation = NotificationOperation::Modify;
                shard.changed_parts = [pim_contracts::notification::FLAGS_CHANGED_PART.as_bytes().to_vec()]
                    .into_iter()
                    .collect();
            }
            shard
        })
        .collect()
}

/// Merges `incoming` into `queue` per the compression rules: a later
/// `Modify` absorbs into an earlier one for the same item; a later
/// `Remove` supersedes any earlier pending change for that item; a
/// later `ModifyFlags` merges flag sets with an earlier one. Anything
/// else is appended, preserving the relative order of distinct items.
pub fn compress_into(queue: &mut Vec<Notification>, incoming: Notification) {
    if let Some(id) = incoming.single_item() {
        if let Some(existing) = queue.iter_mut().rev().find(|n| n.single_item() == Some(id)) {
            match (existing.operation, incoming.operation) {
                (_, NotificationOperation::Remove) => {
                    *existing = incoming;
                    return;
                }
                (NotificationOperation::Modify, NotificationOperation::Modify) => {
                    existing.changed_parts.extend(incoming.changed_parts);
                    return;
                }
                (NotificationOperation::ModifyFlags, NotificationOperation::ModifyFlags) => {
                    existing.added_flags.extend(incoming.added_flags);
                    existing.removed_flags.extend(incoming.removed_flags);
                    return;
                }
                _ => {}
            }
        }
    }
    queue.push(incoming);
}

/// Runs [`compress_into`] over every element of `notifications` in
/// order, against an initially empty queue.
pub fn compress_all(notifications: impl IntoIterator<Item = Notification>) -> Vec<Notification> {
    let mut queue = Vec::new();
    for notification in notifications {
        compress_into(&mut queue, notification);
    }
    queue
}

/// A fully processed notification, shaped for delivery the way
/// [`batch_shape`] decided.
#[derive(Clone, Debug)]
pub enum MonitorSignal {
    Single(Notification),
    Batch(Vec<Notification>),
    CollectionStatisticsChanged(EntityId),
    FetchError { context: String, error_text: String },
}

/// One accepted notification waiting in `pending`/`pipeline`, tagged
/// with the shape it's destined to be delivered in. `needs_split` and
/// `supports_batch` are independent, so a single accepted notification
/// can produce both a `Batch` entry (untouched, for batch-capable
/// listeners) and one `Single` entry per item (for listeners that want
/// per-item delivery) — never one entry doing double duty.
#[derive(Clone, Debug)]
enum Queued {
    Single(Notification),
    Batch(Vec<Notification>),
}

impl Queued {
    fn items(&self) -> Vec<(NotificationType, EntityId)> {
        match self {
            Queued::Single(n) => n.items.iter().map(|&id| (n.notification_type, id)).collect(),
            Queued::Batch(notifications) => notifications
                .iter()
                .flat_map(|n| n.items.iter().map(move |&id| (n.notification_type, id)))
                .collect(),
        }
    }
}

/// Filters, hydrates, compresses, and fans a notification stream out to
/// listeners; tracks reference-counted "buffered" collections and their
/// purge buffer.
pub struct Monitor {
    filter: Mutex<FilterConfig>,
    listeners: Mutex<Vec<ListenerCapabilities>>,
    item_cache: std::sync::Arc<EntityCache<Item>>,
    collection_cache: std::sync::Arc<EntityCache<pim_contracts::collection::Collection>>,
    /// Hydrated, ready to emit. Depth 1 for change-recording monitors,
    /// deeper for pure monitors that may prefetch ahead of listeners.
    pipeline: Mutex<VecDeque<Queued>>,
    pipeline_depth: usize,
    /// Accepted but not yet hydrated.
    pending: Mutex<VecDeque<Queued>>,
    signals: broadcast::Sender<MonitorSignal>,
    pinned: Mutex<HashMap<EntityId, u32>>,
    purge_buffer: Mutex<VecDeque<EntityId>>,
    item_counts: Mutex<HashMap<EntityId, u64>>,
    pending_stats: Mutex<BTreeSet<EntityId>>,
}

impl Monitor {
    pub fn new(
        item_cache: std::sync::Arc<EntityCache<Item>>,
        collection_cache: std::sync::Arc<EntityCache<pim_contracts::collection::Collection>>,
        pipeline_depth: usize,
    ) -> Self {
        let (signals, _) = broadcast::channel(1024);
        Self {
            filter: Mutex::new(FilterConfig::default()),
            listeners: Mutex::new(Vec::new()),
            item_cache,
            collection_cache,
            pipeline: Mutex::new(VecDeque::new()),
            pipeline_depth: pipeline_depth.max(1),
            pending: Mutex::new(VecDeque::new()),
            signals,
            pinned: Mutex::new(HashMap::new()),
            purge_buffer: Mutex::new(VecDeque::new()),
            item_counts: Mutex::new(HashMap::new()),
            pending_stats: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn set_filter(&self, filter: FilterConfig) {
        *self.filter.lock().unwrap() = filter;
    }

    pub fn register_listener(&self, capabilities: ListenerCapabilities) {
        self.listeners.lock().unwrap().push(capabilities);
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<MonitorSignal> {
        self.signals.subscribe()
    }

    /// Accepts one notification off the bus: filters it, translates a
    /// cross-boundary move, and queues it for hydration in whichever
    /// shape(s) its listeners asked for. `needs_split` and
    /// `supports_batch` are independent: a notification with listeners
    /// of both kinds queues an untouched `Batch` entry *and* a `Single`
    /// entry per item, so neither kind loses its expected shape.
    pub fn accept(&self, notification: Notification) {
        let filter = self.filter.lock().unwrap();
        if !filter.passes(&notification) {
            return;
        }
        let translated = filter.translate_move(&notification);
        drop(filter);

        let shape = batch_shape(&self.listeners.lock().unwrap(), translated.operation);
        let rewrite_flags =
            translated.operation == NotificationOperation::ModifyFlags && !shape.supports_batch;
        let split = split_per_item(&translated, rewrite_flags);
        self.note_statistics_relevant(&split);

        let mut pending = self.pending.lock().unwrap();
        // No listener registered at all still needs a default shape to
        // hydrate and deliver in, so the split (per-item) path doubles
        // as that fallback.
        if shape.needs_split || !shape.supports_batch {
            for piece in split {
                pending.push_back(Queued::Single(piece));
            }
        }
        if shape.supports_batch {
            pending.push_back(Queued::Batch(vec![translated]));
        }
    }

    /// Item `Add`/`Remove`/`Move` changes its parent collection's item
    /// count, so it schedules a debounced stats refresh for that
    /// collection (both sides, for a move). A `Remove` of the
    /// collection itself drops any pending refresh for it outright —
    /// there is nothing left to refresh.
    fn note_statistics_relevant(&self, pieces: &[Notification]) {
        let mut scheduled = self.pending_stats.lock().unwrap();
        for piece in pieces {
            match piece.notification_type {
                NotificationType::Collection if piece.operation == NotificationOperation::Remove => {
                    for &id in &piece.items {
                        scheduled.remove(&id);
                    }
                }
                NotificationType::Item => match piece.operation {
                    NotificationOperation::Add | NotificationOperation::Remove => {
                        if piece.source_collection.is_valid() {
                            scheduled.insert(piece.source_collection);
                        }
                    }
                    NotificationOperation::Move => {
                        if piece.source_collection.is_valid() {
                            scheduled.insert(piece.source_collection);
                        }
                        if piece.destination_collection.is_valid() {
                            scheduled.insert(piece.destination_collection);
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    /// Moves notifications from `pending` into `pipeline` up to
    /// `pipeline_depth`, issuing cache requests for any referenced
    /// entity not yet cached.
    pub fn hydrate(&self) {
        let mut pipeline = self.pipeline.lock().unwrap();
        let mut pending = self.pending.lock().unwrap();
        while pipeline.len() < self.pipeline_depth {
            let Some(queued) = pending.pop_front() else {
                break;
            };
            for (kind, item) in queued.items() {
                match kind {
                    NotificationType::Item => {
                        self.item_cache
                            .ensure_cached(item, ItemFetchOptions::cache_hydration());
                    }
                    NotificationType::Collection => {
                        self.collection_cache
                            .ensure_cached(item, CollectionFetchScope::default());
                    }
                    NotificationType::Tag => {}
                }
            }
            pipeline.push_back(queued);
        }
    }

    /// `true` iff every item referenced by the head of the pipeline is
    /// now non-pending in its cache (cached or invalidated).
    fn head_is_hydrated(&self, queued: &Queued) -> bool {
        queued.items().into_iter().all(|(kind, item)| match kind {
            NotificationType::Item => self.item_cache.is_cached(item) || !self.item_cache.is_requested(item),
            NotificationType::Collection => {
                self.collection_cache.is_cached(item) || !self.collection_cache.is_requested(item)
            }
            NotificationType::Tag => true,
        })
    }

    /// Emits the head of the pipeline once hydrated and pops it.
    /// Returns `true` if a notification was emitted.
    pub fn try_deliver(&self) -> bool {
        let mut pipeline = self.pipeline.lock().unwrap();
        let Some(head) = pipeline.front() else {
            return false;
        };
        if !self.head_is_hydrated(head) {
            return false;
        }
        let queued = pipeline.pop_front().unwrap();
        drop(pipeline);
        match queued {
            Queued::Single(notification) => {
                let _ = self.signals.send(MonitorSignal::Single(notification));
            }
            Queued::Batch(notifications) => {
                let _ = self.signals.send(MonitorSignal::Batch(notifications));
            }
        }
        true
    }

    /// Fires a debounced statistics refresh for every collection marked
    /// relevant since the last call, per the ~500 ms constant.
    pub async fn flush_statistics(&self) {
        let collections: Vec<EntityId> = {
            let mut scheduled = self.pending_stats.lock().unwrap();
            std::mem::take(&mut *scheduled).into_iter().collect()
        };
        if collections.is_empty() {
            return;
        }
        sleep(STATISTICS_DEBOUNCE).await;
        for collection in collections {
            let _ = self
                .signals
                .send(MonitorSignal::CollectionStatisticsChanged(collection));
        }
    }

    /// Pins a collection: its cached items are never purged while
    /// pinned.
    pub fn ref_collection(&self, id: EntityId) {
        *self.pinned.lock().unwrap().entry(id).or_insert(0) += 1;
        self.purge_buffer.lock().unwrap().retain(|&queued| queued != id);
    }

    /// Unpins one reference; once the count reaches zero the collection
    /// moves into the purge buffer. If that pushes the buffer past
    /// [`PURGE_BUFFER_CAPACITY`], the oldest id is evicted and returned
    /// so the caller can free associated resources.
    pub fn deref_collection(&self, id: EntityId) -> Option<EntityId> {
        let mut pinned = self.pinned.lock().unwrap();
        let still_pinned = match pinned.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                pinned.remove(&id);
                false
            }
            None => false,
        };
        drop(pinned);
        if still_pinned {
            return None;
        }
        let mut buffer = self.purge_buffer.lock().unwrap();
        buffer.push_back(id);
        if buffer.len() > PURGE_BUFFER_CAPACITY {
            buffer.pop_front()
        } else {
            None
        }
    }

    pub fn set_item_count(&self, collection: EntityId, count: u64) {
        self.item_counts.lock().unwrap().insert(collection, count);
    }

    /// `true` when `id` is unpinned, outside the purge buffer, and its
    /// known item count exceeds [`PURGE_ITEM_THRESHOLD`].
    pub fn should_purge(&self, id: EntityId) -> bool {
        if self.pinned.lock().unwrap().contains_key(&id) {
            return false;
        }
        if self.purge_buffer.lock().unwrap().contains(&id) {
            return false;
        }
        self.item_counts
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(|&count| count > PURGE_ITEM_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Response;
    use pim_contracts::id::INVALID_ID;

    fn item_notification(op: NotificationOperation, item: i64, source: i64) -> Notification {
        let mut n = Notification::new(NotificationType::Item, op, b"R1".to_vec());
        n.source_collection = EntityId::from(source);
        n.items = vec![EntityId::from(item)];
        n
    }

    #[test]
    fn cross_resource_move_translates_to_remove_when_only_source_monitored() {
        let mut filter = FilterConfig::default();
        filter.monitored_resources.insert(b"R1".to_vec());

        let mut mv = Notification::new(NotificationType::Item, NotificationOperation::Move, b"R1".to_vec());
        mv.destination_resource = b"R2".to_vec();
        mv.source_collection = EntityId::from(1);
        mv.destination_collection = EntityId::from(2);
        mv.items = vec![EntityId::from(42)];

        assert!(filter.passes(&mv));
        let translated = filter.translate_move(&mv);
        assert_eq!(translated.operation, NotificationOperation::Remove);
    }

    #[test]
    fn purge_buffer_evicts_oldest_after_eleven_derefs() {
        let item_cache = std::sync::Arc::new(EntityCache::new(
            std::sync::Arc::new(crate::channel::test_support::RecordingChannel::new(vec![])),
            8,
        ));
        let collection_cache = std::sync::Arc::new(EntityCache::new(
            std::sync::Arc::new(crate::channel::test_support::RecordingChannel::new(vec![])),
            8,
        ));
        let monitor = Monitor::new(item_cache, collection_cache, 1);

        let mut evicted = None;
        for id in 0..11 {
            monitor.ref_collection(EntityId::from(id));
            evicted = monitor.deref_collection(EntityId::from(id));
        }
        assert_eq!(evicted, Some(EntityId::from(0)));
    }

    #[test]
    fn compression_is_idempotent() {
        let notifications = vec![
            item_notification(NotificationOperation::Add, 1, 7),
            item_notification(NotificationOperation::Modify, 1, 7),
            item_notification(NotificationOperation::Add, 2, 7),
        ];
        let once = compress_all(notifications);
        let twice = compress_all(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn unreferenced_item_notification_has_invalid_destination() {
        let n = item_notification(NotificationOperation::Add, 1, 7);
        assert_eq!(n.destination_collection, INVALID_ID);
    }

    fn multi_item_notification(op: NotificationOperation, items: &[i64], source: i64) -> Notification {
        let mut n = Notification::new(NotificationType::Item, op, b"R1".to_vec());
        n.source_collection = EntityId::from(source);
        n.items = items.iter().map(|&id| EntityId::from(id)).collect();
        n
    }

    /// A listener registered for both `single` and `batch` delivery of
    /// `Add` must receive the whole 3-item notification as one `Batch`
    /// signal, *and* one `Single` signal per item — never N one-item
    /// `Batch` signals.
    #[tokio::test]
    async fn mixed_listeners_each_get_their_own_shape() {
        let item_cache = std::sync::Arc::new(EntityCache::new(
            std::sync::Arc::new(crate::channel::test_support::RecordingChannel::new(vec![
                Ok(Response::Items(vec![Item::new(EntityId::from(1), EntityId::from(7))])),
                Ok(Response::Items(vec![Item::new(EntityId::from(2), EntityId::from(7))])),
                Ok(Response::Items(vec![Item::new(EntityId::from(3), EntityId::from(7))])),
            ])),
            16,
        ));
        let collection_cache = std::sync::Arc::new(EntityCache::new(
            std::sync::Arc::new(crate::channel::test_support::RecordingChannel::new(vec![])),
            8,
        ));
        let monitor = Monitor::new(item_cache.clone(), collection_cache, 16);
        monitor.register_listener(ListenerCapabilities {
            add: SignalSubscription {
                batch: true,
                single: true,
            },
            ..Default::default()
        });

        let mut signals = monitor.subscribe_signals();
        monitor.accept(multi_item_notification(NotificationOperation::Add, &[1, 2, 3], 7));
        monitor.hydrate();

        // Hydrate every item referenced by the queued entries.
        while item_cache.drive_one().await.is_some() {}
        monitor.hydrate();

        let mut batches = Vec::new();
        let mut singles = Vec::new();
        while monitor.try_deliver() {
            match signals.try_recv().unwrap() {
                MonitorSignal::Batch(notifications) => batches.push(notifications),
                MonitorSignal::Single(notification) => singles.push(notification),
                other => panic!("unexpected signal: {other:?}"),
            }
        }

        assert_eq!(batches.len(), 1, "exactly one batch signal, not one per item");
        assert_eq!(batches[0].len(), 1, "the batch wraps the original un-split notification");
        assert_eq!(batches[0][0].items.len(), 3, "the batch keeps all three items together");
        assert_eq!(singles.len(), 3, "single listeners still get one signal per item");
    }

    /// A listener registered for `batch` only must not see its 2-item
    /// notification split into per-item pieces.
    #[tokio::test]
    async fn batch_only_listener_never_triggers_a_split() {
        let item_cache = std::sync::Arc::new(EntityCache::new(
            std::sync::Arc::new(crate::channel::test_support::RecordingChannel::new(vec![
                Ok(Response::Items(vec![Item::new(EntityId::from(1), EntityId::from(7))])),
                Ok(Response::Items(vec![Item::new(EntityId::from(2), EntityId::from(7))])),
            ])),
            16,
        ));
        let collection_cache = std::sync::Arc::new(EntityCache::new(
            std::sync::Arc::new(crate::channel::test_support::RecordingChannel::new(vec![])),
            8,
        ));
        let monitor = Monitor::new(item_cache.clone(), collection_cache, 16);
        monitor.register_listener(ListenerCapabilities {
            add: SignalSubscription {
                batch: true,
                single: false,
            },
            ..Default::default()
        });

        let mut signals = monitor.subscribe_signals();
        monitor.accept(multi_item_notification(NotificationOperation::Add, &[1, 2], 7));
        monitor.hydrate();
        while item_cache.drive_one().await.is_some() {}
        monitor.hydrate();

        let mut delivered = Vec::new();
        while monitor.try_deliver() {
            delivered.push(signals.try_recv().unwrap());
        }

        assert_eq!(delivered.len(), 1);
        match &delivered[0] {
            MonitorSignal::Batch(notifications) => {
                assert_eq!(notifications.len(), 1);
                assert_eq!(notifications[0].items.len(), 2);
            }
            other => panic!("expected a single batch signal, got {other:?}"),
        }
    }
}
