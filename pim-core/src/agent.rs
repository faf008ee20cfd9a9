//! What the core assumes of its host: an observer capability set, a
//! handful of lifecycle hooks, an online/offline toggle, and a task
//! scheduler. Everything else about "being an agent" — how it's
//! packaged, how it talks to its own groupware backend — lives outside
//! this crate; [`AgentBase`] only wires the pieces the core owns
//! (the change recorder, the entity caches) to the pieces the host
//! supplies (the observer, the lifecycle hooks).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pim_contracts::collection::Collection;
use pim_contracts::id::EntityId;
use pim_contracts::item::Item;
use pim_contracts::notification::{ChangedParts, NotificationOperation, NotificationType};

use crate::cache::EntityCache;
use crate::error::Result;
use crate::recorder::ChangeRecorder;

/// Change callbacks a host registers interest in. Every method defaults
/// to a no-op, so an implementor only overrides what it cares about;
/// the `_v2` variants additionally carry `changed_parts` and fall back
/// to the v1 method when not overridden.
pub trait Observer: Send + Sync {
    fn item_added(&self, _item: &Item, _collection: EntityId) {}
    fn item_changed(&self, _item: &Item) {}
    fn item_changed_v2(&self, item: &Item, _changed_parts: &ChangedParts) {
        self.item_changed(item);
    }
    fn item_moved(&self, _item: &Item, _source: EntityId, _destination: EntityId) {}
    fn item_removed(&self, _item: &Item) {}
    fn item_linked(&self, _item: &Item, _collection: EntityId) {}
    fn item_unlinked(&self, _item: &Item, _collection: EntityId) {}

    fn collection_added(&self, _collection: &Collection, _parent: EntityId) {}
    fn collection_changed(&self, _collection: &Collection) {}
    fn collection_changed_v2(&self, collection: &Collection, _changed_parts: &ChangedParts) {
        self.collection_changed(collection);
    }
    fn collection_moved(&self, _collection: &Collection, _source: EntityId, _destination: EntityId) {}
    fn collection_removed(&self, _collection: &Collection) {}
}

/// Hooks the host application drives the agent through; all default to
/// doing nothing.
pub trait ResourceLifecycle: Send + Sync {
    fn about_to_quit(&self) {}
    fn cleanup(&self) {}
    /// `window_handle` is an opaque platform handle (e.g. an X11/Win32
    /// window id) the host passes through for a parented config dialog;
    /// this crate never interprets it.
    fn configure(&self, _window_handle: u64) {}
}

/// The kind of work a [`Scheduler`] serializes. `Custom` carries a
/// caller-chosen label for anything host-specific.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    FullSync,
    CollectionTreeSync,
    CollectionSync,
    FetchItem,
    ResourceCollectionDeletion,
    ChangeReplay,
    Custom,
}

#[derive(Clone, Debug)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    /// Higher runs first; ties broken FIFO.
    pub priority: i32,
    pub label: String,
}

impl ScheduledTask {
    pub fn new(kind: TaskKind, priority: i32, label: impl Into<String>) -> Self {
        Self {
            kind,
            priority,
            label: label.into(),
        }
    }
}

/// A single-threaded priority queue of [`ScheduledTask`]s. At most one
/// task is ever "current"; `task_done`/`defer_task`/`cancel_task` are
/// how the current task leaves that slot.
#[derive(Default)]
pub struct Scheduler {
    queue: Mutex<VecDeque<ScheduledTask>>,
    current: Mutex<Option<ScheduledTask>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, task: ScheduledTask) {
        let mut queue = self.queue.lock().unwrap();
        let position = queue
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(queue.len());
        queue.insert(position, task);
    }

    /// Pops the highest-priority task into the "current" slot and
    /// returns a clone of it. Returns `None` (without changing
    /// `current`) if a task is already running or nothing is queued.
    pub fn next(&self) -> Option<ScheduledTask> {
        let mut current = self.current.lock().unwrap();
        if current.is_some() {
            return None;
        }
        let task = self.queue.lock().unwrap().pop_front()?;
        *current = Some(task.clone());
        current.clone()
    }

    pub fn current(&self) -> Option<ScheduledTask> {
        self.current.lock().unwrap().clone()
    }

    /// The running task completed; clears the current slot.
    pub fn task_done(&self) {
        self.current.lock().unwrap().take();
    }

    /// The running task can't make progress right now; requeue it
    /// behind its priority peers instead of discarding it.
    pub fn defer_task(&self) {
        if let Some(task) = self.current.lock().unwrap().take() {
            self.queue.lock().unwrap().push_back(task);
        }
    }

    /// The running task is abandoned outright.
    pub fn cancel_task(&self) {
        self.current.lock().unwrap().take();
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Hosts one [`ChangeRecorder`] and replays its journal on startup,
/// hydrating each replayed notification's entities from the caches
/// before dispatching to the [`Observer`]. `change_processed` on the
/// recorder is only ever called from here, right after dispatch.
pub struct AgentBase {
    recorder: Arc<ChangeRecorder>,
    observer: Arc<dyn Observer>,
    lifecycle: Arc<dyn ResourceLifecycle>,
    item_cache: Arc<EntityCache<Item>>,
    collection_cache: Arc<EntityCache<Collection>>,
    scheduler: Scheduler,
    online: AtomicBool,
    needs_network: AtomicBool,
    network_available: AtomicBool,
    quitting: AtomicBool,
}

impl AgentBase {
    pub fn new(
        recorder: Arc<ChangeRecorder>,
        observer: Arc<dyn Observer>,
        lifecycle: Arc<dyn ResourceLifecycle>,
        item_cache: Arc<EntityCache<Item>>,
        collection_cache: Arc<EntityCache<Collection>>,
    ) -> Self {
        Self {
            recorder,
            observer,
            lifecycle,
            item_cache,
            collection_cache,
            scheduler: Scheduler::new(),
            online: AtomicBool::new(true),
            needs_network: AtomicBool::new(false),
            network_available: AtomicBool::new(true),
            quitting: AtomicBool::new(false),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Combines the user's online preference with OS network state when
    /// `needs_network` is set.
    pub fn is_online(&self) -> bool {
        let online = self.online.load(Ordering::SeqCst);
        if self.needs_network.load(Ordering::SeqCst) {
            online && self.network_available.load(Ordering::SeqCst)
        } else {
            online
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_needs_network(&self, needs_network: bool) {
        self.needs_network.store(needs_network, Ordering::SeqCst);
    }

    pub fn set_network_available(&self, available: bool) {
        self.network_available.store(available, Ordering::SeqCst);
    }

    pub fn about_to_quit(&self) {
        self.quitting.store(true, Ordering::SeqCst);
        self.lifecycle.about_to_quit();
    }

    pub fn cleanup(&self) {
        self.lifecycle.cleanup();
    }

    pub fn configure(&self, window_handle: u64) {
        self.lifecycle.configure(window_handle);
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    /// Drains the change recorder's journal, dispatching each entry to
    /// the observer and acknowledging it before moving to the next.
    /// Called once at startup, before the agent accepts new work.
    pub async fn replay_pending_changes(&self) -> Result<usize> {
        let mut replayed = 0usize;
        while let Some(notification) = self.recorder.replay_next().await {
            self.dispatch(&notification);
            self.recorder.change_processed().await?;
            replayed += 1;
        }
        Ok(replayed)
    }

    fn dispatch(&self, notification: &pim_contracts::notification::Notification) {
        match notification.notification_type {
            NotificationType::Item => {
                for &id in &notification.items {
                    let item = self.item_cache.retrieve(id);
                    self.dispatch_item(notification, &item);
                }
            }
            NotificationType::Collection => {
                for &id in &notification.items {
                    let collection = self.collection_cache.retrieve(id);
                    self.dispatch_collection(notification, &collection);
                }
            }
            NotificationType::Tag => {}
        }
    }

    fn dispatch_item(&self, notification: &pim_contracts::notification::Notification, item: &Item) {
        match notification.operation {
            NotificationOperation::Add => self.observer.item_added(item, notification.source_collection),
            NotificationOperation::Modify | NotificationOperation::ModifyFlags => {
                if notification.changed_parts.is_empty() {
                    self.observer.item_changed(item);
                } else {
                    self.observer.item_changed_v2(item, &notification.changed_parts);
                }
            }
            NotificationOperation::Move => self.observer.item_moved(
                item,
                notification.source_collection,
                notification.destination_collection,
            ),
            NotificationOperation::Remove => self.observer.item_removed(item),
            NotificationOperation::Link => self.observer.item_linked(item, notification.source_collection),
            NotificationOperation::Unlink => self.observer.item_unlinked(item, notification.source_collection),
            NotificationOperation::Subscribe | NotificationOperation::Unsubscribe => {}
        }
    }

    fn dispatch_collection(
        &self,
        notification: &pim_contracts::notification::Notification,
        collection: &Collection,
    ) {
        match notification.operation {
            NotificationOperation::Add => {
                self.observer.collection_added(collection, notification.source_collection)
            }
            NotificationOperation::Modify | NotificationOperation::ModifyFlags => {
                if notification.changed_parts.is_empty() {
                    self.observer.collection_changed(collection);
                } else {
                    self.observer.collection_changed_v2(collection, &notification.changed_parts);
                }
            }
            NotificationOperation::Move => self.observer.collection_moved(
                collection,
                notification.source_collection,
                notification.destination_collection,
            ),
            NotificationOperation::Remove => self.observer.collection_removed(collection),
            _ => {}
        }
    }
}
