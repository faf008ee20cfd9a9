//! Reconciles one collection's remote item listing against its local
//! mirror: matches by id falling back to remote id, rewrites only items
//! whose diff actually changed something, and deletes what full mode
//! says is gone.

use std::collections::HashMap;
use std::sync::Arc;

use pim_contracts::id::{EntityId, RemoteId};
use pim_contracts::item::{validate_flags, Item};
use pim_contracts::scope::{EntityScope, ItemFetchOptions};

use crate::channel::{Command, CommandChannel, Response};
use crate::error::{Result, SyncError};
use crate::sync::{Progress, SyncMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    /// One transaction wraps the whole sync; `rollback` undoes it all.
    Single,
    /// A fresh transaction per delivered batch; each commit stands on
    /// its own regardless of later batches.
    MultiplePerBatch,
    /// No transaction; every write is autonomous.
    None,
}

#[derive(Clone, Debug)]
pub struct ItemSyncOptions {
    pub collection: EntityId,
    pub fetch_scope: ItemFetchOptions,
    pub total_items_hint: Option<usize>,
    pub streaming: bool,
    pub transaction_mode: TransactionMode,
    pub mode: SyncMode,
    /// Forces every matched item to be treated as changed, e.g. after a
    /// cache-policy change that invalidated previously fetched payloads.
    pub invalidate_payload: bool,
}

struct LocalItem {
    item: Item,
    touched: bool,
}

pub struct ItemSync {
    channel: Arc<dyn CommandChannel>,
    options: ItemSyncOptions,
    by_id: HashMap<EntityId, LocalItem>,
    by_remote_id: HashMap<RemoteId, EntityId>,
    progress: Progress,
    delivery_done: bool,
    transaction_open: bool,
    canceled: bool,
}

/// The diff rule deciding whether a matched local item needs rewriting.
pub fn needs_rewrite(local: &Item, remote: &Item, invalidate_payload: bool) -> bool {
    if invalidate_payload {
        return true;
    }
    if local.remote_revision != remote.remote_revision {
        return true;
    }
    if local.flags != remote.flags {
        return true;
    }
    if remote
        .payload_parts
        .keys()
        .any(|part| !local.payload_parts.contains_key(part))
    {
        return true;
    }
    if remote
        .attributes
        .iter()
        .any(|(key, value)| local.attributes.get(key) != Some(value))
    {
        return true;
    }
    if !local.payload_parts.is_empty() && local.payload_parts != remote.payload_parts {
        return true;
    }
    false
}

impl ItemSync {
    pub async fn begin(channel: Arc<dyn CommandChannel>, options: ItemSyncOptions) -> Result<Self> {
        let response = channel
            .call(Command::FetchItems {
                scope: EntityScope::List(Vec::new()),
                options: options.fetch_scope,
                collection: Some(options.collection),
            })
            .await?;
        let local = match response {
            Response::Items(items) => items,
            _ => Vec::new(),
        };

        let mut by_id = HashMap::new();
        let mut by_remote_id = HashMap::new();
        for item in local {
            if !item.remote_id.is_empty() {
                by_remote_id.insert(item.remote_id.clone(), item.id);
            }
            by_id.insert(item.id, LocalItem { item, touched: false });
        }

        let transaction_open = if options.transaction_mode != TransactionMode::None {
            channel.call(Command::BeginTransaction).await?;
            true
        } else {
            false
        };

        Ok(Self {
            channel,
            options,
            by_id,
            by_remote_id,
            progress: Progress::default(),
            delivery_done: false,
            transaction_open,
            canceled: false,
        })
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    fn find_local(&self, remote: &Item) -> Option<EntityId> {
        if self.by_id.contains_key(&remote.id) {
            return Some(remote.id);
        }
        self.by_remote_id.get(&remote.remote_id).copied()
    }

    /// Delivers one batch of remote items (full listing, or the
    /// changed half of an incremental pair). Items without a remote id
    /// are logged and skipped.
    pub async fn set_items(&mut self, remote_items: Vec<Item>) -> Result<()> {
        if self.canceled {
            return Ok(());
        }
        for remote in remote_items {
            if remote.remote_id.is_empty() {
                tracing::warn!(id = %remote.id, "remote item listing entry with no remote id, skipping");
                continue;
            }
            validate_flags(&remote.flags)?;
            match self.find_local(&remote) {
                Some(local_id) => self.reconcile_matched(local_id, remote).await?,
                None => self.create(remote).await?,
            }
        }
        if self.options.transaction_mode == TransactionMode::MultiplePerBatch {
            self.commit_batch().await?;
        }
        Ok(())
    }

    /// Delivers one batch of removed remote ids (incremental mode
    /// only). Individual delete failures don't abort the batch.
    pub async fn set_removed(&mut self, removed_remote_ids: Vec<RemoteId>) -> Result<()> {
        if self.canceled || self.options.mode != SyncMode::Incremental {
            return Ok(());
        }
        for remote_id in removed_remote_ids {
            if let Some(&local_id) = self.by_remote_id.get(&remote_id) {
                if let Err(error) = self.channel.call(Command::DeleteItem(local_id)).await {
                    tracing::warn!(%error, id = %local_id, "item delete failed, continuing batch");
                    continue;
                }
                self.by_id.remove(&local_id);
                self.by_remote_id.remove(&remote_id);
                self.progress.advance(1);
            }
        }
        if self.options.transaction_mode == TransactionMode::MultiplePerBatch {
            self.commit_batch().await?;
        }
        Ok(())
    }

    async fn reconcile_matched(&mut self, local_id: EntityId, remote: Item) -> Result<()> {
        let rewrite = {
            let local = &self.by_id.get(&local_id).expect("matched id must be present").item;
            needs_rewrite(local, &remote, self.options.invalidate_payload)
        };
        if rewrite {
            let mut to_write = remote.clone();
            to_write.id = local_id;
            let expected_revision = self.by_id.get(&local_id).map(|l| l.item.revision);
            self.channel
                .call(Command::ModifyItem {
                    item: to_write,
                    expected_revision,
                })
                .await?;
        }
        if let Some(entry) = self.by_id.get_mut(&local_id) {
            entry.item = remote;
            entry.touched = true;
        }
        self.progress.advance(1);
        Ok(())
    }

    async fn create(&mut self, mut remote: Item) -> Result<()> {
        remote.parent_collection = self.options.collection;
        remote.storage_collection = self.options.collection;
        let response = self.channel.call(Command::CreateItem(remote.clone())).await?;
        let created = match response {
            Response::Items(mut created) => created.pop().unwrap_or(remote),
            _ => remote,
        };
        if !created.remote_id.is_empty() {
            self.by_remote_id.insert(created.remote_id.clone(), created.id);
        }
        self.by_id.insert(
            created.id,
            LocalItem {
                item: created,
                touched: true,
            },
        );
        self.progress.advance(1);
        Ok(())
    }

    async fn commit_batch(&mut self) -> Result<()> {
        if self.transaction_open {
            self.channel.call(Command::CommitTransaction).await?;
            self.transaction_open = false;
        }
        if self.options.transaction_mode != TransactionMode::None {
            self.channel.call(Command::BeginTransaction).await?;
            self.transaction_open = true;
        }
        Ok(())
    }

    pub fn delivery_done(&mut self) {
        self.delivery_done = true;
    }

    /// Aborts the running transaction and marks the job canceled;
    /// further `set_items`/`set_removed` calls are silently ignored and
    /// no deletion happens at [`Self::finish`].
    pub async fn rollback(&mut self) -> Result<()> {
        self.canceled = true;
        if self.transaction_open {
            self.channel.call(Command::RollbackTransaction).await?;
            self.transaction_open = false;
        }
        Ok(())
    }

    /// In full mode, deletes every local item `set_items` never
    /// touched; then commits (unless canceled, in which case nothing
    /// further is written).
    pub async fn finish(mut self) -> Result<Progress> {
        if !self.delivery_done && self.options.streaming {
            return Err(SyncError::IntegrityError(
                "item sync finished before delivery_done was called".into(),
            ));
        }
        if self.canceled {
            return Ok(self.progress);
        }

        if self.options.mode == SyncMode::Full {
            let untouched: Vec<EntityId> = self
                .by_id
                .iter()
                .filter(|(_, entry)| !entry.touched)
                .map(|(&id, _)| id)
                .collect();
            for id in untouched {
                if let Err(error) = self.channel.call(Command::DeleteItem(id)).await {
                    tracing::warn!(%error, %id, "item delete failed during full sync cleanup");
                    continue;
                }
                self.by_id.remove(&id);
                self.progress.advance(1);
            }
        }

        if self.transaction_open {
            self.channel.call(Command::CommitTransaction).await?;
            self.transaction_open = false;
        }
        Ok(self.progress)
    }
}

impl Drop for ItemSync {
    fn drop(&mut self) {
        if self.transaction_open {
            tracing::warn!("item sync dropped with an open transaction; rollback not issued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;

    fn remote_item(id: i64, remote_id: &str, revision: &str) -> Item {
        let mut item = Item::new(EntityId::from(id), EntityId::from(7));
        item.remote_id = remote_id.as_bytes().to_vec();
        item.remote_revision = revision.to_string();
        item
    }

    #[tokio::test]
    async fn unchanged_item_advances_progress_without_a_write() {
        let local = remote_item(1, "msg-1", "r1");
        let channel = Arc::new(RecordingChannel::new(vec![Ok(Response::Items(vec![local.clone()]))]));
        let mut sync = ItemSync::begin(
            channel.clone(),
            ItemSyncOptions {
                collection: EntityId::from(7),
                fetch_scope: ItemFetchOptions::diff_scope(),
                total_items_hint: None,
                streaming: false,
                transaction_mode: TransactionMode::None,
                mode: SyncMode::Incremental,
                invalidate_payload: false,
            },
        )
        .await
        .unwrap();

        let remote_unchanged = remote_item(1, "msg-1", "r1");
        sync.set_items(vec![remote_unchanged]).await.unwrap();
        assert_eq!(sync.progress().processed, 1);
        assert_eq!(channel.calls().len(), 1, "only the initial fetch, no modify");
    }

    #[tokio::test]
    async fn revision_change_triggers_rewrite() {
        let local = remote_item(1, "msg-1", "r1");
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Items(vec![local.clone()])),
            Ok(Response::Ack),
        ]));
        let mut sync = ItemSync::begin(
            channel,
            ItemSyncOptions {
                collection: EntityId::from(7),
                fetch_scope: ItemFetchOptions::diff_scope(),
                total_items_hint: None,
                streaming: false,
                transaction_mode: TransactionMode::None,
                mode: SyncMode::Incremental,
                invalidate_payload: false,
            },
        )
        .await
        .unwrap();

        let remote_changed = remote_item(1, "msg-1", "r2");
        sync.set_items(vec![remote_changed]).await.unwrap();
        assert_eq!(sync.progress().processed, 1);
    }

    #[tokio::test]
    async fn full_sync_deletes_untouched_items() {
        let stale = remote_item(2, "msg-2", "r1");
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Items(vec![stale])),
            Ok(Response::Ack), // begin transaction
            Ok(Response::Ack), // delete of id 2
            Ok(Response::Ack), // commit
        ]));
        let sync = ItemSync::begin(
            channel,
            ItemSyncOptions {
                collection: EntityId::from(7),
                fetch_scope: ItemFetchOptions::diff_scope(),
                total_items_hint: None,
                streaming: false,
                transaction_mode: TransactionMode::Single,
                mode: SyncMode::Full,
                invalidate_payload: false,
            },
        )
        .await
        .unwrap();

        let progress = sync.finish().await.unwrap();
        assert_eq!(progress.processed, 1);
    }

    #[test]
    fn attribute_mismatch_triggers_rewrite() {
        let mut local = remote_item(1, "msg-1", "r1");
        let mut remote = remote_item(1, "msg-1", "r1");
        local.attributes.insert(b"color".to_vec(), b"blue".to_vec());
        remote.attributes.insert(b"color".to_vec(), b"red".to_vec());
        assert!(needs_rewrite(&local, &remote, false));
    }

    #[test]
    fn differing_payload_bytes_for_a_shared_key_triggers_rewrite() {
        let mut local = remote_item(1, "msg-1", "r1");
        let mut remote = remote_item(1, "msg-1", "r1");
        local.payload_parts.insert("BODY".into(), b"old".to_vec());
        local.payload_parts.insert("EXTRA".into(), b"kept locally".to_vec());
        remote.payload_parts.insert("BODY".into(), b"new".to_vec());
        assert!(needs_rewrite(&local, &remote, false));
    }

    #[test]
    fn identical_items_never_need_a_rewrite() {
        let local = remote_item(1, "msg-1", "r1");
        let remote = remote_item(1, "msg-1", "r1");
        assert!(!needs_rewrite(&local, &remote, false));
    }

    #[tokio::test]
    async fn multiple_per_batch_commits_and_reopens_a_transaction_per_batch() {
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Items(vec![])),                                 // initial fetch
            Ok(Response::Ack),                                           // begin
            Ok(Response::Items(vec![remote_item(1, "msg-1", "r1")])),    // create in batch 1
            Ok(Response::Ack),                                           // commit batch 1
            Ok(Response::Ack),                                           // reopen for batch 2
            Ok(Response::Items(vec![remote_item(2, "msg-2", "r1")])),    // create in batch 2
            Ok(Response::Ack),                                           // commit batch 2
            Ok(Response::Ack),                                           // reopen after batch 2
            Ok(Response::Ack),                                           // final commit at finish
        ]));

        let mut sync = ItemSync::begin(
            channel.clone(),
            ItemSyncOptions {
                collection: EntityId::from(7),
                fetch_scope: ItemFetchOptions::diff_scope(),
                total_items_hint: None,
                streaming: false,
                transaction_mode: TransactionMode::MultiplePerBatch,
                mode: SyncMode::Incremental,
                invalidate_payload: false,
            },
        )
        .await
        .unwrap();

        sync.set_items(vec![remote_item(1, "msg-1", "r1")]).await.unwrap();
        sync.set_items(vec![remote_item(2, "msg-2", "r1")]).await.unwrap();
        let progress = sync.finish().await.unwrap();

        assert_eq!(progress.processed, 2);
        let commits = channel
            .calls()
            .iter()
            .filter(|c| matches!(c, Command::CommitTransaction))
            .count();
        assert_eq!(commits, 3, "one commit per batch plus the final commit at finish");
    }

    #[tokio::test]
    async fn rollback_drains_pending_work_without_writing_anything() {
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Items(vec![])), // initial fetch
            Ok(Response::Ack),           // begin
            Ok(Response::Ack),           // rollback
        ]));
        let mut sync = ItemSync::begin(
            channel.clone(),
            ItemSyncOptions {
                collection: EntityId::from(7),
                fetch_scope: ItemFetchOptions::diff_scope(),
                total_items_hint: None,
                streaming: false,
                transaction_mode: TransactionMode::Single,
                mode: SyncMode::Incremental,
                invalidate_payload: false,
            },
        )
        .await
        .unwrap();

        sync.rollback().await.unwrap();
        // Anything delivered after rollback is silently dropped, not queued.
        sync.set_items(vec![remote_item(1, "msg-1", "r1")]).await.unwrap();
        let progress = sync.finish().await.unwrap();

        assert_eq!(progress.processed, 0);
        assert_eq!(channel.calls().len(), 3, "no command issued after the rollback");
    }

    #[tokio::test]
    async fn set_removed_deletes_matched_items_in_incremental_mode() {
        let item_a = remote_item(1, "msg-1", "r1");
        let item_b = remote_item(2, "msg-2", "r1");
        let channel = Arc::new(RecordingChannel::new(vec![
            Ok(Response::Items(vec![item_a, item_b])), // initial fetch
            Ok(Response::Ack),                         // delete of msg-1
        ]));
        let mut sync = ItemSync::begin(
            channel,
            ItemSyncOptions {
                collection: EntityId::from(7),
                fetch_scope: ItemFetchOptions::diff_scope(),
                total_items_hint: None,
                streaming: false,
                transaction_mode: TransactionMode::None,
                mode: SyncMode::Incremental,
                invalidate_payload: false,
            },
        )
        .await
        .unwrap();

        sync.set_removed(vec![b"msg-1".to_vec()]).await.unwrap();
        assert_eq!(sync.progress().processed, 1);
        assert!(!sync.by_id.contains_key(&EntityId::from(1)));
        assert!(!sync.by_remote_id.contains_key(&b"msg-1".to_vec()));
        assert!(sync.by_id.contains_key(&EntityId::from(2)), "unrelated item untouched");
    }
}
