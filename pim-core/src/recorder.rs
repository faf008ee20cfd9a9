//! Durably journals every accepted notification and drives an
//! at-least-once replay loop so the embedding agent can process changes
//! exactly once per restart, crash-resilient (the Change Recorder).
//!
//! A change recorder is a Monitor in spirit — it reuses the same filter
//! and move-translation rules — but instead of delivering straight to
//! listeners it writes to a journal first and waits for an explicit
//! `change_processed()` acknowledgement before advancing.

use std::collections::VecDeque;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use pim_contracts::id::EntityId;
use pim_contracts::item::Item;
use pim_contracts::notification::{Notification, NotificationOperation, NotificationType};
use pim_contracts::scope::ItemFetchOptions;
use tokio::sync::broadcast;

use crate::cache::EntityCache;
use crate::error::{Result, SyncError};
use crate::monitor::{compress_into, FilterConfig};

pub mod journal;
pub mod legacy;

use journal::{decode_journal, encode_header, encode_notification, CURRENT_VERSION};

/// Derives the journal's on-disk path from an agent's settings base
/// name: `<basename>_changes.dat`.
pub fn journal_path_for(settings_basename: &Path) -> PathBuf {
    let mut name = settings_basename
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push("_changes.dat");
    settings_basename.with_file_name(name)
}

pub struct ChangeRecorder {
    filter: Mutex<FilterConfig>,
    session_id: Vec<u8>,
    recording_enabled: AtomicBool,
    pending: Mutex<VecDeque<Notification>>,
    start_offset: Mutex<u64>,
    needs_full_save: AtomicBool,
    journal_path: PathBuf,
    legacy_path: PathBuf,
    changes_added: broadcast::Sender<()>,
    item_cache: Arc<EntityCache<Item>>,
}

impl ChangeRecorder {
    /// Loads the journal at `journal_path`, migrating from the legacy
    /// settings file at `legacy_path` if the binary journal doesn't
    /// exist yet.
    pub async fn load(
        journal_path: PathBuf,
        legacy_path: PathBuf,
        session_id: Vec<u8>,
        item_cache: Arc<EntityCache<Item>>,
    ) -> Result<Self> {
        let (changes_added, _) = broadcast::channel(16);
        let exists = tokio::fs::try_exists(&journal_path).await.unwrap_or(false);

        let (pending, start_offset, needs_full_save) = if exists {
            let bytes = read_file(&journal_path).await?;
            decode_journal(&bytes)
        } else if tokio::fs::try_exists(&legacy_path).await.unwrap_or(false) {
            let contents = read_file(&legacy_path).await?;
            let contents = String::from_utf8_lossy(&contents).into_owned();
            let entries = legacy::parse_legacy_file(&contents)?;
            let mut notifications = Vec::with_capacity(entries.len());
            for entry in &entries {
                if entry.notification_type == NotificationType::Item {
                    item_cache.request(entry.item_id, ItemFetchOptions::cache_hydration());
                }
                notifications.push(legacy::into_placeholder_notification(entry));
            }
            tracing::info!(count = notifications.len(), "migrated legacy change journal");
            (notifications, 0, true)
        } else {
            (Vec::new(), 0, false)
        };

        let recorder = Self {
            filter: Mutex::new(FilterConfig::default()),
            session_id,
            recording_enabled: AtomicBool::new(true),
            pending: Mutex::new(pending.into()),
            start_offset: Mutex::new(start_offset),
            needs_full_save: AtomicBool::new(needs_full_save),
            journal_path,
            legacy_path,
            changes_added,
            item_cache,
        };

        if needs_full_save {
            recorder.write_full_atomic().await?;
            recorder.needs_full_save.store(false, Ordering::SeqCst);
            if recorder.legacy_migrated_this_load(exists) {
                let _ = tokio::fs::remove_file(&recorder.legacy_path).await;
            }
        }

        Ok(recorder)
    }

    fn legacy_migrated_this_load(&self, binary_existed: bool) -> bool {
        !binary_existed
    }

    pub fn set_filter(&self, filter: FilterConfig) {
        *self.filter.lock().unwrap() = filter;
    }

    pub fn set_recording_enabled(&self, enabled: bool) {
        self.recording_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn subscribe_changes_added(&self) -> broadcast::Receiver<()> {
        self.changes_added.subscribe()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Accepts a notification the way a Monitor would, then journals it
    /// before anyone observes it (write-ahead). Notifications
    /// originating from this recorder's own session are dropped
    /// unconditionally while recording.
    pub async fn enqueue(&self, notification: Notification) -> Result<()> {
        if !self.recording_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        if notification.session_id == self.session_id {
            return Ok(());
        }
        let filter = self.filter.lock().unwrap();
        if !filter.passes(&notification) {
            return Ok(());
        }
        let translated = filter.translate_move(&notification);
        drop(filter);

        {
            let mut pending = self.pending.lock().unwrap();
            let mut as_vec: Vec<Notification> = pending.drain(..).collect();
            compress_into(&mut as_vec, translated);
            *pending = as_vec.into();
        }
        // Any enqueue — whether it appended a fresh tail or merged into
        // an existing entry — gets the same atomic rewrite; only the
        // start_offset-bump path in `change_processed` gets the cheaper
        // header-only write.
        self.write_full_atomic().await?;
        let _ = self.changes_added.send(());
        Ok(())
    }

    /// If nobody is listening for `notification`'s shape, the recorder
    /// just advances past it instead of delivering — modeled here as
    /// the caller choosing not to call `replay_next` for it and calling
    /// `change_processed` directly.
    pub async fn skip_undeliverable(&self) -> Result<()> {
        self.change_processed().await
    }

    /// Hydrates (if needed) and returns the head of `pending` without
    /// removing it. The embedder must call [`Self::change_processed`]
    /// once done.
    pub async fn replay_next(&self) -> Option<Notification> {
        let head = self.pending.lock().unwrap().front().cloned()?;
        if head.notification_type == NotificationType::Item {
            for &item in &head.items {
                self.item_cache
                    .ensure_cached(item, ItemFetchOptions::cache_hydration());
            }
        }
        Some(head)
    }

    /// Removes the head of `pending`. Advances the journal by exactly
    /// one entry: a full rewrite if `needs_full_save` was set or the
    /// queue is now empty, otherwise a header-only `start_offset` bump.
    pub async fn change_processed(&self) -> Result<()> {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.pop_front().is_none() {
                tracing::warn!("change_processed called with nothing pending");
            }
        }
        let is_empty = self.pending.lock().unwrap().is_empty();
        let full_save_needed = self.needs_full_save.swap(false, Ordering::SeqCst) || is_empty;
        if full_save_needed {
            self.write_full_atomic().await
        } else {
            *self.start_offset.lock().unwrap() += 1;
            self.rewrite_header_only().await
        }
    }

    async fn write_full_atomic(&self) -> Result<()> {
        let entries: Vec<Notification> = self.pending.lock().unwrap().iter().cloned().collect();
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_header(CURRENT_VERSION, entries.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        for notification in &entries {
            encode_notification(&mut buf, notification);
        }
        let path = self.journal_path.clone();
        write_atomic(path, buf).await?;
        *self.start_offset.lock().unwrap() = 0;
        Ok(())
    }

    async fn rewrite_header_only(&self) -> Result<()> {
        let path = self.journal_path.clone();
        let start_offset = *self.start_offset.lock().unwrap();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(8))?;
            file.write_all(&start_offset.to_le_bytes())?;
            file.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|_| SyncError::JournalFormatError("header rewrite task panicked".into()))??;
        Ok(())
    }
}

async fn write_atomic(path: PathBuf, buf: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|_| SyncError::JournalFormatError("journal writer task panicked".into()))??;
    Ok(())
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::read(&path))
        .await
        .map_err(|_| SyncError::JournalFormatError("journal reader task panicked".into()))?
        .map_err(SyncError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;
    use tempfile::tempdir;

    fn add_notification(item: i64, parent: i64) -> Notification {
        let mut n = Notification::new(NotificationType::Item, NotificationOperation::Add, b"R".to_vec());
        n.source_collection = EntityId::from(parent);
        n.items = vec![EntityId::from(item)];
        n
    }

    fn modify_notification(item: i64) -> Notification {
        let mut n = Notification::new(NotificationType::Item, NotificationOperation::Modify, b"R".to_vec());
        n.items = vec![EntityId::from(item)];
        n.changed_parts.insert(b"BODY".to_vec());
        n
    }

    #[tokio::test]
    async fn crash_resilient_replay_survives_restart() {
        let dir = tempdir().unwrap();
        let journal_path = dir.path().join("agent_changes.dat");
        let legacy_path = dir.path().join("agent_legacy.ini");
        let item_cache = Arc::new(EntityCache::new(
            Arc::new(RecordingChannel::new(vec![])),
            16,
        ));

        let recorder = ChangeRecorder::load(
            journal_path.clone(),
            legacy_path.clone(),
            b"session-a".to_vec(),
            item_cache.clone(),
        )
        .await
        .unwrap();

        recorder.enqueue(add_notification(1, 7)).await.unwrap();
        recorder.enqueue(modify_notification(1)).await.unwrap();
        assert_eq!(recorder.pending_len(), 1, "compression must merge Add+Modify into one entry");

        // Simulate a crash: drop the recorder before change_processed,
        // then reload from disk.
        drop(recorder);

        let item_cache = Arc::new(EntityCache::new(
            Arc::new(RecordingChannel::new(vec![])),
            16,
        ));
        let reloaded = ChangeRecorder::load(journal_path, legacy_path, b"session-a".to_vec(), item_cache)
            .await
            .unwrap();
        assert_eq!(reloaded.pending_len(), 1);
        let head = reloaded.replay_next().await.unwrap();
        assert_eq!(head.items, vec![EntityId::from(1)]);
        assert_eq!(head.source_collection, EntityId::from(7));

        reloaded.change_processed().await.unwrap();
        assert_eq!(reloaded.pending_len(), 0);
    }

    #[tokio::test]
    async fn own_session_notifications_are_dropped() {
        let dir = tempdir().unwrap();
        let item_cache = Arc::new(EntityCache::new(Arc::new(RecordingChannel::new(vec![])), 16));
        let recorder = ChangeRecorder::load(
            dir.path().join("agent_changes.dat"),
            dir.path().join("agent_legacy.ini"),
            b"session-a".to_vec(),
            item_cache,
        )
        .await
        .unwrap();

        let mut own = add_notification(1, 7);
        own.session_id = b"session-a".to_vec();
        recorder.enqueue(own).await.unwrap();
        assert_eq!(recorder.pending_len(), 0);
    }

    #[tokio::test]
    async fn legacy_settings_file_migrates_into_three_pending_entries() {
        let dir = tempdir().unwrap();
        let journal_path = dir.path().join("agent_changes.dat");
        let legacy_path = dir.path().join("agent_legacy.ini");
        tokio::fs::write(
            &legacy_path,
            "[ChangeRecorder_change]\n\
             size=3\n\
             1\\type=0\n1\\op=0\n1\\uid=100\n1\\resource=res\n1\\parentCol=7\n1\\parentDestCol=-1\n1\\mimeType=message/rfc822\n1\\itemParts=PAYLOAD\n\
             2\\type=0\n2\\op=1\n2\\uid=101\n2\\resource=res\n2\\parentCol=7\n2\\parentDestCol=-1\n2\\mimeType=message/rfc822\n2\\itemParts=FLAGS\n\
             3\\type=0\n3\\op=4\n3\\uid=102\n3\\resource=res\n3\\parentCol=7\n3\\parentDestCol=-1\n3\\mimeType=message/rfc822\n3\\itemParts=\n",
        )
        .await
        .unwrap();

        let item_cache = Arc::new(EntityCache::new(Arc::new(RecordingChannel::new(vec![])), 16));
        let recorder = ChangeRecorder::load(
            journal_path.clone(),
            legacy_path.clone(),
            b"session-a".to_vec(),
            item_cache,
        )
        .await
        .unwrap();

        assert_eq!(recorder.pending_len(), 3, "all three legacy entries become pending notifications");
        assert!(!tokio::fs::try_exists(&legacy_path).await.unwrap(), "migrated legacy file is removed");
        assert!(tokio::fs::try_exists(&journal_path).await.unwrap(), "migration forces a full journal write");

        // The full-save from migration must itself be a correct journal:
        // reloading from it (legacy file already gone) reproduces the
        // same three entries without touching the legacy path again.
        let item_cache = Arc::new(EntityCache::new(Arc::new(RecordingChannel::new(vec![])), 16));
        let reloaded = ChangeRecorder::load(journal_path, legacy_path, b"session-a".to_vec(), item_cache)
            .await
            .unwrap();
        assert_eq!(reloaded.pending_len(), 3);
    }
}
