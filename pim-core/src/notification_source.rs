//! One subscription to the server's change stream: parses already
//! tokenized wire frames into [`Notification`] records and emits one
//! per received server event.
//!
//! Raw byte framing, literal blocks, and the `+` continuation token are
//! the transport's problem; this module starts one level up, at "a
//! frame with its tokens already split out" ([`RawFrame`]). What it
//! owns is the part the design calls out specifically: validating and
//! reassembling multi-item batches, and recognizing the end-of-stream
//! marker.

use std::collections::BTreeSet;

use async_trait::async_trait;
use pim_contracts::id::{EntityId, ResourceId};
use pim_contracts::notification::{ChangedParts, Notification, NotificationOperation, NotificationType};
use tokio::sync::broadcast;

use crate::channel::{Command, CommandChannel, Response};
use crate::error::Result;

/// An end-of-stream marker for the current fetch context, carried as a
/// notification whose sole item is `-1`.
pub const END_OF_STREAM_ID: EntityId = EntityId(-1);

/// One already-tokenized server event line.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub notification_type: NotificationType,
    pub operation: NotificationOperation,
    pub session_id: Vec<u8>,
    pub resource: ResourceId,
    pub destination_resource: ResourceId,
    pub source_collection: EntityId,
    pub destination_collection: EntityId,
    pub items: Vec<EntityId>,
    pub changed_parts: ChangedParts,
    pub added_flags: BTreeSet<Vec<u8>>,
    pub removed_flags: BTreeSet<Vec<u8>>,
    pub mime_type: String,
    /// `Some(n)` on a header line announcing `n` single-item frames to
    /// follow. `None` for an already-complete, non-batched frame.
    pub batch_header_count: Option<u32>,
    /// `Some(n)` on the trailing `+n` confirmation line closing a batch
    /// opened by `batch_header_count`.
    pub batch_confirmation: Option<u32>,
}

impl RawFrame {
    fn into_notification(self) -> Notification {
        Notification {
            notification_type: self.notification_type,
            operation: self.operation,
            session_id: self.session_id,
            resource: self.resource,
            destination_resource: self.destination_resource,
            source_collection: self.source_collection,
            destination_collection: self.destination_collection,
            items: self.items,
            changed_parts: self.changed_parts,
            added_flags: self.added_flags,
            removed_flags: self.removed_flags,
            mime_type: self.mime_type,
        }
    }
}

/// The transport's half of a subscription: yields one already-tokenized
/// frame at a time, or `None` on a clean end of stream. A transport
/// implementation reports connection loss through `Err` from the next
/// poll, not a silent `None`.
#[async_trait]
pub trait RawFrameStream: Send {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>>;
}

/// One subscription to the server's change stream.
///
/// Reconnection is the embedder's responsibility: on a stream error
/// (reported as `TransportFailure`), `run` returns the error and the
/// embedder is expected to call [`subscribe`] again and restart `run`
/// once connectivity is back.
pub struct NotificationSource {
    client_id: Vec<u8>,
    subscription_handle: Vec<u8>,
    notify: broadcast::Sender<Notification>,
}

impl NotificationSource {
    /// Issues `SUBSCRIBE <client-id>` and stores the returned handle.
    pub async fn subscribe(channel: &dyn CommandChannel, client_id: Vec<u8>) -> Result<Self> {
        let response = channel
            .call(Command::Subscribe {
                client_id: client_id.clone(),
            })
            .await?;
        let subscription_handle = match response {
            Response::SubscriptionHandle(handle) => handle,
            _ => client_id.clone(),
        };
        let (notify, _) = broadcast::channel(1024);
        Ok(Self {
            client_id,
            subscription_handle,
            notify,
        })
    }

    pub fn client_id(&self) -> &[u8] {
        &self.client_id
    }

    pub fn subscription_handle(&self) -> &[u8] {
        &self.subscription_handle
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    /// Drains `stream` until it ends cleanly or errors, emitting one
    /// [`Notification`] per complete frame (or per completed batch) on
    /// [`Self::subscribe_notifications`]. Malformed counts drop the
    /// whole in-progress batch and are logged, not propagated —
    /// connection loss is the only thing that ends this loop with an
    /// error.
    pub async fn run(&self, mut stream: impl RawFrameStream) -> Result<()> {
        let mut batch: Option<BatchInProgress> = None;
        loop {
            let frame = match stream.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(error) => return Err(error),
            };

            if frame.items.len() == 1 && frame.items[0] == END_OF_STREAM_ID {
                continue;
            }

            if let Some(expected) = frame.batch_header_count {
                batch = Some(BatchInProgress {
                    expected,
                    received: Vec::new(),
                });
                continue;
            }

            if let Some(confirmed) = frame.batch_confirmation {
                match batch.take() {
                    Some(in_progress) if in_progress.received.len() as u32 == confirmed
                        && confirmed == in_progress.expected =>
                    {
                        for notification in in_progress.received {
                            let _ = self.notify.send(notification);
                        }
                    }
                    Some(in_progress) => {
                        tracing::warn!(
                            expected = in_progress.expected,
                            received = in_progress.received.len(),
                            confirmed,
                            "notification batch count mismatch, dropping batch"
                        );
                    }
                    None => {
                        tracing::warn!(confirmed, "batch confirmation with no open batch");
                    }
                }
                continue;
            }

            match batch.as_mut() {
                Some(in_progress) => in_progress.received.push(frame.into_notification()),
                None => {
                    let _ = self.notify.send(frame.into_notification());
                }
            }
        }
    }
}

struct BatchInProgress {
    expected: u32,
    received: Vec<Notification>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;
    use std::sync::Mutex;

    fn base_frame(item: i64) -> RawFrame {
        RawFrame {
            notification_type: NotificationType::Item,
            operation: NotificationOperation::Add,
            session_id: Vec::new(),
            resource: b"R".to_vec(),
            destination_resource: ResourceId::new(),
            source_collection: EntityId::from(7),
            destination_collection: EntityId(-1),
            items: vec![EntityId::from(item)],
            changed_parts: ChangedParts::new(),
            added_flags: BTreeSet::new(),
            removed_flags: BTreeSet::new(),
            mime_type: String::new(),
            batch_header_count: None,
            batch_confirmation: None,
        }
    }

    struct ScriptedStream {
        frames: Mutex<std::collections::VecDeque<RawFrame>>,
    }

    #[async_trait]
    impl RawFrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
            Ok(self.frames.lock().unwrap().pop_front())
        }
    }

    #[tokio::test]
    async fn single_record_passes_through() {
        let channel = RecordingChannel::new(vec![Ok(Response::SubscriptionHandle(b"h".to_vec()))]);
        let source = NotificationSource::subscribe(&channel, b"client".to_vec())
            .await
            .unwrap();
        let mut rx = source.subscribe_notifications();

        let stream = ScriptedStream {
            frames: Mutex::new(vec![base_frame(1)].into()),
        };
        source.run(stream).await.unwrap();

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.items, vec![EntityId::from(1)]);
    }

    #[tokio::test]
    async fn batch_with_matching_count_is_delivered() {
        let channel = RecordingChannel::new(vec![Ok(Response::SubscriptionHandle(b"h".to_vec()))]);
        let source = NotificationSource::subscribe(&channel, b"client".to_vec())
            .await
            .unwrap();
        let mut rx = source.subscribe_notifications();

        let mut header = base_frame(1);
        header.batch_header_count = Some(2);
        let mut confirmation = base_frame(0);
        confirmation.batch_confirmation = Some(2);

        let stream = ScriptedStream {
            frames: Mutex::new(vec![header, base_frame(1), base_frame(2), confirmation].into()),
        };
        source.run(stream).await.unwrap();

        assert_eq!(rx.try_recv().unwrap().items, vec![EntityId::from(1)]);
        assert_eq!(rx.try_recv().unwrap().items, vec![EntityId::from(2)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn batch_with_mismatched_count_is_dropped() {
        let channel = RecordingChannel::new(vec![Ok(Response::SubscriptionHandle(b"h".to_vec()))]);
        let source = NotificationSource::subscribe(&channel, b"client".to_vec())
            .await
            .unwrap();
        let mut rx = source.subscribe_notifications();

        let mut header = base_frame(1);
        header.batch_header_count = Some(3);
        let mut confirmation = base_frame(0);
        confirmation.batch_confirmation = Some(2);

        let stream = ScriptedStream {
            frames: Mutex::new(vec![header, base_frame(1), base_frame(2), confirmation].into()),
        };
        source.run(stream).await.unwrap();

        assert!(rx.try_recv().is_err());
    }
}
