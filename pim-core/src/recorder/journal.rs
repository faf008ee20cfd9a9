//! Binary encoding for the change journal.
//!
//! Layout: a little-endian `u64` header word packing `(version << 32) |
//! count`, followed — for version 1 and up — by a `u64` `start_offset`,
//! followed by `count` encoded notifications back to back. `version` 3
//! is the only format this module writes; earlier versions are
//! recognized on read so a stale journal triggers a full rewrite rather
//! than being silently misparsed.

use std::collections::BTreeSet;

use pim_contracts::id::EntityId;
use pim_contracts::notification::{ChangedParts, Notification, NotificationOperation, NotificationType};

use crate::error::{Result, SyncError};

pub const CURRENT_VERSION: u32 = 3;
const HEADER_VERSION_SHIFT: u32 = 32;

pub fn encode_header(version: u32, count: u32) -> u64 {
    ((version as u64) << HEADER_VERSION_SHIFT) | count as u64
}

fn decode_header(word: u64) -> (u32, u32) {
    ((word >> HEADER_VERSION_SHIFT) as u32, word as u32)
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn write_list<T>(buf: &mut Vec<u8>, items: &[T], mut write_one: impl FnMut(&mut Vec<u8>, &T)) {
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        write_one(buf, item);
    }
}

fn write_set(buf: &mut Vec<u8>, items: &BTreeSet<Vec<u8>>) {
    buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        write_bytes(buf, item);
    }
}

pub fn encode_notification(buf: &mut Vec<u8>, n: &Notification) {
    buf.extend_from_slice(&(n.notification_type as i32).to_le_bytes());
    buf.extend_from_slice(&(n.operation as i32).to_le_bytes());
    buf.extend_from_slice(&n.source_collection.get().to_le_bytes());
    write_bytes(buf, &n.resource);
    buf.extend_from_slice(&n.destination_collection.get().to_le_bytes());
    write_bytes(buf, &n.destination_resource);
    write_set(buf, &n.added_flags);
    write_set(buf, &n.removed_flags);
    write_set(buf, &n.changed_parts);
    write_list(buf, &n.items, |b, id| b.extend_from_slice(&id.get().to_le_bytes()));
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(SyncError::JournalFormatError("truncated journal record".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn set(&mut self) -> Result<BTreeSet<Vec<u8>>> {
        let count = self.u32()?;
        (0..count).map(|_| self.bytes()).collect()
    }

    fn ids(&mut self) -> Result<Vec<EntityId>> {
        let count = self.u32()?;
        (0..count).map(|_| Ok(EntityId::from(self.i64()?))).collect()
    }
}

fn notification_type_from_i32(value: i32) -> Result<NotificationType> {
    match value {
        0 => Ok(NotificationType::Item),
        1 => Ok(NotificationType::Collection),
        2 => Ok(NotificationType::Tag),
        other => Err(SyncError::JournalFormatError(format!("unknown notification type {other}"))),
    }
}

fn operation_from_i32(value: i32) -> Result<NotificationOperation> {
    use NotificationOperation::*;
    match value {
        0 => Ok(Add),
        1 => Ok(Modify),
        2 => Ok(ModifyFlags),
        3 => Ok(Move),
        4 => Ok(Remove),
        5 => Ok(Link),
        6 => Ok(Unlink),
        7 => Ok(Subscribe),
        8 => Ok(Unsubscribe),
        other => Err(SyncError::JournalFormatError(format!("unknown notification operation {other}"))),
    }
}

fn decode_notification(reader: &mut Reader<'_>) -> Result<Notification> {
    let notification_type = notification_type_from_i32(reader.i32()?)?;
    let operation = operation_from_i32(reader.i32()?)?;
    let source_collection = EntityId::from(reader.i64()?);
    let resource = reader.bytes()?;
    let destination_collection = EntityId::from(reader.i64()?);
    let destination_resource = reader.bytes()?;
    let added_flags = reader.set()?;
    let removed_flags = reader.set()?;
    let changed_parts: ChangedParts = reader.set()?;
    let items = reader.ids()?;

    Ok(Notification {
        notification_type,
        operation,
        session_id: Vec::new(),
        resource,
        destination_resource,
        source_collection,
        destination_collection,
        items,
        changed_parts,
        added_flags,
        removed_flags,
        mime_type: String::new(),
    })
}

/// Decodes a whole journal file. Returns the notifications it could
/// parse, the `start_offset` it read (0 for version 0 or an empty/
/// missing file), and whether a full rewrite is warranted — either
/// because the tail was truncated mid-record (a crash mid-write) or
/// because the file predates the current format.
pub fn decode_journal(bytes: &[u8]) -> (Vec<Notification>, u64, bool) {
    let mut reader = Reader::new(bytes);
    let Ok(header) = reader.u64() else {
        return (Vec::new(), 0, !bytes.is_empty());
    };
    let (version, count) = decode_header(header);

    let start_offset = if version >= 1 {
        match reader.u64() {
            Ok(value) => value,
            Err(_) => return (Vec::new(), 0, true),
        }
    } else {
        0
    };

    if version > CURRENT_VERSION {
        tracing::warn!(version, "change journal has a newer format than this build understands");
        return (Vec::new(), 0, true);
    }
    if version != CURRENT_VERSION {
        tracing::info!(version, target = CURRENT_VERSION, "upgrading change journal format");
    }

    let mut notifications = Vec::new();
    let mut needs_full_save = version != CURRENT_VERSION;
    for _ in 0..count {
        match decode_notification(&mut reader) {
            Ok(notification) => notifications.push(notification),
            Err(error) => {
                tracing::warn!(%error, "truncating change journal at first malformed record");
                needs_full_save = true;
                break;
            }
        }
    }

    let start_offset = start_offset.min(notifications.len() as u64);
    let notifications = notifications.split_off(start_offset as usize);
    (notifications, 0, needs_full_save || start_offset > 0)
}
