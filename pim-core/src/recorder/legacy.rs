//! Migration path for the version-0 change journal: a flat, line-based
//! settings file using the same `key`, `N\key` indexed-array shape the
//! legacy change recorder wrote before it moved to a binary journal.
//!
//! Once read, every entry is turned into a placeholder [`Notification`]
//! (no `changed_parts` beyond what was recorded, no session id — the
//! legacy format never carried one) and the file itself is deleted; see
//! [`crate::recorder::ChangeRecorder::load`].

use std::collections::BTreeSet;

use pim_contracts::id::{EntityId, ResourceId, INVALID_ID};
use pim_contracts::notification::{Notification, NotificationOperation, NotificationType};

use crate::error::{Result, SyncError};

#[derive(Clone, Debug)]
pub struct LegacyEntry {
    pub notification_type: NotificationType,
    pub operation: NotificationOperation,
    pub item_id: EntityId,
    pub remote_id: Vec<u8>,
    pub resource: ResourceId,
    pub parent_collection: EntityId,
    pub parent_dest_collection: EntityId,
    pub mime_type: String,
    pub item_parts: BTreeSet<Vec<u8>>,
}

impl Default for LegacyEntry {
    fn default() -> Self {
        Self {
            notification_type: NotificationType::Item,
            operation: NotificationOperation::Add,
            item_id: INVALID_ID,
            remote_id: Vec::new(),
            resource: ResourceId::new(),
            parent_collection: INVALID_ID,
            parent_dest_collection: INVALID_ID,
            mime_type: String::new(),
            item_parts: BTreeSet::new(),
        }
    }
}

fn notification_type_from_token(token: &str) -> Result<NotificationType> {
    match token {
        "0" => Ok(NotificationType::Item),
        "1" => Ok(NotificationType::Collection),
        "2" => Ok(NotificationType::Tag),
        other => Err(SyncError::JournalFormatError(format!("legacy type {other}"))),
    }
}

fn operation_from_token(token: &str) -> Result<NotificationOperation> {
    use NotificationOperation::*;
    match token {
        "0" => Ok(Add),
        "1" => Ok(Modify),
        "2" => Ok(ModifyFlags),
        "3" => Ok(Move),
        "4" => Ok(Remove),
        "5" => Ok(Link),
        "6" => Ok(Unlink),
        other => Err(SyncError::JournalFormatError(format!("legacy operation {other}"))),
    }
}

/// Parses the `size=N` / `N\key=value` array group the legacy recorder
/// wrote under a `ChangeRecorder` section. Lines that don't belong to
/// any entry (section headers, the `size` line itself) are skipped.
pub fn parse_legacy_file(contents: &str) -> Result<Vec<LegacyEntry>> {
    let mut size: usize = 0;
    let mut entries: Vec<LegacyEntry> = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('[') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        if key == "size" {
            size = value.trim().parse().unwrap_or(0);
            entries.resize_with(size, LegacyEntry::default);
            continue;
        }

        let Some((index, field)) = key.split_once('\\') else {
            continue;
        };
        let Ok(index) = index.parse::<usize>() else {
            continue;
        };
        if index == 0 || index > entries.len() {
            continue;
        }
        let entry = &mut entries[index - 1];
        match field {
            "type" => entry.notification_type = notification_type_from_token(value)?,
            "op" => entry.operation = operation_from_token(value)?,
            "uid" => {
                entry.item_id = value
                    .parse::<i64>()
                    .map(EntityId::from)
                    .map_err(|_| SyncError::JournalFormatError(format!("legacy uid {value}")))?
            }
            "remoteId" => entry.remote_id = value.as_bytes().to_vec(),
            "resource" => entry.resource = value.as_bytes().to_vec(),
            "parentCol" => {
                entry.parent_collection = value
                    .parse::<i64>()
                    .map(EntityId::from)
                    .unwrap_or(INVALID_ID)
            }
            "parentDestCol" => {
                entry.parent_dest_collection = value
                    .parse::<i64>()
                    .map(EntityId::from)
                    .unwrap_or(INVALID_ID)
            }
            "mimeType" => entry.mime_type = value.to_string(),
            "itemParts" => {
                entry.item_parts = value
                    .split(',')
                    .filter(|part| !part.is_empty())
                    .map(|part| part.as_bytes().to_vec())
                    .collect()
            }
            _ => {}
        }
    }

    Ok(entries)
}

pub fn into_placeholder_notification(entry: &LegacyEntry) -> Notification {
    let mut notification = Notification::new(entry.notification_type, entry.operation, entry.resource.clone());
    notification.source_collection = entry.parent_collection;
    notification.destination_collection = entry.parent_dest_collection;
    notification.mime_type = entry.mime_type.clone();
    notification.changed_parts = entry.item_parts.clone();
    if entry.item_id.is_valid() {
        notification.items = vec![entry.item_id];
    }
    notification
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_an_indexed_array_group() {
        let contents = "\
[ChangeRecorder_change]
size=2
1\\type=0
1\\op=0
1\\uid=100
1\\resource=res
1\\parentCol=7
1\\parentDestCol=-1
1\\mimeType=message/rfc822
1\\itemParts=PAYLOAD,FLAGS
2\\type=0
2\\op=4
2\\uid=101
2\\resource=res
2\\parentCol=7
2\\parentDestCol=-1
2\\mimeType=message/rfc822
2\\itemParts=
";
        let entries = parse_legacy_file(contents).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].item_id, EntityId::from(100));
        assert_eq!(entries[0].operation, NotificationOperation::Add);
        assert_eq!(entries[0].parent_collection, EntityId::from(7));
        assert!(entries[0].item_parts.contains(b"PAYLOAD".as_slice()));
        assert_eq!(entries[1].operation, NotificationOperation::Remove);
        assert!(entries[1].item_parts.is_empty());
    }

    #[test]
    fn missing_size_line_yields_no_entries() {
        let entries = parse_legacy_file("[ChangeRecorder_change]\n1\\type=0\n").unwrap();
        assert!(entries.is_empty());
    }
}
