//! Items: the leaf records inside a collection.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ContractError, ContractResult};
use crate::id::{EntityId, RemoteId, ResourceId};
use crate::tag::TagRef;

/// Well-known flag tokens with reserved wire meaning. Anything outside
/// this set is an opaque, application-defined label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservedFlag {
    Seen,
    Important,
    Deleted,
    Updated,
}

impl ReservedFlag {
    pub const fn token(self) -> &'static str {
        match self {
            ReservedFlag::Seen => "\\SEEN",
            ReservedFlag::Important => "\\Important",
            ReservedFlag::Deleted => "\\Deleted",
            ReservedFlag::Updated => "\\Updated",
        }
    }

    /// Parses a wire flag token back into the [`ReservedFlag`] it names.
    /// Only meant for tokens that look reserved (a leading `\`) but don't
    /// match one of the bracketed structured prefixes
    /// (`FLAG_PREFIX_MIME_TYPE` and friends, which carry an embedded
    /// value and aren't plain reserved tokens). Case-insensitive, since
    /// `\SEEN` and `\Seen` both appear on the wire depending on resource.
    pub fn from_token(token: &str) -> ContractResult<Self> {
        match token {
            _ if token.eq_ignore_ascii_case(ReservedFlag::Seen.token()) => Ok(ReservedFlag::Seen),
            _ if token.eq_ignore_ascii_case(ReservedFlag::Important.token()) => Ok(ReservedFlag::Important),
            _ if token.eq_ignore_ascii_case(ReservedFlag::Deleted.token()) => Ok(ReservedFlag::Deleted),
            _ if token.eq_ignore_ascii_case(ReservedFlag::Updated.token()) => Ok(ReservedFlag::Updated),
            other => Err(ContractError::UnknownFlagToken(other.to_string())),
        }
    }
}

/// `true` for a flag token that looks reserved (backslash-prefixed) but
/// carries no embedded value, i.e. is a candidate for
/// [`ReservedFlag::from_token`] rather than a structured prefix like
/// [`FLAG_PREFIX_MIME_TYPE`].
fn looks_reserved(token: &str) -> bool {
    token.starts_with('\\')
        && !token.starts_with(FLAG_PREFIX_MIME_TYPE)
        && !token.starts_with(FLAG_PREFIX_GID)
        && !token.starts_with(FLAG_PREFIX_REMOTE_ID)
        && !token.starts_with(FLAG_PREFIX_REMOTE_REVISION)
}

/// Rejects a remote flag set carrying a backslash-prefixed token this
/// build doesn't recognize as reserved and can't treat as an opaque
/// application label either.
pub fn validate_flags(flags: &BTreeSet<String>) -> ContractResult<()> {
    for flag in flags {
        if looks_reserved(flag) {
            ReservedFlag::from_token(flag)?;
        }
    }
    Ok(())
}

/// Prefix for the server-side filter token carrying an item's mime type in
/// its flag set on CREATE.
pub const FLAG_PREFIX_MIME_TYPE: &str = "\\MimeType[";
pub const FLAG_PREFIX_GID: &str = "\\Gid[";
pub const FLAG_PREFIX_REMOTE_ID: &str = "\\RemoteId[";
pub const FLAG_PREFIX_REMOTE_REVISION: &str = "\\RemoteRevision[";

/// A leaf record inside a collection.
///
/// Invariant: `revision` never decreases locally after a successful
/// modify round-trip. An empty `remote_id` means the item exists only
/// locally (not yet pushed to the resource).
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Item {
    pub id: EntityId,
    pub remote_id: RemoteId,
    pub remote_revision: String,
    pub mime_type: String,
    pub parent_collection: EntityId,
    /// Source collection for virtual containers; equals `parent_collection`
    /// for items that live where they appear.
    pub storage_collection: EntityId,
    pub revision: u64,
    pub flags: BTreeSet<String>,
    pub tags: BTreeSet<TagRef>,
    pub attributes: BTreeMap<Vec<u8>, Vec<u8>>,
    pub payload_parts: BTreeMap<String, Vec<u8>>,
    pub modification_time: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(id: EntityId, parent_collection: EntityId) -> Self {
        Self {
            id,
            remote_id: RemoteId::new(),
            remote_revision: String::new(),
            mime_type: String::new(),
            parent_collection,
            storage_collection: parent_collection,
            revision: 0,
            flags: BTreeSet::new(),
            tags: BTreeSet::new(),
            attributes: BTreeMap::new(),
            payload_parts: BTreeMap::new(),
            modification_time: None,
        }
    }

    /// `true` when this item has never been pushed to its resource.
    pub fn is_local_only(&self) -> bool {
        self.remote_id.is_empty()
    }

    pub fn has_flag(&self, flag: ReservedFlag) -> bool {
        self.flags.contains(flag.token())
    }

    /// `resource = ResourceId::new()` placeholder used where the item's
    /// resource isn't separately tracked (it is inferred from its parent
    /// collection in this model).
    pub fn resource_placeholder() -> ResourceId {
        ResourceId::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_token_recognizes_known_tokens_case_insensitively() {
        assert_eq!(ReservedFlag::from_token("\\seen").unwrap(), ReservedFlag::Seen);
        assert_eq!(ReservedFlag::from_token("\\Important").unwrap(), ReservedFlag::Important);
    }

    #[test]
    fn from_token_rejects_unknown_reserved_looking_tokens() {
        let error = ReservedFlag::from_token("\\Flagged").unwrap_err();
        assert!(matches!(error, ContractError::UnknownFlagToken(token) if token == "\\Flagged"));
    }

    #[test]
    fn validate_flags_accepts_opaque_and_structured_tokens() {
        let mut flags = BTreeSet::new();
        flags.insert("personal-label".to_string());
        flags.insert(format!("{FLAG_PREFIX_MIME_TYPE}text/plain]"));
        flags.insert(ReservedFlag::Deleted.token().to_string());
        assert!(validate_flags(&flags).is_ok());
    }

    #[test]
    fn validate_flags_rejects_an_unrecognized_reserved_token() {
        let mut flags = BTreeSet::new();
        flags.insert("\\Junk".to_string());
        let error = validate_flags(&flags).unwrap_err();
        assert!(matches!(error, ContractError::UnknownFlagToken(_)));
    }
}
