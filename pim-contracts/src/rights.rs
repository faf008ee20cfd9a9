//! Collection access rights.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Rights a session holds on a collection. Mirrors the ACL bits the
    /// wire protocol reports alongside a `FETCH COLLECTIONS` response.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct CollectionRights: u32 {
        const CREATE_ITEM         = 0b0000_0001;
        const CHANGE_ITEM         = 0b0000_0010;
        const DELETE_ITEM         = 0b0000_0100;
        const CREATE_SUBCOLLECTION = 0b0000_1000;
        const CHANGE_COLLECTION   = 0b0001_0000;
        const DELETE_COLLECTION   = 0b0010_0000;
        const ALL = Self::CREATE_ITEM.bits()
            | Self::CHANGE_ITEM.bits()
            | Self::DELETE_ITEM.bits()
            | Self::CREATE_SUBCOLLECTION.bits()
            | Self::CHANGE_COLLECTION.bits()
            | Self::DELETE_COLLECTION.bits();
    }
}
