//! Change-notification and synchronization core for a client-side PIM
//! storage library: the entity cache, the notification bus, the
//! filtering/compressing Monitor, the crash-safe change recorder, the
//! collection and item synchronizers, and the agent/resource lifecycle
//! contract they're hosted behind.
//!
//! Format parsers, GUI, daemon bootstrap, and the wire transport itself
//! are external collaborators; this crate only consumes the
//! [`channel::CommandChannel`] abstraction and the data model in
//! `pim_contracts`.

pub mod agent;
pub mod cache;
pub mod channel;
pub mod error;
pub mod monitor;
pub mod notification_source;
pub mod recorder;
pub mod settings;
pub mod sync;

pub use error::{ErrorKind, Result, SyncError};
