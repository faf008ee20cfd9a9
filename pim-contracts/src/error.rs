//! The small error surface owned by the data model itself, e.g. parsing a
//! scope or a reserved flag token. `pim-core` defines its own richer
//! `SyncError` that wraps this one.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("malformed remote id chain: {0}")]
    MalformedRemoteIdChain(String),

    #[error("unknown flag token: {0}")]
    UnknownFlagToken(String),
}

pub type ContractResult<T> = std::result::Result<T, ContractError>;
