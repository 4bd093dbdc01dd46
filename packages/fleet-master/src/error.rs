//! Master server errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MasterError {
    /// Unknown user or forbidden action
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Application id does not exist
    #[error("Unknown application id {0}")]
    UnknownApplication(u64),

    /// Malformed distinguished name
    #[error("Ill-formed distinguished name '{0}'")]
    MalformedDn(String),

    /// Another writer currently holds the write lock
    #[error("Write lock is held by {0}")]
    ResourceBusy(String),

    #[error(transparent)]
    Store(#[from] fleet_inventory::StoreError),
}
