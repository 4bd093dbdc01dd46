//! Daemon errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Master(#[from] fleet_master::MasterError),

    #[error(transparent)]
    Inventory(#[from] fleet_inventory::InventoryError),

    #[error(transparent)]
    Frame(#[from] crate::frame::FrameError),
}

impl DaemonError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        DaemonError::Io { context, source }
    }
}
