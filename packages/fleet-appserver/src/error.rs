//! Application server errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppServerError {
    /// Malformed or out-of-order client frame
    #[error("Ill-formatted request: {0}")]
    Request(String),

    /// Unknown user or forbidden service
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// A writer holds the inventory; the client should retry later
    #[error("Server is unavailable ({0})")]
    Unavailable(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] fleet_daemon::FrameError),

    #[error(transparent)]
    Master(#[from] fleet_master::MasterError),
}

impl AppServerError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        AppServerError::Io { context, source }
    }
}
