//! Inventory and store error types.

use thiserror::Error;

/// Violations of the inventory object graph: failed lookups, identity
/// mismatches, and illegal structural operations.
#[derive(Error, Debug, Clone)]
pub enum ObjectError {
    /// Partition not found
    #[error("Unknown partition '{0}'")]
    UnknownPartition(String),

    /// Group not found
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    /// Site not found
    #[error("Unknown site '{0}'")]
    UnknownSite(String),

    /// Dataset not found
    #[error("Unknown dataset '{0}'")]
    UnknownDataset(String),

    /// Block not found
    #[error("Unknown block '{0}'")]
    UnknownBlock(String),

    /// File not found
    #[error("Unknown file '{0}'")]
    UnknownFile(String),

    /// Dataset replica not found
    #[error("Unknown replica of '{dataset}' at '{site}'")]
    UnknownReplica { dataset: String, site: String },

    /// Copy attempted between objects with different identity keys
    #[error("Cannot copy '{other}' into '{this}'")]
    IdentityMismatch { this: String, other: String },

    /// Block full name is not of the form `dataset#block`
    #[error("Invalid block full name '{0}'")]
    InvalidBlockName(String),

    /// Partition condition text failed to parse
    #[error("Invalid partition condition '{text}': {reason}")]
    InvalidCondition { text: String, reason: String },

    /// Partition tree exceeds depth 2 or names a missing subpartition
    #[error("Invalid partition structure for '{name}': {reason}")]
    InvalidPartition { name: String, reason: String },

    /// Mutation attempted through a read-only inventory view
    #[error("Inventory view is read-only")]
    ReadOnlyView,
}

/// Persistent store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O failure that did not go away after retries
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Transient I/O failure that may succeed on retry
    #[error("Transient I/O error while {context}: {source}")]
    TransientIo {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Row did not deserialize
    #[error("Malformed row in table '{table}': {reason}")]
    MalformedRow { table: &'static str, reason: String },

    /// Write attempted on a read-only handle
    #[error("Store is read-only")]
    ReadOnly,
}

/// Combined error for inventory operations that touch both the object graph
/// and the persistent store.
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Operation requires an attached store
    #[error("No persistent store attached")]
    NoStore,
}
