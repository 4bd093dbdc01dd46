//! Persistent store for the inventory graph.

pub mod rows;
pub mod store;
pub mod table_file;

pub use store::{FsInventoryStore, LoadFilters, NameFilter};
pub use table_file::{retry_io, Row, TableFile};
