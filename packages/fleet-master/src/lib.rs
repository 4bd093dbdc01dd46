//! Master server: user authorization, application registry, and the
//! process-wide write lock.

pub mod appmanager;
pub mod authorizer;
pub mod error;
pub mod master;
pub mod registry;
pub mod writelock;

pub use appmanager::{AppFilter, AppMode, AppStatus, AppUpdate, Application};
pub use authorizer::normalize_dn;
pub use error::MasterError;
pub use master::MasterServer;
pub use registry::Authorized;
pub use writelock::WriteLock;
