//! The master server: registry access behind a read-write lock.

use std::path::Path;

use parking_lot::RwLock;

use crate::error::MasterError;
use crate::registry::RegistryStore;
use crate::writelock::WriteLock;

/// Owns the registry tables, the authorization routines, the application
/// registry, and the process-wide write lock.
///
/// Authorization methods are stateless reads and may be called concurrently
/// from every connection handler; mutations take the write side of the lock
/// for the duration of one table update.
#[derive(Debug)]
pub struct MasterServer {
    pub(crate) registry: RwLock<RegistryStore>,
    write_lock: WriteLock,
}

impl MasterServer {
    pub fn open(registry_dir: impl AsRef<Path>) -> Result<Self, MasterError> {
        Ok(Self {
            registry: RwLock::new(RegistryStore::open(registry_dir)?),
            write_lock: WriteLock::new(),
        })
    }

    pub fn write_lock(&self) -> &WriteLock {
        &self.write_lock
    }
}
