//! Registry tables of the master server.

use std::path::Path;

use serde::{Deserialize, Serialize};

use fleet_inventory::persistence::{Row, TableFile};
use fleet_inventory::StoreError;

/// A user/role/target column that is either a wildcard or one specific id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authorized {
    All,
    Named(u32),
}

impl Authorized {
    /// Wildcards match everything; named ids match themselves.
    pub fn covers(self, id: u32) -> bool {
        match self {
            Authorized::All => true,
            Authorized::Named(named) => named == id,
        }
    }

    fn as_id(self) -> u32 {
        match self {
            Authorized::All => 0,
            Authorized::Named(id) => id,
        }
    }

    fn from_id(id: u32) -> Self {
        if id == 0 {
            Authorized::All
        } else {
            Authorized::Named(id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: u32,
    pub name: String,
    /// Normalized distinguished name
    pub dn: String,
    pub email: String,
}

impl Row for UserRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleRow {
    pub id: u32,
    pub name: String,
}

impl Row for RoleRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub id: u32,
    pub name: String,
}

impl Row for TargetRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

/// Authorization of (user, role) on a target; role or target may be the
/// wildcard id 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAuthRow {
    pub user_id: u32,
    pub role_id: u32,
    pub target_id: u32,
}

impl UserAuthRow {
    pub fn role(&self) -> Authorized {
        Authorized::from_id(self.role_id)
    }

    pub fn target(&self) -> Authorized {
        Authorized::from_id(self.target_id)
    }
}

impl Row for UserAuthRow {
    type Key = (u32, u32, u32);

    fn key(&self) -> (u32, u32, u32) {
        (self.user_id, self.role_id, self.target_id)
    }
}

/// Executable content allowed to run with write access; `user_id` 0 means
/// any user may submit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedExecRow {
    pub title: String,
    /// md5 hex digest of the executable content
    pub checksum: String,
    pub user_id: u32,
}

impl AuthorizedExecRow {
    pub fn user(&self) -> Authorized {
        Authorized::from_id(self.user_id)
    }
}

impl Row for AuthorizedExecRow {
    type Key = (String, String, u32);

    fn key(&self) -> (String, String, u32) {
        (self.title.clone(), self.checksum.clone(), self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRow {
    pub id: u64,
    pub title: String,
    pub path: String,
    pub args: String,
    pub user_id: u32,
    pub write_request: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Unix seconds at submission
    pub timestamp: u64,
}

impl Row for ActionRow {
    type Key = u64;

    fn key(&self) -> u64 {
        self.id
    }
}

/// File-backed registry: `users`, `roles`, `authorization_targets`,
/// `user_authorizations`, `authorized_executables`, `action`.
#[derive(Debug)]
pub struct RegistryStore {
    pub users: TableFile<UserRow>,
    pub roles: TableFile<RoleRow>,
    pub targets: TableFile<TargetRow>,
    pub user_authorizations: TableFile<UserAuthRow>,
    pub authorized_executables: TableFile<AuthorizedExecRow>,
    pub action: TableFile<ActionRow>,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl RegistryStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            context: "creating registry directory",
            source: e,
        })?;
        Ok(Self {
            users: TableFile::open(dir, "users")?,
            roles: TableFile::open(dir, "roles")?,
            targets: TableFile::open(dir, "authorization_targets")?,
            user_authorizations: TableFile::open(dir, "user_authorizations")?,
            authorized_executables: TableFile::open(dir, "authorized_executables")?,
            action: TableFile::open(dir, "action")?,
            max_retries: 3,
            retry_delay_ms: 100,
        })
    }

    pub fn flush_users(&self) -> Result<(), StoreError> {
        self.users.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn flush_roles(&self) -> Result<(), StoreError> {
        self.roles.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn flush_targets(&self) -> Result<(), StoreError> {
        self.targets.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn flush_user_authorizations(&self) -> Result<(), StoreError> {
        self.user_authorizations
            .flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn flush_authorized_executables(&self) -> Result<(), StoreError> {
        self.authorized_executables
            .flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn flush_action(&self) -> Result<(), StoreError> {
        self.action.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&UserRow> {
        self.users.iter().find(|row| row.name == name)
    }

    pub fn user_by_id(&self, id: u32) -> Option<&UserRow> {
        self.users.get(&id)
    }

    pub fn role_by_name(&self, name: &str) -> Option<&RoleRow> {
        self.roles.iter().find(|row| row.name == name)
    }

    pub fn target_by_name(&self, name: &str) -> Option<&TargetRow> {
        self.targets.iter().find(|row| row.name == name)
    }
}
