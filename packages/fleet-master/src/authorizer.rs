//! User identification and authorization.
//!
//! Stateless lookups over the registry tables; safe under concurrent
//! callers. Wildcard authorization rows are modelled as
//! [`Authorized::All`](crate::registry::Authorized) on the role and target
//! columns.

use crate::error::MasterError;
use crate::master::MasterServer;
use crate::registry::{RoleRow, TargetRow, UserAuthRow, UserRow};

/// Renders a distinguished name as `/KEY=VALUE/KEY=VALUE/...`.
///
/// Accepts both the slash form and the comma-separated RFC form
/// (`CN = John Doe, DC = example, DC = org`). Backslash-escaped commas
/// inside values are preserved. Equality of two DNs is string equality of
/// their normalized forms.
pub fn normalize_dn(input: &str) -> Result<String, MasterError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(MasterError::MalformedDn(input.to_owned()));
    }

    let parts: Vec<String> = if input.starts_with('/') {
        split_unescaped(&input[1..], '/')
    } else {
        split_unescaped(input, ',')
    };

    let mut dn = String::with_capacity(input.len());
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            return Err(MasterError::MalformedDn(input.to_owned()));
        }
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| MasterError::MalformedDn(input.to_owned()))?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(MasterError::MalformedDn(input.to_owned()));
        }
        dn.push('/');
        dn.push_str(key);
        dn.push('=');
        dn.push_str(value);
    }
    Ok(dn)
}

/// Splits on a separator, honouring backslash escapes.
fn split_unescaped(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in input.chars() {
        if escaped {
            current.push('\\');
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        current.push('\\');
    }
    parts.push(current);
    parts
}

impl MasterServer {
    pub fn user_exists(&self, name: &str) -> bool {
        self.registry.read().user_by_name(name).is_some()
    }

    /// `(name, dn, email)` for every known user.
    pub fn list_users(&self) -> Vec<(String, String, String)> {
        self.registry
            .read()
            .users
            .iter()
            .map(|row| (row.name.clone(), row.dn.clone(), row.email.clone()))
            .collect()
    }

    /// Maps a DN or a user name to `(name, id)`. With `check_trunc`, a DN
    /// that is a truncation prefix of a stored DN also matches.
    pub fn identify_user(
        &self,
        dn: Option<&str>,
        name: Option<&str>,
        check_trunc: bool,
    ) -> Result<Option<(String, u32)>, MasterError> {
        let registry = self.registry.read();

        if let Some(dn) = dn {
            let normalized = normalize_dn(dn)?;
            let found = registry.users.iter().find(|row| {
                row.dn == normalized || (check_trunc && row.dn.starts_with(&normalized))
            });
            return Ok(found.map(|row| (row.name.clone(), row.id)));
        }

        if let Some(name) = name {
            return Ok(registry
                .user_by_name(name)
                .map(|row| (row.name.clone(), row.id)));
        }

        Ok(None)
    }

    pub fn identify_role(&self, name: &str) -> Option<(String, u32)> {
        self.registry
            .read()
            .role_by_name(name)
            .map(|row| (row.name.clone(), row.id))
    }

    pub fn list_roles(&self) -> Vec<String> {
        self.registry
            .read()
            .roles
            .iter()
            .map(|row| row.name.clone())
            .collect()
    }

    pub fn list_authorization_targets(&self) -> Vec<String> {
        self.registry
            .read()
            .targets
            .iter()
            .map(|row| row.name.clone())
            .collect()
    }

    /// Checks the authorization of (user, role) on a target. `None` on
    /// either argument asks for authorization across that dimension.
    pub fn check_user_auth(&self, user: &str, role: Option<&str>, target: Option<&str>) -> bool {
        let registry = self.registry.read();
        let Some(user_row) = registry.user_by_name(user) else {
            return false;
        };
        let role_id = match role {
            None => None,
            Some(name) => match registry.role_by_name(name) {
                Some(row) => Some(row.id),
                None => return false,
            },
        };
        let target_id = match target {
            None => None,
            Some(name) => match registry.target_by_name(name) {
                Some(row) => Some(row.id),
                None => return false,
            },
        };

        let authorized = registry.user_authorizations.iter().any(|row| {
            row.user_id == user_row.id
                && role_id.map_or(true, |id| row.role().covers(id))
                && target_id.map_or(true, |id| row.target().covers(id))
        });
        authorized
    }

    /// `(role, target)` pairs the user is authorized for; `None` marks the
    /// wildcard dimension.
    pub fn list_user_auth(&self, user: &str) -> Vec<(Option<String>, Option<String>)> {
        let registry = self.registry.read();
        let Some(user_row) = registry.user_by_name(user) else {
            return Vec::new();
        };
        registry
            .user_authorizations
            .iter()
            .filter(|row| row.user_id == user_row.id)
            .map(|row| {
                let role = registry.roles.get(&row.role_id).map(|r| r.name.clone());
                let target = registry.targets.get(&row.target_id).map(|t| t.name.clone());
                (role, target)
            })
            .collect()
    }

    /// `(user, role)` pairs authorized for a target; `None` asks for users
    /// authorized across all targets.
    pub fn list_authorized_users(&self, target: Option<&str>) -> Vec<(String, Option<String>)> {
        let registry = self.registry.read();
        let target_id = match target {
            None => None,
            Some(name) => match registry.target_by_name(name) {
                Some(row) => Some(row.id),
                None => return Vec::new(),
            },
        };
        registry
            .user_authorizations
            .iter()
            .filter(|row| match target_id {
                None => row.target() == crate::registry::Authorized::All,
                Some(id) => row.target().covers(id),
            })
            .filter_map(|row| {
                let user = registry.user_by_id(row.user_id)?;
                let role = registry.roles.get(&row.role_id).map(|r| r.name.clone());
                Some((user.name.clone(), role))
            })
            .collect()
    }

    // --- Registry population ------------------------------------------------

    /// Adds a user; the DN is normalized before it is stored.
    pub fn add_user(&self, name: &str, dn: &str, email: &str) -> Result<u32, MasterError> {
        let dn = normalize_dn(dn)?;
        let mut registry = self.registry.write();
        if let Some(existing) = registry.user_by_name(name) {
            return Ok(existing.id);
        }
        let id = registry.users.max_key().map_or(1, |k| k + 1);
        registry.users.upsert(UserRow {
            id,
            name: name.to_owned(),
            dn,
            email: email.to_owned(),
        });
        registry.flush_users()?;
        Ok(id)
    }

    pub fn add_role(&self, name: &str) -> Result<u32, MasterError> {
        let mut registry = self.registry.write();
        if let Some(existing) = registry.role_by_name(name) {
            return Ok(existing.id);
        }
        let id = registry.roles.max_key().map_or(1, |k| k + 1);
        registry.roles.upsert(RoleRow {
            id,
            name: name.to_owned(),
        });
        registry.flush_roles()?;
        Ok(id)
    }

    pub fn add_authorization_target(&self, name: &str) -> Result<u32, MasterError> {
        let mut registry = self.registry.write();
        if let Some(existing) = registry.target_by_name(name) {
            return Ok(existing.id);
        }
        let id = registry.targets.max_key().map_or(1, |k| k + 1);
        registry.targets.upsert(TargetRow {
            id,
            name: name.to_owned(),
        });
        registry.flush_targets()?;
        Ok(id)
    }

    /// Grants (user, role, target); pass `None` for a wildcard dimension.
    pub fn authorize_user(
        &self,
        user: &str,
        role: Option<&str>,
        target: Option<&str>,
    ) -> Result<(), MasterError> {
        let registry = self.registry.read();
        let user_id = registry
            .user_by_name(user)
            .ok_or_else(|| MasterError::Authorization(format!("unknown user {}", user)))?
            .id;
        let role_id = match role {
            None => 0,
            Some(name) => {
                registry
                    .role_by_name(name)
                    .ok_or_else(|| MasterError::Authorization(format!("unknown role {}", name)))?
                    .id
            }
        };
        let target_id = match target {
            None => 0,
            Some(name) => {
                registry
                    .target_by_name(name)
                    .ok_or_else(|| {
                        MasterError::Authorization(format!("unknown target {}", name))
                    })?
                    .id
            }
        };
        drop(registry);

        let mut registry = self.registry.write();
        registry.user_authorizations.upsert(UserAuthRow {
            user_id,
            role_id,
            target_id,
        });
        registry.flush_user_authorizations()?;
        Ok(())
    }
}
