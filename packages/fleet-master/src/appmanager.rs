//! Application registry: scheduling, polling, status transitions, and the
//! write-access gate for submitted executables.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::MasterError;
use crate::master::MasterServer;
use crate::registry::{ActionRow, AuthorizedExecRow};

/// Lifecycle of a submitted application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    New,
    Run,
    Done,
    Failed,
    Killed,
}

impl AppStatus {
    pub fn name(self) -> &'static str {
        match self {
            AppStatus::New => "new",
            AppStatus::Run => "run",
            AppStatus::Done => "done",
            AppStatus::Failed => "failed",
            AppStatus::Killed => "killed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "new" => Some(AppStatus::New),
            "run" => Some(AppStatus::Run),
            "done" => Some(AppStatus::Done),
            "failed" => Some(AppStatus::Failed),
            "killed" => Some(AppStatus::Killed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AppStatus::Done | AppStatus::Failed | AppStatus::Killed)
    }
}

/// Execution mode requested by the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    Synch,
    Asynch,
}

/// One application row joined with its submitter's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: u64,
    pub title: String,
    pub path: String,
    pub args: String,
    pub user_id: u32,
    pub user: String,
    pub write_request: bool,
    pub status: AppStatus,
    pub exit_code: Option<i32>,
    pub timestamp: u64,
}

/// Row selection for [`MasterServer::get_applications`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AppFilter {
    pub app_id: Option<u64>,
    pub status: Option<AppStatus>,
}

/// Field updates for [`MasterServer::update_application`].
#[derive(Debug, Clone, Default)]
pub struct AppUpdate {
    pub status: Option<AppStatus>,
    pub exit_code: Option<i32>,
    pub path: Option<String>,
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MasterServer {
    /// Schedules an application and returns its id. The mode only matters to
    /// the front door (synchronous submitters wait on the app event bus);
    /// the row itself is mode-agnostic.
    pub fn schedule_app(
        &self,
        _mode: AppMode,
        title: &str,
        path: &str,
        user: &str,
        args: &str,
        write_request: bool,
    ) -> Result<u64, MasterError> {
        let mut registry = self.registry.write();
        let user_id = registry
            .user_by_name(user)
            .ok_or_else(|| MasterError::Authorization(format!("unknown user {}", user)))?
            .id;
        let id = registry.action.max_key().map_or(1, |k| k + 1);
        registry.action.upsert(ActionRow {
            id,
            title: title.to_owned(),
            path: path.to_owned(),
            args: args.to_owned(),
            user_id,
            write_request,
            status: AppStatus::New.name().to_owned(),
            exit_code: None,
            timestamp: now_seconds(),
        });
        registry.flush_action()?;
        tracing::info!("Scheduled application {} ({}) for user {}", title, id, user);
        Ok(id)
    }

    /// Applications matching the filter, oldest first.
    pub fn get_applications(&self, filter: AppFilter) -> Vec<Application> {
        let registry = self.registry.read();
        let mut apps: Vec<Application> = registry
            .action
            .iter()
            .filter(|row| filter.app_id.map_or(true, |id| row.id == id))
            .filter(|row| {
                filter
                    .status
                    .map_or(true, |status| row.status == status.name())
            })
            .map(|row| Application {
                id: row.id,
                title: row.title.clone(),
                path: row.path.clone(),
                args: row.args.clone(),
                user_id: row.user_id,
                user: registry
                    .user_by_id(row.user_id)
                    .map(|u| u.name.clone())
                    .unwrap_or_default(),
                write_request: row.write_request,
                status: AppStatus::from_name(&row.status).unwrap_or(AppStatus::Failed),
                exit_code: row.exit_code,
                timestamp: row.timestamp,
            })
            .collect();
        apps.sort_by_key(|app| (app.timestamp, app.id));
        apps
    }

    pub fn get_application(&self, app_id: u64) -> Result<Application, MasterError> {
        self.get_applications(AppFilter {
            app_id: Some(app_id),
            status: None,
        })
        .pop()
        .ok_or(MasterError::UnknownApplication(app_id))
    }

    pub fn update_application(&self, app_id: u64, update: AppUpdate) -> Result<(), MasterError> {
        let mut registry = self.registry.write();
        let Some(row) = registry.action.get(&app_id).cloned() else {
            return Err(MasterError::UnknownApplication(app_id));
        };
        let mut row = row;
        if let Some(status) = update.status {
            row.status = status.name().to_owned();
        }
        if let Some(exit_code) = update.exit_code {
            row.exit_code = Some(exit_code);
        }
        if let Some(path) = update.path {
            row.path = path;
        }
        registry.action.upsert(row);
        registry.flush_action()?;
        Ok(())
    }

    /// Registers executable content as write-authorized for a title.
    /// `user: None` makes the row a wildcard.
    pub fn add_authorized_executable(
        &self,
        title: &str,
        content: &[u8],
        user: Option<&str>,
    ) -> Result<(), MasterError> {
        let user_id = match user {
            None => 0,
            Some(name) => {
                self.registry
                    .read()
                    .user_by_name(name)
                    .ok_or_else(|| {
                        MasterError::Authorization(format!("unknown user {}", name))
                    })?
                    .id
            }
        };
        let mut registry = self.registry.write();
        registry.authorized_executables.upsert(AuthorizedExecRow {
            title: title.to_owned(),
            checksum: content_checksum(content),
            user_id,
        });
        registry.flush_authorized_executables()?;
        Ok(())
    }

    /// An executable may write iff its content checksum matches an
    /// authorized row for the title that is either the wildcard or names the
    /// submitting user.
    pub fn check_write_auth(&self, title: &str, user_id: u32, content: &[u8]) -> bool {
        let checksum = content_checksum(content);
        self.registry
            .read()
            .authorized_executables
            .iter()
            .any(|row| {
                row.title == title && row.checksum == checksum && row.user().covers(user_id)
            })
    }
}

/// md5 hex digest of executable content.
pub fn content_checksum(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
