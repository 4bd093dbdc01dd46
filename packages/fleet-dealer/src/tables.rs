//! Request tables: `copy_requests`, `copy_request_sites`,
//! `copy_request_items`, `active_copies`.
//!
//! The dealer cycle takes the registry mutably for the duration of one
//! locked section, which stands in for the SQL table locks the request
//! tables traditionally get.

use std::path::Path;

use serde::{Deserialize, Serialize};

use fleet_inventory::persistence::{Row, TableFile};
use fleet_inventory::StoreError;

use crate::error::DealerError;

/// Lifecycle of a copy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    New,
    Activated,
    Rejected,
}

impl RequestStatus {
    pub fn name(self) -> &'static str {
        match self {
            RequestStatus::New => "new",
            RequestStatus::Activated => "activated",
            RequestStatus::Rejected => "rejected",
        }
    }
}

/// Lifecycle of an active copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    New,
    Queued,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyRequestRow {
    pub id: u64,
    pub group: String,
    pub num_copies: u32,
    pub request_count: u32,
    pub first_request_time: u64,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Row for CopyRequestRow {
    type Key = u64;

    fn key(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyRequestSiteRow {
    pub request_id: u64,
    pub site: String,
}

impl Row for CopyRequestSiteRow {
    type Key = (u64, String);

    fn key(&self) -> (u64, String) {
        (self.request_id, self.site.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyRequestItemRow {
    pub request_id: u64,
    /// Dataset name or block full name
    pub item: String,
}

impl Row for CopyRequestItemRow {
    type Key = (u64, String);

    fn key(&self) -> (u64, String) {
        (self.request_id, self.item.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCopyRow {
    pub request_id: u64,
    /// Dataset name or block full name
    pub item: String,
    pub site: String,
    pub status: CopyStatus,
    pub created: u64,
    pub updated: u64,
}

impl Row for ActiveCopyRow {
    type Key = (u64, String, String);

    fn key(&self) -> (u64, String, String) {
        (self.request_id, self.item.clone(), self.site.clone())
    }
}

fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// File-backed request registry.
#[derive(Debug)]
pub struct RequestRegistry {
    pub copy_requests: TableFile<CopyRequestRow>,
    pub copy_request_sites: TableFile<CopyRequestSiteRow>,
    pub copy_request_items: TableFile<CopyRequestItemRow>,
    pub active_copies: TableFile<ActiveCopyRow>,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl RequestRegistry {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            context: "creating request registry directory",
            source: e,
        })?;
        Ok(Self {
            copy_requests: TableFile::open(dir, "copy_requests")?,
            copy_request_sites: TableFile::open(dir, "copy_request_sites")?,
            copy_request_items: TableFile::open(dir, "copy_request_items")?,
            active_copies: TableFile::open(dir, "active_copies")?,
            max_retries: 3,
            retry_delay_ms: 100,
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.copy_requests
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.copy_request_sites
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.copy_request_items
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.active_copies
            .flush(self.max_retries, self.retry_delay_ms)
    }

    /// Files a new copy request.
    pub fn create_request(
        &mut self,
        group: &str,
        num_copies: u32,
        sites: &[&str],
        items: &[&str],
    ) -> Result<u64, DealerError> {
        let id = self.copy_requests.max_key().map_or(1, |k| k + 1);
        self.copy_requests.upsert(CopyRequestRow {
            id,
            group: group.to_owned(),
            num_copies,
            request_count: 1,
            first_request_time: now_seconds(),
            status: RequestStatus::New,
            rejection_reason: None,
        });
        for site in sites {
            self.copy_request_sites.upsert(CopyRequestSiteRow {
                request_id: id,
                site: (*site).to_owned(),
            });
        }
        for item in items {
            self.copy_request_items.upsert(CopyRequestItemRow {
                request_id: id,
                item: (*item).to_owned(),
            });
        }
        self.flush()?;
        Ok(id)
    }

    pub fn request(&self, id: u64) -> Option<&CopyRequestRow> {
        self.copy_requests.get(&id)
    }

    /// Marks a request activated.
    pub fn activate_request(&mut self, id: u64) -> Result<(), DealerError> {
        if let Some(mut row) = self.copy_requests.get(&id).cloned() {
            row.status = RequestStatus::Activated;
            self.copy_requests.upsert(row);
        }
        self.flush()?;
        Ok(())
    }

    /// Rejects a request with a reason and drops its site, item, and active
    /// rows; the request row itself is kept as history.
    pub fn reject_request(&mut self, id: u64, reason: String) -> Result<(), DealerError> {
        tracing::info!("Rejecting copy request {}: {}", id, reason);
        if let Some(mut row) = self.copy_requests.get(&id).cloned() {
            row.status = RequestStatus::Rejected;
            row.rejection_reason = Some(reason);
            self.copy_requests.upsert(row);
        }
        self.copy_request_sites.retain(|_, row| row.request_id != id);
        self.copy_request_items.retain(|_, row| row.request_id != id);
        self.active_copies.retain(|_, row| row.request_id != id);
        self.flush()?;
        Ok(())
    }

    /// Inserts one active copy row.
    pub fn insert_active_copy(
        &mut self,
        request_id: u64,
        item: &str,
        site: &str,
        status: CopyStatus,
    ) -> Result<(), DealerError> {
        let now = now_seconds();
        self.active_copies.upsert(ActiveCopyRow {
            request_id,
            item: item.to_owned(),
            site: site.to_owned(),
            status,
            created: now,
            updated: now,
        });
        self.flush()?;
        Ok(())
    }

    /// Marks one active copy failed.
    pub fn fail_active_copy(
        &mut self,
        request_id: u64,
        item: &str,
        site: &str,
    ) -> Result<(), DealerError> {
        let key = (request_id, item.to_owned(), site.to_owned());
        if let Some(mut row) = self.active_copies.get(&key).cloned() {
            row.status = CopyStatus::Failed;
            row.updated = now_seconds();
            self.active_copies.upsert(row);
        }
        self.flush()?;
        Ok(())
    }

    /// Moves matching `new` active copies at a site to `queued`: the item is
    /// the dataset itself or any block of it.
    pub fn queue_active_copies(&mut self, dataset: &str, site: &str) -> Result<(), DealerError> {
        let prefix = format!("{}#", dataset);
        let now = now_seconds();
        let matching: Vec<ActiveCopyRow> = self
            .active_copies
            .iter()
            .filter(|row| {
                row.status == CopyStatus::New
                    && row.site == site
                    && (row.item == dataset || row.item.starts_with(&prefix))
            })
            .cloned()
            .collect();
        for mut row in matching {
            row.status = CopyStatus::Queued;
            row.updated = now;
            self.active_copies.upsert(row);
        }
        self.flush()?;
        Ok(())
    }
}
