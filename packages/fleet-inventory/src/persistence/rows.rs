//! Row schemas of the persisted inventory tables.

use serde::{Deserialize, Serialize};

use super::table_file::Row;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRow {
    pub id: u32,
    pub name: String,
}

impl Row for PartitionRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub id: u32,
    pub name: String,
    pub olevel: String,
}

impl Row for GroupRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRow {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub storage_type: String,
    pub backend: String,
    pub status: String,
}

impl Row for SiteRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

/// Quota of one (site, leaf partition) pair, in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRow {
    pub site_id: u32,
    pub partition_id: u32,
    pub storage: i64,
}

impl Row for QuotaRow {
    type Key = (u32, u32);

    fn key(&self) -> (u32, u32) {
        (self.site_id, self.partition_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftwareVersionRow {
    pub id: u32,
    pub cycle: u32,
    pub major: u32,
    pub minor: u32,
    pub suffix: String,
}

impl Row for SoftwareVersionRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    pub id: u32,
    pub name: String,
    pub status: String,
    pub data_type: String,
    /// 0 = no software version
    pub software_version_id: u32,
    pub last_update: u64,
    pub is_open: bool,
}

impl Row for DatasetRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: u32,
    pub dataset_id: u32,
    pub name: String,
    pub size: u64,
    pub num_files: u32,
    pub is_open: bool,
    pub last_update: u64,
}

impl Row for BlockRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRow {
    pub id: u32,
    pub block_id: u32,
    pub size: u64,
    pub name: String,
}

impl Row for FileRow {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetReplicaRow {
    pub dataset_id: u32,
    pub site_id: u32,
}

impl Row for DatasetReplicaRow {
    type Key = (u32, u32);

    fn key(&self) -> (u32, u32) {
        (self.dataset_id, self.site_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReplicaRow {
    pub block_id: u32,
    pub site_id: u32,
    /// 0 = unowned
    pub group_id: u32,
    pub is_complete: bool,
    pub is_custodial: bool,
    pub last_update: u64,
}

impl Row for BlockReplicaRow {
    type Key = (u32, u32);

    fn key(&self) -> (u32, u32) {
        (self.block_id, self.site_id)
    }
}

/// Only present when the replica size differs from the block's canonical
/// size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReplicaSizeRow {
    pub block_id: u32,
    pub site_id: u32,
    pub size: u64,
}

impl Row for BlockReplicaSizeRow {
    type Key = (u32, u32);

    fn key(&self) -> (u32, u32) {
        (self.block_id, self.site_id)
    }
}
