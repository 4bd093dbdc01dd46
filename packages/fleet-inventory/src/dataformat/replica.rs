//! Dataset and block placement records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::block::Block;
use super::condition::ReplicaContext;

/// Placement of a dataset at a site. Exists only while it holds at least one
/// block replica.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetReplica {
    pub dataset: String,
    pub site: String,
    /// Block replicas keyed by block name
    pub block_replicas: BTreeMap<String, BlockReplica>,
}

impl DatasetReplica {
    pub fn new(dataset: impl Into<String>, site: impl Into<String>) -> Self {
        DatasetReplica {
            dataset: dataset.into(),
            site: site.into(),
            block_replicas: BTreeMap::new(),
        }
    }

    /// Total on-site size over the block replicas.
    pub fn size(&self) -> u64 {
        self.block_replicas.values().map(|br| br.size).sum()
    }

    pub fn to_record(&self) -> DatasetReplicaRecord {
        DatasetReplicaRecord {
            dataset: self.dataset.clone(),
            site: self.site.clone(),
        }
    }
}

/// Placement of a block at a site, owned by a group (`None` = unowned).
/// The replica size may differ from the block's canonical size.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReplica {
    pub dataset: String,
    pub block: String,
    pub site: String,
    pub group: Option<String>,
    pub is_complete: bool,
    pub is_custodial: bool,
    pub size: u64,
    /// Unix seconds
    pub last_update: u64,
}

impl BlockReplica {
    pub fn copy_from(&mut self, record: &BlockReplicaRecord, canonical_size: u64) {
        self.group = record.group.clone();
        self.is_complete = record.is_complete;
        self.is_custodial = record.is_custodial;
        self.size = record.size.unwrap_or(canonical_size);
        self.last_update = record.last_update;
    }

    pub fn to_record(&self, canonical_size: u64, attrs: bool) -> BlockReplicaRecord {
        if attrs {
            BlockReplicaRecord {
                block: Block::full_name(&self.dataset, &self.block),
                site: self.site.clone(),
                group: self.group.clone(),
                is_complete: self.is_complete,
                is_custodial: self.is_custodial,
                size: if self.size == canonical_size {
                    None
                } else {
                    Some(self.size)
                },
                last_update: self.last_update,
            }
        } else {
            BlockReplicaRecord::named(&self.dataset, &self.block, &self.site)
        }
    }

    /// Attribute view used for partition classification.
    pub fn context(&self) -> ReplicaContext<'_> {
        ReplicaContext {
            dataset: &self.dataset,
            group: self.group.as_deref(),
            is_custodial: self.is_custodial,
            is_complete: self.is_complete,
        }
    }
}

/// Unlinked (dataset, site) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetReplicaRecord {
    pub dataset: String,
    pub site: String,
}

/// Unlinked block replica; `block` is the owning block's full name and
/// `size: None` means "the block's canonical size".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReplicaRecord {
    pub block: String,
    pub site: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub is_complete: bool,
    pub is_custodial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub last_update: u64,
}

impl BlockReplicaRecord {
    /// Identity-only record.
    pub fn named(dataset: &str, block: &str, site: &str) -> Self {
        BlockReplicaRecord {
            block: Block::full_name(dataset, block),
            site: site.to_owned(),
            group: None,
            is_complete: false,
            is_custodial: false,
            size: None,
            last_update: 0,
        }
    }
}
