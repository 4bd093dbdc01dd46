//! Storage sites and per-partition replica bookkeeping.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::condition::ReplicaContext;
use super::partition::Partition;
use crate::error::ObjectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Disk,
    Mss,
    Buffer,
    Unknown,
}

impl StorageType {
    pub fn name(self) -> &'static str {
        match self {
            StorageType::Disk => "disk",
            StorageType::Mss => "mss",
            StorageType::Buffer => "buffer",
            StorageType::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "disk" => StorageType::Disk,
            "mss" => StorageType::Mss,
            "buffer" => StorageType::Buffer,
            _ => StorageType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteStatus {
    Ready,
    Waitroom,
    Morgue,
    Unknown,
}

impl SiteStatus {
    pub fn name(self) -> &'static str {
        match self {
            SiteStatus::Ready => "ready",
            SiteStatus::Waitroom => "waitroom",
            SiteStatus::Morgue => "morgue",
            SiteStatus::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "ready" => SiteStatus::Ready,
            "waitroom" => SiteStatus::Waitroom,
            "morgue" => SiteStatus::Morgue,
            _ => SiteStatus::Unknown,
        }
    }
}

/// Quota and replica set of one site under one leaf partition.
///
/// Superpartitions have no stored `SitePartition`; their view is the union of
/// the subpartition sets and the sum of the subpartition quotas
/// (see [`Site::partition_replicas`] and [`Site::partition_quota`]).
#[derive(Debug, Clone, PartialEq)]
pub struct SitePartition {
    pub site: String,
    pub partition: String,
    /// Quota in bytes; negative means unlimited
    pub quota: i64,
    /// Block replicas classified into this partition, as (dataset, block)
    pub replicas: HashSet<(String, String)>,
}

impl SitePartition {
    pub fn new(site: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            partition: partition.into(),
            quota: 0,
            replicas: HashSet::new(),
        }
    }

    pub fn to_record(&self) -> SitePartitionRecord {
        SitePartitionRecord {
            site: self.site.clone(),
            partition: self.partition.clone(),
            quota: self.quota,
        }
    }
}

/// A storage endpoint holding replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    /// Store-assigned numeric id (0 until persisted)
    pub id: u32,
    pub name: String,
    pub host: String,
    pub storage_type: StorageType,
    pub backend: String,
    pub status: SiteStatus,
    /// One entry per leaf partition
    pub partitions: HashMap<String, SitePartition>,
}

impl Site {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Site {
            id: 0,
            name,
            host: String::new(),
            storage_type: StorageType::Unknown,
            backend: String::new(),
            status: SiteStatus::Unknown,
            partitions: HashMap::new(),
        }
    }

    pub fn copy_from(&mut self, record: &SiteRecord) -> Result<(), ObjectError> {
        if self.name != record.name {
            return Err(ObjectError::IdentityMismatch {
                this: format!("site {}", self.name),
                other: format!("site {}", record.name),
            });
        }
        self.host = record.host.clone();
        self.storage_type = record.storage_type;
        self.backend = record.backend.clone();
        self.status = record.status;
        Ok(())
    }

    pub fn to_record(&self, attrs: bool) -> SiteRecord {
        if attrs {
            SiteRecord {
                name: self.name.clone(),
                host: self.host.clone(),
                storage_type: self.storage_type,
                backend: self.backend.clone(),
                status: self.status,
            }
        } else {
            SiteRecord::named(&self.name)
        }
    }

    /// Registers a block replica in every leaf partition whose condition it
    /// satisfies.
    pub fn add_block_replica(
        &mut self,
        partitions: &HashMap<String, Partition>,
        dataset: &str,
        block: &str,
        ctx: &ReplicaContext<'_>,
    ) {
        for partition in partitions.values() {
            let Some(condition) = &partition.condition else {
                continue;
            };
            if condition.matches(ctx) {
                if let Some(sp) = self.partitions.get_mut(&partition.name) {
                    sp.replicas.insert((dataset.to_owned(), block.to_owned()));
                }
            }
        }
    }

    /// Drops a block replica from every partition set.
    pub fn remove_block_replica(&mut self, dataset: &str, block: &str) {
        let key = (dataset.to_owned(), block.to_owned());
        for sp in self.partitions.values_mut() {
            sp.replicas.remove(&key);
        }
    }

    /// Re-classifies a replica after an attribute change.
    pub fn update_partitioning(
        &mut self,
        partitions: &HashMap<String, Partition>,
        dataset: &str,
        block: &str,
        ctx: &ReplicaContext<'_>,
    ) {
        self.remove_block_replica(dataset, block);
        self.add_block_replica(partitions, dataset, block, ctx);
    }

    /// Replica set under a partition; unions subpartitions for a
    /// superpartition.
    pub fn partition_replicas(
        &self,
        partitions: &HashMap<String, Partition>,
        name: &str,
    ) -> Result<HashSet<(String, String)>, ObjectError> {
        let partition = partitions
            .get(name)
            .ok_or_else(|| ObjectError::UnknownPartition(name.to_owned()))?;

        match &partition.subpartitions {
            None => Ok(self
                .partitions
                .get(name)
                .map(|sp| sp.replicas.clone())
                .unwrap_or_default()),
            Some(children) => {
                let mut union = HashSet::new();
                for child in children {
                    if let Some(sp) = self.partitions.get(child) {
                        union.extend(sp.replicas.iter().cloned());
                    }
                }
                Ok(union)
            }
        }
    }

    /// Quota under a partition; sums subpartitions for a superpartition.
    /// Any negative contribution makes the whole quota unlimited.
    pub fn partition_quota(
        &self,
        partitions: &HashMap<String, Partition>,
        name: &str,
    ) -> Result<i64, ObjectError> {
        let partition = partitions
            .get(name)
            .ok_or_else(|| ObjectError::UnknownPartition(name.to_owned()))?;

        match &partition.subpartitions {
            None => Ok(self.partitions.get(name).map(|sp| sp.quota).unwrap_or(0)),
            Some(children) => {
                let mut total: i64 = 0;
                for child in children {
                    let quota = self.partitions.get(child).map(|sp| sp.quota).unwrap_or(0);
                    if quota < 0 {
                        return Ok(-1);
                    }
                    total += quota;
                }
                Ok(total)
            }
        }
    }
}

/// Unlinked site description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub name: String,
    pub host: String,
    pub storage_type: StorageType,
    pub backend: String,
    pub status: SiteStatus,
}

impl SiteRecord {
    /// Identity-only record.
    pub fn named(name: &str) -> Self {
        SiteRecord {
            name: name.to_owned(),
            host: String::new(),
            storage_type: StorageType::Unknown,
            backend: String::new(),
            status: SiteStatus::Unknown,
        }
    }
}

/// Unlinked (site, partition, quota) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitePartitionRecord {
    pub site: String,
    pub partition: String,
    /// Bytes; negative means unlimited
    pub quota: i64,
}
