//! Datasets and software-version interning.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::block::Block;
use super::replica::DatasetReplica;
use crate::error::ObjectError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetStatus {
    Unknown,
    Production,
    Valid,
    Invalid,
    Deprecated,
    Deleted,
}

impl DatasetStatus {
    pub fn name(self) -> &'static str {
        match self {
            DatasetStatus::Unknown => "unknown",
            DatasetStatus::Production => "production",
            DatasetStatus::Valid => "valid",
            DatasetStatus::Invalid => "invalid",
            DatasetStatus::Deprecated => "deprecated",
            DatasetStatus::Deleted => "deleted",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "production" => DatasetStatus::Production,
            "valid" => DatasetStatus::Valid,
            "invalid" => DatasetStatus::Invalid,
            "deprecated" => DatasetStatus::Deprecated,
            "deleted" => DatasetStatus::Deleted,
            _ => DatasetStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Unknown,
    Data,
    Simulation,
    Test,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Unknown => "unknown",
            DataType::Data => "data",
            DataType::Simulation => "simulation",
            DataType::Test => "test",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "data" => DataType::Data,
            "simulation" => DataType::Simulation,
            "test" => DataType::Test,
            _ => DataType::Unknown,
        }
    }
}

/// Software release that produced a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftwareVersion {
    pub cycle: u32,
    pub major: u32,
    pub minor: u32,
    pub suffix: String,
}

/// Interning registry: at most one id per (cycle, major, minor, suffix).
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    by_id: HashMap<u32, SoftwareVersion>,
    by_value: HashMap<SoftwareVersion, u32>,
    next_id: u32,
}

impl Default for VersionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_value: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a version loaded from the store under its persisted id.
    pub fn insert_with_id(&mut self, id: u32, version: SoftwareVersion) {
        self.by_value.insert(version.clone(), id);
        self.by_id.insert(id, version);
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }

    /// Returns the id for a version, creating one if it is new.
    pub fn intern(&mut self, version: &SoftwareVersion) -> u32 {
        if let Some(id) = self.by_value.get(version) {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_value.insert(version.clone(), id);
        self.by_id.insert(id, version.clone());
        id
    }

    pub fn get(&self, id: u32) -> Option<&SoftwareVersion> {
        self.by_id.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &SoftwareVersion)> {
        self.by_id.iter().map(|(id, v)| (*id, v))
    }
}

/// A named data unit composed of blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Store-assigned numeric id (0 until persisted)
    pub id: u32,
    pub name: String,
    pub status: DatasetStatus,
    pub data_type: DataType,
    /// Interned software version id
    pub software_version: Option<u32>,
    /// Unix seconds
    pub last_update: u64,
    pub is_open: bool,
    /// Blocks in name order
    pub blocks: BTreeMap<String, Block>,
    /// Replicas keyed by site name
    pub replicas: HashMap<String, DatasetReplica>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Dataset {
            id: 0,
            name: name.into(),
            status: DatasetStatus::Unknown,
            data_type: DataType::Unknown,
            software_version: None,
            last_update: 0,
            is_open: false,
            blocks: BTreeMap::new(),
            replicas: HashMap::new(),
        }
    }

    /// Total size over all blocks.
    pub fn size(&self) -> u64 {
        self.blocks.values().map(|b| b.size).sum()
    }

    pub fn num_files(&self) -> u64 {
        self.blocks.values().map(|b| u64::from(b.num_files)).sum()
    }

    pub fn find_block(&self, name: &str) -> Option<&Block> {
        self.blocks.get(name)
    }

    pub fn find_replica(&self, site: &str) -> Option<&DatasetReplica> {
        self.replicas.get(site)
    }

    pub fn copy_from(
        &mut self,
        record: &DatasetRecord,
        versions: &mut VersionRegistry,
    ) -> Result<(), ObjectError> {
        if self.name != record.name {
            return Err(ObjectError::IdentityMismatch {
                this: format!("dataset {}", self.name),
                other: format!("dataset {}", record.name),
            });
        }
        self.status = record.status;
        self.data_type = record.data_type;
        self.software_version = record
            .software_version
            .as_ref()
            .map(|v| versions.intern(v));
        self.last_update = record.last_update;
        self.is_open = record.is_open;
        Ok(())
    }

    pub fn to_record(&self, attrs: bool, versions: &VersionRegistry) -> DatasetRecord {
        if attrs {
            DatasetRecord {
                name: self.name.clone(),
                status: self.status,
                data_type: self.data_type,
                software_version: self
                    .software_version
                    .and_then(|id| versions.get(id).cloned()),
                last_update: self.last_update,
                is_open: self.is_open,
            }
        } else {
            DatasetRecord::named(&self.name)
        }
    }
}

/// Unlinked dataset description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub name: String,
    pub status: DatasetStatus,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<SoftwareVersion>,
    pub last_update: u64,
    pub is_open: bool,
}

impl DatasetRecord {
    /// Identity-only record.
    pub fn named(name: &str) -> Self {
        DatasetRecord {
            name: name.to_owned(),
            status: DatasetStatus::Unknown,
            data_type: DataType::Unknown,
            software_version: None,
            last_update: 0,
            is_open: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_interning_is_idempotent() {
        let mut registry = VersionRegistry::new();
        let v = SoftwareVersion {
            cycle: 9,
            major: 4,
            minor: 0,
            suffix: "patch1".into(),
        };
        let id = registry.intern(&v);
        assert_eq!(registry.intern(&v), id);
        assert_eq!(registry.get(id), Some(&v));

        let other = SoftwareVersion {
            cycle: 10,
            major: 0,
            minor: 0,
            suffix: String::new(),
        };
        assert_ne!(registry.intern(&other), id);
    }
}
