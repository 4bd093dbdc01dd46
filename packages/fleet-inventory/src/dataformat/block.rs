//! Blocks and their files.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ObjectError;

/// A unit of replication inside a dataset. Identity is `(dataset, name)`;
/// the wire form of the identity is the full name `dataset#block`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Store-assigned numeric id (0 until persisted)
    pub id: u32,
    pub name: String,
    pub size: u64,
    pub num_files: u32,
    pub is_open: bool,
    /// Unix seconds
    pub last_update: u64,
    /// Files keyed by logical file name
    pub files: BTreeMap<String, File>,
    /// Sites currently holding a replica of this block
    pub replica_sites: BTreeSet<String>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Block {
            id: 0,
            name: name.into(),
            size: 0,
            num_files: 0,
            is_open: false,
            last_update: 0,
            files: BTreeMap::new(),
            replica_sites: BTreeSet::new(),
        }
    }

    pub fn full_name(dataset: &str, block: &str) -> String {
        format!("{}#{}", dataset, block)
    }

    /// Splits `dataset#block` into its components.
    pub fn from_full_name(full: &str) -> Result<(&str, &str), ObjectError> {
        match full.split_once('#') {
            Some((dataset, block)) if !dataset.is_empty() && !block.is_empty() => {
                Ok((dataset, block))
            }
            _ => Err(ObjectError::InvalidBlockName(full.to_owned())),
        }
    }

    pub fn copy_from(&mut self, record: &BlockRecord) -> Result<(), ObjectError> {
        if self.name != record.name {
            return Err(ObjectError::IdentityMismatch {
                this: format!("block {}", self.name),
                other: format!("block {}", record.name),
            });
        }
        self.size = record.size;
        self.num_files = record.num_files;
        self.is_open = record.is_open;
        self.last_update = record.last_update;
        Ok(())
    }

    pub fn to_record(&self, dataset: &str, attrs: bool) -> BlockRecord {
        if attrs {
            BlockRecord {
                dataset: dataset.to_owned(),
                name: self.name.clone(),
                size: self.size,
                num_files: self.num_files,
                is_open: self.is_open,
                last_update: self.last_update,
            }
        } else {
            BlockRecord::named(dataset, &self.name)
        }
    }
}

/// A single file inside a block.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    /// Store-assigned numeric id (0 until persisted)
    pub id: u32,
    /// Logical file name, globally unique
    pub lfn: String,
    pub size: u64,
}

impl File {
    pub fn to_record(&self, dataset: &str, block: &str) -> FileRecord {
        FileRecord {
            block: Block::full_name(dataset, block),
            lfn: self.lfn.clone(),
            size: self.size,
        }
    }
}

/// Unlinked block description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub dataset: String,
    pub name: String,
    pub size: u64,
    pub num_files: u32,
    pub is_open: bool,
    pub last_update: u64,
}

impl BlockRecord {
    /// Identity-only record.
    pub fn named(dataset: &str, name: &str) -> Self {
        BlockRecord {
            dataset: dataset.to_owned(),
            name: name.to_owned(),
            size: 0,
            num_files: 0,
            is_open: false,
            last_update: 0,
        }
    }

    pub fn full_name(&self) -> String {
        Block::full_name(&self.dataset, &self.name)
    }
}

/// Unlinked file description; `block` is the owning block's full name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub block: String,
    pub lfn: String,
    pub size: u64,
}
