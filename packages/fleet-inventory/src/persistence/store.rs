//! File-backed inventory store.
//!
//! One row file per table under the data directory, with the table set
//! `partitions, groups, sites, quotas, software_versions, datasets, blocks,
//! files, dataset_replicas, block_replicas, block_replica_sizes`. Incremental
//! upserts and deletes rewrite the touched tables through the shadow-file
//! rename; a full snapshot rebuilds every table and commits them in one pass.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use super::rows::*;
use super::table_file::TableFile;
use crate::config::PartitionDef;
use crate::dataformat::{
    Block, BlockReplica, DataType, Dataset, DatasetStatus, File, Group, OwnershipLevel,
    Partition, ReplicaCondition, Site, SitePartition, SitePartitionRecord, SiteStatus,
    SoftwareVersion, StorageType, VersionRegistry,
};
use crate::error::{InventoryError, ObjectError, StoreError};
use crate::glob::glob_match;

/// Fixed class order of the version hash.
const VERSION_TABLE_ORDER: [&str; 11] = [
    "block_replica_sizes",
    "block_replicas",
    "blocks",
    "dataset_replicas",
    "datasets",
    "files",
    "groups",
    "partitions",
    "quotas",
    "sites",
    "software_versions",
];

/// Include/exclude glob lists over entity names.
#[derive(Debug, Clone)]
pub struct NameFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl NameFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    pub fn matches(&self, name: &str) -> bool {
        let included = if self.include.is_empty() {
            true
        } else {
            self.include.iter().any(|pat| glob_match(pat, name))
        };
        included && !self.exclude.iter().any(|pat| glob_match(pat, name))
    }
}

/// Name constraints applied during a bulk load.
#[derive(Debug, Clone, Default)]
pub struct LoadFilters {
    pub groups: Option<NameFilter>,
    pub sites: Option<NameFilter>,
    pub datasets: Option<NameFilter>,
}

/// Inventory store over row files.
#[derive(Debug)]
pub struct FsInventoryStore {
    dir: PathBuf,
    read_only: bool,
    max_retries: u32,
    retry_delay_ms: u64,
    partitions: TableFile<PartitionRow>,
    groups: TableFile<GroupRow>,
    sites: TableFile<SiteRow>,
    quotas: TableFile<QuotaRow>,
    software_versions: TableFile<SoftwareVersionRow>,
    datasets: TableFile<DatasetRow>,
    blocks: TableFile<BlockRow>,
    files: TableFile<FileRow>,
    dataset_replicas: TableFile<DatasetReplicaRow>,
    block_replicas: TableFile<BlockReplicaRow>,
    block_replica_sizes: TableFile<BlockReplicaSizeRow>,
}

impl FsInventoryStore {
    /// Opens a writable store, creating the data directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_inner(dir.as_ref(), false)
    }

    /// Opens a handle that refuses every write operation.
    pub fn open_read_only(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_inner(dir.as_ref(), true)
    }

    fn open_inner(dir: &Path, read_only: bool) -> Result<Self, StoreError> {
        if !read_only {
            fs::create_dir_all(dir).map_err(|e| StoreError::Io {
                context: "creating data directory",
                source: e,
            })?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            read_only,
            max_retries: 3,
            retry_delay_ms: 100,
            partitions: TableFile::open(dir, "partitions")?,
            groups: TableFile::open(dir, "groups")?,
            sites: TableFile::open(dir, "sites")?,
            quotas: TableFile::open(dir, "quotas")?,
            software_versions: TableFile::open(dir, "software_versions")?,
            datasets: TableFile::open(dir, "datasets")?,
            blocks: TableFile::open(dir, "blocks")?,
            files: TableFile::open(dir, "files")?,
            dataset_replicas: TableFile::open(dir, "dataset_replicas")?,
            block_replicas: TableFile::open(dir, "block_replicas")?,
            block_replica_sizes: TableFile::open(dir, "block_replica_sizes")?,
        })
    }

    pub fn set_retry_policy(&mut self, max_retries: u32, retry_delay_ms: u64) {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Opens a fresh handle on the same directory (one connection per
    /// process; workers get read-only handles).
    pub fn new_handle(&self, read_only: bool) -> Result<Self, StoreError> {
        Self::open_inner(&self.dir, read_only)
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    // --- Id resolution -----------------------------------------------------

    pub fn partition_id(&self, name: &str) -> Option<u32> {
        self.partitions
            .iter()
            .find(|row| row.name == name)
            .map(|row| row.id)
    }

    pub fn group_id(&self, name: &str) -> Option<u32> {
        self.groups
            .iter()
            .find(|row| row.name == name)
            .map(|row| row.id)
    }

    pub fn group_name(&self, id: u32) -> Option<&str> {
        self.groups.get(&id).map(|row| row.name.as_str())
    }

    pub fn site_id(&self, name: &str) -> Option<u32> {
        self.sites
            .iter()
            .find(|row| row.name == name)
            .map(|row| row.id)
    }

    pub fn site_name(&self, id: u32) -> Option<&str> {
        self.sites.get(&id).map(|row| row.name.as_str())
    }

    pub fn dataset_id(&self, name: &str) -> Option<u32> {
        self.datasets
            .iter()
            .find(|row| row.name == name)
            .map(|row| row.id)
    }

    pub fn dataset_name(&self, id: u32) -> Option<&str> {
        self.datasets.get(&id).map(|row| row.name.as_str())
    }

    fn block_id(&self, dataset_id: u32, name: &str) -> Option<u32> {
        self.blocks
            .iter()
            .find(|row| row.dataset_id == dataset_id && row.name == name)
            .map(|row| row.id)
    }

    fn dataset_block_ids(&self, dataset_id: u32) -> HashSet<u32> {
        self.blocks
            .iter()
            .filter(|row| row.dataset_id == dataset_id)
            .map(|row| row.id)
            .collect()
    }

    // --- Bulk read ---------------------------------------------------------

    /// Builds the partition list from the table rows and the configured
    /// definitions. Definitions without a row are assigned an id (persisted
    /// when the handle is writable); rows without a definition are an error.
    pub fn get_partitions(
        &mut self,
        defs: &[PartitionDef],
    ) -> Result<Vec<Partition>, InventoryError> {
        let mut by_name: HashMap<&str, &PartitionDef> =
            defs.iter().map(|d| (d.name.as_str(), d)).collect();

        let mut partitions = Vec::with_capacity(defs.len());
        let mut new_rows = Vec::new();
        let mut next_id = self.partitions.max_key().map_or(1, |k| k + 1);

        for row in self.partitions.iter() {
            let def = by_name.remove(row.name.as_str()).ok_or_else(|| {
                ObjectError::InvalidPartition {
                    name: row.name.clone(),
                    reason: "no condition defined in configuration".to_owned(),
                }
            })?;
            partitions.push(Self::build_partition(def, row.id)?);
        }

        // definitions not yet in the table
        for def in defs {
            if !by_name.contains_key(def.name.as_str()) {
                continue;
            }
            partitions.push(Self::build_partition(def, next_id)?);
            new_rows.push(PartitionRow {
                id: next_id,
                name: def.name.clone(),
            });
            next_id += 1;
        }

        if !new_rows.is_empty() && !self.read_only {
            for row in new_rows {
                self.partitions.upsert(row);
            }
            self.partitions.flush(self.max_retries, self.retry_delay_ms)?;
        }

        // wire superpartition parents and validate depth
        let leaves: HashSet<String> = partitions
            .iter()
            .filter(|p| p.is_leaf())
            .map(|p| p.name.clone())
            .collect();
        let mut parents: HashMap<String, String> = HashMap::new();
        for partition in &partitions {
            if let Some(children) = &partition.subpartitions {
                for child in children {
                    if !leaves.contains(child) {
                        return Err(ObjectError::InvalidPartition {
                            name: partition.name.clone(),
                            reason: format!("subpartition '{}' is not a leaf partition", child),
                        }
                        .into());
                    }
                    parents.insert(child.clone(), partition.name.clone());
                }
            }
        }
        for partition in &mut partitions {
            partition.parent = parents.get(&partition.name).cloned();
        }

        Ok(partitions)
    }

    fn build_partition(def: &PartitionDef, id: u32) -> Result<Partition, InventoryError> {
        let condition = match (&def.condition, &def.subpartitions) {
            (Some(text), None) => Some(ReplicaCondition::parse(text)?),
            (None, Some(_)) => None,
            _ => {
                return Err(ObjectError::InvalidPartition {
                    name: def.name.clone(),
                    reason: "exactly one of condition / subpartitions required".to_owned(),
                }
                .into())
            }
        };
        Ok(Partition {
            id,
            name: def.name.clone(),
            condition,
            subpartitions: def.subpartitions.clone(),
            parent: None,
        })
    }

    pub fn yield_groups<'a>(
        &'a self,
        filter: Option<&'a NameFilter>,
    ) -> impl Iterator<Item = Group> + 'a {
        self.groups
            .iter()
            .filter(move |row| filter.map_or(true, |f| f.matches(&row.name)))
            .map(|row| Group {
                id: row.id,
                name: row.name.clone(),
                olevel: OwnershipLevel::from_name(&row.olevel).unwrap_or(OwnershipLevel::Block),
            })
    }

    pub fn yield_sites<'a>(
        &'a self,
        filter: Option<&'a NameFilter>,
    ) -> impl Iterator<Item = Site> + 'a {
        self.sites
            .iter()
            .filter(move |row| filter.map_or(true, |f| f.matches(&row.name)))
            .map(|row| {
                let mut site = Site::new(row.name.clone());
                site.id = row.id;
                site.host = row.host.clone();
                site.storage_type = StorageType::from_name(&row.storage_type);
                site.backend = row.backend.clone();
                site.status = SiteStatus::from_name(&row.status);
                site
            })
    }

    pub fn yield_sitepartitions(&self) -> impl Iterator<Item = SitePartitionRecord> + '_ {
        self.quotas.iter().filter_map(|row| {
            let site = self.site_name(row.site_id)?;
            let partition = self.partitions.get(&row.partition_id)?;
            Some(SitePartitionRecord {
                site: site.to_owned(),
                partition: partition.name.clone(),
                quota: row.storage,
            })
        })
    }

    pub fn yield_software_versions(&self) -> impl Iterator<Item = (u32, SoftwareVersion)> + '_ {
        self.software_versions.iter().map(|row| {
            (
                row.id,
                SoftwareVersion {
                    cycle: row.cycle,
                    major: row.major,
                    minor: row.minor,
                    suffix: row.suffix.clone(),
                },
            )
        })
    }

    pub fn yield_datasets<'a>(
        &'a self,
        filter: Option<&'a NameFilter>,
    ) -> impl Iterator<Item = Dataset> + 'a {
        self.datasets
            .iter()
            .filter(move |row| filter.map_or(true, |f| f.matches(&row.name)))
            .map(|row| {
                let mut dataset = Dataset::new(row.name.clone());
                dataset.id = row.id;
                dataset.status = DatasetStatus::from_name(&row.status);
                dataset.data_type = DataType::from_name(&row.data_type);
                dataset.software_version = if row.software_version_id == 0 {
                    None
                } else {
                    Some(row.software_version_id)
                };
                dataset.last_update = row.last_update;
                dataset.is_open = row.is_open;
                dataset
            })
    }

    /// Yields `(dataset_id, block)` pairs, optionally constrained to a
    /// dataset-id set (the in-memory form of a load-time side table).
    pub fn yield_blocks<'a>(
        &'a self,
        dataset_ids: Option<&'a HashSet<u32>>,
    ) -> impl Iterator<Item = (u32, Block)> + 'a {
        self.blocks
            .iter()
            .filter(move |row| dataset_ids.map_or(true, |ids| ids.contains(&row.dataset_id)))
            .map(|row| {
                let mut block = Block::new(row.name.clone());
                block.id = row.id;
                block.size = row.size;
                block.num_files = row.num_files;
                block.is_open = row.is_open;
                block.last_update = row.last_update;
                (row.dataset_id, block)
            })
    }

    /// Yields `(block_id, file)` pairs.
    pub fn yield_files<'a>(
        &'a self,
        block_ids: Option<&'a HashSet<u32>>,
    ) -> impl Iterator<Item = (u32, File)> + 'a {
        self.files
            .iter()
            .filter(move |row| block_ids.map_or(true, |ids| ids.contains(&row.block_id)))
            .map(|row| {
                (
                    row.block_id,
                    File {
                        id: row.id,
                        lfn: row.name.clone(),
                        size: row.size,
                    },
                )
            })
    }

    pub fn dataset_replica_rows(&self) -> impl Iterator<Item = &DatasetReplicaRow> {
        self.dataset_replicas.iter()
    }

    pub fn block_replica_row(&self, block_id: u32, site_id: u32) -> Option<&BlockReplicaRow> {
        self.block_replicas.get(&(block_id, site_id))
    }

    pub fn block_replica_size(&self, block_id: u32, site_id: u32) -> Option<u64> {
        self.block_replica_sizes
            .get(&(block_id, site_id))
            .map(|row| row.size)
    }

    // --- Per-entity upsert -------------------------------------------------

    pub fn save_partition(&mut self, partition: &mut Partition) -> Result<(), StoreError> {
        self.ensure_writable()?;
        if partition.id == 0 {
            partition.id = match self.partition_id(&partition.name) {
                Some(id) => id,
                None => self.partitions.max_key().map_or(1, |k| k + 1),
            };
        }
        self.partitions.upsert(PartitionRow {
            id: partition.id,
            name: partition.name.clone(),
        });
        self.partitions.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn save_group(&mut self, group: &mut Group) -> Result<(), StoreError> {
        self.ensure_writable()?;
        if group.id == 0 {
            group.id = match self.group_id(&group.name) {
                Some(id) => id,
                None => self.groups.max_key().map_or(1, |k| k + 1),
            };
        }
        self.groups.upsert(GroupRow {
            id: group.id,
            name: group.name.clone(),
            olevel: group.olevel.name().to_owned(),
        });
        self.groups.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn save_site(&mut self, site: &mut Site) -> Result<(), StoreError> {
        self.ensure_writable()?;
        if site.id == 0 {
            site.id = match self.site_id(&site.name) {
                Some(id) => id,
                None => self.sites.max_key().map_or(1, |k| k + 1),
            };
        }
        self.sites.upsert(SiteRow {
            id: site.id,
            name: site.name.clone(),
            host: site.host.clone(),
            storage_type: site.storage_type.name().to_owned(),
            backend: site.backend.clone(),
            status: site.status.name().to_owned(),
        });
        self.sites.flush(self.max_retries, self.retry_delay_ms)
    }

    /// Saves a leaf site-partition quota. Unsaved site or partition rows make
    /// this a no-op, as does a superpartition (only leaf quotas persist).
    pub fn save_sitepartition(&mut self, sp: &SitePartition) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let (Some(site_id), Some(partition_id)) =
            (self.site_id(&sp.site), self.partition_id(&sp.partition))
        else {
            return Ok(());
        };
        self.quotas.upsert(QuotaRow {
            site_id,
            partition_id,
            storage: sp.quota,
        });
        self.quotas.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn save_dataset(
        &mut self,
        dataset: &mut Dataset,
        versions: &VersionRegistry,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;

        let mut versions_dirty = false;
        if let Some(version_id) = dataset.software_version {
            if self.software_versions.get(&version_id).is_none() {
                if let Some(version) = versions.get(version_id) {
                    self.software_versions.upsert(SoftwareVersionRow {
                        id: version_id,
                        cycle: version.cycle,
                        major: version.major,
                        minor: version.minor,
                        suffix: version.suffix.clone(),
                    });
                    versions_dirty = true;
                }
            }
        }
        if versions_dirty {
            self.software_versions
                .flush(self.max_retries, self.retry_delay_ms)?;
        }

        if dataset.id == 0 {
            dataset.id = match self.dataset_id(&dataset.name) {
                Some(id) => id,
                None => self.datasets.max_key().map_or(1, |k| k + 1),
            };
        }
        self.datasets.upsert(DatasetRow {
            id: dataset.id,
            name: dataset.name.clone(),
            status: dataset.status.name().to_owned(),
            data_type: dataset.data_type.name().to_owned(),
            software_version_id: dataset.software_version.unwrap_or(0),
            last_update: dataset.last_update,
            is_open: dataset.is_open,
        });
        self.datasets.flush(self.max_retries, self.retry_delay_ms)
    }

    /// No-op when the owning dataset has no row yet.
    pub fn save_block(&mut self, dataset_name: &str, block: &mut Block) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(dataset_id) = self.dataset_id(dataset_name) else {
            return Ok(());
        };
        if block.id == 0 {
            block.id = match self.block_id(dataset_id, &block.name) {
                Some(id) => id,
                None => self.blocks.max_key().map_or(1, |k| k + 1),
            };
        }
        self.blocks.upsert(BlockRow {
            id: block.id,
            dataset_id,
            name: block.name.clone(),
            size: block.size,
            num_files: block.num_files,
            is_open: block.is_open,
            last_update: block.last_update,
        });
        self.blocks.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn save_file(
        &mut self,
        dataset_name: &str,
        block_name: &str,
        file: &mut File,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(dataset_id) = self.dataset_id(dataset_name) else {
            return Ok(());
        };
        let Some(block_id) = self.block_id(dataset_id, block_name) else {
            return Ok(());
        };
        if file.id == 0 {
            file.id = match self
                .files
                .iter()
                .find(|row| row.name == file.lfn)
                .map(|row| row.id)
            {
                Some(id) => id,
                None => self.files.max_key().map_or(1, |k| k + 1),
            };
        }
        self.files.upsert(FileRow {
            id: file.id,
            block_id,
            size: file.size,
            name: file.lfn.clone(),
        });
        self.files.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn save_datasetreplica(
        &mut self,
        dataset_name: &str,
        site_name: &str,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let (Some(dataset_id), Some(site_id)) =
            (self.dataset_id(dataset_name), self.site_id(site_name))
        else {
            return Ok(());
        };
        self.dataset_replicas.upsert(DatasetReplicaRow {
            dataset_id,
            site_id,
        });
        self.dataset_replicas
            .flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn save_blockreplica(
        &mut self,
        replica: &BlockReplica,
        canonical_size: u64,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(dataset_id) = self.dataset_id(&replica.dataset) else {
            return Ok(());
        };
        let Some(block_id) = self.block_id(dataset_id, &replica.block) else {
            return Ok(());
        };
        let Some(site_id) = self.site_id(&replica.site) else {
            return Ok(());
        };
        let group_id = match &replica.group {
            None => 0,
            Some(name) => self.group_id(name).unwrap_or_else(|| {
                tracing::warn!("Group {} has no row; saving replica as unowned", name);
                0
            }),
        };

        self.block_replicas.upsert(BlockReplicaRow {
            block_id,
            site_id,
            group_id,
            is_complete: replica.is_complete,
            is_custodial: replica.is_custodial,
            last_update: replica.last_update,
        });
        self.block_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;

        if replica.size != canonical_size {
            self.block_replica_sizes.upsert(BlockReplicaSizeRow {
                block_id,
                site_id,
                size: replica.size,
            });
        } else {
            self.block_replica_sizes.remove(&(block_id, site_id));
        }
        self.block_replica_sizes
            .flush(self.max_retries, self.retry_delay_ms)
    }

    // --- Per-entity delete -------------------------------------------------

    pub fn delete_partition(&mut self, name: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(id) = self.partition_id(name) else {
            return Ok(());
        };
        self.partitions.remove(&id);
        self.quotas.retain(|_, row| row.partition_id != id);
        self.partitions
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.quotas.flush(self.max_retries, self.retry_delay_ms)
    }

    /// Deleting a group disowns every replica it held.
    pub fn delete_group(&mut self, name: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(id) = self.group_id(name) else {
            return Ok(());
        };
        self.groups.remove(&id);

        let mut rewritten = Vec::new();
        for row in self.block_replicas.iter() {
            if row.group_id == id {
                let mut row = row.clone();
                row.group_id = 0;
                rewritten.push(row);
            }
        }
        for row in rewritten {
            self.block_replicas.upsert(row);
        }

        self.groups.flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replicas
            .flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn delete_site(&mut self, name: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(id) = self.site_id(name) else {
            return Ok(());
        };
        self.sites.remove(&id);
        self.dataset_replicas.retain(|_, row| row.site_id != id);
        self.block_replicas.retain(|_, row| row.site_id != id);
        self.block_replica_sizes.retain(|_, row| row.site_id != id);
        self.quotas.retain(|_, row| row.site_id != id);

        self.sites.flush(self.max_retries, self.retry_delay_ms)?;
        self.dataset_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replica_sizes
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.quotas.flush(self.max_retries, self.retry_delay_ms)
    }

    /// Cascades over blocks, files, dataset replicas, block replicas and
    /// their size rows.
    pub fn delete_dataset(&mut self, name: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(id) = self.dataset_id(name) else {
            return Ok(());
        };
        let block_ids = self.dataset_block_ids(id);

        self.datasets.remove(&id);
        self.blocks.retain(|_, row| row.dataset_id != id);
        self.files.retain(|_, row| !block_ids.contains(&row.block_id));
        self.dataset_replicas.retain(|_, row| row.dataset_id != id);
        self.block_replicas
            .retain(|_, row| !block_ids.contains(&row.block_id));
        self.block_replica_sizes
            .retain(|_, row| !block_ids.contains(&row.block_id));

        self.datasets.flush(self.max_retries, self.retry_delay_ms)?;
        self.blocks.flush(self.max_retries, self.retry_delay_ms)?;
        self.files.flush(self.max_retries, self.retry_delay_ms)?;
        self.dataset_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replica_sizes
            .flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn delete_block(&mut self, dataset_name: &str, block_name: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(dataset_id) = self.dataset_id(dataset_name) else {
            return Ok(());
        };
        let Some(block_id) = self.block_id(dataset_id, block_name) else {
            return Ok(());
        };

        self.blocks.remove(&block_id);
        self.files.retain(|_, row| row.block_id != block_id);
        self.block_replicas.retain(|_, row| row.block_id != block_id);
        self.block_replica_sizes
            .retain(|_, row| row.block_id != block_id);

        self.blocks.flush(self.max_retries, self.retry_delay_ms)?;
        self.files.flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replica_sizes
            .flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn delete_file(&mut self, lfn: &str) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(id) = self
            .files
            .iter()
            .find(|row| row.name == lfn)
            .map(|row| row.id)
        else {
            return Ok(());
        };
        self.files.remove(&id);
        self.files.flush(self.max_retries, self.retry_delay_ms)
    }

    pub fn delete_datasetreplica(
        &mut self,
        dataset_name: &str,
        site_name: &str,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let (Some(dataset_id), Some(site_id)) =
            (self.dataset_id(dataset_name), self.site_id(site_name))
        else {
            return Ok(());
        };
        let block_ids = self.dataset_block_ids(dataset_id);

        self.block_replicas
            .retain(|_, row| !(row.site_id == site_id && block_ids.contains(&row.block_id)));
        self.block_replica_sizes
            .retain(|_, row| !(row.site_id == site_id && block_ids.contains(&row.block_id)));
        self.dataset_replicas.remove(&(dataset_id, site_id));

        self.block_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replica_sizes
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.dataset_replicas
            .flush(self.max_retries, self.retry_delay_ms)
    }

    /// Removing the last block replica of a dataset at a site also drops the
    /// dataset replica row.
    pub fn delete_blockreplica(
        &mut self,
        dataset_name: &str,
        block_name: &str,
        site_name: &str,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let Some(dataset_id) = self.dataset_id(dataset_name) else {
            return Ok(());
        };
        let Some(block_id) = self.block_id(dataset_id, block_name) else {
            return Ok(());
        };
        let Some(site_id) = self.site_id(site_name) else {
            return Ok(());
        };

        self.block_replicas.remove(&(block_id, site_id));
        self.block_replica_sizes.remove(&(block_id, site_id));

        let block_ids = self.dataset_block_ids(dataset_id);
        let any_left = self
            .block_replicas
            .iter()
            .any(|row| row.site_id == site_id && block_ids.contains(&row.block_id));
        if !any_left {
            self.dataset_replicas.remove(&(dataset_id, site_id));
        }

        self.block_replicas
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.block_replica_sizes
            .flush(self.max_retries, self.retry_delay_ms)?;
        self.dataset_replicas
            .flush(self.max_retries, self.retry_delay_ms)
    }

    // --- Snapshot, clone, version ------------------------------------------

    /// Rebuilds every table from the object graph and commits the snapshot.
    /// Entities without an id get one assigned.
    pub fn save_all(
        &mut self,
        partitions: &mut HashMap<String, Partition>,
        groups: &mut HashMap<String, Group>,
        sites: &mut HashMap<String, Site>,
        datasets: &mut HashMap<String, Dataset>,
        versions: &VersionRegistry,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;

        let next = |max: &mut u32| {
            *max += 1;
            *max
        };

        let mut partition_rows = Vec::new();
        {
            let mut max = partitions.values().map(|p| p.id).max().unwrap_or(0);
            let mut names: Vec<String> = partitions.keys().cloned().collect();
            names.sort();
            for name in names {
                let partition = partitions.get_mut(&name).expect("partition present");
                if partition.id == 0 {
                    partition.id = next(&mut max);
                }
                partition_rows.push(PartitionRow {
                    id: partition.id,
                    name: partition.name.clone(),
                });
            }
        }

        let mut group_rows = Vec::new();
        {
            let mut max = groups.values().map(|g| g.id).max().unwrap_or(0);
            let mut names: Vec<String> = groups.keys().cloned().collect();
            names.sort();
            for name in names {
                let group = groups.get_mut(&name).expect("group present");
                if group.id == 0 {
                    group.id = next(&mut max);
                }
                group_rows.push(GroupRow {
                    id: group.id,
                    name: group.name.clone(),
                    olevel: group.olevel.name().to_owned(),
                });
            }
        }

        let mut site_rows = Vec::new();
        let mut quota_rows = Vec::new();
        {
            let mut max = sites.values().map(|s| s.id).max().unwrap_or(0);
            let mut names: Vec<String> = sites.keys().cloned().collect();
            names.sort();
            for name in names {
                let site = sites.get_mut(&name).expect("site present");
                if site.id == 0 {
                    site.id = next(&mut max);
                }
                site_rows.push(SiteRow {
                    id: site.id,
                    name: site.name.clone(),
                    host: site.host.clone(),
                    storage_type: site.storage_type.name().to_owned(),
                    backend: site.backend.clone(),
                    status: site.status.name().to_owned(),
                });
                for sp in site.partitions.values() {
                    if let Some(partition_id) = partitions.get(&sp.partition).map(|p| p.id) {
                        quota_rows.push(QuotaRow {
                            site_id: site.id,
                            partition_id,
                            storage: sp.quota,
                        });
                    }
                }
            }
        }

        let version_rows: Vec<SoftwareVersionRow> = versions
            .iter()
            .map(|(id, v)| SoftwareVersionRow {
                id,
                cycle: v.cycle,
                major: v.major,
                minor: v.minor,
                suffix: v.suffix.clone(),
            })
            .collect();

        let mut dataset_rows = Vec::new();
        let mut block_rows = Vec::new();
        let mut file_rows = Vec::new();
        let mut dr_rows = Vec::new();
        let mut br_rows = Vec::new();
        let mut brs_rows = Vec::new();
        {
            let mut max_dataset = datasets.values().map(|d| d.id).max().unwrap_or(0);
            let mut max_block = datasets
                .values()
                .flat_map(|d| d.blocks.values())
                .map(|b| b.id)
                .max()
                .unwrap_or(0);
            let mut max_file = datasets
                .values()
                .flat_map(|d| d.blocks.values())
                .flat_map(|b| b.files.values())
                .map(|f| f.id)
                .max()
                .unwrap_or(0);

            let mut names: Vec<String> = datasets.keys().cloned().collect();
            names.sort();
            for name in names {
                let dataset = datasets.get_mut(&name).expect("dataset present");
                if dataset.id == 0 {
                    dataset.id = next(&mut max_dataset);
                }
                dataset_rows.push(DatasetRow {
                    id: dataset.id,
                    name: dataset.name.clone(),
                    status: dataset.status.name().to_owned(),
                    data_type: dataset.data_type.name().to_owned(),
                    software_version_id: dataset.software_version.unwrap_or(0),
                    last_update: dataset.last_update,
                    is_open: dataset.is_open,
                });

                let dataset_id = dataset.id;
                let mut block_ids: HashMap<String, u32> = HashMap::new();
                for block in dataset.blocks.values_mut() {
                    if block.id == 0 {
                        block.id = next(&mut max_block);
                    }
                    block_ids.insert(block.name.clone(), block.id);
                    block_rows.push(BlockRow {
                        id: block.id,
                        dataset_id,
                        name: block.name.clone(),
                        size: block.size,
                        num_files: block.num_files,
                        is_open: block.is_open,
                        last_update: block.last_update,
                    });
                    for file in block.files.values_mut() {
                        if file.id == 0 {
                            file.id = next(&mut max_file);
                        }
                        file_rows.push(FileRow {
                            id: file.id,
                            block_id: block.id,
                            size: file.size,
                            name: file.lfn.clone(),
                        });
                    }
                }

                let canonical: HashMap<u32, u64> = dataset
                    .blocks
                    .values()
                    .map(|b| (b.id, b.size))
                    .collect();

                for replica in dataset.replicas.values() {
                    let Some(site) = sites.get(&replica.site) else {
                        continue;
                    };
                    dr_rows.push(DatasetReplicaRow {
                        dataset_id,
                        site_id: site.id,
                    });
                    for br in replica.block_replicas.values() {
                        let Some(&block_id) = block_ids.get(&br.block) else {
                            continue;
                        };
                        let group_id = br
                            .group
                            .as_ref()
                            .and_then(|g| groups.get(g))
                            .map_or(0, |g| g.id);
                        br_rows.push(BlockReplicaRow {
                            block_id,
                            site_id: site.id,
                            group_id,
                            is_complete: br.is_complete,
                            is_custodial: br.is_custodial,
                            last_update: br.last_update,
                        });
                        if canonical.get(&block_id) != Some(&br.size) {
                            brs_rows.push(BlockReplicaSizeRow {
                                block_id,
                                site_id: site.id,
                                size: br.size,
                            });
                        }
                    }
                }
            }
        }

        self.partitions.replace_all(partition_rows);
        self.groups.replace_all(group_rows);
        self.sites.replace_all(site_rows);
        self.quotas.replace_all(quota_rows);
        self.software_versions.replace_all(version_rows);
        self.datasets.replace_all(dataset_rows);
        self.blocks.replace_all(block_rows);
        self.files.replace_all(file_rows);
        self.dataset_replicas.replace_all(dr_rows);
        self.block_replicas.replace_all(br_rows);
        self.block_replica_sizes.replace_all(brs_rows);

        self.commit_snapshot()
    }

    /// Flushes every table through the shadow-file rename.
    pub fn commit_snapshot(&mut self) -> Result<(), StoreError> {
        self.ensure_writable()?;
        for name in VERSION_TABLE_ORDER {
            self.flush_table(name)?;
        }
        Ok(())
    }

    fn flush_table(&self, name: &str) -> Result<(), StoreError> {
        let (r, d) = (self.max_retries, self.retry_delay_ms);
        match name {
            "partitions" => self.partitions.flush(r, d),
            "groups" => self.groups.flush(r, d),
            "sites" => self.sites.flush(r, d),
            "quotas" => self.quotas.flush(r, d),
            "software_versions" => self.software_versions.flush(r, d),
            "datasets" => self.datasets.flush(r, d),
            "blocks" => self.blocks.flush(r, d),
            "files" => self.files.flush(r, d),
            "dataset_replicas" => self.dataset_replicas.flush(r, d),
            "block_replicas" => self.block_replicas.flush(r, d),
            "block_replica_sizes" => self.block_replica_sizes.flush(r, d),
            other => unreachable!("unknown table {}", other),
        }
    }

    fn table_checksum(&self, name: &str) -> u32 {
        match name {
            "partitions" => self.partitions.checksum(),
            "groups" => self.groups.checksum(),
            "sites" => self.sites.checksum(),
            "quotas" => self.quotas.checksum(),
            "software_versions" => self.software_versions.checksum(),
            "datasets" => self.datasets.checksum(),
            "blocks" => self.blocks.checksum(),
            "files" => self.files.checksum(),
            "dataset_replicas" => self.dataset_replicas.checksum(),
            "block_replicas" => self.block_replicas.checksum(),
            "block_replica_sizes" => self.block_replica_sizes.checksum(),
            other => unreachable!("unknown table {}", other),
        }
    }

    /// Copies every table row-for-row from another store.
    pub fn clone_from(&mut self, other: &FsInventoryStore) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.partitions.replace_all(other.partitions.iter().cloned());
        self.groups.replace_all(other.groups.iter().cloned());
        self.sites.replace_all(other.sites.iter().cloned());
        self.quotas.replace_all(other.quotas.iter().cloned());
        self.software_versions
            .replace_all(other.software_versions.iter().cloned());
        self.datasets.replace_all(other.datasets.iter().cloned());
        self.blocks.replace_all(other.blocks.iter().cloned());
        self.files.replace_all(other.files.iter().cloned());
        self.dataset_replicas
            .replace_all(other.dataset_replicas.iter().cloned());
        self.block_replicas
            .replace_all(other.block_replicas.iter().cloned());
        self.block_replica_sizes
            .replace_all(other.block_replica_sizes.iter().cloned());
        self.commit_snapshot()
    }

    /// Content hash of the full persisted state: md5 over the concatenated
    /// per-table checksums, each rendered as 8 lowercase hex characters, in
    /// the fixed class order.
    pub fn version(&self) -> String {
        let mut concatenated = String::with_capacity(VERSION_TABLE_ORDER.len() * 8);
        for name in VERSION_TABLE_ORDER {
            concatenated.push_str(&format!("{:08x}", self.table_checksum(name)));
        }
        let mut hasher = Md5::new();
        hasher.update(concatenated.as_bytes());
        hex::encode(hasher.finalize())
    }
}
