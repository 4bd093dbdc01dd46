//! The inventory container: single source of truth for the entity graph.
//!
//! `embed` and `unlink` (reached through [`Inventory::update`] and
//! [`Inventory::delete`]) are the only mutation entry points into the graph.
//! They are not safe for concurrent use; the daemon main loop serializes them
//! under the master write lock. Worker processes only ever see an
//! [`InventoryProxy`].

use std::collections::{HashMap, HashSet};
use std::ops::Deref;

use crate::config::PartitionDef;
use crate::dataformat::{
    Block, BlockReplica, Dataset, DatasetReplica, Entity, File, Group, Partition,
    ReplicaContext, Site, SitePartition, VersionRegistry,
};
use crate::error::{InventoryError, ObjectError};
use crate::persistence::{FsInventoryStore, LoadFilters};

/// The in-memory object graph plus its optional persistent store.
#[derive(Debug, Default)]
pub struct Inventory {
    pub partitions: HashMap<String, Partition>,
    pub groups: HashMap<String, Group>,
    pub sites: HashMap<String, Site>,
    pub datasets: HashMap<String, Dataset>,
    pub versions: VersionRegistry,
    store: Option<FsInventoryStore>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_store(&mut self, store: FsInventoryStore) {
        self.store = Some(store);
    }

    pub fn store(&self) -> Option<&FsInventoryStore> {
        self.store.as_ref()
    }

    /// Content hash of the persisted state.
    pub fn version(&self) -> Result<String, InventoryError> {
        Ok(self.store.as_ref().ok_or(InventoryError::NoStore)?.version())
    }

    // --- Bulk load ---------------------------------------------------------

    /// Populates the graph from the store in dependency order, rebuilding
    /// every back-reference.
    pub fn load(
        &mut self,
        defs: &[PartitionDef],
        filters: &LoadFilters,
    ) -> Result<(), InventoryError> {
        self.partitions.clear();
        self.groups.clear();
        self.sites.clear();
        self.datasets.clear();
        self.versions = VersionRegistry::new();

        let store = self.store.as_mut().ok_or(InventoryError::NoStore)?;

        for partition in store.get_partitions(defs)? {
            self.partitions.insert(partition.name.clone(), partition);
        }

        let store = self.store.as_ref().expect("store attached");

        for group in store.yield_groups(filters.groups.as_ref()) {
            self.groups.insert(group.name.clone(), group);
        }
        tracing::info!("Loaded {} groups", self.groups.len());

        for mut site in store.yield_sites(filters.sites.as_ref()) {
            for partition in self.partitions.values().filter(|p| p.is_leaf()) {
                site.partitions.insert(
                    partition.name.clone(),
                    SitePartition::new(site.name.clone(), partition.name.clone()),
                );
            }
            self.sites.insert(site.name.clone(), site);
        }
        for record in store.yield_sitepartitions() {
            if let Some(site) = self.sites.get_mut(&record.site) {
                if let Some(sp) = site.partitions.get_mut(&record.partition) {
                    sp.quota = record.quota;
                }
            }
        }
        tracing::info!("Loaded {} sites", self.sites.len());

        for (id, version) in store.yield_software_versions() {
            self.versions.insert_with_id(id, version);
        }

        for dataset in store.yield_datasets(filters.datasets.as_ref()) {
            self.datasets.insert(dataset.name.clone(), dataset);
        }
        tracing::info!("Loaded {} datasets", self.datasets.len());

        let dataset_names: HashMap<u32, String> = self
            .datasets
            .values()
            .map(|d| (d.id, d.name.clone()))
            .collect();
        let dataset_ids: HashSet<u32> = dataset_names.keys().copied().collect();
        let constraint = filters.datasets.as_ref().map(|_| &dataset_ids);

        let mut num_blocks = 0usize;
        let mut block_names: HashMap<u32, (String, String)> = HashMap::new();
        for (dataset_id, block) in store.yield_blocks(constraint) {
            let Some(name) = dataset_names.get(&dataset_id) else {
                continue;
            };
            block_names.insert(block.id, (name.clone(), block.name.clone()));
            let dataset = self.datasets.get_mut(name).expect("dataset loaded");
            dataset.blocks.insert(block.name.clone(), block);
            num_blocks += 1;
        }
        tracing::info!("Loaded {} blocks", num_blocks);

        for (block_id, file) in store.yield_files(None) {
            let Some((dataset_name, block_name)) = block_names.get(&block_id) else {
                continue;
            };
            let dataset = self.datasets.get_mut(dataset_name).expect("dataset loaded");
            let block = dataset.blocks.get_mut(block_name).expect("block loaded");
            block.files.insert(file.lfn.clone(), file);
        }

        let mut num_dataset_replicas = 0usize;
        let mut num_block_replicas = 0usize;
        let replica_rows: Vec<_> = store.dataset_replica_rows().cloned().collect();
        for row in replica_rows {
            let Some(dataset_name) = dataset_names.get(&row.dataset_id).cloned() else {
                continue;
            };
            let Some(site_name) = store.site_name(row.site_id).map(str::to_owned) else {
                continue;
            };
            if !self.sites.contains_key(&site_name) {
                continue;
            }

            let dataset = self
                .datasets
                .get_mut(&dataset_name)
                .expect("dataset loaded");
            let mut replica = DatasetReplica::new(dataset_name.clone(), site_name.clone());
            for block in dataset.blocks.values() {
                let Some(br_row) = store.block_replica_row(block.id, row.site_id) else {
                    continue;
                };
                let group = if br_row.group_id == 0 {
                    None
                } else {
                    store.group_name(br_row.group_id).map(str::to_owned)
                };
                let size = store
                    .block_replica_size(block.id, row.site_id)
                    .unwrap_or(block.size);
                replica.block_replicas.insert(
                    block.name.clone(),
                    BlockReplica {
                        dataset: dataset_name.clone(),
                        block: block.name.clone(),
                        site: site_name.clone(),
                        group,
                        is_complete: br_row.is_complete,
                        is_custodial: br_row.is_custodial,
                        size,
                        last_update: br_row.last_update,
                    },
                );
            }

            // a dataset replica exists only with at least one block replica
            if replica.block_replicas.is_empty() {
                continue;
            }

            let mut classifications = Vec::with_capacity(replica.block_replicas.len());
            for br in replica.block_replicas.values() {
                classifications.push((
                    br.block.clone(),
                    br.group.clone(),
                    br.is_custodial,
                    br.is_complete,
                ));
            }
            for (block_name, ..) in &classifications {
                dataset
                    .blocks
                    .get_mut(block_name)
                    .expect("block loaded")
                    .replica_sites
                    .insert(site_name.clone());
            }
            num_block_replicas += replica.block_replicas.len();
            num_dataset_replicas += 1;
            dataset.replicas.insert(site_name.clone(), replica);

            let site = self.sites.get_mut(&site_name).expect("site loaded");
            for (block_name, group, is_custodial, is_complete) in &classifications {
                site.add_block_replica(
                    &self.partitions,
                    &dataset_name,
                    block_name,
                    &ReplicaContext {
                        dataset: &dataset_name,
                        group: group.as_deref(),
                        is_custodial: *is_custodial,
                        is_complete: *is_complete,
                    },
                );
            }
        }
        tracing::info!(
            "Loaded {} dataset replicas and {} block replicas",
            num_dataset_replicas,
            num_block_replicas
        );

        Ok(())
    }

    // --- Mutation entry points ---------------------------------------------

    /// Embeds an entity; with `write`, also persists it.
    /// Returns whether the graph changed.
    pub fn update(&mut self, entity: &Entity, write: bool) -> Result<bool, InventoryError> {
        let changed = self.embed(entity)?;
        if write {
            self.write_entity(entity, false)?;
        }
        Ok(changed)
    }

    /// Unlinks an entity with the structural cascades; with `write`, persists
    /// the deletions. Returns the affected entities.
    pub fn delete(&mut self, entity: &Entity, write: bool) -> Result<Vec<Entity>, InventoryError> {
        let affected = self.unlink(entity)?;
        if write {
            for affected_entity in &affected {
                self.write_entity(affected_entity, true)?;
            }
        }
        Ok(affected)
    }

    /// Locate-or-create; idempotent. The only way entities enter the graph
    /// outside of `load`.
    pub fn embed(&mut self, entity: &Entity) -> Result<bool, ObjectError> {
        match entity {
            Entity::Partition(rec) => {
                if self.partitions.contains_key(&rec.name) {
                    return Ok(false);
                }
                if let Some(children) = &rec.subpartitions {
                    for child in children {
                        let leaf = self
                            .partitions
                            .get(child)
                            .ok_or_else(|| ObjectError::UnknownPartition(child.clone()))?;
                        if !leaf.is_leaf() {
                            return Err(ObjectError::InvalidPartition {
                                name: rec.name.clone(),
                                reason: format!("subpartition '{}' is not a leaf", child),
                            });
                        }
                    }
                    for child in children {
                        self.partitions
                            .get_mut(child)
                            .expect("checked above")
                            .parent = Some(rec.name.clone());
                    }
                } else if rec.condition.is_none() {
                    return Err(ObjectError::InvalidPartition {
                        name: rec.name.clone(),
                        reason: "exactly one of condition / subpartitions required".to_owned(),
                    });
                }
                let partition = Partition {
                    id: 0,
                    name: rec.name.clone(),
                    condition: rec.condition.clone(),
                    subpartitions: rec.subpartitions.clone(),
                    parent: None,
                };
                if partition.is_leaf() {
                    for site in self.sites.values_mut() {
                        site.partitions.insert(
                            rec.name.clone(),
                            SitePartition::new(site.name.clone(), rec.name.clone()),
                        );
                    }
                }
                self.partitions.insert(rec.name.clone(), partition);
                Ok(true)
            }

            Entity::Group(rec) => match self.groups.get_mut(&rec.name) {
                Some(group) => {
                    if group.to_record(true) == *rec {
                        Ok(false)
                    } else {
                        group.copy_from(rec)?;
                        Ok(true)
                    }
                }
                None => {
                    self.groups.insert(
                        rec.name.clone(),
                        Group {
                            id: 0,
                            name: rec.name.clone(),
                            olevel: rec.olevel,
                        },
                    );
                    Ok(true)
                }
            },

            Entity::Site(rec) => match self.sites.get_mut(&rec.name) {
                Some(site) => {
                    if site.to_record(true) == *rec {
                        Ok(false)
                    } else {
                        site.copy_from(rec)?;
                        Ok(true)
                    }
                }
                None => {
                    let mut site = Site::new(rec.name.clone());
                    site.copy_from(rec)?;
                    for partition in self.partitions.values().filter(|p| p.is_leaf()) {
                        site.partitions.insert(
                            partition.name.clone(),
                            SitePartition::new(rec.name.clone(), partition.name.clone()),
                        );
                    }
                    self.sites.insert(rec.name.clone(), site);
                    Ok(true)
                }
            },

            Entity::SitePartition(rec) => {
                let partition = self
                    .partitions
                    .get(&rec.partition)
                    .ok_or_else(|| ObjectError::UnknownPartition(rec.partition.clone()))?;
                if !partition.is_leaf() {
                    return Err(ObjectError::InvalidPartition {
                        name: rec.partition.clone(),
                        reason: "cannot set a quota on a superpartition".to_owned(),
                    });
                }
                let site = self
                    .sites
                    .get_mut(&rec.site)
                    .ok_or_else(|| ObjectError::UnknownSite(rec.site.clone()))?;
                let sp = site
                    .partitions
                    .entry(rec.partition.clone())
                    .or_insert_with(|| {
                        SitePartition::new(rec.site.clone(), rec.partition.clone())
                    });
                if sp.quota == rec.quota {
                    Ok(false)
                } else {
                    sp.quota = rec.quota;
                    Ok(true)
                }
            }

            Entity::Dataset(rec) => match self.datasets.get_mut(&rec.name) {
                Some(dataset) => {
                    if dataset.to_record(true, &self.versions) == *rec {
                        Ok(false)
                    } else {
                        dataset.copy_from(rec, &mut self.versions)?;
                        Ok(true)
                    }
                }
                None => {
                    let mut dataset = Dataset::new(rec.name.clone());
                    dataset.copy_from(rec, &mut self.versions)?;
                    self.datasets.insert(rec.name.clone(), dataset);
                    Ok(true)
                }
            },

            Entity::Block(rec) => {
                let dataset = self
                    .datasets
                    .get_mut(&rec.dataset)
                    .ok_or_else(|| ObjectError::UnknownDataset(rec.dataset.clone()))?;
                match dataset.blocks.get_mut(&rec.name) {
                    Some(block) => {
                        if block.to_record(&rec.dataset, true) == *rec {
                            Ok(false)
                        } else {
                            block.copy_from(rec)?;
                            Ok(true)
                        }
                    }
                    None => {
                        let mut block = Block::new(rec.name.clone());
                        block.copy_from(rec)?;
                        dataset.blocks.insert(rec.name.clone(), block);
                        Ok(true)
                    }
                }
            }

            Entity::File(rec) => {
                let (dataset_name, block_name) = Block::from_full_name(&rec.block)?;
                let dataset = self
                    .datasets
                    .get_mut(dataset_name)
                    .ok_or_else(|| ObjectError::UnknownDataset(dataset_name.to_owned()))?;
                let block = dataset
                    .blocks
                    .get_mut(block_name)
                    .ok_or_else(|| ObjectError::UnknownBlock(rec.block.clone()))?;
                match block.files.get_mut(&rec.lfn) {
                    Some(file) => {
                        if file.size == rec.size {
                            Ok(false)
                        } else {
                            file.size = rec.size;
                            Ok(true)
                        }
                    }
                    None => {
                        block.files.insert(
                            rec.lfn.clone(),
                            File {
                                id: 0,
                                lfn: rec.lfn.clone(),
                                size: rec.size,
                            },
                        );
                        Ok(true)
                    }
                }
            }

            Entity::DatasetReplica(rec) => {
                if !self.sites.contains_key(&rec.site) {
                    return Err(ObjectError::UnknownSite(rec.site.clone()));
                }
                let dataset = self
                    .datasets
                    .get_mut(&rec.dataset)
                    .ok_or_else(|| ObjectError::UnknownDataset(rec.dataset.clone()))?;
                if dataset.replicas.contains_key(&rec.site) {
                    Ok(false)
                } else {
                    dataset.replicas.insert(
                        rec.site.clone(),
                        DatasetReplica::new(rec.dataset.clone(), rec.site.clone()),
                    );
                    Ok(true)
                }
            }

            Entity::BlockReplica(rec) => {
                let (dataset_name, block_name) = Block::from_full_name(&rec.block)?;
                if let Some(group) = &rec.group {
                    if !self.groups.contains_key(group) {
                        return Err(ObjectError::UnknownGroup(group.clone()));
                    }
                }
                if !self.sites.contains_key(&rec.site) {
                    return Err(ObjectError::UnknownSite(rec.site.clone()));
                }
                let dataset = self
                    .datasets
                    .get_mut(dataset_name)
                    .ok_or_else(|| ObjectError::UnknownDataset(dataset_name.to_owned()))?;
                let canonical_size = dataset
                    .blocks
                    .get(block_name)
                    .ok_or_else(|| ObjectError::UnknownBlock(rec.block.clone()))?
                    .size;
                let replica = dataset.replicas.get_mut(&rec.site).ok_or_else(|| {
                    ObjectError::UnknownReplica {
                        dataset: dataset_name.to_owned(),
                        site: rec.site.clone(),
                    }
                })?;

                let ctx = ReplicaContext {
                    dataset: dataset_name,
                    group: rec.group.as_deref(),
                    is_custodial: rec.is_custodial,
                    is_complete: rec.is_complete,
                };

                let changed = match replica.block_replicas.get_mut(block_name) {
                    Some(existing) => {
                        if existing.to_record(canonical_size, true) == *rec {
                            false
                        } else {
                            existing.copy_from(rec, canonical_size);
                            self.sites
                                .get_mut(&rec.site)
                                .expect("checked above")
                                .update_partitioning(
                                    &self.partitions,
                                    dataset_name,
                                    block_name,
                                    &ctx,
                                );
                            true
                        }
                    }
                    None => {
                        replica.block_replicas.insert(
                            block_name.to_owned(),
                            BlockReplica {
                                dataset: dataset_name.to_owned(),
                                block: block_name.to_owned(),
                                site: rec.site.clone(),
                                group: rec.group.clone(),
                                is_complete: rec.is_complete,
                                is_custodial: rec.is_custodial,
                                size: rec.size.unwrap_or(canonical_size),
                                last_update: rec.last_update,
                            },
                        );
                        dataset
                            .blocks
                            .get_mut(block_name)
                            .expect("checked above")
                            .replica_sites
                            .insert(rec.site.clone());
                        self.sites
                            .get_mut(&rec.site)
                            .expect("checked above")
                            .add_block_replica(&self.partitions, dataset_name, block_name, &ctx);
                        true
                    }
                };
                Ok(changed)
            }
        }
    }

    /// Removes an entity and cascades per the structural invariants.
    pub fn unlink(&mut self, entity: &Entity) -> Result<Vec<Entity>, ObjectError> {
        match entity {
            Entity::Partition(rec) => {
                let partition = self
                    .partitions
                    .remove(&rec.name)
                    .ok_or_else(|| ObjectError::UnknownPartition(rec.name.clone()))?;
                if let Some(children) = &partition.subpartitions {
                    for child in children {
                        if let Some(leaf) = self.partitions.get_mut(child) {
                            leaf.parent = None;
                        }
                    }
                }
                if let Some(parent) = &partition.parent {
                    if let Some(parent) = self.partitions.get_mut(parent) {
                        if let Some(children) = &mut parent.subpartitions {
                            children.retain(|c| c != &partition.name);
                        }
                    }
                }
                for site in self.sites.values_mut() {
                    site.partitions.remove(&partition.name);
                }
                Ok(vec![Entity::Partition(partition.to_record())])
            }

            Entity::Group(rec) => {
                let group = self
                    .groups
                    .remove(&rec.name)
                    .ok_or_else(|| ObjectError::UnknownGroup(rec.name.clone()))?;

                // disown every replica the group held and re-classify it
                let mut disowned = Vec::new();
                for dataset in self.datasets.values_mut() {
                    for replica in dataset.replicas.values_mut() {
                        for br in replica.block_replicas.values_mut() {
                            if br.group.as_deref() == Some(group.name.as_str()) {
                                br.group = None;
                                disowned.push((
                                    br.dataset.clone(),
                                    br.block.clone(),
                                    br.site.clone(),
                                    br.is_custodial,
                                    br.is_complete,
                                ));
                            }
                        }
                    }
                }
                for (dataset, block, site, is_custodial, is_complete) in &disowned {
                    if let Some(site_obj) = self.sites.get_mut(site) {
                        site_obj.update_partitioning(
                            &self.partitions,
                            dataset,
                            block,
                            &ReplicaContext {
                                dataset,
                                group: None,
                                is_custodial: *is_custodial,
                                is_complete: *is_complete,
                            },
                        );
                    }
                }
                Ok(vec![Entity::Group(group.to_record(true))])
            }

            Entity::Site(rec) => {
                let site = self
                    .sites
                    .remove(&rec.name)
                    .ok_or_else(|| ObjectError::UnknownSite(rec.name.clone()))?;
                for dataset in self.datasets.values_mut() {
                    if let Some(replica) = dataset.replicas.remove(&site.name) {
                        for block_name in replica.block_replicas.keys() {
                            if let Some(block) = dataset.blocks.get_mut(block_name) {
                                block.replica_sites.remove(&site.name);
                            }
                        }
                    }
                }
                Ok(vec![Entity::Site(site.to_record(true))])
            }

            Entity::SitePartition(rec) => Err(ObjectError::InvalidPartition {
                name: rec.partition.clone(),
                reason: "site partitions cannot be deleted".to_owned(),
            }),

            Entity::Dataset(rec) => {
                let dataset = self
                    .datasets
                    .remove(&rec.name)
                    .ok_or_else(|| ObjectError::UnknownDataset(rec.name.clone()))?;
                for replica in dataset.replicas.values() {
                    if let Some(site) = self.sites.get_mut(&replica.site) {
                        for block_name in replica.block_replicas.keys() {
                            site.remove_block_replica(&dataset.name, block_name);
                        }
                    }
                }
                Ok(vec![Entity::Dataset(
                    dataset.to_record(true, &self.versions),
                )])
            }

            Entity::Block(rec) => {
                let dataset = self
                    .datasets
                    .get_mut(&rec.dataset)
                    .ok_or_else(|| ObjectError::UnknownDataset(rec.dataset.clone()))?;
                let block = dataset
                    .blocks
                    .remove(&rec.name)
                    .ok_or_else(|| ObjectError::UnknownBlock(rec.full_name()))?;

                let mut emptied_sites = Vec::new();
                for replica in dataset.replicas.values_mut() {
                    if replica.block_replicas.remove(&rec.name).is_some()
                        && replica.block_replicas.is_empty()
                    {
                        emptied_sites.push(replica.site.clone());
                    }
                }
                for site in &emptied_sites {
                    dataset.replicas.remove(site);
                }
                for site_name in &block.replica_sites {
                    if let Some(site) = self.sites.get_mut(site_name) {
                        site.remove_block_replica(&rec.dataset, &rec.name);
                    }
                }
                Ok(vec![Entity::Block(block.to_record(&rec.dataset, true))])
            }

            Entity::File(rec) => {
                let (dataset_name, block_name) = Block::from_full_name(&rec.block)?;
                let dataset = self
                    .datasets
                    .get_mut(dataset_name)
                    .ok_or_else(|| ObjectError::UnknownDataset(dataset_name.to_owned()))?;
                let block = dataset
                    .blocks
                    .get_mut(block_name)
                    .ok_or_else(|| ObjectError::UnknownBlock(rec.block.clone()))?;
                let file = block
                    .files
                    .remove(&rec.lfn)
                    .ok_or_else(|| ObjectError::UnknownFile(rec.lfn.clone()))?;
                Ok(vec![Entity::File(file.to_record(dataset_name, block_name))])
            }

            Entity::DatasetReplica(rec) => {
                let dataset = self
                    .datasets
                    .get_mut(&rec.dataset)
                    .ok_or_else(|| ObjectError::UnknownDataset(rec.dataset.clone()))?;
                let replica = dataset.replicas.remove(&rec.site).ok_or_else(|| {
                    ObjectError::UnknownReplica {
                        dataset: rec.dataset.clone(),
                        site: rec.site.clone(),
                    }
                })?;
                for block_name in replica.block_replicas.keys() {
                    if let Some(block) = dataset.blocks.get_mut(block_name) {
                        block.replica_sites.remove(&rec.site);
                    }
                }
                if let Some(site) = self.sites.get_mut(&rec.site) {
                    for block_name in replica.block_replicas.keys() {
                        site.remove_block_replica(&rec.dataset, block_name);
                    }
                }
                Ok(vec![Entity::DatasetReplica(replica.to_record())])
            }

            Entity::BlockReplica(rec) => {
                let (dataset_name, block_name) = Block::from_full_name(&rec.block)?;
                let dataset = self
                    .datasets
                    .get_mut(dataset_name)
                    .ok_or_else(|| ObjectError::UnknownDataset(dataset_name.to_owned()))?;
                let canonical_size = dataset
                    .blocks
                    .get(block_name)
                    .ok_or_else(|| ObjectError::UnknownBlock(rec.block.clone()))?
                    .size;
                let replica = dataset.replicas.get_mut(&rec.site).ok_or_else(|| {
                    ObjectError::UnknownReplica {
                        dataset: dataset_name.to_owned(),
                        site: rec.site.clone(),
                    }
                })?;
                let removed = replica.block_replicas.remove(block_name).ok_or_else(|| {
                    ObjectError::UnknownReplica {
                        dataset: rec.block.clone(),
                        site: rec.site.clone(),
                    }
                })?;

                // deleting the last block replica deletes the dataset replica
                if replica.block_replicas.is_empty() {
                    dataset.replicas.remove(&rec.site);
                }
                if let Some(block) = dataset.blocks.get_mut(block_name) {
                    block.replica_sites.remove(&rec.site);
                }
                if let Some(site) = self.sites.get_mut(&rec.site) {
                    site.remove_block_replica(dataset_name, block_name);
                }
                Ok(vec![Entity::BlockReplica(
                    removed.to_record(canonical_size, true),
                )])
            }
        }
    }

    /// Dispatches an entity to the matching store upsert or delete.
    pub fn write_entity(&mut self, entity: &Entity, delete: bool) -> Result<(), InventoryError> {
        let store = self.store.as_mut().ok_or(InventoryError::NoStore)?;

        match entity {
            Entity::Partition(rec) => {
                if delete {
                    store.delete_partition(&rec.name)?;
                } else if let Some(partition) = self.partitions.get_mut(&rec.name) {
                    store.save_partition(partition)?;
                }
            }
            Entity::Group(rec) => {
                if delete {
                    store.delete_group(&rec.name)?;
                } else if let Some(group) = self.groups.get_mut(&rec.name) {
                    store.save_group(group)?;
                }
            }
            Entity::Site(rec) => {
                if delete {
                    store.delete_site(&rec.name)?;
                } else if let Some(site) = self.sites.get_mut(&rec.name) {
                    store.save_site(site)?;
                }
            }
            Entity::SitePartition(rec) => {
                if !delete {
                    if let Some(site) = self.sites.get(&rec.site) {
                        if let Some(sp) = site.partitions.get(&rec.partition) {
                            store.save_sitepartition(sp)?;
                        }
                    }
                }
            }
            Entity::Dataset(rec) => {
                if delete {
                    store.delete_dataset(&rec.name)?;
                } else if let Some(dataset) = self.datasets.get_mut(&rec.name) {
                    store.save_dataset(dataset, &self.versions)?;
                }
            }
            Entity::Block(rec) => {
                if delete {
                    store.delete_block(&rec.dataset, &rec.name)?;
                } else if let Some(dataset) = self.datasets.get_mut(&rec.dataset) {
                    if let Some(block) = dataset.blocks.get_mut(&rec.name) {
                        store.save_block(&rec.dataset, block)?;
                    }
                }
            }
            Entity::File(rec) => {
                let (dataset_name, block_name) = Block::from_full_name(&rec.block)?;
                if delete {
                    store.delete_file(&rec.lfn)?;
                } else if let Some(dataset) = self.datasets.get_mut(dataset_name) {
                    if let Some(block) = dataset.blocks.get_mut(block_name) {
                        if let Some(file) = block.files.get_mut(&rec.lfn) {
                            store.save_file(dataset_name, block_name, file)?;
                        }
                    }
                }
            }
            Entity::DatasetReplica(rec) => {
                if delete {
                    store.delete_datasetreplica(&rec.dataset, &rec.site)?;
                } else {
                    store.save_datasetreplica(&rec.dataset, &rec.site)?;
                }
            }
            Entity::BlockReplica(rec) => {
                let (dataset_name, block_name) = Block::from_full_name(&rec.block)?;
                if delete {
                    store.delete_blockreplica(dataset_name, block_name, &rec.site)?;
                } else if let Some(dataset) = self.datasets.get(dataset_name) {
                    let canonical_size =
                        dataset.blocks.get(block_name).map(|b| b.size).unwrap_or(0);
                    if let Some(br) = dataset
                        .replicas
                        .get(&rec.site)
                        .and_then(|dr| dr.block_replicas.get(block_name))
                    {
                        store.save_blockreplica(br, canonical_size)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes the full graph as one snapshot (shadow files + atomic rename).
    pub fn save_all(&mut self) -> Result<(), InventoryError> {
        let store = self.store.as_mut().ok_or(InventoryError::NoStore)?;
        store.save_all(
            &mut self.partitions,
            &mut self.groups,
            &mut self.sites,
            &mut self.datasets,
            &self.versions,
        )?;
        Ok(())
    }

    // --- Read helpers ------------------------------------------------------

    pub fn find_block_replica(
        &self,
        dataset: &str,
        block: &str,
        site: &str,
    ) -> Option<&BlockReplica> {
        self.datasets
            .get(dataset)?
            .replicas
            .get(site)?
            .block_replicas
            .get(block)
    }

    /// Bytes of replica data a site holds under a partition.
    pub fn site_partition_usage(&self, site: &str, partition: &str) -> Result<u64, ObjectError> {
        let site_obj = self
            .sites
            .get(site)
            .ok_or_else(|| ObjectError::UnknownSite(site.to_owned()))?;
        let members = site_obj.partition_replicas(&self.partitions, partition)?;
        let mut total = 0u64;
        for (dataset_name, block_name) in &members {
            if let Some(br) = self.find_block_replica(dataset_name, block_name, site) {
                total += br.size;
            }
        }
        Ok(total)
    }

    /// Read view handed to workers. With `capture` the view records proposed
    /// mutations; without it every mutation is rejected.
    pub fn create_proxy(&self, capture: bool) -> InventoryProxy<'_> {
        InventoryProxy {
            inventory: self,
            capture,
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

/// Read-only view of the inventory with optional mutation capture.
///
/// Workers run against this view; `update`/`delete` never touch the graph,
/// they only append to the captured lists which the worker ships back to the
/// master over its mutation channel.
#[derive(Debug)]
pub struct InventoryProxy<'a> {
    inventory: &'a Inventory,
    capture: bool,
    pub updated: Vec<Entity>,
    pub deleted: Vec<Entity>,
}

impl InventoryProxy<'_> {
    pub fn update(&mut self, entity: Entity) -> Result<(), ObjectError> {
        if !self.capture {
            return Err(ObjectError::ReadOnlyView);
        }
        self.updated.push(entity);
        Ok(())
    }

    pub fn delete(&mut self, entity: Entity) -> Result<(), ObjectError> {
        if !self.capture {
            return Err(ObjectError::ReadOnlyView);
        }
        self.deleted.push(entity);
        Ok(())
    }
}

impl Deref for InventoryProxy<'_> {
    type Target = Inventory;

    fn deref(&self) -> &Inventory {
        self.inventory
    }
}
