//! Entity value objects of the inventory graph.
//!
//! Graph types ([`Dataset`], [`Block`], [`Site`], ...) are owned exclusively
//! by the [`Inventory`](crate::inventory::Inventory); cross-references between
//! them are name keys resolved through the owning container. Every graph type
//! has a serializable *record* form (its unlinked clone), and the [`Entity`]
//! enum wraps the records as the typed payload of mutation channels and of
//! `Inventory::update` / `Inventory::delete`.

pub mod block;
pub mod condition;
pub mod dataset;
pub mod group;
pub mod partition;
pub mod replica;
pub mod site;

pub use block::{Block, BlockRecord, File, FileRecord};
pub use condition::{ReplicaCondition, ReplicaContext};
pub use dataset::{
    DataType, Dataset, DatasetRecord, DatasetStatus, SoftwareVersion, VersionRegistry,
};
pub use group::{Group, GroupRecord, OwnershipLevel};
pub use partition::{Partition, PartitionRecord};
pub use replica::{BlockReplica, BlockReplicaRecord, DatasetReplica, DatasetReplicaRecord};
pub use site::{Site, SitePartition, SitePartitionRecord, SiteRecord, SiteStatus, StorageType};

use serde::{Deserialize, Serialize};

/// An unlinked entity clone, tagged by class.
///
/// This is the unit that travels on mutation channels and the only argument
/// type the inventory mutation entry points accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", content = "object")]
pub enum Entity {
    Partition(PartitionRecord),
    Group(GroupRecord),
    Site(SiteRecord),
    SitePartition(SitePartitionRecord),
    Dataset(DatasetRecord),
    Block(BlockRecord),
    File(FileRecord),
    DatasetReplica(DatasetReplicaRecord),
    BlockReplica(BlockReplicaRecord),
}

impl Entity {
    /// Human-readable identity, used in logs.
    pub fn describe(&self) -> String {
        match self {
            Entity::Partition(r) => format!("partition {}", r.name),
            Entity::Group(r) => format!("group {}", r.name),
            Entity::Site(r) => format!("site {}", r.name),
            Entity::SitePartition(r) => format!("sitepartition {}/{}", r.site, r.partition),
            Entity::Dataset(r) => format!("dataset {}", r.name),
            Entity::Block(r) => format!("block {}", r.full_name()),
            Entity::File(r) => format!("file {}", r.lfn),
            Entity::DatasetReplica(r) => format!("replica {}:{}", r.site, r.dataset),
            Entity::BlockReplica(r) => format!("replica {}:{}", r.site, r.block),
        }
    }
}
