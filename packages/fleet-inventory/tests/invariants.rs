//! Structural invariants of the inventory graph.

use fleet_inventory::dataformat::{
    BlockRecord, BlockReplicaRecord, DatasetRecord, DatasetReplicaRecord, GroupRecord,
    OwnershipLevel, PartitionRecord, ReplicaCondition, SiteRecord, SiteStatus, StorageType,
};
use fleet_inventory::{Entity, Inventory, ObjectError};

fn partition(name: &str, condition: &str) -> Entity {
    Entity::Partition(PartitionRecord {
        name: name.to_owned(),
        condition: Some(ReplicaCondition::parse(condition).unwrap()),
        subpartitions: None,
    })
}

fn site(name: &str) -> Entity {
    Entity::Site(SiteRecord {
        name: name.to_owned(),
        host: format!("{}.example.org", name.to_lowercase()),
        storage_type: StorageType::Disk,
        backend: "gfal".to_owned(),
        status: SiteStatus::Ready,
    })
}

fn dataset(name: &str) -> Entity {
    Entity::Dataset(DatasetRecord::named(name))
}

fn block(dataset: &str, name: &str, size: u64) -> Entity {
    Entity::Block(BlockRecord {
        dataset: dataset.to_owned(),
        name: name.to_owned(),
        size,
        num_files: 1,
        is_open: false,
        last_update: 1000,
    })
}

fn block_replica(dataset: &str, block: &str, site: &str, group: Option<&str>) -> Entity {
    Entity::BlockReplica(BlockReplicaRecord {
        block: format!("{}#{}", dataset, block),
        site: site.to_owned(),
        group: group.map(str::to_owned),
        is_complete: true,
        is_custodial: false,
        size: None,
        last_update: 1000,
    })
}

/// Two sites, two groups, one dataset with two blocks, replicas of both
/// blocks at S1 and of b1 at S2.
fn build() -> Inventory {
    let mut inv = Inventory::new();

    inv.update(&partition("global", "true"), false).unwrap();
    inv.update(&partition("owned", "not group == unowned"), false)
        .unwrap();

    inv.update(
        &Entity::Group(GroupRecord::new("prod", OwnershipLevel::Block)),
        false,
    )
    .unwrap();
    inv.update(
        &Entity::Group(GroupRecord::new("analysis", OwnershipLevel::Dataset)),
        false,
    )
    .unwrap();

    inv.update(&site("S1"), false).unwrap();
    inv.update(&site("S2"), false).unwrap();

    inv.update(&dataset("/d"), false).unwrap();
    inv.update(&block("/d", "b1", 100), false).unwrap();
    inv.update(&block("/d", "b2", 200), false).unwrap();

    for s in ["S1", "S2"] {
        inv.update(
            &Entity::DatasetReplica(DatasetReplicaRecord {
                dataset: "/d".to_owned(),
                site: s.to_owned(),
            }),
            false,
        )
        .unwrap();
    }
    inv.update(&block_replica("/d", "b1", "S1", Some("prod")), false)
        .unwrap();
    inv.update(&block_replica("/d", "b2", "S1", Some("prod")), false)
        .unwrap();
    inv.update(&block_replica("/d", "b1", "S2", None), false)
        .unwrap();

    inv
}

#[test]
fn block_replica_back_references() {
    // I1: every block replica is registered in its dataset replica, its
    // block's site set, and the site partition sets it classifies into
    let inv = build();

    let dataset = &inv.datasets["/d"];
    let dr = dataset.replicas.get("S1").unwrap();
    assert!(dr.block_replicas.contains_key("b1"));
    assert!(dr.block_replicas.contains_key("b2"));

    assert!(dataset.blocks["b1"].replica_sites.contains("S1"));
    assert!(dataset.blocks["b1"].replica_sites.contains("S2"));
    assert!(!dataset.blocks["b2"].replica_sites.contains("S2"));

    let s1 = &inv.sites["S1"];
    let global = &s1.partitions["global"].replicas;
    assert!(global.contains(&("/d".to_owned(), "b1".to_owned())));
    assert!(global.contains(&("/d".to_owned(), "b2".to_owned())));

    // the "owned" partition excludes unowned replicas
    let s2 = &inv.sites["S2"];
    assert!(s2.partitions["global"]
        .replicas
        .contains(&("/d".to_owned(), "b1".to_owned())));
    assert!(!s2.partitions["owned"]
        .replicas
        .contains(&("/d".to_owned(), "b1".to_owned())));
}

#[test]
fn replica_union_matches_blocks() {
    // I2: a block's replica set is the union over dataset replicas
    let inv = build();
    let dataset = &inv.datasets["/d"];

    for block in dataset.blocks.values() {
        for site in &block.replica_sites {
            let dr = dataset.replicas.get(site).unwrap();
            assert!(dr.block_replicas.contains_key(&block.name));
        }
    }
    for dr in dataset.replicas.values() {
        for name in dr.block_replicas.keys() {
            assert!(dataset.blocks[name].replica_sites.contains(&dr.site));
        }
    }
}

#[test]
fn group_delete_disowns_replicas() {
    // I3: after deleting a group no replica refers to it, and the replicas
    // are re-classified
    let mut inv = build();

    let affected = inv
        .delete(
            &Entity::Group(GroupRecord::new("prod", OwnershipLevel::Block)),
            false,
        )
        .unwrap();
    assert_eq!(affected.len(), 1);
    assert!(!inv.groups.contains_key("prod"));

    for dataset in inv.datasets.values() {
        for dr in dataset.replicas.values() {
            for br in dr.block_replicas.values() {
                assert_ne!(br.group.as_deref(), Some("prod"));
            }
        }
    }

    // both S1 replicas lost ownership, so the "owned" partition is empty
    assert!(inv.sites["S1"].partitions["owned"].replicas.is_empty());
}

#[test]
fn dataset_delete_cascades() {
    // I4: nothing refers to a deleted dataset
    let mut inv = build();

    inv.delete(&dataset("/d"), false).unwrap();
    assert!(!inv.datasets.contains_key("/d"));

    for site in inv.sites.values() {
        for sp in site.partitions.values() {
            assert!(sp.replicas.is_empty());
        }
    }
}

#[test]
fn embed_is_idempotent() {
    // I5: the second embed of an identical entity is a no-op
    let mut inv = build();

    assert!(!inv.update(&site("S1"), false).unwrap());
    assert!(!inv.update(&block("/d", "b1", 100), false).unwrap());
    assert!(!inv
        .update(&block_replica("/d", "b1", "S1", Some("prod")), false)
        .unwrap());

    // a real attribute change is reported
    assert!(inv.update(&block("/d", "b1", 150), false).unwrap());
}

#[test]
fn last_block_replica_removes_dataset_replica() {
    // deleting the last block replica deletes the dataset replica
    let mut inv = build();

    inv.delete(&block_replica("/d", "b1", "S2", None), false)
        .unwrap();
    assert!(!inv.datasets["/d"].replicas.contains_key("S2"));
    assert!(inv.datasets["/d"].replicas.contains_key("S1"));
}

#[test]
fn replica_embed_requires_dataset_replica() {
    let mut inv = build();
    inv.update(&site("S3"), false).unwrap();

    let err = inv
        .update(&block_replica("/d", "b1", "S3", None), false)
        .unwrap_err();
    assert!(matches!(
        err,
        fleet_inventory::InventoryError::Object(ObjectError::UnknownReplica { .. })
    ));
}

#[test]
fn group_attribute_change_reclassifies() {
    // I1/invariant 2: classification follows attribute changes
    let mut inv = build();

    // disown b1 at S1: it leaves the "owned" partition
    inv.update(&block_replica("/d", "b1", "S1", None), false)
        .unwrap();
    assert!(!inv.sites["S1"].partitions["owned"]
        .replicas
        .contains(&("/d".to_owned(), "b1".to_owned())));
    assert!(inv.sites["S1"].partitions["owned"]
        .replicas
        .contains(&("/d".to_owned(), "b2".to_owned())));
}

#[test]
fn proxy_captures_proposed_mutations() {
    // the worker view: reads pass through, mutations are only recorded and
    // applied later by the master loop
    let mut inv = build();

    let mut view = inv.create_proxy(false);
    let err = view
        .update(Entity::Group(GroupRecord::new("new", OwnershipLevel::Block)))
        .unwrap_err();
    assert!(matches!(err, ObjectError::ReadOnlyView));

    let (updated, deleted) = {
        let mut view = inv.create_proxy(true);
        // reads go straight to the graph
        assert!(view.datasets.contains_key("/d"));
        view.update(Entity::Group(GroupRecord::new(
            "analysis2",
            OwnershipLevel::Dataset,
        )))
        .unwrap();
        view.delete(block_replica("/d", "b1", "S2", None)).unwrap();
        (view.updated, view.deleted)
    };

    // nothing changed yet
    assert!(!inv.groups.contains_key("analysis2"));

    // the master applies the captured lists in order
    for entity in &updated {
        inv.update(entity, false).unwrap();
    }
    for entity in &deleted {
        inv.delete(entity, false).unwrap();
    }
    assert!(inv.groups.contains_key("analysis2"));
    assert!(!inv.datasets["/d"].replicas.contains_key("S2"));
}

#[test]
fn superpartition_views_are_unions() {
    let mut inv = Inventory::new();
    inv.update(&partition("owned", "not group == unowned"), false)
        .unwrap();
    inv.update(&partition("unowned", "group == unowned"), false)
        .unwrap();
    inv.update(
        &Entity::Partition(PartitionRecord {
            name: "all".to_owned(),
            condition: None,
            subpartitions: Some(vec!["owned".to_owned(), "unowned".to_owned()]),
        }),
        false,
    )
    .unwrap();
    inv.update(
        &Entity::Group(GroupRecord::new("prod", OwnershipLevel::Block)),
        false,
    )
    .unwrap();
    inv.update(&site("S1"), false).unwrap();
    inv.update(&dataset("/d"), false).unwrap();
    inv.update(&block("/d", "b1", 100), false).unwrap();
    inv.update(&block("/d", "b2", 50), false).unwrap();
    inv.update(
        &Entity::DatasetReplica(DatasetReplicaRecord {
            dataset: "/d".to_owned(),
            site: "S1".to_owned(),
        }),
        false,
    )
    .unwrap();
    inv.update(&block_replica("/d", "b1", "S1", Some("prod")), false)
        .unwrap();
    inv.update(&block_replica("/d", "b2", "S1", None), false)
        .unwrap();

    // quotas: 10 + 20 bytes on the leaves, summed on the superpartition
    use fleet_inventory::dataformat::SitePartitionRecord;
    inv.update(
        &Entity::SitePartition(SitePartitionRecord {
            site: "S1".to_owned(),
            partition: "owned".to_owned(),
            quota: 10,
        }),
        false,
    )
    .unwrap();
    inv.update(
        &Entity::SitePartition(SitePartitionRecord {
            site: "S1".to_owned(),
            partition: "unowned".to_owned(),
            quota: 20,
        }),
        false,
    )
    .unwrap();

    let s1 = &inv.sites["S1"];
    let union = s1.partition_replicas(&inv.partitions, "all").unwrap();
    assert_eq!(union.len(), 2);
    assert_eq!(s1.partition_quota(&inv.partitions, "all").unwrap(), 30);
    assert_eq!(inv.site_partition_usage("S1", "all").unwrap(), 150);
    assert_eq!(inv.site_partition_usage("S1", "owned").unwrap(), 100);
}
