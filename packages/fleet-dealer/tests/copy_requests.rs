//! Copy-request handler cycles against a populated inventory.

use fleet_dealer::{
    CopyRequestsConfig, CopyRequestsHandler, CopyStatus, QuotaPolicy, RequestRegistry,
    RequestStatus,
};
use fleet_inventory::dataformat::{
    BlockRecord, BlockReplicaRecord, DatasetRecord, DatasetReplicaRecord, GroupRecord,
    OwnershipLevel, PartitionRecord, ReplicaCondition, SitePartitionRecord, SiteRecord,
    SiteStatus, StorageType,
};
use fleet_inventory::{Entity, Inventory};

const TB: u64 = 1_000_000_000_000;

fn add_site(inv: &mut Inventory, name: &str) {
    inv.update(
        &Entity::Site(SiteRecord {
            name: name.to_owned(),
            host: String::new(),
            storage_type: StorageType::Disk,
            backend: String::new(),
            status: SiteStatus::Ready,
        }),
        false,
    )
    .unwrap();
    inv.update(
        &Entity::SitePartition(SitePartitionRecord {
            site: name.to_owned(),
            partition: "global".to_owned(),
            quota: -1,
        }),
        false,
    )
    .unwrap();
}

fn add_dataset(inv: &mut Inventory, name: &str, blocks: &[(&str, u64)]) {
    inv.update(&Entity::Dataset(DatasetRecord::named(name)), false)
        .unwrap();
    for (block, size) in blocks {
        inv.update(
            &Entity::Block(BlockRecord {
                dataset: name.to_owned(),
                name: (*block).to_owned(),
                size: *size,
                num_files: 1,
                is_open: false,
                last_update: 0,
            }),
            false,
        )
        .unwrap();
    }
}

fn add_replicas(inv: &mut Inventory, dataset: &str, site: &str, blocks: &[&str], group: &str) {
    inv.update(
        &Entity::DatasetReplica(DatasetReplicaRecord {
            dataset: dataset.to_owned(),
            site: site.to_owned(),
        }),
        false,
    )
    .unwrap();
    for block in blocks {
        inv.update(
            &Entity::BlockReplica(BlockReplicaRecord {
                block: format!("{}#{}", dataset, block),
                site: site.to_owned(),
                group: Some(group.to_owned()),
                is_complete: true,
                is_custodial: false,
                size: None,
                last_update: 0,
            }),
            false,
        )
        .unwrap();
    }
}

/// Four ready sites; /X fully at S1 (owned by G_over), half at S2 (owned by
/// prod), absent elsewhere.
fn scenario_inventory() -> Inventory {
    let mut inv = Inventory::new();
    inv.update(
        &Entity::Partition(PartitionRecord {
            name: "global".to_owned(),
            condition: Some(ReplicaCondition::Always),
            subpartitions: None,
        }),
        false,
    )
    .unwrap();
    for group in ["G_over", "G_new", "prod"] {
        inv.update(
            &Entity::Group(GroupRecord::new(group, OwnershipLevel::Block)),
            false,
        )
        .unwrap();
    }
    for site in ["S1", "S2", "S3", "S4"] {
        add_site(&mut inv, site);
    }
    add_dataset(
        &mut inv,
        "/X",
        &[("b1", 10 * TB), ("b2", 10 * TB), ("b3", 10 * TB), ("b4", 10 * TB)],
    );
    add_replicas(&mut inv, "/X", "S1", &["b1", "b2", "b3", "b4"], "G_over");
    add_replicas(&mut inv, "/X", "S2", &["b1", "b2"], "prod");
    inv
}

fn handler(overwritten: &[&str]) -> CopyRequestsHandler {
    let mut config = CopyRequestsConfig::new(500.0, 0.8);
    config.overwritten_groups = overwritten.iter().map(|s| (*s).to_owned()).collect();
    CopyRequestsHandler::with_seed(config, 42)
}

#[test]
fn two_copies_with_partial_existence_and_reown() {
    // scenario: num_copies=2; the full copy under an overwritable group is
    // re-owned, the partial copy under a protected group is skipped, and
    // one fresh copy goes to a policy-chosen empty site
    let dir = tempfile::tempdir().unwrap();
    let inv = scenario_inventory();
    let mut registry = RequestRegistry::open(dir.path()).unwrap();
    let request_id = registry
        .create_request("G_new", 2, &["S1", "S2", "S3", "S4"], &["/X"])
        .unwrap();

    let mut handler = handler(&["G_over"]);
    let policy = QuotaPolicy::new("global");
    let proposals = handler
        .get_requests(&mut registry, &inv, &policy)
        .unwrap();

    assert_eq!(
        registry.request(request_id).unwrap().status,
        RequestStatus::Activated
    );

    let new_rows: Vec<_> = registry
        .active_copies
        .iter()
        .filter(|row| row.status == CopyStatus::New)
        .collect();
    assert_eq!(new_rows.len(), 2);
    assert!(new_rows.iter().all(|row| row.item == "/X"));
    assert!(new_rows.iter().any(|row| row.site == "S1"), "re-own at S1");
    assert!(
        new_rows
            .iter()
            .any(|row| row.site == "S3" || row.site == "S4"),
        "fresh copy at an empty site"
    );
    assert!(new_rows.iter().all(|row| row.site != "S2"), "S2 skipped");

    // both placements are whole-dataset proposals
    assert_eq!(proposals.len(), 2);
    assert!(proposals.iter().all(|p| p.dataset == "/X" && p.blocks.is_none()));
}

#[test]
fn oversized_dataset_is_rejected() {
    // scenario: an 800 TB dataset against a 500 TB ceiling
    let dir = tempfile::tempdir().unwrap();
    let mut inv = scenario_inventory();
    add_dataset(&mut inv, "/Y", &[("big", 800 * TB)]);

    let mut registry = RequestRegistry::open(dir.path()).unwrap();
    let request_id = registry
        .create_request("G_new", 1, &["S3"], &["/Y"])
        .unwrap();

    let mut handler = handler(&[]);
    let proposals = handler
        .get_requests(&mut registry, &inv, &QuotaPolicy::new("global"))
        .unwrap();

    assert!(proposals.is_empty());
    let row = registry.request(request_id).unwrap();
    assert_eq!(row.status, RequestStatus::Rejected);
    assert_eq!(
        row.rejection_reason.as_deref(),
        Some("Dataset /Y is too large (>500 TB)")
    );
}

#[test]
fn large_block_list_promotes_to_dataset() {
    // scenario: 9 of 10 blocks requested, 90 TB > 100 TB x 0.8: the request
    // becomes a whole-dataset placement
    let dir = tempfile::tempdir().unwrap();
    let mut inv = scenario_inventory();
    let blocks: Vec<(String, u64)> = (0..10).map(|i| (format!("b{}", i), 10 * TB)).collect();
    let block_refs: Vec<(&str, u64)> = blocks.iter().map(|(n, s)| (n.as_str(), *s)).collect();
    add_dataset(&mut inv, "/Z", &block_refs);

    let mut registry = RequestRegistry::open(dir.path()).unwrap();
    let items: Vec<String> = (0..9).map(|i| format!("/Z#b{}", i)).collect();
    let item_refs: Vec<&str> = items.iter().map(String::as_str).collect();
    let request_id = registry
        .create_request("G_new", 1, &["S3"], &item_refs)
        .unwrap();

    let mut handler = handler(&[]);
    let proposals = handler
        .get_requests(&mut registry, &inv, &QuotaPolicy::new("global"))
        .unwrap();

    assert_eq!(
        registry.request(request_id).unwrap().status,
        RequestStatus::Activated
    );

    // one dataset-level activation row, not nine block rows
    let new_rows: Vec<_> = registry
        .active_copies
        .iter()
        .filter(|row| row.status == CopyStatus::New)
        .collect();
    assert_eq!(new_rows.len(), 1);
    assert_eq!(new_rows[0].item, "/Z");
    assert_eq!(new_rows[0].site, "S3");

    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].dataset, "/Z");
    assert!(proposals[0].blocks.is_none());
}

#[test]
fn unknown_names_reject_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let inv = scenario_inventory();
    let mut registry = RequestRegistry::open(dir.path()).unwrap();

    let bad_group = registry
        .create_request("nonesuch", 1, &["S3"], &["/X"])
        .unwrap();
    let bad_dataset = registry
        .create_request("G_new", 1, &["S3"], &["/missing"])
        .unwrap();
    let bad_block = registry
        .create_request("G_new", 1, &["S3"], &["/X#nope"])
        .unwrap();
    let bad_sites = registry
        .create_request("G_new", 1, &["T9_*"], &["/X"])
        .unwrap();

    let mut handler = handler(&[]);
    handler
        .get_requests(&mut registry, &inv, &QuotaPolicy::new("global"))
        .unwrap();

    for (id, reason) in [
        (bad_group, "Invalid group name nonesuch"),
        (bad_dataset, "Dataset /missing not found"),
        (bad_block, "Block /X#nope not found"),
        (bad_sites, "No valid site name in list"),
    ] {
        let row = registry.request(id).unwrap();
        assert_eq!(row.status, RequestStatus::Rejected);
        assert_eq!(row.rejection_reason.as_deref(), Some(reason));
    }
}

#[test]
fn site_patterns_resolve_against_policy_targets() {
    let dir = tempfile::tempdir().unwrap();
    let inv = scenario_inventory();
    let mut registry = RequestRegistry::open(dir.path()).unwrap();
    // copy to every site, one copy each (num_copies = 0)
    let request_id = registry.create_request("G_new", 0, &["S*"], &["/X"]).unwrap();

    let mut handler = handler(&[]);
    let proposals = handler
        .get_requests(&mut registry, &inv, &QuotaPolicy::new("global"))
        .unwrap();

    assert_eq!(
        registry.request(request_id).unwrap().status,
        RequestStatus::Activated
    );
    // nothing fully exists under G_new anywhere: all four sites get a copy
    assert_eq!(proposals.len(), 4);
}

#[test]
fn inflight_copies_are_reproposed_and_queued() {
    let dir = tempfile::tempdir().unwrap();
    let inv = scenario_inventory();
    let mut registry = RequestRegistry::open(dir.path()).unwrap();

    // left over from a cycle whose proposal was not accepted
    registry
        .insert_active_copy(7, "/X#b1", "S3", CopyStatus::New)
        .unwrap();
    // its dataset has vanished: marked failed
    registry
        .insert_active_copy(8, "/gone", "S3", CopyStatus::New)
        .unwrap();

    let mut handler = handler(&[]);
    let proposals = handler
        .get_requests(&mut registry, &inv, &QuotaPolicy::new("global"))
        .unwrap();

    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].dataset, "/X");
    assert_eq!(proposals[0].blocks.as_deref(), Some(&["b1".to_owned()][..]));
    assert_eq!(proposals[0].destination.as_deref(), Some("S3"));

    let failed = registry
        .active_copies
        .get(&(8, "/gone".to_owned(), "S3".to_owned()))
        .unwrap();
    assert_eq!(failed.status, CopyStatus::Failed);

    // the transfer back end accepts: the row moves to queued
    handler.postprocess(&mut registry, &proposals).unwrap();
    let row = registry
        .active_copies
        .get(&(7, "/X#b1".to_owned(), "S3".to_owned()))
        .unwrap();
    assert_eq!(row.status, CopyStatus::Queued);
}
