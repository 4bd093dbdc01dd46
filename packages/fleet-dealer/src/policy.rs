//! Placement policy seam.

use fleet_inventory::dataformat::SiteStatus;
use fleet_inventory::Inventory;

use crate::request::DealerRequest;

/// Decides which sites may receive data and where shortfall copies go.
pub trait DealerPolicy: Send {
    /// Active partition of this cycle.
    fn partition_name(&self) -> &str;

    /// Sites eligible as copy destinations.
    fn target_sites(&self, inventory: &Inventory) -> Vec<String>;

    /// Refusal reason for placing `request` at `site`, or `None` to accept.
    fn check_destination(
        &self,
        inventory: &Inventory,
        request: &DealerRequest,
        site: &str,
    ) -> Option<String>;

    /// Picks a destination from `candidates` for a shortfall copy.
    fn find_destination_for(
        &self,
        inventory: &Inventory,
        request: &DealerRequest,
        candidates: &[String],
    ) -> Option<String>;
}

/// Quota-headroom policy: ready sites are targets, a placement must fit the
/// site's quota in the active partition, and shortfall copies go to the
/// candidate with the most headroom.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub partition: String,
}

impl QuotaPolicy {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
        }
    }

    /// Free bytes at a site under the active partition; `None` is unlimited.
    fn headroom(&self, inventory: &Inventory, site: &str) -> Option<i64> {
        let site_obj = inventory.sites.get(site)?;
        let quota = site_obj
            .partition_quota(&inventory.partitions, &self.partition)
            .ok()?;
        if quota < 0 {
            return None;
        }
        let usage = inventory
            .site_partition_usage(site, &self.partition)
            .unwrap_or(0);
        Some(quota - usage as i64)
    }
}

impl DealerPolicy for QuotaPolicy {
    fn partition_name(&self) -> &str {
        &self.partition
    }

    fn target_sites(&self, inventory: &Inventory) -> Vec<String> {
        let mut sites: Vec<String> = inventory
            .sites
            .values()
            .filter(|site| site.status == SiteStatus::Ready)
            .map(|site| site.name.clone())
            .collect();
        sites.sort();
        sites
    }

    fn check_destination(
        &self,
        inventory: &Inventory,
        request: &DealerRequest,
        site: &str,
    ) -> Option<String> {
        let needed = request.size(inventory) as i64;
        match self.headroom(inventory, site) {
            None => None,
            Some(headroom) if headroom >= needed => None,
            Some(headroom) => Some(format!(
                "Site {} has {} bytes of quota left in partition {}, {} needed",
                site, headroom, self.partition, needed
            )),
        }
    }

    fn find_destination_for(
        &self,
        inventory: &Inventory,
        request: &DealerRequest,
        candidates: &[String],
    ) -> Option<String> {
        candidates
            .iter()
            .filter(|site| self.check_destination(inventory, request, site).is_none())
            .max_by_key(|site| self.headroom(inventory, site).unwrap_or(i64::MAX))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_inventory::dataformat::{
        BlockRecord, DatasetRecord, PartitionRecord, ReplicaCondition, SiteRecord,
        SitePartitionRecord, StorageType,
    };
    use fleet_inventory::Entity;

    fn site_record(name: &str, status: SiteStatus) -> SiteRecord {
        SiteRecord {
            name: name.to_owned(),
            host: String::new(),
            storage_type: StorageType::Disk,
            backend: String::new(),
            status,
        }
    }

    #[test]
    fn only_ready_sites_are_targets() {
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
        inv.update(&Entity::Site(site_record("S1", SiteStatus::Ready)), false)
            .unwrap();
        inv.update(&Entity::Site(site_record("S2", SiteStatus::Morgue)), false)
            .unwrap();

        let policy = QuotaPolicy::new("global");
        assert_eq!(policy.target_sites(&inv), vec!["S1".to_owned()]);
    }

    #[test]
    fn quota_gates_and_headroom_choice() {
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
        for (name, quota) in [("S1", 50i64), ("S2", 500), ("S3", -1)] {
            inv.update(&Entity::Site(site_record(name, SiteStatus::Ready)), false)
                .unwrap();
            inv.update(
                &Entity::SitePartition(SitePartitionRecord {
                    site: name.to_owned(),
                    partition: "global".to_owned(),
                    quota,
                }),
                false,
            )
            .unwrap();
        }
        inv.update(&Entity::Dataset(DatasetRecord::named("/d")), false)
            .unwrap();
        inv.update(
            &Entity::Block(BlockRecord {
                dataset: "/d".to_owned(),
                name: "b1".to_owned(),
                size: 100,
                num_files: 1,
                is_open: false,
                last_update: 0,
            }),
            false,
        )
        .unwrap();

        let policy = QuotaPolicy::new("global");
        let request = DealerRequest::dataset_level("/d");

        // 100 bytes do not fit a 50-byte quota
        assert!(policy.check_destination(&inv, &request, "S1").is_some());
        assert!(policy.check_destination(&inv, &request, "S2").is_none());
        // unlimited quota always fits
        assert!(policy.check_destination(&inv, &request, "S3").is_none());

        let candidates = vec!["S1".to_owned(), "S2".to_owned(), "S3".to_owned()];
        let chosen = policy
            .find_destination_for(&inv, &request, &candidates)
            .unwrap();
        assert_eq!(chosen, "S3");
    }
}
