//! Copy-request evaluation.
//!
//! Turns pending rows of the request tables into validated, deduplicated
//! `(item, destination, group)` placements, respecting quotas, proposals
//! already in flight, the ownership-override list, and size ceilings.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use fleet_inventory::dataformat::Block;
use fleet_inventory::glob::glob_match;
use fleet_inventory::Inventory;

use crate::error::DealerError;
use crate::policy::DealerPolicy;
use crate::request::{DealerRequest, Existence};
use crate::tables::{ActiveCopyRow, CopyStatus, RequestRegistry, RequestStatus};

const TERA: f64 = 1e12;

/// Working set of one cycle: site -> dataset -> proposed blocks.
type BlocksToPropose = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

#[derive(Debug, Clone)]
pub struct CopyRequestsConfig {
    /// Maximum bytes one request may ask for
    pub max_size: u64,
    /// Block-list requests above this fraction of the dataset size are
    /// promoted to whole-dataset requests
    pub block_request_max: f64,
    /// Groups whose ownership a request may take over
    pub overwritten_groups: Vec<String>,
}

impl CopyRequestsConfig {
    pub fn new(max_size_tb: f64, block_request_max: f64) -> Self {
        Self {
            max_size: (max_size_tb * TERA) as u64,
            block_request_max,
            overwritten_groups: Vec::new(),
        }
    }

    fn max_size_tb(&self) -> f64 {
        self.max_size as f64 / TERA
    }
}

/// Processes direct transfer requests made to the registry.
pub struct CopyRequestsHandler {
    config: CopyRequestsConfig,
    rng: StdRng,
}

/// One pending request grouped from the three tables.
#[derive(Debug)]
struct Pending {
    group: String,
    num_copies: u32,
    sites: Vec<String>,
    items: Vec<String>,
}

impl CopyRequestsHandler {
    pub fn new(config: CopyRequestsConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic site shuffling for tests.
    pub fn with_seed(config: CopyRequestsConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One evaluation cycle.
    ///
    /// 1. Re-enqueue `new` active copies into the working set.
    /// 2. Collect pending requests.
    /// 3. Validate group, sites, and items of each request.
    /// 4. Apply the size gates and block-list promotion.
    /// 5. Assign destinations.
    /// 6. Record activations; mark the request activated.
    /// 7. Flatten the working set into the cycle's proposal.
    pub fn get_requests(
        &mut self,
        registry: &mut RequestRegistry,
        inventory: &Inventory,
        policy: &dyn DealerPolicy,
    ) -> Result<Vec<DealerRequest>, DealerError> {
        let mut blocks_to_propose: BlocksToPropose = BTreeMap::new();

        self.requeue_active_copies(registry, inventory, &mut blocks_to_propose)?;

        // group pending rows by request id
        let mut pending: BTreeMap<u64, Pending> = BTreeMap::new();
        for row in registry.copy_requests.iter() {
            if row.status == RequestStatus::New {
                pending.insert(
                    row.id,
                    Pending {
                        group: row.group.clone(),
                        num_copies: row.num_copies,
                        sites: Vec::new(),
                        items: Vec::new(),
                    },
                );
            }
        }
        for row in registry.copy_request_sites.iter() {
            if let Some(entry) = pending.get_mut(&row.request_id) {
                entry.sites.push(row.site.clone());
            }
        }
        for row in registry.copy_request_items.iter() {
            if let Some(entry) = pending.get_mut(&row.request_id) {
                entry.items.push(row.item.clone());
            }
        }

        let target_sites = policy.target_sites(inventory);

        'requests: for (request_id, request) in pending {
            if !inventory.groups.contains_key(&request.group) {
                registry.reject_request(
                    request_id,
                    format!("Invalid group name {}", request.group),
                )?;
                continue;
            }

            // resolve site literals and patterns against the policy targets
            let mut sites: Vec<String> = Vec::new();
            for name in &request.sites {
                if name.contains('*') || name.contains('?') {
                    for target in &target_sites {
                        if glob_match(name, target) && !sites.contains(target) {
                            sites.push(target.clone());
                        }
                    }
                } else if target_sites.contains(name) && !sites.contains(name) {
                    sites.push(name.clone());
                }
            }
            if sites.is_empty() {
                registry.reject_request(request_id, "No valid site name in list".to_owned())?;
                continue;
            }
            sites.shuffle(&mut self.rng);

            // resolve items; sorting clusters the blocks of one dataset
            let mut item_names = request.items.clone();
            item_names.sort();

            // (dataset, None) is a whole-dataset item
            let mut items: Vec<(String, Option<Vec<String>>)> = Vec::new();
            let mut current_dataset = String::new();
            for item_name in &item_names {
                match Block::from_full_name(item_name) {
                    Err(_) => {
                        current_dataset.clear();
                        if !inventory.datasets.contains_key(item_name) {
                            registry.reject_request(
                                request_id,
                                format!("Dataset {} not found", item_name),
                            )?;
                            continue 'requests;
                        }
                        items.push((item_name.clone(), None));
                    }
                    Ok((dataset_name, block_name)) => {
                        if dataset_name != current_dataset {
                            if !inventory.datasets.contains_key(dataset_name) {
                                registry.reject_request(
                                    request_id,
                                    format!("Dataset {} not found", dataset_name),
                                )?;
                                continue 'requests;
                            }
                            current_dataset = dataset_name.to_owned();
                            items.push((dataset_name.to_owned(), Some(Vec::new())));
                        }
                        let dataset = &inventory.datasets[dataset_name];
                        if dataset.find_block(block_name).is_none() {
                            registry.reject_request(
                                request_id,
                                format!("Block {} not found", item_name),
                            )?;
                            continue 'requests;
                        }
                        if let Some((_, Some(blocks))) = items.last_mut() {
                            blocks.push(block_name.to_owned());
                        }
                    }
                }
            }

            // size gates; an oversized block list becomes a dataset request
            let mut protos: Vec<DealerRequest> = Vec::new();
            for (dataset_name, blocks) in items {
                let dataset = &inventory.datasets[&dataset_name];
                match blocks {
                    None => {
                        if dataset.size() > self.config.max_size {
                            registry.reject_request(
                                request_id,
                                format!(
                                    "Dataset {} is too large (>{:.0} TB)",
                                    dataset_name,
                                    self.config.max_size_tb()
                                ),
                            )?;
                            continue 'requests;
                        }
                        protos.push(
                            DealerRequest::dataset_level(dataset_name)
                                .with_group(request.group.clone()),
                        );
                    }
                    Some(block_names) => {
                        let total: u64 = block_names
                            .iter()
                            .filter_map(|name| dataset.blocks.get(name))
                            .map(|block| block.size)
                            .sum();
                        if total > self.config.max_size {
                            registry.reject_request(
                                request_id,
                                format!(
                                    "Request size for {} too large (>{:.0} TB)",
                                    dataset_name,
                                    self.config.max_size_tb()
                                ),
                            )?;
                            continue 'requests;
                        }
                        let proto = if total as f64
                            > dataset.size() as f64 * self.config.block_request_max
                        {
                            // large enough to just copy the dataset
                            DealerRequest::dataset_level(dataset_name)
                        } else {
                            DealerRequest::block_level(dataset_name, block_names)
                        };
                        protos.push(proto.with_group(request.group.clone()));
                    }
                }
            }

            // find destinations for each item
            let mut new_requests: Vec<DealerRequest> = Vec::new();
            let mut completed_requests: Vec<DealerRequest> = Vec::new();

            for proto in &protos {
                if request.num_copies == 0 {
                    // one copy at each requested site
                    for destination in &sites {
                        let dealer_request = proto.with_destination(destination);
                        if dealer_request.existence_at(inventory, destination) == Existence::Full
                        {
                            completed_requests.push(dealer_request);
                        } else if policy
                            .check_destination(inventory, &dealer_request, destination)
                            .is_some()
                        {
                            registry.reject_request(
                                request_id,
                                format!(
                                    "Cannot copy {} to {}",
                                    proto.item_name(),
                                    destination
                                ),
                            )?;
                            continue 'requests;
                        } else {
                            new_requests.push(dealer_request);
                        }
                    }
                    continue;
                }

                // total of num_copies copies; sites already holding the item
                // come first, preserving the shuffle within each class
                let with_existence: Vec<(&String, Existence)> = sites
                    .iter()
                    .map(|site| (site, proto.existence_at(inventory, site)))
                    .collect();
                let ordered = with_existence
                    .iter()
                    .filter(|(_, existence)| *existence != Existence::None)
                    .chain(
                        with_existence
                            .iter()
                            .filter(|(_, existence)| *existence == Existence::None),
                    );

                let mut candidate_sites: Vec<String> = Vec::new();
                let mut num_new = request.num_copies;

                for (destination, existence) in ordered {
                    if num_new == 0 {
                        break;
                    }
                    let dealer_request = proto.with_destination(destination);

                    // copies proposed by other requests count as complete
                    if let Some(proposed) = blocks_to_propose
                        .get(destination.as_str())
                        .and_then(|by_dataset| by_dataset.get(&proto.dataset))
                    {
                        let covered = match &proto.blocks {
                            Some(blocks) => blocks.iter().all(|b| proposed.contains(b)),
                            None => {
                                let full: BTreeSet<String> = inventory.datasets
                                    [&proto.dataset]
                                    .blocks
                                    .keys()
                                    .cloned()
                                    .collect();
                                *proposed == full
                            }
                        };
                        if covered {
                            num_new -= 1;
                            completed_requests.push(dealer_request);
                            continue;
                        }
                    }

                    match existence {
                        Existence::Full => {
                            num_new -= 1;
                            completed_requests.push(dealer_request);
                        }
                        Existence::Partial => {
                            // flip the ownership when the sole owner may be
                            // overwritten, otherwise leave the site alone
                            if let Some(Some(owner)) = proto.sole_owner(inventory, destination)
                            {
                                if self.config.overwritten_groups.contains(&owner) {
                                    new_requests.push(dealer_request);
                                    num_new -= 1;
                                }
                            }
                        }
                        Existence::None => candidate_sites.push((*destination).clone()),
                    }
                }

                // fill the shortfall from the candidate pool
                for copy_index in 0..num_new {
                    match policy.find_destination_for(inventory, proto, &candidate_sites) {
                        None => {
                            registry.reject_request(
                                request_id,
                                format!(
                                    "Destination {} for {} not available",
                                    copy_index,
                                    proto.item_name()
                                ),
                            )?;
                            continue 'requests;
                        }
                        Some(destination) => {
                            candidate_sites.retain(|site| site != &destination);
                            new_requests.push(proto.with_destination(&destination));
                        }
                    }
                }
            }

            // record the activations and merge into the working set
            for dealer_request in &new_requests {
                let destination = dealer_request
                    .destination
                    .as_deref()
                    .expect("destination assigned");
                for item in dealer_request.item_rows() {
                    registry.insert_active_copy(request_id, &item, destination, CopyStatus::New)?;
                }
                let blocks = blocks_to_propose
                    .entry(destination.to_owned())
                    .or_default()
                    .entry(dealer_request.dataset.clone())
                    .or_default();
                match &dealer_request.blocks {
                    Some(list) => blocks.extend(list.iter().cloned()),
                    None => blocks.extend(
                        inventory.datasets[&dealer_request.dataset]
                            .blocks
                            .keys()
                            .cloned(),
                    ),
                }
            }
            for dealer_request in &completed_requests {
                let destination = dealer_request
                    .destination
                    .as_deref()
                    .expect("destination assigned");
                for item in dealer_request.item_rows() {
                    registry.insert_active_copy(
                        request_id,
                        &item,
                        destination,
                        CopyStatus::Completed,
                    )?;
                }
            }
            registry.activate_request(request_id)?;
        }

        // flatten the working set into the final proposal
        let mut proposals = Vec::new();
        for (site, by_dataset) in blocks_to_propose {
            for (dataset_name, blocks) in by_dataset {
                let full: BTreeSet<String> = inventory
                    .datasets
                    .get(&dataset_name)
                    .map(|d| d.blocks.keys().cloned().collect())
                    .unwrap_or_default();
                let mut request = if blocks == full {
                    DealerRequest::dataset_level(dataset_name)
                } else {
                    DealerRequest::block_level(dataset_name, blocks.into_iter().collect())
                };
                request.destination = Some(site.clone());
                proposals.push(request);
            }
        }
        Ok(proposals)
    }

    /// Step 1: active copies still `new` were not queued in the last cycle
    /// and re-enter the working set; rows whose item or site vanished fail.
    fn requeue_active_copies(
        &self,
        registry: &mut RequestRegistry,
        inventory: &Inventory,
        blocks_to_propose: &mut BlocksToPropose,
    ) -> Result<(), DealerError> {
        let mut rows: Vec<ActiveCopyRow> = registry
            .active_copies
            .iter()
            .filter(|row| row.status == CopyStatus::New)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.site, &a.item).cmp(&(&b.site, &b.item)));

        for row in rows {
            if !inventory.sites.contains_key(&row.site) {
                registry.fail_active_copy(row.request_id, &row.item, &row.site)?;
                continue;
            }
            match Block::from_full_name(&row.item) {
                Ok((dataset_name, block_name)) => {
                    let Some(dataset) = inventory.datasets.get(dataset_name) else {
                        registry.fail_active_copy(row.request_id, &row.item, &row.site)?;
                        continue;
                    };
                    if dataset.find_block(block_name).is_none() {
                        registry.fail_active_copy(row.request_id, &row.item, &row.site)?;
                        continue;
                    }
                    blocks_to_propose
                        .entry(row.site.clone())
                        .or_default()
                        .entry(dataset_name.to_owned())
                        .or_default()
                        .insert(block_name.to_owned());
                }
                Err(_) => {
                    let Some(dataset) = inventory.datasets.get(&row.item) else {
                        registry.fail_active_copy(row.request_id, &row.item, &row.site)?;
                        continue;
                    };
                    blocks_to_propose
                        .entry(row.site.clone())
                        .or_default()
                        .entry(row.item.clone())
                        .or_default()
                        .extend(dataset.blocks.keys().cloned());
                }
            }
        }
        Ok(())
    }

    /// Post-processing after the transfer back end accepts the proposal:
    /// matching `new` active copies move to `queued`.
    pub fn postprocess(
        &self,
        registry: &mut RequestRegistry,
        accepted: &[DealerRequest],
    ) -> Result<(), DealerError> {
        for request in accepted {
            let Some(site) = request.destination.as_deref() else {
                continue;
            };
            registry.queue_active_copies(&request.dataset, site)?;
        }
        Ok(())
    }
}
