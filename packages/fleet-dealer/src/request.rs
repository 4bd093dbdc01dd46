//! Placement proposals handed to the transfer back end.

use std::collections::HashSet;

use fleet_inventory::dataformat::Block;
use fleet_inventory::Inventory;

/// How much of an item already sits at a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    None,
    Partial,
    Full,
}

/// An `(item, destination, group)` triple; the item is a whole dataset or a
/// block list of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DealerRequest {
    pub dataset: String,
    /// `None` proposes the whole dataset
    pub blocks: Option<Vec<String>>,
    pub destination: Option<String>,
    pub group: Option<String>,
}

impl DealerRequest {
    pub fn dataset_level(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            blocks: None,
            destination: None,
            group: None,
        }
    }

    pub fn block_level(dataset: impl Into<String>, blocks: Vec<String>) -> Self {
        Self {
            dataset: dataset.into(),
            blocks: Some(blocks),
            destination: None,
            group: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_destination(&self, destination: &str) -> Self {
        let mut request = self.clone();
        request.destination = Some(destination.to_owned());
        request
    }

    /// Name used in operator-facing messages.
    pub fn item_name(&self) -> &str {
        &self.dataset
    }

    /// Item names as stored in `active_copies` rows.
    pub fn item_rows(&self) -> Vec<String> {
        match &self.blocks {
            None => vec![self.dataset.clone()],
            Some(blocks) => blocks
                .iter()
                .map(|b| Block::full_name(&self.dataset, b))
                .collect(),
        }
    }

    /// Requested bytes.
    pub fn size(&self, inventory: &Inventory) -> u64 {
        let Some(dataset) = inventory.datasets.get(&self.dataset) else {
            return 0;
        };
        match &self.blocks {
            None => dataset.size(),
            Some(blocks) => blocks
                .iter()
                .filter_map(|name| dataset.blocks.get(name))
                .map(|block| block.size)
                .sum(),
        }
    }

    /// Existence level of the item at a site. Full means every requested
    /// block has a complete replica there owned by the requested group; a
    /// copy under a different owner (or an incomplete one) is only partial,
    /// which is what makes ownership flips possible.
    pub fn existence_at(&self, inventory: &Inventory, site: &str) -> Existence {
        let Some(dataset) = inventory.datasets.get(&self.dataset) else {
            return Existence::None;
        };
        let Some(replica) = dataset.replicas.get(site) else {
            return Existence::None;
        };

        let requested: Vec<&str> = match &self.blocks {
            None => dataset.blocks.keys().map(String::as_str).collect(),
            Some(blocks) => blocks.iter().map(String::as_str).collect(),
        };

        let mut present = 0usize;
        let mut satisfied = 0usize;
        for name in &requested {
            if let Some(br) = replica.block_replicas.get(*name) {
                present += 1;
                if br.is_complete && br.group == self.group {
                    satisfied += 1;
                }
            }
        }

        if present == 0 {
            Existence::None
        } else if satisfied == requested.len() {
            Existence::Full
        } else {
            Existence::Partial
        }
    }

    /// The single group owning every present replica of the item at a site;
    /// `None` when nothing is present or ownership is split. The inner
    /// `Option` is the owner itself (`None` = unowned).
    pub fn sole_owner(
        &self,
        inventory: &Inventory,
        site: &str,
    ) -> Option<Option<String>> {
        let dataset = inventory.datasets.get(&self.dataset)?;
        let replica = dataset.replicas.get(site)?;

        let requested: Vec<&str> = match &self.blocks {
            None => dataset.blocks.keys().map(String::as_str).collect(),
            Some(blocks) => blocks.iter().map(String::as_str).collect(),
        };

        let mut owners: HashSet<Option<&str>> = HashSet::new();
        for name in requested {
            if let Some(br) = replica.block_replicas.get(name) {
                owners.insert(br.group.as_deref());
            }
        }

        if owners.len() == 1 {
            owners
                .into_iter()
                .next()
                .map(|owner| owner.map(str::to_owned))
        } else {
            None
        }
    }
}
