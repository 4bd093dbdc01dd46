//! Dealer cycle driver.

use fleet_inventory::Inventory;

use crate::copy_requests::CopyRequestsHandler;
use crate::policy::DealerPolicy;
use crate::request::DealerRequest;
use crate::tables::RequestRegistry;

/// Wires the request registry, the copy-request handler, and the policy into
/// one per-cycle entry point. A handler failure rejects only the cycle's
/// remaining work; the dealer itself keeps running.
pub struct Dealer {
    registry: RequestRegistry,
    handler: CopyRequestsHandler,
    policy: Box<dyn DealerPolicy>,
}

impl Dealer {
    pub fn new(
        registry: RequestRegistry,
        handler: CopyRequestsHandler,
        policy: Box<dyn DealerPolicy>,
    ) -> Self {
        Self {
            registry,
            handler,
            policy,
        }
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RequestRegistry {
        &mut self.registry
    }

    /// Evaluates the pending requests against the inventory and returns the
    /// cycle's placement proposal.
    pub fn run_cycle(&mut self, inventory: &Inventory) -> Vec<DealerRequest> {
        match self
            .handler
            .get_requests(&mut self.registry, inventory, self.policy.as_ref())
        {
            Ok(proposals) => {
                if !proposals.is_empty() {
                    tracing::info!("Dealer cycle proposed {} placements", proposals.len());
                }
                proposals
            }
            Err(err) => {
                tracing::error!("Dealer cycle failed: {}", err);
                Vec::new()
            }
        }
    }

    /// Records the placements the transfer back end accepted.
    pub fn postprocess(&mut self, accepted: &[DealerRequest]) {
        if let Err(err) = self.handler.postprocess(&mut self.registry, accepted) {
            tracing::error!("Dealer post-processing failed: {}", err);
        }
    }
}
