//! Dealer errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DealerError {
    #[error(transparent)]
    Store(#[from] fleet_inventory::StoreError),

    #[error(transparent)]
    Object(#[from] fleet_inventory::ObjectError),
}
