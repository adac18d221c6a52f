#![forbid(unsafe_code)]

pub mod journal;
pub mod repo;
pub mod store;

pub use store::{ClaimId, PeriodClaim, PeriodClaimRequest, PeriodKey, PulseStore, StorageError};
