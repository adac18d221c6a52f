#![forbid(unsafe_code)]

pub mod address;
pub mod common;
pub mod grant;
pub mod redemption;
pub mod registry;
pub mod transfer;

pub use address::Address;
pub use common::{amount_string, Amount, ContractViolation, SchemaVersion, UnixTimeSec, Validate};
