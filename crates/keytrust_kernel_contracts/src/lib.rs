#![forbid(unsafe_code)]

pub mod common;
pub mod escrow;
pub mod peer;
pub mod policy;

pub use common::{ContractViolation, SchemaVersion, UnixTimeSecs, Validate};
