#![forbid(unsafe_code)]

pub mod config;
pub mod container;
pub mod error;
pub mod escrow_cache;
pub mod preflight;
pub mod remote;
pub mod trust_graph;
pub mod voucher_dedup;

#[cfg(test)]
pub(crate) mod test_support;
