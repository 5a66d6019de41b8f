#![forbid(unsafe_code)]

pub mod crypto;
pub mod identity_codec;
pub mod policy_eval;
pub mod recovery_keys;
