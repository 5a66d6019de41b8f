#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::common::validate_token;
use crate::policy::{PolicyVersion, UserControllableViewStatus};
use crate::{ContractViolation, SchemaVersion, UnixTimeSecs, Validate};

pub const PEER_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const ED25519_PUBLIC_KEY_LEN: usize = 32;
pub const ED25519_SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PeerId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("peer_id", &self.0, 128)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw signed content exactly as it was received, plus the detached signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedBlob {
    pub data: Vec<u8>,
    pub sig: Vec<u8>,
}

impl SignedBlob {
    pub fn new(data: Vec<u8>, sig: Vec<u8>) -> Self {
        Self { data, sig }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentInfo {
    pub schema_version: SchemaVersion,
    pub peer_id: PeerId,
    pub machine_id: String,
    pub model_id: String,
    pub epoch: u64,
    pub signing_public_key: Vec<u8>,
    pub encryption_public_key: Vec<u8>,
    pub creation_time: UnixTimeSecs,
}

impl PermanentInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        peer_id: PeerId,
        machine_id: String,
        model_id: String,
        epoch: u64,
        signing_public_key: Vec<u8>,
        encryption_public_key: Vec<u8>,
        creation_time: UnixTimeSecs,
    ) -> Result<Self, ContractViolation> {
        let info = Self {
            schema_version: PEER_CONTRACT_VERSION,
            peer_id,
            machine_id,
            model_id,
            epoch,
            signing_public_key,
            encryption_public_key,
            creation_time,
        };
        info.validate()?;
        Ok(info)
    }
}

impl Validate for PermanentInfo {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.peer_id.validate()?;
        validate_token("permanent_info.machine_id", &self.machine_id, 128)?;
        validate_token("permanent_info.model_id", &self.model_id, 64)?;
        if self.signing_public_key.len() != ED25519_PUBLIC_KEY_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "permanent_info.signing_public_key",
                reason: "must be 32 bytes",
            });
        }
        if self.encryption_public_key.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "permanent_info.encryption_public_key",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableInfo {
    pub schema_version: SchemaVersion,
    pub clock: u64,
    /// Highest policy version this peer is able to evaluate.
    pub policy_version: PolicyVersion,
    /// Redaction keys, by redaction name.
    pub policy_secrets: BTreeMap<String, Vec<u8>>,
    pub os_version: String,
    pub serial_number: String,
    pub is_inherited_account: bool,
    pub sync_user_controllable_views: Option<UserControllableViewStatus>,
    pub recovery_signing_public_key: Option<Vec<u8>>,
    pub recovery_encryption_public_key: Option<Vec<u8>>,
}

impl StableInfo {
    pub fn v1(
        clock: u64,
        policy_version: PolicyVersion,
        os_version: String,
        serial_number: String,
        is_inherited_account: bool,
    ) -> Result<Self, ContractViolation> {
        let info = Self {
            schema_version: PEER_CONTRACT_VERSION,
            clock,
            policy_version,
            policy_secrets: BTreeMap::new(),
            os_version,
            serial_number,
            is_inherited_account,
            sync_user_controllable_views: None,
            recovery_signing_public_key: None,
            recovery_encryption_public_key: None,
        };
        info.validate()?;
        Ok(info)
    }

    pub fn with_recovery_keys(mut self, signing: Vec<u8>, encryption: Vec<u8>) -> Self {
        self.recovery_signing_public_key = Some(signing);
        self.recovery_encryption_public_key = Some(encryption);
        self
    }

    pub fn with_sync_user_controllable_views(mut self, status: UserControllableViewStatus) -> Self {
        self.sync_user_controllable_views = Some(status);
        self
    }

    pub fn with_policy_secret(mut self, name: impl Into<String>, key: Vec<u8>) -> Self {
        self.policy_secrets.insert(name.into(), key);
        self
    }

    pub fn has_recovery_key(&self) -> bool {
        matches!(
            (
                &self.recovery_signing_public_key,
                &self.recovery_encryption_public_key
            ),
            (Some(s), Some(e)) if !s.is_empty() && !e.is_empty()
        )
    }

    pub fn trusts_recovery_key(&self, signing_public_key: &[u8], encryption_public_key: &[u8]) -> bool {
        self.has_recovery_key()
            && self.recovery_signing_public_key.as_deref() == Some(signing_public_key)
            && self.recovery_encryption_public_key.as_deref() == Some(encryption_public_key)
    }
}

impl Validate for StableInfo {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.policy_version.validate()?;
        if self.os_version.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "stable_info.os_version",
                reason: "must be <= 64 chars",
            });
        }
        if self.serial_number.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "stable_info.serial_number",
                reason: "must be <= 64 chars",
            });
        }
        if self.recovery_signing_public_key.is_some() != self.recovery_encryption_public_key.is_some()
        {
            return Err(ContractViolation::InvalidValue {
                field: "stable_info.recovery_keys",
                reason: "signing and encryption recovery keys must be set together",
            });
        }
        for name in self.policy_secrets.keys() {
            validate_token("stable_info.policy_secrets", name, 64)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicInfo {
    pub schema_version: SchemaVersion,
    pub clock: u64,
    pub included_peer_ids: BTreeSet<PeerId>,
    pub excluded_peer_ids: BTreeSet<PeerId>,
}

impl DynamicInfo {
    pub fn v1(
        clock: u64,
        included_peer_ids: BTreeSet<PeerId>,
        excluded_peer_ids: BTreeSet<PeerId>,
    ) -> Result<Self, ContractViolation> {
        let info = Self {
            schema_version: PEER_CONTRACT_VERSION,
            clock,
            included_peer_ids,
            excluded_peer_ids,
        };
        info.validate()?;
        Ok(info)
    }

    pub fn includes(&self, peer_id: &PeerId) -> bool {
        self.included_peer_ids.contains(peer_id) && !self.excluded_peer_ids.contains(peer_id)
    }
}

impl Validate for DynamicInfo {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self
            .included_peer_ids
            .iter()
            .any(|p| self.excluded_peer_ids.contains(p))
        {
            return Err(ContractViolation::InvalidValue {
                field: "dynamic_info.included_peer_ids",
                reason: "must be disjoint from excluded_peer_ids",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoucherReason {
    SecureChannel,
    Restore,
    RecoveryKey,
    CustodianRecoveryKey,
    InheritanceKey,
    Upgrade,
}

/// Lowercase hex SHA-256 of a voucher's raw signed content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoucherDigest(String);

impl VoucherDigest {
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Equality and hashing follow the raw signed content, not the peer IDs inside it.
#[derive(Debug, Clone)]
pub struct Voucher {
    pub beneficiary_id: PeerId,
    pub sponsor_id: PeerId,
    pub reason: VoucherReason,
    pub signed: SignedBlob,
}

impl Voucher {
    pub fn canonical_digest(&self) -> VoucherDigest {
        VoucherDigest::of(&self.signed.data)
    }
}

impl PartialEq for Voucher {
    fn eq(&self, other: &Self) -> bool {
        self.signed.data == other.signed.data
    }
}

impl Eq for Voucher {}

impl std::hash::Hash for Voucher {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.signed.data.hash(state);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CustodianRecoveryKeyKind {
    RecoveryKey,
    InheritanceKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianRecoveryKey {
    pub uuid: Uuid,
    /// The custodian's own pseudo-peer in the graph, derived from its key material.
    pub peer_id: PeerId,
    pub enrolled_by: PeerId,
    pub signing_public_key: Vec<u8>,
    pub encryption_public_key: Vec<u8>,
    pub kind: CustodianRecoveryKeyKind,
}

impl CustodianRecoveryKey {
    pub fn v1(
        uuid: Uuid,
        peer_id: PeerId,
        enrolled_by: PeerId,
        signing_public_key: Vec<u8>,
        encryption_public_key: Vec<u8>,
        kind: CustodianRecoveryKeyKind,
    ) -> Result<Self, ContractViolation> {
        let crk = Self {
            uuid,
            peer_id,
            enrolled_by,
            signing_public_key,
            encryption_public_key,
            kind,
        };
        crk.validate()?;
        Ok(crk)
    }
}

impl Validate for CustodianRecoveryKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.peer_id.validate()?;
        self.enrolled_by.validate()?;
        if self.uuid.is_nil() {
            return Err(ContractViolation::InvalidValue {
                field: "custodian_recovery_key.uuid",
                reason: "must not be nil",
            });
        }
        if self.signing_public_key.len() != ED25519_PUBLIC_KEY_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "custodian_recovery_key.signing_public_key",
                reason: "must be 32 bytes",
            });
        }
        if self.encryption_public_key.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "custodian_recovery_key.encryption_public_key",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(data: &[u8]) -> SignedBlob {
        SignedBlob::new(data.to_vec(), vec![7; ED25519_SIGNATURE_LEN])
    }

    #[test]
    fn at_peer_01_voucher_equality_follows_raw_content() {
        let a = Voucher {
            beneficiary_id: PeerId::new("peer-b").unwrap(),
            sponsor_id: PeerId::new("peer-a").unwrap(),
            reason: VoucherReason::SecureChannel,
            signed: signed(b"same-bytes"),
        };
        let mut b = a.clone();
        b.beneficiary_id = PeerId::new("peer-c").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical_digest(), b.canonical_digest());

        let mut c = a.clone();
        c.signed = signed(b"other-bytes");
        assert_ne!(a, c);
    }

    #[test]
    fn at_peer_02_peer_id_rejects_empty_and_non_ascii() {
        assert!(PeerId::new("").is_err());
        assert!(PeerId::new("  ").is_err());
        assert!(PeerId::new("pe\u{e9}r").is_err());
        assert!(PeerId::new("SHA256:abc").is_ok());
    }

    #[test]
    fn at_peer_03_dynamic_info_honours_exclusions() {
        let a = PeerId::new("a").unwrap();
        let b = PeerId::new("b").unwrap();
        let info = DynamicInfo::v1(3, [a.clone()].into(), [b.clone()].into()).unwrap();
        assert!(info.includes(&a));
        assert!(!info.includes(&b));
        assert!(DynamicInfo::v1(3, [a.clone()].into(), [a].into()).is_err());
    }

    #[test]
    fn at_peer_04_recovery_keys_must_be_set_together() {
        let mut info =
            StableInfo::v1(1, PolicyVersion::new(5, "SHA256:x").unwrap(), "17".into(), "S".into(), false)
                .unwrap();
        assert!(!info.has_recovery_key());
        info.recovery_signing_public_key = Some(vec![1; 32]);
        assert!(info.validate().is_err());
        let info = info.with_recovery_keys(vec![1; 32], vec![2; 32]);
        assert!(info.trusts_recovery_key(&[1; 32], &[2; 32]));
        assert!(!info.trusts_recovery_key(&[1; 32], &[3; 32]));
    }
}
