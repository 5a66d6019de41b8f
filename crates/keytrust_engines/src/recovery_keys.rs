#![forbid(unsafe_code)]

use keytrust_kernel_contracts::peer::{CustodianRecoveryKey, PeerId};
use keytrust_kernel_contracts::ContractViolation;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crypto::{CryptoError, CryptoProvider, DerivedKeyMaterial, SigningKeyPair};

pub const RECOVERY_KEY_PEER_PREFIX: &str = "RK-";
pub const CUSTODIAN_PEER_PREFIX: &str = "CRK-";

const RECOVERY_KEY_GROUP_LEN: usize = 4;
const MIN_RECOVERY_KEY_GROUPS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecoveryKeyError {
    #[error("recovery key is malformed")]
    MalformedRecoveryKey,
    #[error("recovery string is empty")]
    EmptyRecoveryString,
    #[error("key derivation failed: {0}")]
    Derivation(CryptoError),
    #[error("derived keys do not match the enrolled custodian key")]
    KeyMismatch,
    #[error("contract violation: {0}")]
    Contract(ContractViolation),
}

impl From<CryptoError> for RecoveryKeyError {
    fn from(e: CryptoError) -> Self {
        RecoveryKeyError::Derivation(e)
    }
}

impl From<ContractViolation> for RecoveryKeyError {
    fn from(v: ContractViolation) -> Self {
        RecoveryKeyError::Contract(v)
    }
}

/// Uppercases and strips the `-` separators; at least six four-character alphanumeric groups.
pub fn normalize_recovery_key(raw: &str) -> Result<String, RecoveryKeyError> {
    let groups: Vec<&str> = raw.trim().split('-').collect();
    if groups.len() < MIN_RECOVERY_KEY_GROUPS {
        return Err(RecoveryKeyError::MalformedRecoveryKey);
    }
    let well_formed = groups.iter().all(|g| {
        g.len() == RECOVERY_KEY_GROUP_LEN && g.chars().all(|c| c.is_ascii_alphanumeric())
    });
    if !well_formed {
        return Err(RecoveryKeyError::MalformedRecoveryKey);
    }
    Ok(groups.concat().to_ascii_uppercase())
}

fn derived_peer_id(
    prefix: &str,
    signing_public_key: &[u8],
    encryption_public_key: &[u8],
) -> Result<PeerId, ContractViolation> {
    let mut hasher = Sha256::new();
    hasher.update(signing_public_key);
    hasher.update(encryption_public_key);
    let hex: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    PeerId::new(format!("{prefix}{hex}"))
}

/// Keys and peer ID derived from the account recovery key. Never persisted.
#[derive(Debug)]
pub struct RecoveryKeySet {
    pub peer_id: PeerId,
    material: DerivedKeyMaterial,
}

impl RecoveryKeySet {
    pub fn derive<C: CryptoProvider + ?Sized>(
        crypto: &C,
        recovery_key: &str,
        salt: &str,
    ) -> Result<Self, RecoveryKeyError> {
        let normalized = normalize_recovery_key(recovery_key)?;
        let material = crypto.derive_key_material(&normalized, salt)?;
        let peer_id = derived_peer_id(
            RECOVERY_KEY_PEER_PREFIX,
            &material.signing.public_key(),
            &material.encryption_public_key(),
        )?;
        Ok(Self { peer_id, material })
    }

    pub fn signing_public_key(&self) -> Vec<u8> {
        self.material.signing.public_key()
    }

    pub fn encryption_public_key(&self) -> Vec<u8> {
        self.material.encryption_public_key()
    }

    pub fn signing_keys(&self) -> &SigningKeyPair {
        &self.material.signing
    }
}

#[derive(Debug)]
pub struct CustodianKeySet {
    pub uuid: Uuid,
    pub peer_id: PeerId,
    material: DerivedKeyMaterial,
}

impl CustodianKeySet {
    pub fn derive<C: CryptoProvider + ?Sized>(
        crypto: &C,
        uuid: Uuid,
        recovery_string: &str,
        salt: &str,
    ) -> Result<Self, RecoveryKeyError> {
        if recovery_string.trim().is_empty() {
            return Err(RecoveryKeyError::EmptyRecoveryString);
        }
        let material = crypto.derive_key_material(recovery_string, salt)?;
        let peer_id = derived_peer_id(
            CUSTODIAN_PEER_PREFIX,
            &material.signing.public_key(),
            &material.encryption_public_key(),
        )?;
        Ok(Self {
            uuid,
            peer_id,
            material,
        })
    }

    /// Derives the key set and checks it reproduces the enrolled public material.
    pub fn derive_for<C: CryptoProvider + ?Sized>(
        crypto: &C,
        enrolled: &CustodianRecoveryKey,
        recovery_string: &str,
        salt: &str,
    ) -> Result<Self, RecoveryKeyError> {
        let set = Self::derive(crypto, enrolled.uuid, recovery_string, salt)?;
        if set.signing_public_key() != enrolled.signing_public_key
            || set.encryption_public_key() != enrolled.encryption_public_key
            || set.peer_id != enrolled.peer_id
        {
            return Err(RecoveryKeyError::KeyMismatch);
        }
        Ok(set)
    }

    pub fn signing_public_key(&self) -> Vec<u8> {
        self.material.signing.public_key()
    }

    pub fn encryption_public_key(&self) -> Vec<u8> {
        self.material.encryption_public_key()
    }

    pub fn signing_keys(&self) -> &SigningKeyPair {
        &self.material.signing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Crypto;
    use keytrust_kernel_contracts::peer::CustodianRecoveryKeyKind;

    const KEY: &str = "ABCD-EFGH-IJKL-MNOP-QRST-UVWX-YZ23";

    #[test]
    fn at_rk_01_normalization_accepts_grouped_keys_case_insensitively() {
        assert_eq!(
            normalize_recovery_key(&KEY.to_ascii_lowercase()).unwrap(),
            normalize_recovery_key(KEY).unwrap()
        );
        assert_eq!(
            normalize_recovery_key("ABCD-EFGH"),
            Err(RecoveryKeyError::MalformedRecoveryKey)
        );
        assert_eq!(
            normalize_recovery_key("ABCD-EFGH-IJKL-MNOP-QRST-UV!X"),
            Err(RecoveryKeyError::MalformedRecoveryKey)
        );
        assert_eq!(
            normalize_recovery_key(""),
            Err(RecoveryKeyError::MalformedRecoveryKey)
        );
    }

    #[test]
    fn at_rk_02_recovery_key_set_is_deterministic_per_salt() {
        let crypto = Ed25519Crypto;
        let a = RecoveryKeySet::derive(&crypto, KEY, "altdsid-1").unwrap();
        let b = RecoveryKeySet::derive(&crypto, &KEY.to_ascii_lowercase(), "altdsid-1").unwrap();
        let c = RecoveryKeySet::derive(&crypto, KEY, "altdsid-2").unwrap();
        assert_eq!(a.peer_id, b.peer_id);
        assert!(a.peer_id.as_str().starts_with(RECOVERY_KEY_PEER_PREFIX));
        assert_ne!(a.peer_id, c.peer_id);
        assert_eq!(a.signing_public_key(), b.signing_public_key());
    }

    #[test]
    fn at_rk_03_custodian_keys_must_match_enrollment() {
        let crypto = Ed25519Crypto;
        let uuid = Uuid::from_u128(0x5a1d_0000_0000_4000_8000_0000_0000_0001);
        let set = CustodianKeySet::derive(&crypto, uuid, "custodian secret", "salt").unwrap();
        let enrolled = CustodianRecoveryKey::v1(
            uuid,
            set.peer_id.clone(),
            PeerId::new("SHA256:enroller").unwrap(),
            set.signing_public_key(),
            set.encryption_public_key(),
            CustodianRecoveryKeyKind::RecoveryKey,
        )
        .unwrap();

        assert!(CustodianKeySet::derive_for(&crypto, &enrolled, "custodian secret", "salt").is_ok());
        assert_eq!(
            CustodianKeySet::derive_for(&crypto, &enrolled, "wrong secret", "salt").unwrap_err(),
            RecoveryKeyError::KeyMismatch
        );
        assert_eq!(
            CustodianKeySet::derive(&crypto, uuid, "   ", "salt").unwrap_err(),
            RecoveryKeyError::EmptyRecoveryString
        );
    }
}
