#![forbid(unsafe_code)]

//! Signed peer-info and voucher blobs.
//!
//! Every blob is canonical JSON signed with Ed25519. Permanent info is self-signed and its
//! SHA-256 names the peer; stable and dynamic info are signed by the owning peer's permanent
//! signing key; vouchers are signed by the sponsor.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keytrust_kernel_contracts::peer::{
    DynamicInfo, PeerId, PermanentInfo, SignedBlob, StableInfo, Voucher, VoucherReason,
    ED25519_SIGNATURE_LEN, PEER_CONTRACT_VERSION,
};
use keytrust_kernel_contracts::policy::{PolicyVersion, UserControllableViewStatus};
use keytrust_kernel_contracts::{ContractViolation, UnixTimeSecs, Validate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{CryptoError, CryptoProvider, SigningKeyPair};

pub const PEER_ID_HASH_PREFIX: &str = "SHA256:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid signature: {0}")]
    InvalidSignature(CryptoError),
    #[error("malformed blob: {0}")]
    Malformed(String),
    #[error("peer id mismatch: filed as {filed}, content hashes to {derived}")]
    PeerIdMismatch { filed: PeerId, derived: PeerId },
    #[error("contract violation: {0}")]
    Contract(ContractViolation),
}

impl From<ContractViolation> for CodecError {
    fn from(v: ContractViolation) -> Self {
        CodecError::Contract(v)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Malformed(e.to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct PermanentInfoContent {
    machine_id: String,
    model_id: String,
    epoch: u64,
    signing_public_key: Vec<u8>,
    encryption_public_key: Vec<u8>,
    creation_time: u64,
}

#[derive(Serialize, Deserialize)]
struct StableInfoContent {
    clock: u64,
    policy_version: PolicyVersion,
    policy_secrets: BTreeMap<String, Vec<u8>>,
    os_version: String,
    serial_number: String,
    is_inherited_account: bool,
    sync_user_controllable_views: Option<UserControllableViewStatus>,
    recovery_signing_public_key: Option<Vec<u8>>,
    recovery_encryption_public_key: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct DynamicInfoContent {
    clock: u64,
    included_peer_ids: BTreeSet<PeerId>,
    excluded_peer_ids: BTreeSet<PeerId>,
}

#[derive(Serialize, Deserialize)]
struct VoucherContent {
    beneficiary_id: PeerId,
    sponsor_id: PeerId,
    reason: VoucherReason,
}

/// Content-addressed peer ID for a permanent info blob.
pub fn peer_id_for_permanent_info(data: &[u8]) -> Result<PeerId, ContractViolation> {
    PeerId::new(format!(
        "{PEER_ID_HASH_PREFIX}{}",
        BASE64.encode(Sha256::digest(data))
    ))
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityCodec<'a, C: CryptoProvider + ?Sized> {
    crypto: &'a C,
}

impl<'a, C: CryptoProvider + ?Sized> IdentityCodec<'a, C> {
    pub fn new(crypto: &'a C) -> Self {
        Self { crypto }
    }

    pub fn parse_permanent_info(
        &self,
        peer_id: &PeerId,
        blob: &SignedBlob,
    ) -> Result<PermanentInfo, CodecError> {
        let derived = peer_id_for_permanent_info(&blob.data)?;
        if &derived != peer_id {
            return Err(CodecError::PeerIdMismatch {
                filed: peer_id.clone(),
                derived,
            });
        }
        let content: PermanentInfoContent = serde_json::from_slice(&blob.data)?;
        self.crypto
            .verify(&content.signing_public_key, &blob.data, &blob.sig)
            .map_err(CodecError::InvalidSignature)?;
        Ok(PermanentInfo::v1(
            derived,
            content.machine_id,
            content.model_id,
            content.epoch,
            content.signing_public_key,
            content.encryption_public_key,
            UnixTimeSecs(content.creation_time),
        )?)
    }

    pub fn parse_stable_info(
        &self,
        blob: &SignedBlob,
        signer: &PermanentInfo,
    ) -> Result<StableInfo, CodecError> {
        self.verify_against(signer, blob)?;
        let content: StableInfoContent = serde_json::from_slice(&blob.data)?;
        let info = StableInfo {
            schema_version: PEER_CONTRACT_VERSION,
            clock: content.clock,
            policy_version: content.policy_version,
            policy_secrets: content.policy_secrets,
            os_version: content.os_version,
            serial_number: content.serial_number,
            is_inherited_account: content.is_inherited_account,
            sync_user_controllable_views: content.sync_user_controllable_views,
            recovery_signing_public_key: content.recovery_signing_public_key,
            recovery_encryption_public_key: content.recovery_encryption_public_key,
        };
        info.validate()?;
        Ok(info)
    }

    pub fn parse_dynamic_info(
        &self,
        blob: &SignedBlob,
        signer: &PermanentInfo,
    ) -> Result<DynamicInfo, CodecError> {
        self.verify_against(signer, blob)?;
        let content: DynamicInfoContent = serde_json::from_slice(&blob.data)?;
        for peer_id in content
            .included_peer_ids
            .iter()
            .chain(content.excluded_peer_ids.iter())
        {
            peer_id.validate()?;
        }
        Ok(DynamicInfo::v1(
            content.clock,
            content.included_peer_ids,
            content.excluded_peer_ids,
        )?)
    }

    /// Decodes a voucher. The sponsor signature is checked by [`Self::verify_voucher`].
    pub fn parse_voucher(&self, blob: &SignedBlob) -> Result<Voucher, CodecError> {
        if blob.sig.len() != ED25519_SIGNATURE_LEN {
            return Err(CodecError::Malformed(format!(
                "voucher signature must be {ED25519_SIGNATURE_LEN} bytes, got {}",
                blob.sig.len()
            )));
        }
        let content: VoucherContent = serde_json::from_slice(&blob.data)?;
        content.beneficiary_id.validate()?;
        content.sponsor_id.validate()?;
        Ok(Voucher {
            beneficiary_id: content.beneficiary_id,
            sponsor_id: content.sponsor_id,
            reason: content.reason,
            signed: blob.clone(),
        })
    }

    pub fn verify_voucher(
        &self,
        voucher: &Voucher,
        sponsor: &PermanentInfo,
    ) -> Result<(), CodecError> {
        if voucher.sponsor_id != sponsor.peer_id {
            return Err(CodecError::Malformed(format!(
                "voucher names sponsor {} but was checked against {}",
                voucher.sponsor_id, sponsor.peer_id
            )));
        }
        self.verify_against(sponsor, &voucher.signed)
    }

    fn verify_against(&self, signer: &PermanentInfo, blob: &SignedBlob) -> Result<(), CodecError> {
        self.crypto
            .verify(&signer.signing_public_key, &blob.data, &blob.sig)
            .map_err(CodecError::InvalidSignature)
    }
}

fn sign_content<T: Serialize>(signer: &SigningKeyPair, content: &T) -> Result<SignedBlob, CodecError> {
    let data = serde_json::to_vec(content)?;
    let sig = signer.sign(&data);
    Ok(SignedBlob::new(data, sig))
}

/// Builds a self-signed permanent info blob and the peer ID it hashes to.
pub fn encode_permanent_info(
    signer: &SigningKeyPair,
    machine_id: &str,
    model_id: &str,
    epoch: u64,
    encryption_public_key: &[u8],
    creation_time: UnixTimeSecs,
) -> Result<(PeerId, SignedBlob), CodecError> {
    let blob = sign_content(
        signer,
        &PermanentInfoContent {
            machine_id: machine_id.to_string(),
            model_id: model_id.to_string(),
            epoch,
            signing_public_key: signer.public_key(),
            encryption_public_key: encryption_public_key.to_vec(),
            creation_time: creation_time.0,
        },
    )?;
    let peer_id = peer_id_for_permanent_info(&blob.data)?;
    Ok((peer_id, blob))
}

pub fn encode_stable_info(
    signer: &SigningKeyPair,
    info: &StableInfo,
) -> Result<SignedBlob, CodecError> {
    info.validate()?;
    sign_content(
        signer,
        &StableInfoContent {
            clock: info.clock,
            policy_version: info.policy_version.clone(),
            policy_secrets: info.policy_secrets.clone(),
            os_version: info.os_version.clone(),
            serial_number: info.serial_number.clone(),
            is_inherited_account: info.is_inherited_account,
            sync_user_controllable_views: info.sync_user_controllable_views,
            recovery_signing_public_key: info.recovery_signing_public_key.clone(),
            recovery_encryption_public_key: info.recovery_encryption_public_key.clone(),
        },
    )
}

pub fn encode_dynamic_info(
    signer: &SigningKeyPair,
    info: &DynamicInfo,
) -> Result<SignedBlob, CodecError> {
    info.validate()?;
    sign_content(
        signer,
        &DynamicInfoContent {
            clock: info.clock,
            included_peer_ids: info.included_peer_ids.clone(),
            excluded_peer_ids: info.excluded_peer_ids.clone(),
        },
    )
}

pub fn encode_voucher(
    sponsor_signer: &SigningKeyPair,
    sponsor_id: &PeerId,
    beneficiary_id: &PeerId,
    reason: VoucherReason,
) -> Result<SignedBlob, CodecError> {
    sign_content(
        sponsor_signer,
        &VoucherContent {
            beneficiary_id: beneficiary_id.clone(),
            sponsor_id: sponsor_id.clone(),
            reason,
        },
    )
}
