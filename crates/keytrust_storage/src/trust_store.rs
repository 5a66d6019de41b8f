#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keytrust_kernel_contracts::escrow::{BottleId, EscrowRecordStatus, ViabilityTier};
use keytrust_kernel_contracts::peer::{CustodianRecoveryKey, PeerId, SignedBlob, VoucherDigest};
use keytrust_kernel_contracts::policy::{PolicyDocument, PolicyVersion};
use keytrust_kernel_contracts::{ContractViolation, Validate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("row not found in {table}: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("contract violation: {0}")]
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRow {
    pub peer_id: PeerId,
    pub permanent_info: SignedBlob,
    pub stable_info: Option<SignedBlob>,
    pub dynamic_info: Option<SignedBlob>,
}

impl PeerRow {
    pub fn v1(
        peer_id: PeerId,
        permanent_info: SignedBlob,
        stable_info: Option<SignedBlob>,
        dynamic_info: Option<SignedBlob>,
    ) -> Result<Self, ContractViolation> {
        peer_id.validate()?;
        if permanent_info.data.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "peer_row.permanent_info",
                reason: "must not be empty",
            });
        }
        Ok(Self {
            peer_id,
            permanent_info,
            stable_info,
            dynamic_info,
        })
    }
}

/// A voucher filed under the peer it admits. Keyed by `(filed_under, digest)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherRow {
    pub filed_under: PeerId,
    pub digest: VoucherDigest,
    pub voucher: SignedBlob,
}

/// The local device's prepared identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgoIdentityRow {
    pub peer_id: PeerId,
    pub permanent_info: SignedBlob,
    pub stable_info: Option<SignedBlob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleRow {
    pub bottle_id: BottleId,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowClientMetadataRow {
    pub secure_backup_metadata_timestamp_secs: u64,
    pub secure_backup_numeric_passphrase_length: u64,
    pub secure_backup_uses_complex_passphrase: bool,
    pub secure_backup_uses_numeric_passphrase: bool,
    pub device_color: String,
    pub device_enclosure_color: String,
    pub device_mid: String,
    pub device_model: String,
    pub device_model_class: String,
    pub device_model_version: String,
    pub device_name: String,
    pub device_platform: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowMetadataRow {
    pub backup_keybag_digest: Vec<u8>,
    pub bottle_id: String,
    pub escrowed_spki: Vec<u8>,
    pub peer_info: Vec<u8>,
    pub serial: String,
    pub build: String,
    pub passcode_generation: Option<u64>,
    pub secure_backup_usable_timestamp_secs: u64,
    pub secure_backup_timestamp_secs: u64,
    pub client_metadata: EscrowClientMetadataRow,
}

/// Stored escrow record. The tier column is assigned at insert time and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecordRow {
    pub row_id: u64,
    pub tier: ViabilityTier,
    pub creation_date_secs: u64,
    pub remaining_attempts: u64,
    pub label: String,
    pub record_id: String,
    pub silent_attempt_allowed: bool,
    pub record_status: EscrowRecordStatus,
    pub sos_viability_code: i32,
    pub federation_id: String,
    pub expected_federation_id: String,
    pub metadata: EscrowMetadataRow,
}

/// Escrow row as handed to [`TrustStore::append_escrow_record`]; the store assigns id and tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowRecordRowInput {
    pub creation_date_secs: u64,
    pub remaining_attempts: u64,
    pub label: String,
    pub record_id: String,
    pub silent_attempt_allowed: bool,
    pub record_status: EscrowRecordStatus,
    pub sos_viability_code: i32,
    pub federation_id: String,
    pub expected_federation_id: String,
    pub metadata: EscrowMetadataRow,
}

#[derive(Debug, Clone)]
pub struct TrustStore {
    peers: BTreeMap<PeerId, PeerRow>,
    // (filed_under, canonical digest) -> voucher.
    vouchers: BTreeMap<(PeerId, VoucherDigest), VoucherRow>,
    // UUIDs are not unique on their own: (uuid, custodian peer id) -> key.
    custodian_recovery_keys: BTreeMap<(Uuid, PeerId), CustodianRecoveryKey>,
    policy_documents: BTreeMap<PolicyVersion, PolicyDocument>,
    ego_identity: Option<EgoIdentityRow>,
    bottles: BTreeMap<BottleId, BottleRow>,

    // Escrow cache: one table with a tier column, plus an append-ordered index per tier.
    escrow_records: BTreeMap<u64, EscrowRecordRow>,
    escrow_tier_index: BTreeMap<ViabilityTier, Vec<u64>>,
    next_escrow_row_id: u64,
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl TrustStore {
    pub fn new_in_memory() -> Self {
        Self {
            peers: BTreeMap::new(),
            vouchers: BTreeMap::new(),
            custodian_recovery_keys: BTreeMap::new(),
            policy_documents: BTreeMap::new(),
            ego_identity: None,
            bottles: BTreeMap::new(),
            escrow_records: BTreeMap::new(),
            escrow_tier_index: BTreeMap::new(),
            next_escrow_row_id: 1,
        }
    }

    /// Runs `f` against a working copy and commits it only if `f` returns `Ok`.
    pub fn transaction<T, E>(
        &mut self,
        f: impl FnOnce(&mut TrustStore) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut working = self.clone();
        let out = f(&mut working)?;
        *self = working;
        Ok(out)
    }

    pub fn insert_peer(&mut self, row: PeerRow) -> Result<(), StorageError> {
        row.peer_id.validate()?;
        if self.peers.contains_key(&row.peer_id) {
            return Err(StorageError::DuplicateKey {
                table: "peers",
                key: row.peer_id.to_string(),
            });
        }
        self.peers.insert(row.peer_id.clone(), row);
        Ok(())
    }

    pub fn update_peer_stable_info(
        &mut self,
        peer_id: &PeerId,
        stable_info: SignedBlob,
    ) -> Result<(), StorageError> {
        let row = self.peer_row_mut(peer_id, "peers.stable_info")?;
        row.stable_info = Some(stable_info);
        Ok(())
    }

    pub fn update_peer_dynamic_info(
        &mut self,
        peer_id: &PeerId,
        dynamic_info: SignedBlob,
    ) -> Result<(), StorageError> {
        let row = self.peer_row_mut(peer_id, "peers.dynamic_info")?;
        row.dynamic_info = Some(dynamic_info);
        Ok(())
    }

    fn peer_row_mut(
        &mut self,
        peer_id: &PeerId,
        table: &'static str,
    ) -> Result<&mut PeerRow, StorageError> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| StorageError::NotFound {
                table,
                key: peer_id.to_string(),
            })
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerRow> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, PeerRow> {
        &self.peers
    }

    pub fn insert_voucher(
        &mut self,
        filed_under: &PeerId,
        voucher: SignedBlob,
    ) -> Result<VoucherDigest, StorageError> {
        if !self.peers.contains_key(filed_under) {
            return Err(StorageError::ForeignKeyViolation {
                table: "vouchers.filed_under",
                key: filed_under.to_string(),
            });
        }
        let digest = VoucherDigest::of(&voucher.data);
        let key = (filed_under.clone(), digest.clone());
        if self.vouchers.contains_key(&key) {
            return Err(StorageError::DuplicateKey {
                table: "vouchers",
                key: format!("{filed_under}/{}", digest.as_str()),
            });
        }
        self.vouchers.insert(
            key,
            VoucherRow {
                filed_under: filed_under.clone(),
                digest: digest.clone(),
                voucher,
            },
        );
        Ok(digest)
    }

    pub fn remove_voucher(
        &mut self,
        filed_under: &PeerId,
        digest: &VoucherDigest,
    ) -> Result<VoucherRow, StorageError> {
        self.vouchers
            .remove(&(filed_under.clone(), digest.clone()))
            .ok_or_else(|| StorageError::NotFound {
                table: "vouchers",
                key: format!("{filed_under}/{}", digest.as_str()),
            })
    }

    /// Refiles a voucher under another peer. A voucher belongs to exactly one peer, so the
    /// source row is always removed; if the target already holds identical content the source
    /// is simply dropped.
    pub fn move_voucher(
        &mut self,
        from: &PeerId,
        digest: &VoucherDigest,
        to: &PeerId,
    ) -> Result<(), StorageError> {
        if !self.peers.contains_key(to) {
            return Err(StorageError::ForeignKeyViolation {
                table: "vouchers.filed_under",
                key: to.to_string(),
            });
        }
        let mut row = self.remove_voucher(from, digest)?;
        let key = (to.clone(), digest.clone());
        if self.vouchers.contains_key(&key) {
            return Ok(());
        }
        row.filed_under = to.clone();
        self.vouchers.insert(key, row);
        Ok(())
    }

    pub fn vouchers(&self) -> &BTreeMap<(PeerId, VoucherDigest), VoucherRow> {
        &self.vouchers
    }

    pub fn vouchers_filed_under(&self, peer_id: &PeerId) -> Vec<&VoucherRow> {
        self.vouchers
            .values()
            .filter(|row| &row.filed_under == peer_id)
            .collect()
    }

    pub fn insert_custodian_recovery_key(
        &mut self,
        crk: CustodianRecoveryKey,
    ) -> Result<(), StorageError> {
        crk.validate()?;
        if !self.peers.contains_key(&crk.enrolled_by) {
            return Err(StorageError::ForeignKeyViolation {
                table: "custodian_recovery_keys.enrolled_by",
                key: crk.enrolled_by.to_string(),
            });
        }
        let key = (crk.uuid, crk.peer_id.clone());
        if self.custodian_recovery_keys.contains_key(&key) {
            return Err(StorageError::DuplicateKey {
                table: "custodian_recovery_keys",
                key: format!("{}/{}", crk.uuid, crk.peer_id),
            });
        }
        self.custodian_recovery_keys.insert(key, crk);
        Ok(())
    }

    pub fn custodian_recovery_keys(&self) -> impl Iterator<Item = &CustodianRecoveryKey> {
        self.custodian_recovery_keys.values()
    }

    pub fn upsert_policy_document(&mut self, doc: PolicyDocument) -> Result<(), StorageError> {
        doc.validate()?;
        self.policy_documents.insert(doc.version.clone(), doc);
        Ok(())
    }

    pub fn policy_document(&self, version: &PolicyVersion) -> Option<&PolicyDocument> {
        self.policy_documents.get(version)
    }

    pub fn policy_documents(&self) -> &BTreeMap<PolicyVersion, PolicyDocument> {
        &self.policy_documents
    }

    pub fn set_ego_identity(&mut self, row: EgoIdentityRow) -> Result<(), StorageError> {
        row.peer_id.validate()?;
        self.ego_identity = Some(row);
        Ok(())
    }

    pub fn ego_identity(&self) -> Option<&EgoIdentityRow> {
        self.ego_identity.as_ref()
    }

    pub fn insert_bottle(&mut self, row: BottleRow) -> Result<(), StorageError> {
        row.bottle_id.validate()?;
        if self.bottles.contains_key(&row.bottle_id) {
            return Err(StorageError::DuplicateKey {
                table: "bottles",
                key: row.bottle_id.as_str().to_string(),
            });
        }
        self.bottles.insert(row.bottle_id.clone(), row);
        Ok(())
    }

    pub fn bottles(&self) -> &BTreeMap<BottleId, BottleRow> {
        &self.bottles
    }

    /// Append-only: existing escrow rows are never touched.
    pub fn append_escrow_record(
        &mut self,
        tier: ViabilityTier,
        input: EscrowRecordRowInput,
    ) -> Result<u64, StorageError> {
        if input.label.trim().is_empty() {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "escrow_record_row.label",
                    reason: "must not be empty",
                },
            ));
        }
        let row_id = self.next_escrow_row_id;
        self.next_escrow_row_id = self.next_escrow_row_id.saturating_add(1);
        self.escrow_records.insert(
            row_id,
            EscrowRecordRow {
                row_id,
                tier,
                creation_date_secs: input.creation_date_secs,
                remaining_attempts: input.remaining_attempts,
                label: input.label,
                record_id: input.record_id,
                silent_attempt_allowed: input.silent_attempt_allowed,
                record_status: input.record_status,
                sos_viability_code: input.sos_viability_code,
                federation_id: input.federation_id,
                expected_federation_id: input.expected_federation_id,
                metadata: input.metadata,
            },
        );
        self.escrow_tier_index.entry(tier).or_default().push(row_id);
        Ok(row_id)
    }

    pub fn escrow_rows_for_tier(&self, tier: ViabilityTier) -> Vec<&EscrowRecordRow> {
        self.escrow_tier_index
            .get(&tier)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.escrow_records.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn escrow_rows(&self) -> &BTreeMap<u64, EscrowRecordRow> {
        &self.escrow_records
    }

    /// SHA-256 over the peer, voucher, custodian key and escrow tables.
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        // Rows hold only string-keyed maps and plain fields, so serialization cannot fail.
        let mut feed = |table: &str, json: serde_json::Result<Vec<u8>>| {
            hasher.update(table.as_bytes());
            hasher.update(json.unwrap_or_default());
        };
        feed("peers", serde_json::to_vec(&self.peers.values().collect::<Vec<_>>()));
        feed(
            "vouchers",
            serde_json::to_vec(&self.vouchers.values().collect::<Vec<_>>()),
        );
        feed(
            "custodian_recovery_keys",
            serde_json::to_vec(&self.custodian_recovery_keys.values().collect::<Vec<_>>()),
        );
        feed(
            "escrow_records",
            serde_json::to_vec(&self.escrow_records.values().collect::<Vec<_>>()),
        );
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}
