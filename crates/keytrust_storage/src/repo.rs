#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keytrust_kernel_contracts::escrow::{BottleId, ViabilityTier};
use keytrust_kernel_contracts::peer::{CustodianRecoveryKey, PeerId, SignedBlob, VoucherDigest};
use keytrust_kernel_contracts::policy::{PolicyDocument, PolicyVersion};

use crate::trust_store::{
    BottleRow, EgoIdentityRow, EscrowRecordRow, EscrowRecordRowInput, PeerRow, StorageError,
    TrustStore, VoucherRow,
};

/// Typed repository interface for the peer/voucher trust graph tables.
pub trait TrustGraphRepo {
    fn insert_peer_row(&mut self, row: PeerRow) -> Result<(), StorageError>;
    fn update_peer_stable_info_row(
        &mut self,
        peer_id: &PeerId,
        stable_info: SignedBlob,
    ) -> Result<(), StorageError>;
    fn update_peer_dynamic_info_row(
        &mut self,
        peer_id: &PeerId,
        dynamic_info: SignedBlob,
    ) -> Result<(), StorageError>;
    fn peer_row(&self, peer_id: &PeerId) -> Option<&PeerRow>;
    fn peer_rows(&self) -> &BTreeMap<PeerId, PeerRow>;

    fn insert_voucher_row(
        &mut self,
        filed_under: &PeerId,
        voucher: SignedBlob,
    ) -> Result<VoucherDigest, StorageError>;
    fn remove_voucher_row(
        &mut self,
        filed_under: &PeerId,
        digest: &VoucherDigest,
    ) -> Result<VoucherRow, StorageError>;
    fn move_voucher_row(
        &mut self,
        from: &PeerId,
        digest: &VoucherDigest,
        to: &PeerId,
    ) -> Result<(), StorageError>;
    fn voucher_rows(&self) -> &BTreeMap<(PeerId, VoucherDigest), VoucherRow>;

    fn insert_custodian_recovery_key_row(
        &mut self,
        crk: CustodianRecoveryKey,
    ) -> Result<(), StorageError>;
    fn custodian_recovery_key_rows(&self) -> Vec<&CustodianRecoveryKey>;

    fn upsert_policy_document_row(&mut self, doc: PolicyDocument) -> Result<(), StorageError>;
    fn policy_document_rows(&self) -> &BTreeMap<PolicyVersion, PolicyDocument>;

    fn set_ego_identity_row(&mut self, row: EgoIdentityRow) -> Result<(), StorageError>;
    fn ego_identity_row(&self) -> Option<&EgoIdentityRow>;
}

/// Typed repository interface for escrow viability tiers and local bottles.
pub trait EscrowCacheRepo {
    fn append_escrow_record_row(
        &mut self,
        tier: ViabilityTier,
        input: EscrowRecordRowInput,
    ) -> Result<u64, StorageError>;
    fn escrow_tier_rows(&self, tier: ViabilityTier) -> Vec<&EscrowRecordRow>;

    fn insert_bottle_row(&mut self, row: BottleRow) -> Result<(), StorageError>;
    fn bottle_rows(&self) -> &BTreeMap<BottleId, BottleRow>;
    fn ego_peer_id(&self) -> Option<&PeerId>;
}

impl TrustGraphRepo for TrustStore {
    fn insert_peer_row(&mut self, row: PeerRow) -> Result<(), StorageError> {
        self.insert_peer(row)
    }

    fn update_peer_stable_info_row(
        &mut self,
        peer_id: &PeerId,
        stable_info: SignedBlob,
    ) -> Result<(), StorageError> {
        self.update_peer_stable_info(peer_id, stable_info)
    }

    fn update_peer_dynamic_info_row(
        &mut self,
        peer_id: &PeerId,
        dynamic_info: SignedBlob,
    ) -> Result<(), StorageError> {
        self.update_peer_dynamic_info(peer_id, dynamic_info)
    }

    fn peer_row(&self, peer_id: &PeerId) -> Option<&PeerRow> {
        self.get_peer(peer_id)
    }

    fn peer_rows(&self) -> &BTreeMap<PeerId, PeerRow> {
        self.peers()
    }

    fn insert_voucher_row(
        &mut self,
        filed_under: &PeerId,
        voucher: SignedBlob,
    ) -> Result<VoucherDigest, StorageError> {
        self.insert_voucher(filed_under, voucher)
    }

    fn remove_voucher_row(
        &mut self,
        filed_under: &PeerId,
        digest: &VoucherDigest,
    ) -> Result<VoucherRow, StorageError> {
        self.remove_voucher(filed_under, digest)
    }

    fn move_voucher_row(
        &mut self,
        from: &PeerId,
        digest: &VoucherDigest,
        to: &PeerId,
    ) -> Result<(), StorageError> {
        self.move_voucher(from, digest, to)
    }

    fn voucher_rows(&self) -> &BTreeMap<(PeerId, VoucherDigest), VoucherRow> {
        self.vouchers()
    }

    fn insert_custodian_recovery_key_row(
        &mut self,
        crk: CustodianRecoveryKey,
    ) -> Result<(), StorageError> {
        self.insert_custodian_recovery_key(crk)
    }

    fn custodian_recovery_key_rows(&self) -> Vec<&CustodianRecoveryKey> {
        self.custodian_recovery_keys().collect()
    }

    fn upsert_policy_document_row(&mut self, doc: PolicyDocument) -> Result<(), StorageError> {
        self.upsert_policy_document(doc)
    }

    fn policy_document_rows(&self) -> &BTreeMap<PolicyVersion, PolicyDocument> {
        self.policy_documents()
    }

    fn set_ego_identity_row(&mut self, row: EgoIdentityRow) -> Result<(), StorageError> {
        self.set_ego_identity(row)
    }

    fn ego_identity_row(&self) -> Option<&EgoIdentityRow> {
        self.ego_identity()
    }
}

impl EscrowCacheRepo for TrustStore {
    fn append_escrow_record_row(
        &mut self,
        tier: ViabilityTier,
        input: EscrowRecordRowInput,
    ) -> Result<u64, StorageError> {
        self.append_escrow_record(tier, input)
    }

    fn escrow_tier_rows(&self, tier: ViabilityTier) -> Vec<&EscrowRecordRow> {
        self.escrow_rows_for_tier(tier)
    }

    fn insert_bottle_row(&mut self, row: BottleRow) -> Result<(), StorageError> {
        self.insert_bottle(row)
    }

    fn bottle_rows(&self) -> &BTreeMap<BottleId, BottleRow> {
        self.bottles()
    }

    fn ego_peer_id(&self) -> Option<&PeerId> {
        self.ego_identity().map(|row| &row.peer_id)
    }
}
