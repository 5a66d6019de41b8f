#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use keytrust_engines::crypto::{Ed25519Crypto, SigningKeyPair};
use keytrust_engines::identity_codec::{
    encode_dynamic_info, encode_permanent_info, encode_stable_info, encode_voucher, IdentityCodec,
};
use keytrust_engines::recovery_keys::CustodianKeySet;
use keytrust_kernel_contracts::escrow::{
    EscrowClientMetadata, EscrowInformationMetadata, EscrowRecord, EscrowRecordStatus,
    RecordViability, SosViability,
};
use keytrust_kernel_contracts::peer::{
    CustodianRecoveryKey, CustodianRecoveryKeyKind, DynamicInfo, PeerId, PermanentInfo,
    SignedBlob, StableInfo, VoucherReason,
};
use keytrust_kernel_contracts::policy::{
    ModelToCategoryRule, PolicyDocument, PolicyRules, PolicyVersion,
};
use keytrust_kernel_contracts::UnixTimeSecs;
use keytrust_storage::repo::TrustGraphRepo;
use keytrust_storage::trust_store::{EgoIdentityRow, PeerRow, TrustStore};
use uuid::Uuid;

use crate::remote::{FetchError, RemoteTrustService};

pub(crate) const TEST_RECOVERY_KEY: &str = "7YQ4-M2KD-X9PA-LC3T-8WRN-FB6J-Q1ZE";
pub(crate) const TEST_SALT: &str = "dsid-2046-test";

pub(crate) struct TestPeer {
    pub keys: SigningKeyPair,
    pub peer_id: PeerId,
    pub permanent_blob: SignedBlob,
}

impl TestPeer {
    pub fn new(model_id: &str, machine_id: &str) -> Self {
        let keys = SigningKeyPair::generate();
        let (peer_id, permanent_blob) = encode_permanent_info(
            &keys,
            machine_id,
            model_id,
            1,
            &[0x42; 32],
            UnixTimeSecs(1_700_000_000),
        )
        .unwrap();
        Self {
            keys,
            peer_id,
            permanent_blob,
        }
    }

    pub fn permanent_info(&self) -> PermanentInfo {
        let crypto = Ed25519Crypto;
        IdentityCodec::new(&crypto)
            .parse_permanent_info(&self.peer_id, &self.permanent_blob)
            .unwrap()
    }

    pub fn sign_stable(&self, stable: &StableInfo) -> SignedBlob {
        encode_stable_info(&self.keys, stable).unwrap()
    }

    fn sign_dynamic(&self, included: &[&PeerId], include_self: bool) -> SignedBlob {
        let mut ids: BTreeSet<PeerId> = included.iter().map(|p| (*p).clone()).collect();
        if include_self {
            ids.insert(self.peer_id.clone());
        }
        let info = DynamicInfo::v1(1, ids, BTreeSet::new()).unwrap();
        encode_dynamic_info(&self.keys, &info).unwrap()
    }

    /// Stores the peer as a trusted member that includes itself plus `included`.
    pub fn register(&self, store: &mut TrustStore, stable: Option<&StableInfo>, included: &[&PeerId]) {
        let row = PeerRow::v1(
            self.peer_id.clone(),
            self.permanent_blob.clone(),
            stable.map(|s| self.sign_stable(s)),
            Some(self.sign_dynamic(included, true)),
        )
        .unwrap();
        store.insert_peer(row).unwrap();
    }

    pub fn set_dynamic(&self, store: &mut TrustStore, included: &[&PeerId]) {
        store
            .update_peer_dynamic_info(&self.peer_id, self.sign_dynamic(included, true))
            .unwrap();
    }

    pub fn set_dynamic_excluding_self(&self, store: &mut TrustStore) {
        store
            .update_peer_dynamic_info(&self.peer_id, self.sign_dynamic(&[], false))
            .unwrap();
    }

    pub fn voucher_for(&self, beneficiary: &PeerId) -> SignedBlob {
        encode_voucher(&self.keys, &self.peer_id, beneficiary, VoucherReason::SecureChannel)
            .unwrap()
    }

    pub fn set_as_ego(&self, store: &mut TrustStore, stable: Option<&StableInfo>) {
        store
            .set_ego_identity(EgoIdentityRow {
                peer_id: self.peer_id.clone(),
                permanent_info: self.permanent_blob.clone(),
                stable_info: stable.map(|s| self.sign_stable(s)),
            })
            .unwrap();
    }
}

fn views(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Each version syncs one extra view named after its number, so hashes differ per version.
pub(crate) fn policy_document(version_number: u64) -> PolicyDocument {
    let mut rules = PolicyRules::default();
    rules.model_to_category = vec![
        ModelToCategoryRule::new("iPhone", "full"),
        ModelToCategoryRule::new("Mac", "full"),
        ModelToCategoryRule::new("Watch", "watch"),
    ];
    rules
        .categories_by_view
        .insert("Passwords".into(), views(&["full", "watch"]));
    rules
        .categories_by_view
        .insert("Photos".into(), views(&["full"]));
    rules
        .categories_by_view
        .insert(format!("Feature{version_number}"), views(&["full"]));
    rules.user_controllable_views = views(&["Photos"]);
    rules.priority_views = views(&["Passwords"]);
    PolicyDocument::v1(version_number, rules).unwrap()
}

pub(crate) fn stable_info_at(version: &PolicyVersion, inherited: bool) -> StableInfo {
    StableInfo::v1(
        1,
        version.clone(),
        "17.1".to_string(),
        "C02TEST0001".to_string(),
        inherited,
    )
    .unwrap()
}

pub(crate) fn stable_info(version_number: u64, inherited: bool) -> StableInfo {
    stable_info_at(&policy_document(version_number).version, inherited)
}

pub(crate) fn custodian_key(enrolled_by: &PeerId, uuid: Uuid, secret: &str) -> CustodianRecoveryKey {
    let crypto = Ed25519Crypto;
    let set = CustodianKeySet::derive(&crypto, uuid, secret, TEST_SALT).unwrap();
    CustodianRecoveryKey::v1(
        uuid,
        set.peer_id.clone(),
        enrolled_by.clone(),
        set.signing_public_key(),
        set.encryption_public_key(),
        CustodianRecoveryKeyKind::RecoveryKey,
    )
    .unwrap()
}

pub(crate) fn escrow_record(label: &str, bottle_id: &str, viability: RecordViability) -> EscrowRecord {
    EscrowRecord {
        creation_date: UnixTimeSecs(1_690_000_000),
        remaining_attempts: 10,
        label: label.to_string(),
        record_id: format!("record-{label}"),
        silent_attempt_allowed: true,
        record_status: EscrowRecordStatus::Valid,
        record_viability: viability,
        sos_viability: SosViability::Viable,
        federation_id: "com.example.fed.a".to_string(),
        expected_federation_id: "com.example.fed.a".to_string(),
        escrow_information_metadata: EscrowInformationMetadata {
            backup_keybag_digest: vec![0xab; 20],
            client_metadata: EscrowClientMetadata {
                secure_backup_metadata_timestamp: UnixTimeSecs(1_690_000_100),
                secure_backup_numeric_passphrase_length: 6,
                secure_backup_uses_complex_passphrase: false,
                secure_backup_uses_numeric_passphrase: true,
                device_color: "1".to_string(),
                device_enclosure_color: "2".to_string(),
                device_mid: "mid-123".to_string(),
                device_model: "iPhone".to_string(),
                device_model_class: "iPhone".to_string(),
                device_model_version: "iPhone15,2".to_string(),
                device_name: "Test Phone".to_string(),
                device_platform: 1,
            },
            secure_backup_usable_timestamp: UnixTimeSecs(1_690_000_200),
            bottle_id: bottle_id.to_string(),
            secure_backup_timestamp: UnixTimeSecs(1_690_000_300),
            escrowed_spki: vec![0x30; 91],
            peer_info: vec![0x01, 0x02, 0x03],
            serial: "C02TEST0001".to_string(),
            build: "21A329".to_string(),
            passcode_generation: Some(3),
        },
    }
}

/// Remote stand-in serving a fixed set of policy documents.
#[derive(Default)]
pub(crate) struct StaticRemote {
    pub documents: Vec<PolicyDocument>,
    pub delta_error: Option<FetchError>,
    pub policy_error: Option<FetchError>,
    pub delta_calls: AtomicUsize,
    pub requested_versions: Mutex<Vec<PolicyVersion>>,
}

impl StaticRemote {
    pub fn serving(documents: Vec<PolicyDocument>) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }

    pub fn requested(&self) -> Vec<PolicyVersion> {
        self.requested_versions.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteTrustService for StaticRemote {
    async fn fetch_and_persist_changes_if_needed(
        &self,
        _store: &mut (dyn TrustGraphRepo + Send),
    ) -> Result<(), FetchError> {
        self.delta_calls.fetch_add(1, Ordering::SeqCst);
        match &self.delta_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn fetch_policy_documents(
        &self,
        versions: &[PolicyVersion],
    ) -> Result<Vec<PolicyDocument>, FetchError> {
        if let Some(err) = &self.policy_error {
            return Err(err.clone());
        }
        self.requested_versions
            .lock()
            .unwrap()
            .extend(versions.iter().cloned());
        Ok(self
            .documents
            .iter()
            .filter(|d| versions.contains(&d.version))
            .cloned()
            .collect())
    }
}
