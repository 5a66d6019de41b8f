#![forbid(unsafe_code)]

use keytrust_engines::crypto::SigningKeyPair;
use keytrust_engines::identity_codec::{encode_permanent_info, encode_voucher};
use keytrust_kernel_contracts::peer::{
    CustodianRecoveryKey, CustodianRecoveryKeyKind, PeerId, SignedBlob, VoucherReason,
};
use keytrust_kernel_contracts::policy::{ModelToCategoryRule, PolicyDocument, PolicyRules};
use keytrust_kernel_contracts::UnixTimeSecs;
use keytrust_storage::repo::TrustGraphRepo;
use keytrust_storage::trust_store::{PeerRow, StorageError, TrustStore};
use uuid::Uuid;

fn seed_peer(store: &mut TrustStore, machine: &str) -> (PeerId, SigningKeyPair) {
    let keys = SigningKeyPair::generate();
    let (peer_id, blob) =
        encode_permanent_info(&keys, machine, "iPhone15,2", 1, &[5; 32], UnixTimeSecs(1)).unwrap();
    store
        .insert_peer_row(PeerRow::v1(peer_id.clone(), blob, None, None).unwrap())
        .unwrap();
    (peer_id, keys)
}

fn voucher(sponsor: &(PeerId, SigningKeyPair), beneficiary: &PeerId) -> SignedBlob {
    encode_voucher(&sponsor.1, &sponsor.0, beneficiary, VoucherReason::SecureChannel).unwrap()
}

#[test]
fn at_graph_db_01_peer_ids_are_unique() {
    let mut s = TrustStore::new_in_memory();
    let (peer_id, _) = seed_peer(&mut s, "m1");
    let row = s.peer_row(&peer_id).unwrap().clone();
    assert!(matches!(
        s.insert_peer_row(row),
        Err(StorageError::DuplicateKey { table: "peers", .. })
    ));
}

#[test]
fn at_graph_db_02_vouchers_require_existing_peer() {
    let mut s = TrustStore::new_in_memory();
    let sponsor = seed_peer(&mut s, "m1");
    let ghost = PeerId::new("SHA256:ghost").unwrap();
    assert!(matches!(
        s.insert_voucher_row(&ghost, voucher(&sponsor, &ghost)),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_graph_db_03_same_voucher_cannot_be_filed_twice_under_one_peer() {
    let mut s = TrustStore::new_in_memory();
    let sponsor = seed_peer(&mut s, "m1");
    let (beneficiary, _) = seed_peer(&mut s, "m2");
    let blob = voucher(&sponsor, &beneficiary);
    s.insert_voucher_row(&beneficiary, blob.clone()).unwrap();
    assert!(matches!(
        s.insert_voucher_row(&beneficiary, blob.clone()),
        Err(StorageError::DuplicateKey { .. })
    ));
    // The same content may still be misfiled under another peer.
    s.insert_voucher_row(&sponsor.0, blob).unwrap();
    assert_eq!(s.voucher_rows().len(), 2);
}

#[test]
fn at_graph_db_04_move_voucher_is_exclusive() {
    let mut s = TrustStore::new_in_memory();
    let sponsor = seed_peer(&mut s, "m1");
    let (beneficiary, _) = seed_peer(&mut s, "m2");
    let digest = s
        .insert_voucher_row(&sponsor.0, voucher(&sponsor, &beneficiary))
        .unwrap();

    s.move_voucher_row(&sponsor.0, &digest, &beneficiary).unwrap();
    assert!(s.vouchers_filed_under(&sponsor.0).is_empty());
    let moved = s.vouchers_filed_under(&beneficiary);
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].filed_under, beneficiary);

    let ghost = PeerId::new("SHA256:ghost").unwrap();
    assert!(matches!(
        s.move_voucher_row(&beneficiary, &digest, &ghost),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
    assert_eq!(s.voucher_rows().len(), 1);
}

#[test]
fn at_graph_db_05_transaction_rolls_back_on_error() {
    let mut s = TrustStore::new_in_memory();
    let sponsor = seed_peer(&mut s, "m1");
    let before = s.content_digest();

    let out: Result<(), StorageError> = s.transaction(|tx| {
        tx.insert_voucher_row(&sponsor.0, voucher(&sponsor, &sponsor.0))?;
        tx.remove_voucher_row(&sponsor.0, &keytrust_kernel_contracts::peer::VoucherDigest::of(b"nope"))?;
        Ok(())
    });
    assert!(out.is_err());
    assert_eq!(s.content_digest(), before);

    s.transaction(|tx| tx.insert_voucher_row(&sponsor.0, voucher(&sponsor, &sponsor.0)))
        .unwrap();
    assert_ne!(s.content_digest(), before);
}

#[test]
fn at_graph_db_06_custodian_keys_share_uuid_across_peers() {
    let mut s = TrustStore::new_in_memory();
    let (enroller, _) = seed_peer(&mut s, "m1");
    let uuid = Uuid::from_u128(0x1111_2222_3333_4444_5555_6666_7777_8888);
    for n in ["CRK-one", "CRK-two"] {
        s.insert_custodian_recovery_key_row(
            CustodianRecoveryKey::v1(
                uuid,
                PeerId::new(n).unwrap(),
                enroller.clone(),
                vec![1; 32],
                vec![2; 32],
                CustodianRecoveryKeyKind::RecoveryKey,
            )
            .unwrap(),
        )
        .unwrap();
    }
    assert_eq!(s.custodian_recovery_key_rows().len(), 2);

    let orphan = CustodianRecoveryKey::v1(
        uuid,
        PeerId::new("CRK-three").unwrap(),
        PeerId::new("SHA256:nobody").unwrap(),
        vec![1; 32],
        vec![2; 32],
        CustodianRecoveryKeyKind::InheritanceKey,
    )
    .unwrap();
    assert!(matches!(
        s.insert_custodian_recovery_key_row(orphan),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_graph_db_07_policy_documents_keyed_by_version() {
    let mut s = TrustStore::new_in_memory();
    let mut rules = PolicyRules::default();
    rules
        .model_to_category
        .push(ModelToCategoryRule::new("iPhone", "full"));
    let doc = PolicyDocument::v1(9, rules).unwrap();
    s.upsert_policy_document_row(doc.clone()).unwrap();
    s.upsert_policy_document_row(doc.clone()).unwrap();
    assert_eq!(s.policy_document_rows().len(), 1);
    assert_eq!(s.policy_document(&doc.version), Some(&doc));
}
