#![forbid(unsafe_code)]

use keytrust_kernel_contracts::escrow::{BottleId, EscrowRecordStatus, ViabilityTier};
use keytrust_kernel_contracts::peer::{PeerId, SignedBlob};
use keytrust_storage::repo::{EscrowCacheRepo, TrustGraphRepo};
use keytrust_storage::trust_store::{
    BottleRow, EgoIdentityRow, EscrowMetadataRow, EscrowRecordRowInput, StorageError, TrustStore,
};

fn row_input(label: &str, bottle_id: &str) -> EscrowRecordRowInput {
    EscrowRecordRowInput {
        creation_date_secs: 1_700_000_000,
        remaining_attempts: 10,
        label: label.to_string(),
        record_id: format!("record-{label}"),
        silent_attempt_allowed: true,
        record_status: EscrowRecordStatus::Valid,
        sos_viability_code: 1,
        federation_id: "fed-1".to_string(),
        expected_federation_id: "fed-1".to_string(),
        metadata: EscrowMetadataRow {
            bottle_id: bottle_id.to_string(),
            ..EscrowMetadataRow::default()
        },
    }
}

#[test]
fn at_escrow_db_01_rows_land_in_exactly_one_tier() {
    let mut s = TrustStore::new_in_memory();
    let full = s
        .append_escrow_record_row(ViabilityTier::Full, row_input("a", "bottle-a"))
        .unwrap();
    let legacy = s
        .append_escrow_record_row(ViabilityTier::Legacy, row_input("b", "bottle-b"))
        .unwrap();

    let full_rows = s.escrow_tier_rows(ViabilityTier::Full);
    assert_eq!(full_rows.len(), 1);
    assert_eq!(full_rows[0].row_id, full);
    assert!(s.escrow_tier_rows(ViabilityTier::Partial).is_empty());
    assert_eq!(s.escrow_tier_rows(ViabilityTier::Legacy)[0].row_id, legacy);

    for tier in ViabilityTier::ALL {
        for row in s.escrow_tier_rows(tier) {
            assert_eq!(row.tier, tier);
        }
    }
}

#[test]
fn at_escrow_db_02_superseding_appends_instead_of_mutating() {
    let mut s = TrustStore::new_in_memory();
    s.append_escrow_record_row(ViabilityTier::Partial, row_input("a", "bottle-a"))
        .unwrap();
    s.append_escrow_record_row(ViabilityTier::Full, row_input("a", "bottle-a"))
        .unwrap();
    assert_eq!(s.escrow_rows().len(), 2);
    assert_eq!(s.escrow_tier_rows(ViabilityTier::Partial).len(), 1);
    assert_eq!(s.escrow_tier_rows(ViabilityTier::Full).len(), 1);
}

#[test]
fn at_escrow_db_03_empty_label_is_rejected() {
    let mut s = TrustStore::new_in_memory();
    assert!(matches!(
        s.append_escrow_record_row(ViabilityTier::Full, row_input(" ", "bottle-a")),
        Err(StorageError::ContractViolation(_))
    ));
    assert!(s.escrow_rows().is_empty());
}

#[test]
fn at_escrow_db_04_bottles_and_ego_peer() {
    let mut s = TrustStore::new_in_memory();
    assert!(s.ego_peer_id().is_none());
    let ego = PeerId::new("SHA256:ego").unwrap();
    s.set_ego_identity_row(EgoIdentityRow {
        peer_id: ego.clone(),
        permanent_info: SignedBlob::new(b"perm".to_vec(), vec![0; 64]),
        stable_info: None,
    })
    .unwrap();
    assert_eq!(s.ego_peer_id(), Some(&ego));

    let row = BottleRow {
        bottle_id: BottleId::new("bottle-1").unwrap(),
        peer_id: ego,
    };
    s.insert_bottle_row(row.clone()).unwrap();
    assert!(matches!(
        s.insert_bottle_row(row),
        Err(StorageError::DuplicateKey { table: "bottles", .. })
    ));
}
