#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use keytrust_kernel_contracts::escrow::{
    EscrowClientMetadata, EscrowInformationMetadata, EscrowRecord, SosViability, ViabilityTier,
};
use keytrust_kernel_contracts::{UnixTimeSecs, Validate};
use keytrust_storage::repo::EscrowCacheRepo;
use keytrust_storage::trust_store::{
    EscrowClientMetadataRow, EscrowMetadataRow, EscrowRecordRow, EscrowRecordRowInput,
    StorageError,
};
use tracing::debug;

/// Bottle IDs usable for recovery, split by tier. Legacy records never contribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViableBottles {
    pub fully_viable: BTreeSet<String>,
    pub partially_viable: BTreeSet<String>,
}

fn client_metadata_to_row(m: &EscrowClientMetadata) -> EscrowClientMetadataRow {
    EscrowClientMetadataRow {
        secure_backup_metadata_timestamp_secs: m.secure_backup_metadata_timestamp.0,
        secure_backup_numeric_passphrase_length: m.secure_backup_numeric_passphrase_length,
        secure_backup_uses_complex_passphrase: m.secure_backup_uses_complex_passphrase,
        secure_backup_uses_numeric_passphrase: m.secure_backup_uses_numeric_passphrase,
        device_color: m.device_color.clone(),
        device_enclosure_color: m.device_enclosure_color.clone(),
        device_mid: m.device_mid.clone(),
        device_model: m.device_model.clone(),
        device_model_class: m.device_model_class.clone(),
        device_model_version: m.device_model_version.clone(),
        device_name: m.device_name.clone(),
        device_platform: m.device_platform,
    }
}

fn client_metadata_from_row(row: &EscrowClientMetadataRow) -> EscrowClientMetadata {
    EscrowClientMetadata {
        secure_backup_metadata_timestamp: UnixTimeSecs(row.secure_backup_metadata_timestamp_secs),
        secure_backup_numeric_passphrase_length: row.secure_backup_numeric_passphrase_length,
        secure_backup_uses_complex_passphrase: row.secure_backup_uses_complex_passphrase,
        secure_backup_uses_numeric_passphrase: row.secure_backup_uses_numeric_passphrase,
        device_color: row.device_color.clone(),
        device_enclosure_color: row.device_enclosure_color.clone(),
        device_mid: row.device_mid.clone(),
        device_model: row.device_model.clone(),
        device_model_class: row.device_model_class.clone(),
        device_model_version: row.device_model_version.clone(),
        device_name: row.device_name.clone(),
        device_platform: row.device_platform,
    }
}

pub fn escrow_record_to_row(record: &EscrowRecord) -> EscrowRecordRowInput {
    let m = &record.escrow_information_metadata;
    EscrowRecordRowInput {
        creation_date_secs: record.creation_date.0,
        remaining_attempts: record.remaining_attempts,
        label: record.label.clone(),
        record_id: record.record_id.clone(),
        silent_attempt_allowed: record.silent_attempt_allowed,
        record_status: record.record_status,
        sos_viability_code: record.sos_viability.code(),
        federation_id: record.federation_id.clone(),
        expected_federation_id: record.expected_federation_id.clone(),
        metadata: EscrowMetadataRow {
            backup_keybag_digest: m.backup_keybag_digest.clone(),
            bottle_id: m.bottle_id.clone(),
            escrowed_spki: m.escrowed_spki.clone(),
            peer_info: m.peer_info.clone(),
            serial: m.serial.clone(),
            build: m.build.clone(),
            passcode_generation: m.passcode_generation,
            secure_backup_usable_timestamp_secs: m.secure_backup_usable_timestamp.0,
            secure_backup_timestamp_secs: m.secure_backup_timestamp.0,
            client_metadata: client_metadata_to_row(&m.client_metadata),
        },
    }
}

/// The stored tier decides `record_viability`; unknown SOS codes read back as `Unknown`.
pub fn escrow_record_from_row(row: &EscrowRecordRow) -> EscrowRecord {
    let m = &row.metadata;
    EscrowRecord {
        creation_date: UnixTimeSecs(row.creation_date_secs),
        remaining_attempts: row.remaining_attempts,
        label: row.label.clone(),
        record_id: row.record_id.clone(),
        silent_attempt_allowed: row.silent_attempt_allowed,
        record_status: row.record_status,
        record_viability: row.tier.record_viability(),
        sos_viability: SosViability::from_code(row.sos_viability_code),
        federation_id: row.federation_id.clone(),
        expected_federation_id: row.expected_federation_id.clone(),
        escrow_information_metadata: EscrowInformationMetadata {
            backup_keybag_digest: m.backup_keybag_digest.clone(),
            client_metadata: client_metadata_from_row(&m.client_metadata),
            secure_backup_usable_timestamp: UnixTimeSecs(m.secure_backup_usable_timestamp_secs),
            bottle_id: m.bottle_id.clone(),
            secure_backup_timestamp: UnixTimeSecs(m.secure_backup_timestamp_secs),
            escrowed_spki: m.escrowed_spki.clone(),
            peer_info: m.peer_info.clone(),
            serial: m.serial.clone(),
            build: m.build.clone(),
            passcode_generation: m.passcode_generation,
        },
    }
}

/// Appends `record` to `tier`. Earlier rows, in any tier, are left untouched.
pub fn set_escrow_record(
    repo: &mut dyn EscrowCacheRepo,
    record: &EscrowRecord,
    tier: ViabilityTier,
) -> Result<u64, StorageError> {
    record.validate()?;
    let row_id = repo.append_escrow_record_row(tier, escrow_record_to_row(record))?;
    debug!(row_id, ?tier, label = %record.label, "cached escrow record");
    Ok(row_id)
}

/// Full tier, then partial, then legacy; append order within a tier.
pub fn cached_escrow_records(repo: &dyn EscrowCacheRepo) -> Vec<EscrowRecord> {
    ViabilityTier::ALL
        .into_iter()
        .flat_map(|tier| repo.escrow_tier_rows(tier))
        .map(escrow_record_from_row)
        .collect()
}

pub fn cached_viable_bottles(repo: &dyn EscrowCacheRepo) -> ViableBottles {
    let bottles = |tier: ViabilityTier| -> BTreeSet<String> {
        repo.escrow_tier_rows(tier)
            .into_iter()
            .map(|row| row.metadata.bottle_id.clone())
            .filter(|id| !id.is_empty())
            .collect()
    };
    ViableBottles {
        fully_viable: bottles(ViabilityTier::Full),
        partially_viable: bottles(ViabilityTier::Partial),
    }
}

/// True iff a bottle owned by the local identity appears in `records`.
pub fn cached_records_contain_ego_peer_bottle(
    repo: &dyn EscrowCacheRepo,
    records: &[EscrowRecord],
) -> bool {
    let Some(ego) = repo.ego_peer_id() else {
        return false;
    };
    let record_bottles: BTreeSet<&str> = records.iter().filter_map(EscrowRecord::bottle_id).collect();
    repo.bottle_rows()
        .values()
        .filter(|b| &b.peer_id == ego)
        .any(|b| record_bottles.contains(b.bottle_id.as_str()))
}
