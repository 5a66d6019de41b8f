#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_token;
use crate::{ContractViolation, UnixTimeSecs, Validate};

pub const RECORD_VIABILITY_FULLY_VIABLE: i32 = 0;
pub const RECORD_VIABILITY_PARTIALLY_VIABLE: i32 = 1;
pub const RECORD_VIABILITY_LEGACY: i32 = 2;

pub const SOS_VIABILITY_UNKNOWN: i32 = 0;
pub const SOS_VIABILITY_VIABLE: i32 = 1;
pub const SOS_VIABILITY_NOT_VIABLE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BottleId(String);

impl BottleId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for BottleId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("bottle_id", &self.0, 128)
    }
}

/// Which cache collection an escrow record lives in. A stored record has exactly one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViabilityTier {
    Full,
    Partial,
    Legacy,
}

impl ViabilityTier {
    pub const ALL: [ViabilityTier; 3] = [
        ViabilityTier::Full,
        ViabilityTier::Partial,
        ViabilityTier::Legacy,
    ];

    pub fn record_viability(self) -> RecordViability {
        match self {
            ViabilityTier::Full => RecordViability::FullyViable,
            ViabilityTier::Partial => RecordViability::PartiallyViable,
            ViabilityTier::Legacy => RecordViability::Legacy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordViability {
    FullyViable,
    PartiallyViable,
    Legacy,
}

impl RecordViability {
    pub fn code(self) -> i32 {
        match self {
            RecordViability::FullyViable => RECORD_VIABILITY_FULLY_VIABLE,
            RecordViability::PartiallyViable => RECORD_VIABILITY_PARTIALLY_VIABLE,
            RecordViability::Legacy => RECORD_VIABILITY_LEGACY,
        }
    }

    pub fn tier(self) -> ViabilityTier {
        match self {
            RecordViability::FullyViable => ViabilityTier::Full,
            RecordViability::PartiallyViable => ViabilityTier::Partial,
            RecordViability::Legacy => ViabilityTier::Legacy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SosViability {
    Unknown,
    Viable,
    NotViable,
}

impl SosViability {
    pub fn code(self) -> i32 {
        match self {
            SosViability::Unknown => SOS_VIABILITY_UNKNOWN,
            SosViability::Viable => SOS_VIABILITY_VIABLE,
            SosViability::NotViable => SOS_VIABILITY_NOT_VIABLE,
        }
    }

    /// Unrecognised stored codes decode to `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            SOS_VIABILITY_VIABLE => SosViability::Viable,
            SOS_VIABILITY_NOT_VIABLE => SosViability::NotViable,
            _ => SosViability::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowRecordStatus {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscrowClientMetadata {
    pub secure_backup_metadata_timestamp: UnixTimeSecs,
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

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscrowInformationMetadata {
    pub backup_keybag_digest: Vec<u8>,
    pub client_metadata: EscrowClientMetadata,
    pub secure_backup_usable_timestamp: UnixTimeSecs,
    pub bottle_id: String,
    pub secure_backup_timestamp: UnixTimeSecs,
    pub escrowed_spki: Vec<u8>,
    pub peer_info: Vec<u8>,
    pub serial: String,
    pub build: String,
    pub passcode_generation: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowRecord {
    pub creation_date: UnixTimeSecs,
    pub remaining_attempts: u64,
    pub label: String,
    pub record_id: String,
    pub silent_attempt_allowed: bool,
    pub record_status: EscrowRecordStatus,
    pub record_viability: RecordViability,
    pub sos_viability: SosViability,
    pub federation_id: String,
    pub expected_federation_id: String,
    pub escrow_information_metadata: EscrowInformationMetadata,
}

impl EscrowRecord {
    pub fn bottle_id(&self) -> Option<&str> {
        let id = self.escrow_information_metadata.bottle_id.as_str();
        (!id.is_empty()).then_some(id)
    }
}

impl Validate for EscrowRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("escrow_record.label", &self.label, 256)?;
        if self.record_id.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "escrow_record.record_id",
                reason: "must be <= 256 chars",
            });
        }
        if self.escrow_information_metadata.bottle_id.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "escrow_record.escrow_information_metadata.bottle_id",
                reason: "must be <= 128 chars",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_escrow_01_unknown_sos_codes_decode_to_unknown() {
        assert_eq!(SosViability::from_code(1), SosViability::Viable);
        assert_eq!(SosViability::from_code(2), SosViability::NotViable);
        assert_eq!(SosViability::from_code(0), SosViability::Unknown);
        assert_eq!(SosViability::from_code(42), SosViability::Unknown);
        assert_eq!(SosViability::from_code(-1), SosViability::Unknown);
    }

    #[test]
    fn at_escrow_02_tier_and_viability_map_one_to_one() {
        for tier in ViabilityTier::ALL {
            assert_eq!(tier.record_viability().tier(), tier);
        }
        assert_eq!(
            ViabilityTier::Legacy.record_viability().code(),
            RECORD_VIABILITY_LEGACY
        );
    }
}
