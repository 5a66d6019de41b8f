#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::validate_token;
use crate::{ContractViolation, Validate};

pub const POLICY_HASH_PREFIX: &str = "SHA256:";

/// Ordered by version number, then by policy hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyVersion {
    pub version_number: u64,
    pub policy_hash: String,
}

impl PolicyVersion {
    pub fn new(
        version_number: u64,
        policy_hash: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let v = Self {
            version_number,
            policy_hash: policy_hash.into(),
        };
        v.validate()?;
        Ok(v)
    }
}

impl Validate for PolicyVersion {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.version_number == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "policy_version.version_number",
                reason: "must be > 0",
            });
        }
        validate_token("policy_version.policy_hash", &self.policy_hash, 128)
    }
}

impl std::fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.version_number, self.policy_hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UserControllableViewStatus {
    Unknown,
    Enabled,
    Disabled,
    FollowingPlatform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelToCategoryRule {
    pub prefix: String,
    pub category: String,
}

impl ModelToCategoryRule {
    pub fn new(prefix: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            category: category.into(),
        }
    }
}

/// AES-256-GCM sealed rule extension; the key lives in a peer's policy secrets under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPolicyRedaction {
    pub name: String,
    pub ciphertext_b64: String,
    pub iv_b64: String,
    pub tag_b64: String,
}

/// Plaintext carried inside a [`SealedPolicyRedaction`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedRules {
    pub model_to_category: Vec<ModelToCategoryRule>,
    pub categories_by_view: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRules {
    /// First matching prefix wins.
    pub model_to_category: Vec<ModelToCategoryRule>,
    pub categories_by_view: BTreeMap<String, BTreeSet<String>>,
    pub user_controllable_views: BTreeSet<String>,
    pub inherited_excluded_views: BTreeSet<String>,
    pub priority_views: BTreeSet<String>,
    pub redactions: Vec<SealedPolicyRedaction>,
}

impl PolicyRules {
    pub fn policy_hash(&self) -> String {
        // BTree-backed maps keep the JSON form canonical. Plain string-keyed data, so
        // serialization cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{POLICY_HASH_PREFIX}{}", BASE64.encode(Sha256::digest(canonical)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: PolicyVersion,
    pub rules: PolicyRules,
}

impl PolicyDocument {
    pub fn v1(version_number: u64, rules: PolicyRules) -> Result<Self, ContractViolation> {
        let version = PolicyVersion::new(version_number, rules.policy_hash())?;
        let doc = Self { version, rules };
        doc.validate()?;
        Ok(doc)
    }

    pub fn hash_matches_content(&self) -> bool {
        self.rules.policy_hash() == self.version.policy_hash
    }
}

impl Validate for PolicyDocument {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.version.validate()?;
        for rule in &self.rules.model_to_category {
            validate_token("policy_document.model_to_category.category", &rule.category, 64)?;
        }
        let mut names = BTreeSet::new();
        for redaction in &self.rules.redactions {
            validate_token("policy_document.redactions.name", &redaction.name, 64)?;
            if !names.insert(redaction.name.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "policy_document.redactions.name",
                    reason: "must be unique",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncingPolicy {
    pub version: PolicyVersion,
    pub model_category: String,
    pub views_to_sync: BTreeSet<String>,
    pub user_controllable_views: BTreeSet<String>,
    pub priority_views: BTreeSet<String>,
    pub sync_user_controllable_views: UserControllableViewStatus,
    pub is_inherited_account: bool,
}

impl SyncingPolicy {
    pub fn is_syncing_enabled(&self, view: &str) -> bool {
        if !self.views_to_sync.contains(view) {
            return false;
        }
        if !self.user_controllable_views.contains(view) {
            return true;
        }
        match self.sync_user_controllable_views {
            UserControllableViewStatus::Enabled | UserControllableViewStatus::FollowingPlatform => {
                true
            }
            UserControllableViewStatus::Disabled | UserControllableViewStatus::Unknown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_policy_01_versions_order_by_number_then_hash() {
        let a = PolicyVersion::new(3, "SHA256:b").unwrap();
        let b = PolicyVersion::new(4, "SHA256:a").unwrap();
        let c = PolicyVersion::new(4, "SHA256:c").unwrap();
        assert!(a < b);
        assert!(b < c);
        let max = [c.clone(), a, b].into_iter().max().unwrap();
        assert_eq!(max, c);
    }

    #[test]
    fn at_policy_02_document_hash_tracks_rules() {
        let mut rules = PolicyRules::default();
        rules
            .model_to_category
            .push(ModelToCategoryRule::new("iPhone", "full"));
        let doc = PolicyDocument::v1(7, rules).unwrap();
        assert!(doc.hash_matches_content());
        assert!(doc.version.policy_hash.starts_with(POLICY_HASH_PREFIX));

        let mut tampered = doc.clone();
        tampered
            .rules
            .priority_views
            .insert("Passwords".to_string());
        assert!(!tampered.hash_matches_content());
    }

    #[test]
    fn at_policy_03_user_controllable_views_follow_status() {
        let mut policy = SyncingPolicy {
            version: PolicyVersion::new(1, "SHA256:x").unwrap(),
            model_category: "full".into(),
            views_to_sync: ["Photos".to_string(), "Passwords".to_string()].into(),
            user_controllable_views: ["Photos".to_string()].into(),
            priority_views: BTreeSet::new(),
            sync_user_controllable_views: UserControllableViewStatus::Unknown,
            is_inherited_account: false,
        };
        assert!(policy.is_syncing_enabled("Passwords"));
        assert!(!policy.is_syncing_enabled("Photos"));
        assert!(!policy.is_syncing_enabled("Health"));
        policy.sync_user_controllable_views = UserControllableViewStatus::FollowingPlatform;
        assert!(policy.is_syncing_enabled("Photos"));
        policy.sync_user_controllable_views = UserControllableViewStatus::Disabled;
        assert!(!policy.is_syncing_enabled("Photos"));
    }
}
