#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keytrust_kernel_contracts::policy::{
    ModelToCategoryRule, PolicyDocument, PolicyVersion, RedactedRules, SealedPolicyRedaction,
    SyncingPolicy, UserControllableViewStatus,
};
use tracing::warn;

use crate::crypto::{CryptoError, CryptoProvider, SealedPayload};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyEvalError {
    #[error("policy {version} has no category for model {model_id}")]
    NoCategoryForModel {
        version: PolicyVersion,
        model_id: String,
    },
    #[error("policy {0} content does not match its hash")]
    HashMismatch(PolicyVersion),
    #[error("failed to seal redaction: {0}")]
    Seal(CryptoError),
}

/// Peer attributes a policy document is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct SyncingPolicyInput<'a> {
    pub model_id: &'a str,
    pub sync_user_controllable_views: UserControllableViewStatus,
    pub is_inherited_account: bool,
    pub policy_secrets: &'a BTreeMap<String, Vec<u8>>,
}

pub fn seal_redaction<C: CryptoProvider + ?Sized>(
    crypto: &C,
    name: &str,
    key: &[u8],
    rules: &RedactedRules,
) -> Result<SealedPolicyRedaction, PolicyEvalError> {
    let plaintext = serde_json::to_vec(rules)
        .map_err(|_| PolicyEvalError::Seal(CryptoError::Aead))?;
    let sealed = crypto
        .seal(key, &plaintext)
        .map_err(PolicyEvalError::Seal)?;
    Ok(SealedPolicyRedaction {
        name: name.to_string(),
        ciphertext_b64: BASE64.encode(sealed.ciphertext),
        iv_b64: BASE64.encode(sealed.iv),
        tag_b64: BASE64.encode(sealed.tag),
    })
}

fn open_redaction<C: CryptoProvider + ?Sized>(
    crypto: &C,
    redaction: &SealedPolicyRedaction,
    key: &[u8],
) -> Option<RedactedRules> {
    let decode = |field: &'static str, value: &str| match BASE64.decode(value.as_bytes()) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(redaction = %redaction.name, field, %err, "policy redaction is not valid base64");
            None
        }
    };
    let sealed = SealedPayload {
        ciphertext: decode("ciphertext", &redaction.ciphertext_b64)?,
        iv: decode("iv", &redaction.iv_b64)?,
        tag: decode("tag", &redaction.tag_b64)?,
    };
    let plaintext = match crypto.open(key, &sealed) {
        Ok(p) => p,
        Err(err) => {
            warn!(redaction = %redaction.name, %err, "unable to open policy redaction");
            return None;
        }
    };
    match serde_json::from_slice(&plaintext) {
        Ok(rules) => Some(rules),
        Err(err) => {
            warn!(redaction = %redaction.name, %err, "policy redaction is not valid rules");
            None
        }
    }
}

pub fn evaluate_syncing_policy<C: CryptoProvider + ?Sized>(
    crypto: &C,
    doc: &PolicyDocument,
    input: SyncingPolicyInput<'_>,
) -> Result<SyncingPolicy, PolicyEvalError> {
    if !doc.hash_matches_content() {
        return Err(PolicyEvalError::HashMismatch(doc.version.clone()));
    }

    let mut model_rules: Vec<ModelToCategoryRule> = doc.rules.model_to_category.clone();
    let mut categories_by_view = doc.rules.categories_by_view.clone();
    for redaction in &doc.rules.redactions {
        let Some(key) = input.policy_secrets.get(&redaction.name) else {
            continue;
        };
        let Some(extra) = open_redaction(crypto, redaction, key) else {
            continue;
        };
        model_rules.extend(extra.model_to_category);
        for (view, categories) in extra.categories_by_view {
            categories_by_view.entry(view).or_default().extend(categories);
        }
    }

    let category = model_rules
        .iter()
        .find(|rule| input.model_id.starts_with(rule.prefix.as_str()))
        .map(|rule| rule.category.clone())
        .ok_or_else(|| PolicyEvalError::NoCategoryForModel {
            version: doc.version.clone(),
            model_id: input.model_id.to_string(),
        })?;

    let mut views_to_sync: BTreeSet<String> = categories_by_view
        .iter()
        .filter(|(_, categories)| categories.contains(&category))
        .map(|(view, _)| view.clone())
        .collect();
    if input.is_inherited_account {
        views_to_sync.retain(|view| !doc.rules.inherited_excluded_views.contains(view));
    }
    let user_controllable_views = doc
        .rules
        .user_controllable_views
        .intersection(&views_to_sync)
        .cloned()
        .collect();
    let priority_views = doc
        .rules
        .priority_views
        .intersection(&views_to_sync)
        .cloned()
        .collect();

    Ok(SyncingPolicy {
        version: doc.version.clone(),
        model_category: category,
        views_to_sync,
        user_controllable_views,
        priority_views,
        sync_user_controllable_views: input.sync_user_controllable_views,
        is_inherited_account: input.is_inherited_account,
    })
}
