#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keytrust_engines::crypto::CryptoProvider;
use keytrust_engines::identity_codec::IdentityCodec;
use keytrust_engines::recovery_keys::RecoveryKeySet;
use keytrust_kernel_contracts::peer::{
    CustodianRecoveryKey, DynamicInfo, PeerId, PermanentInfo, StableInfo,
};
use keytrust_kernel_contracts::policy::{PolicyDocument, PolicyVersion};
use keytrust_storage::repo::TrustGraphRepo;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PolicyResolutionError;

/// A peer whose permanent info verified. Stable and dynamic info are `None` when absent or
/// when their signature did not verify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    pub permanent_info: PermanentInfo,
    pub stable_info: Option<StableInfo>,
    pub dynamic_info: Option<DynamicInfo>,
}

impl Peer {
    /// A peer counts as a trusted member only while its own dynamic info includes itself.
    pub fn trusts_itself(&self) -> bool {
        self.dynamic_info
            .as_ref()
            .is_some_and(|d| d.includes(&self.peer_id))
    }

    pub fn included_peer_ids(&self) -> BTreeSet<PeerId> {
        self.dynamic_info
            .as_ref()
            .map(|d| d.included_peer_ids.clone())
            .unwrap_or_default()
    }

    pub fn is_inherited_account(&self) -> bool {
        self.stable_info
            .as_ref()
            .is_some_and(|s| s.is_inherited_account)
    }
}

/// Sponsor admission rule for a candidate joining through a recovery credential.
pub trait IntroductionPolicy: Send + Sync {
    fn can_introduce(
        &self,
        sponsor: &Peer,
        candidate_permanent: &PermanentInfo,
        candidate_stable: &StableInfo,
    ) -> bool;
}

/// Inherited-account peers only introduce inherited-account candidates, and vice versa.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountInheritanceRule;

impl IntroductionPolicy for AccountInheritanceRule {
    fn can_introduce(
        &self,
        sponsor: &Peer,
        _candidate_permanent: &PermanentInfo,
        candidate_stable: &StableInfo,
    ) -> bool {
        sponsor.is_inherited_account() == candidate_stable.is_inherited_account
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAllIntroductions;

impl IntroductionPolicy for PermitAllIntroductions {
    fn can_introduce(&self, _: &Peer, _: &PermanentInfo, _: &StableInfo) -> bool {
        true
    }
}

/// Read model of the trust graph, rebuilt from the store for every operation.
pub struct TrustGraphModel {
    peers: BTreeMap<PeerId, Peer>,
    custodian_recovery_keys: Vec<CustodianRecoveryKey>,
    policies: BTreeMap<PolicyVersion, PolicyDocument>,
    introduction: Arc<dyn IntroductionPolicy>,
}

impl std::fmt::Debug for TrustGraphModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustGraphModel")
            .field("peers", &self.peers.len())
            .field("custodian_recovery_keys", &self.custodian_recovery_keys.len())
            .field("policies", &self.policies.len())
            .finish()
    }
}

impl TrustGraphModel {
    /// Parses every stored peer. Entries that fail to parse are logged and left out.
    pub fn load<C: CryptoProvider + ?Sized>(
        repo: &dyn TrustGraphRepo,
        codec: &IdentityCodec<'_, C>,
        introduction: Arc<dyn IntroductionPolicy>,
    ) -> Self {
        let mut peers = BTreeMap::new();
        for (peer_id, row) in repo.peer_rows() {
            let permanent_info = match codec.parse_permanent_info(peer_id, &row.permanent_info) {
                Ok(info) => info,
                Err(err) => {
                    warn!(peer_id = %peer_id, %err, "skipping peer with invalid permanent info");
                    continue;
                }
            };
            let stable_info = row.stable_info.as_ref().and_then(|blob| {
                codec
                    .parse_stable_info(blob, &permanent_info)
                    .map_err(|err| warn!(peer_id = %peer_id, %err, "ignoring invalid stable info"))
                    .ok()
            });
            let dynamic_info = row.dynamic_info.as_ref().and_then(|blob| {
                codec
                    .parse_dynamic_info(blob, &permanent_info)
                    .map_err(|err| warn!(peer_id = %peer_id, %err, "ignoring invalid dynamic info"))
                    .ok()
            });
            peers.insert(
                peer_id.clone(),
                Peer {
                    peer_id: peer_id.clone(),
                    permanent_info,
                    stable_info,
                    dynamic_info,
                },
            );
        }

        let mut policies = BTreeMap::new();
        for (version, doc) in repo.policy_document_rows() {
            if !doc.hash_matches_content() {
                warn!(version = %version, "skipping policy document whose content does not match its hash");
                continue;
            }
            policies.insert(version.clone(), doc.clone());
        }

        let custodian_recovery_keys = repo
            .custodian_recovery_key_rows()
            .into_iter()
            .cloned()
            .collect();

        debug!(peers = peers.len(), policies = policies.len(), "trust graph model loaded");
        Self {
            peers,
            custodian_recovery_keys,
            policies,
            introduction,
        }
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    fn members(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.trusts_itself())
    }

    pub fn is_recovery_key_enrolled(&self) -> bool {
        self.peers
            .values()
            .filter_map(|p| p.stable_info.as_ref())
            .any(StableInfo::has_recovery_key)
    }

    /// True iff some peer currently includes the custodian's peer ID.
    pub fn is_custodian_recovery_key_enrolled(&self, custodian_peer_id: &PeerId) -> bool {
        self.peers.values().any(|p| {
            p.peer_id != *custodian_peer_id
                && p.dynamic_info
                    .as_ref()
                    .is_some_and(|d| d.includes(custodian_peer_id))
        })
    }

    pub fn peer_id_that_trusts_recovery_keys(
        &self,
        keys: &RecoveryKeySet,
        candidate_permanent: &PermanentInfo,
        candidate_stable: &StableInfo,
    ) -> Option<PeerId> {
        let signing = keys.signing_public_key();
        let encryption = keys.encryption_public_key();
        let mut matched = 0usize;
        let sponsor = self
            .members()
            .filter(|p| {
                p.stable_info
                    .as_ref()
                    .is_some_and(|s| s.trusts_recovery_key(&signing, &encryption))
            })
            .inspect(|_| matched += 1)
            .find(|p| {
                self.introduction
                    .can_introduce(p, candidate_permanent, candidate_stable)
            });
        if sponsor.is_none() && matched > 0 {
            debug!(
                candidate = %candidate_permanent.peer_id,
                matched, "recovery key trusted, but no sponsor admits the candidate"
            );
        }
        sponsor.map(|p| p.peer_id.clone())
    }

    pub fn peer_id_that_trusts_custodian_recovery_keys(
        &self,
        custodian_key: &CustodianRecoveryKey,
        candidate_permanent: &PermanentInfo,
        candidate_stable: &StableInfo,
    ) -> Option<PeerId> {
        self.members()
            .filter(|p| p.peer_id != custodian_key.peer_id)
            .filter(|p| {
                p.dynamic_info
                    .as_ref()
                    .is_some_and(|d| d.includes(&custodian_key.peer_id))
            })
            .find(|p| {
                self.introduction
                    .can_introduce(p, candidate_permanent, candidate_stable)
            })
            .map(|p| p.peer_id.clone())
    }

    /// Several keys may share a UUID. The one whose peer is currently included wins.
    pub fn find_custodian_recovery_key(&self, uuid: Uuid) -> Option<&CustodianRecoveryKey> {
        let mut candidates = self
            .custodian_recovery_keys
            .iter()
            .filter(|k| k.uuid == uuid)
            .peekable();
        let first = *candidates.peek()?;
        candidates
            .find(|k| self.is_custodian_recovery_key_enrolled(&k.peer_id))
            .or(Some(first))
    }

    /// Highest version claimed by `for_peer_ids` (plus the candidate's own claim) that the
    /// candidate can evaluate: a lower version number, or exactly its own version.
    pub fn policy(
        &self,
        for_peer_ids: &BTreeSet<PeerId>,
        candidate_peer_id: &PeerId,
        candidate_stable: &StableInfo,
    ) -> Result<&PolicyDocument, PolicyResolutionError> {
        let cap = &candidate_stable.policy_version;
        let mut visible: BTreeSet<&PolicyVersion> = for_peer_ids
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter_map(|p| p.stable_info.as_ref())
            .map(|s| &s.policy_version)
            .collect();
        visible.insert(cap);

        visible
            .into_iter()
            .rev()
            .filter(|v| v.version_number < cap.version_number || *v == cap)
            .find_map(|v| self.policies.get(v))
            .ok_or_else(|| PolicyResolutionError::NotFound {
                candidate: candidate_peer_id.clone(),
                cap: cap.clone(),
            })
    }

    pub fn all_policy_versions(&self) -> BTreeSet<PolicyVersion> {
        self.peers
            .values()
            .filter_map(|p| p.stable_info.as_ref())
            .map(|s| s.policy_version.clone())
            .collect()
    }
}
