#![forbid(unsafe_code)]

use std::sync::Arc;

use keytrust_engines::crypto::CryptoProvider;
use keytrust_engines::identity_codec::IdentityCodec;
use keytrust_kernel_contracts::escrow::{EscrowRecord, ViabilityTier};
use keytrust_kernel_contracts::policy::PolicyVersion;
use keytrust_kernel_contracts::{ContractViolation, Validate};
use keytrust_storage::trust_store::{StorageError, TrustStore};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::config::TrustContainerConfig;
use crate::error::TrustError;
use crate::escrow_cache::{self, ViableBottles};
use crate::preflight::{
    ego_claimed_policy_version, CustodianRecoveryKeyRequest, PreflightOutcome,
    RecoveryPreflightEngine,
};
use crate::remote::RemoteTrustService;
use crate::trust_graph::{IntroductionPolicy, TrustGraphModel};
use crate::voucher_dedup::{VoucherDeduplicator, VoucherRepairReport};

/// One account's trust graph. Every operation, preflight included, runs under one gate.
pub struct TrustContainer<R, C>
where
    R: RemoteTrustService,
    C: CryptoProvider,
{
    config: TrustContainerConfig,
    remote: R,
    crypto: C,
    introduction: Arc<dyn IntroductionPolicy>,
    store: Mutex<TrustStore>,
}

impl<R, C> TrustContainer<R, C>
where
    R: RemoteTrustService,
    C: CryptoProvider,
{
    pub fn new(
        config: TrustContainerConfig,
        store: TrustStore,
        remote: R,
        crypto: C,
        introduction: Arc<dyn IntroductionPolicy>,
    ) -> Result<Self, ContractViolation> {
        config.validate()?;
        Ok(Self {
            config,
            remote,
            crypto,
            introduction,
            store: Mutex::new(store),
        })
    }

    pub fn config(&self) -> &TrustContainerConfig {
        &self.config
    }

    fn op_span(&self, op: &'static str) -> Span {
        info_span!(
            "trust_container",
            op,
            container = %self.config.container_name,
            context = %self.config.context_id,
        )
    }

    fn load_model(&self, store: &TrustStore) -> TrustGraphModel {
        TrustGraphModel::load(
            store,
            &IdentityCodec::new(&self.crypto),
            Arc::clone(&self.introduction),
        )
    }

    /// Reads the store under the gate.
    pub async fn with_store<T>(&self, f: impl FnOnce(&TrustStore) -> T) -> T {
        let store = self.store.lock().await;
        f(&store)
    }

    async fn fetch_remote_deltas(&self, store: &mut TrustStore) -> Result<(), TrustError> {
        let mut working = store.clone();
        self.remote
            .fetch_and_persist_changes_if_needed(&mut working)
            .await?;
        *store = working;
        Ok(())
    }

    async fn fetch_missing_policy_documents(&self, store: &mut TrustStore) -> Result<(), TrustError> {
        let missing: Vec<PolicyVersion> = {
            let mut wanted = self.load_model(store).all_policy_versions();
            wanted.extend(ego_claimed_policy_version(
                &*store,
                &IdentityCodec::new(&self.crypto),
            ));
            wanted
                .into_iter()
                .filter(|v| store.policy_document(v).is_none())
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        debug!(count = missing.len(), "fetching missing policy documents");

        for batch in missing.chunks(usize::from(self.config.max_policy_fetch_batch)) {
            let docs = self.remote.fetch_policy_documents(batch).await?;
            store.transaction(|tx| {
                for doc in docs {
                    if !batch.contains(&doc.version) {
                        warn!(version = %doc.version, "ignoring unrequested policy document");
                        continue;
                    }
                    if !doc.hash_matches_content() {
                        warn!(version = %doc.version, "ignoring policy document whose content does not match its hash");
                        continue;
                    }
                    tx.upsert_policy_document(doc)?;
                }
                Ok::<(), StorageError>(())
            })?;
        }
        Ok(())
    }

    async fn refresh(&self, store: &mut TrustStore) -> Result<(), TrustError> {
        self.fetch_remote_deltas(store).await?;
        self.fetch_missing_policy_documents(store).await
    }

    pub async fn preflight_vouch_with_recovery_key(
        &self,
        recovery_key: &str,
        salt: &str,
    ) -> Result<PreflightOutcome, TrustError> {
        async {
            let mut store = self.store.lock().await;
            self.refresh(&mut store).await?;
            let model = self.load_model(&store);
            RecoveryPreflightEngine::new(&self.crypto, &*store, &model)
                .preflight_vouch_with_recovery_key(recovery_key, salt)
        }
        .instrument(self.op_span("preflight_vouch_with_recovery_key"))
        .await
    }

    pub async fn preflight_vouch_with_custodian_recovery_key(
        &self,
        request: &CustodianRecoveryKeyRequest,
    ) -> Result<PreflightOutcome, TrustError> {
        async {
            let mut store = self.store.lock().await;
            self.refresh(&mut store).await?;
            let model = self.load_model(&store);
            RecoveryPreflightEngine::new(&self.crypto, &*store, &model)
                .preflight_vouch_with_custodian_recovery_key(request)
        }
        .instrument(self.op_span("preflight_vouch_with_custodian_recovery_key"))
        .await
    }

    /// Repairs voucher filing in one transaction. Per-voucher problems land in the report.
    pub async fn remove_duplicate_vouchers(&self) -> Result<VoucherRepairReport, TrustError> {
        async {
            let mut store = self.store.lock().await;
            let model = self.load_model(&store);
            let report = store.transaction(|tx| {
                let dedup = VoucherDeduplicator::new(IdentityCodec::new(&self.crypto), &model);
                Ok::<_, StorageError>(dedup.remove_duplicate_vouchers(tx))
            })?;
            Ok::<_, TrustError>(report)
        }
        .instrument(self.op_span("remove_duplicate_vouchers"))
        .await
    }

    pub async fn set_escrow_record(
        &self,
        record: &EscrowRecord,
        tier: ViabilityTier,
    ) -> Result<(), TrustError> {
        async {
            let mut store = self.store.lock().await;
            store.transaction(|tx| escrow_cache::set_escrow_record(tx, record, tier))?;
            Ok::<_, TrustError>(())
        }
        .instrument(self.op_span("set_escrow_record"))
        .await
    }

    pub async fn cached_escrow_records(&self) -> Vec<EscrowRecord> {
        let store = self.store.lock().await;
        escrow_cache::cached_escrow_records(&*store)
    }

    pub async fn cached_viable_bottles(&self) -> ViableBottles {
        let store = self.store.lock().await;
        escrow_cache::cached_viable_bottles(&*store)
    }

    pub async fn cached_records_contain_ego_peer_bottle(&self, records: &[EscrowRecord]) -> bool {
        let store = self.store.lock().await;
        escrow_cache::cached_records_contain_ego_peer_bottle(&*store, records)
    }
}
