#![forbid(unsafe_code)]

use std::collections::HashSet;

use keytrust_engines::crypto::CryptoProvider;
use keytrust_engines::identity_codec::IdentityCodec;
use keytrust_kernel_contracts::peer::{PeerId, Voucher, VoucherDigest};
use keytrust_storage::repo::TrustGraphRepo;
use tracing::{debug, info, warn};

use crate::trust_graph::TrustGraphModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Duplicate,
    Unparseable,
    UnknownBeneficiary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RepairStep {
    Drop {
        filed_under: PeerId,
        digest: VoucherDigest,
        reason: DropReason,
    },
    Move {
        from: PeerId,
        digest: VoucherDigest,
        to: PeerId,
    },
}

/// Counts of what one repair pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoucherRepairReport {
    pub duplicates_removed: usize,
    pub unparseable_dropped: usize,
    pub unknown_beneficiary_dropped: usize,
    pub moved: usize,
    pub failed: usize,
}

impl VoucherRepairReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

pub struct VoucherDeduplicator<'a, C: CryptoProvider + ?Sized> {
    codec: IdentityCodec<'a, C>,
    model: &'a TrustGraphModel,
}

impl<'a, C: CryptoProvider + ?Sized> VoucherDeduplicator<'a, C> {
    pub fn new(codec: IdentityCodec<'a, C>, model: &'a TrustGraphModel) -> Self {
        Self { codec, model }
    }

    fn plan(&self, repo: &dyn TrustGraphRepo) -> Vec<RepairStep> {
        let mut seen: HashSet<Voucher> = HashSet::new();
        let mut steps = Vec::new();
        for ((filed_under, digest), row) in repo.voucher_rows() {
            let voucher = match self.codec.parse_voucher(&row.voucher) {
                Ok(v) => v,
                Err(err) => {
                    warn!(filed_under = %filed_under, digest = digest.as_str(), %err, "dropping unparseable voucher");
                    steps.push(RepairStep::Drop {
                        filed_under: filed_under.clone(),
                        digest: digest.clone(),
                        reason: DropReason::Unparseable,
                    });
                    continue;
                }
            };
            if seen.contains(&voucher) {
                steps.push(RepairStep::Drop {
                    filed_under: filed_under.clone(),
                    digest: digest.clone(),
                    reason: DropReason::Duplicate,
                });
                continue;
            }
            let beneficiary = voucher.beneficiary_id.clone();
            seen.insert(voucher);
            if beneficiary == *filed_under {
                continue;
            }
            if self.model.peer(&beneficiary).is_some() {
                steps.push(RepairStep::Move {
                    from: filed_under.clone(),
                    digest: digest.clone(),
                    to: beneficiary,
                });
            } else {
                warn!(
                    filed_under = %filed_under,
                    beneficiary = %beneficiary,
                    "dropping voucher whose beneficiary is not in the graph"
                );
                steps.push(RepairStep::Drop {
                    filed_under: filed_under.clone(),
                    digest: digest.clone(),
                    reason: DropReason::UnknownBeneficiary,
                });
            }
        }
        steps
    }

    /// Best-effort repair. Per-voucher store failures are logged and counted, never returned.
    pub fn remove_duplicate_vouchers(&self, repo: &mut dyn TrustGraphRepo) -> VoucherRepairReport {
        let steps = self.plan(repo);
        let mut report = VoucherRepairReport::default();

        // Drops first so a move never lands next to a copy that is about to be deleted.
        let (drops, moves): (Vec<_>, Vec<_>) = steps
            .into_iter()
            .partition(|s| matches!(s, RepairStep::Drop { .. }));

        for step in drops.into_iter().chain(moves) {
            match step {
                RepairStep::Drop {
                    filed_under,
                    digest,
                    reason,
                } => match repo.remove_voucher_row(&filed_under, &digest) {
                    Ok(_) => match reason {
                        DropReason::Duplicate => report.duplicates_removed += 1,
                        DropReason::Unparseable => report.unparseable_dropped += 1,
                        DropReason::UnknownBeneficiary => report.unknown_beneficiary_dropped += 1,
                    },
                    Err(err) => {
                        warn!(filed_under = %filed_under, digest = digest.as_str(), %err, "failed to drop voucher");
                        report.failed += 1;
                    }
                },
                RepairStep::Move { from, digest, to } => {
                    match repo.move_voucher_row(&from, &digest, &to) {
                        Ok(()) => {
                            debug!(from = %from, to = %to, digest = digest.as_str(), "refiled voucher");
                            report.moved += 1;
                        }
                        Err(err) => {
                            warn!(from = %from, to = %to, %err, "failed to refile voucher");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        if !report.is_clean() {
            info!(?report, "voucher repair pass finished");
        }
        report
    }
}
