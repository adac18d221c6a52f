#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use pulse_engines::{AccountingError, AllocationSplitter, PeriodAccountant, PeriodUsage};
use pulse_kernel_contracts::grant::Grant;
use pulse_kernel_contracts::registry::{BackupAllocation, DistributionNotice};
use pulse_kernel_contracts::transfer::{
    BatchHandle, SettlementStatus, TransferBatch, TransferInstruction,
};
use pulse_kernel_contracts::{amount_string, Address, Amount, UnixTimeSec};
use pulse_storage::{PeriodClaim, PeriodClaimRequest, PulseStore, StorageError};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::bridge::env_u64;
use crate::eligibility::EligibilityMonitor;
use crate::execution::{ExecutionCollaborator, ExecutionError};
use crate::registry::DeadlineRegistry;

pub const SUBMIT_MAX_ATTEMPTS_DEFAULT: u32 = 3;
pub const SUBMIT_BACKOFF_MS_DEFAULT: u64 = 500;
pub const SUBMIT_BACKOFF_CAP_MS: u64 = 30_000;
pub const CLAIM_LEASE_SECS_DEFAULT: u64 = 900;

pub const IN_FLIGHT_DETAIL: &str = "redemption already in flight for this period";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedemptionConfig {
    pub submit_max_attempts: u32,
    pub submit_backoff_ms: u64,
    pub claim_lease_secs: u64,
}

impl RedemptionConfig {
    pub fn mvp_v1() -> Self {
        Self {
            submit_max_attempts: SUBMIT_MAX_ATTEMPTS_DEFAULT,
            submit_backoff_ms: SUBMIT_BACKOFF_MS_DEFAULT,
            claim_lease_secs: CLAIM_LEASE_SECS_DEFAULT,
        }
    }

    pub fn from_env() -> Self {
        Self {
            submit_max_attempts: env_u64(
                "PULSE_SUBMIT_MAX_ATTEMPTS",
                1..=10,
                u64::from(SUBMIT_MAX_ATTEMPTS_DEFAULT),
            ) as u32,
            submit_backoff_ms: env_u64(
                "PULSE_SUBMIT_BACKOFF_MS",
                0..=SUBMIT_BACKOFF_CAP_MS,
                SUBMIT_BACKOFF_MS_DEFAULT,
            ),
            claim_lease_secs: env_u64(
                "PULSE_CLAIM_LEASE_SECS",
                30..=86_400,
                CLAIM_LEASE_SECS_DEFAULT,
            ),
        }
    }
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

/// Early exits of a redemption. These are results, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotPastDeadline,
    NothingAvailable,
    NoBackupsConfigured,
    NoActiveGrant,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NotPastDeadline => "not past deadline",
            SkipReason::NothingAvailable => "nothing available this period",
            SkipReason::NoBackupsConfigured => "no backups configured",
            SkipReason::NoActiveGrant => "no active grant for this asset",
        }
    }
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetOutcomeStatus {
    Settled,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLine {
    pub recipient: Address,
    #[serde(with = "amount_string")]
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetOutcome {
    pub asset: Address,
    pub period_start: UnixTimeSec,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub status: AssetOutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_ref: Option<String>,
    pub transfers: Vec<TransferLine>,
    #[serde(with = "amount_string")]
    pub unallocated: Amount,
    pub registry_notified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AssetOutcome {
    fn pending(asset: Address, period_start: UnixTimeSec, amount: Amount) -> Self {
        Self {
            asset,
            period_start,
            amount,
            status: AssetOutcomeStatus::Skipped,
            settlement_ref: None,
            transfers: Vec::new(),
            unallocated: 0,
            registry_notified: false,
            detail: None,
            error: None,
        }
    }

    fn skipped(mut self, detail: impl Into<String>) -> Self {
        self.status = AssetOutcomeStatus::Skipped;
        self.detail = Some(detail.into());
        self
    }

    fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = AssetOutcomeStatus::Failed;
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionResult {
    pub user: Address,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub per_asset: Vec<AssetOutcome>,
    pub errors: Vec<String>,
}

impl RedemptionResult {
    fn skipped(user: &Address, reason: SkipReason) -> Self {
        Self {
            user: user.clone(),
            success: false,
            skip_reason: Some(reason),
            per_asset: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn failed(user: &Address, error: String) -> Self {
        Self {
            user: user.clone(),
            success: false,
            skip_reason: None,
            per_asset: Vec::new(),
            errors: vec![error],
        }
    }

    fn from_outcomes(user: &Address, per_asset: Vec<AssetOutcome>) -> Self {
        let errors: Vec<String> = per_asset
            .iter()
            .filter_map(|o| {
                o.error
                    .as_ref()
                    .map(|e| format!("Failed to redeem {}: {}", o.asset, e))
            })
            .collect();
        Self {
            user: user.clone(),
            success: errors.is_empty(),
            skip_reason: None,
            per_asset,
            errors,
        }
    }

    pub fn settled_assets(&self) -> impl Iterator<Item = &AssetOutcome> {
        self.per_asset
            .iter()
            .filter(|o| o.status == AssetOutcomeStatus::Settled)
    }
}

/// Unexpected faults. Expected failure modes travel inside `RedemptionResult`.
#[derive(Debug, thiserror::Error)]
pub enum RedemptionFault {
    #[error("storage fault: {0}")]
    Storage(#[from] StorageError),
    #[error("accounting fault: {0}")]
    Accounting(#[from] AccountingError),
    #[error("store lock poisoned")]
    StoreLockPoisoned,
}

/// `base * 2^(attempt-1)`, capped.
pub fn submit_backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(20);
    base_ms
        .saturating_mul(1u64 << shift)
        .min(SUBMIT_BACKOFF_CAP_MS)
}

pub(crate) fn lock_store(store: &Mutex<PulseStore>) -> Result<MutexGuard<'_, PulseStore>, RedemptionFault> {
    store.lock().map_err(|_| RedemptionFault::StoreLockPoisoned)
}

pub struct RedemptionOrchestrator<'a> {
    store: &'a Mutex<PulseStore>,
    registry: &'a dyn DeadlineRegistry,
    executor: &'a dyn ExecutionCollaborator,
    config: RedemptionConfig,
}

impl<'a> RedemptionOrchestrator<'a> {
    pub fn new(
        store: &'a Mutex<PulseStore>,
        registry: &'a dyn DeadlineRegistry,
        executor: &'a dyn ExecutionCollaborator,
        config: RedemptionConfig,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            config,
        }
    }

    /// Redeems the current period's allowance of every active grant of `user`.
    pub fn redeem(&self, user: &Address, now: UnixTimeSec) -> Result<RedemptionResult, RedemptionFault> {
        if let Some(exit) = self.require_distributing(user, now) {
            return Ok(exit);
        }

        let candidates: Vec<(Grant, UnixTimeSec, Amount)> = {
            let store = lock_store(self.store)?;
            let mut out = Vec::new();
            for grant in store.active_grants_for_user(user) {
                // Live claims are left to the reservation step so they surface as in flight.
                let snap = PeriodAccountant::snapshot(grant, now, |period_start| PeriodUsage {
                    settled: store.redeemed_in_period(user, &grant.asset, period_start),
                    in_flight: 0,
                })?;
                if snap.available_to_redeem > 0 {
                    out.push((grant.clone(), snap.period.start, snap.available_to_redeem));
                }
            }
            out
        };
        if candidates.is_empty() {
            return Ok(RedemptionResult::skipped(user, SkipReason::NothingAvailable));
        }

        let backups = match self.load_backups(user) {
            Ok(backups) => backups,
            Err(exit) => return Ok(exit),
        };

        let mut per_asset = Vec::with_capacity(candidates.len());
        for (grant, period_start, available) in candidates {
            let outcome = self.redeem_asset(&grant, period_start, available, None, &backups, now)?;
            per_asset.push(outcome);
        }
        Ok(RedemptionResult::from_outcomes(user, per_asset))
    }

    /// Redeems exactly `amount` of one asset in the current period.
    pub fn redeem_partial(
        &self,
        user: &Address,
        asset: &Address,
        amount: Amount,
        now: UnixTimeSec,
    ) -> Result<RedemptionResult, RedemptionFault> {
        if let Some(exit) = self.require_distributing(user, now) {
            return Ok(exit);
        }

        let (grant, period_start, available) = {
            let store = lock_store(self.store)?;
            let Some(grant) = store.grant(user, asset).filter(|g| g.active).cloned() else {
                return Ok(RedemptionResult::skipped(user, SkipReason::NoActiveGrant));
            };
            let snap = PeriodAccountant::snapshot(&grant, now, |period_start| PeriodUsage {
                settled: store.redeemed_in_period(user, asset, period_start),
                in_flight: 0,
            })?;
            (grant, snap.period.start, snap.available_to_redeem)
        };
        if available == 0 {
            return Ok(RedemptionResult::skipped(user, SkipReason::NothingAvailable));
        }

        let backups = match self.load_backups(user) {
            Ok(backups) => backups,
            Err(exit) => return Ok(exit),
        };

        let outcome =
            self.redeem_asset(&grant, period_start, amount, Some(amount), &backups, now)?;
        Ok(RedemptionResult::from_outcomes(user, vec![outcome]))
    }

    fn require_distributing(&self, user: &Address, now: UnixTimeSec) -> Option<RedemptionResult> {
        let status = EligibilityMonitor::new(self.registry).status(user, now);
        if status.distributing {
            return None;
        }
        let mut exit = RedemptionResult::skipped(user, SkipReason::NotPastDeadline);
        if let Some(err) = status.read_error {
            exit.errors.push(format!("registry read failed: {err}"));
        }
        Some(exit)
    }

    fn load_backups(&self, user: &Address) -> Result<Vec<BackupAllocation>, RedemptionResult> {
        match self.registry.backups(user) {
            Ok(backups) if backups.iter().any(|b| b.share_bps > 0) => Ok(backups),
            Ok(_) => Err(RedemptionResult::skipped(user, SkipReason::NoBackupsConfigured)),
            Err(err) => {
                tracing::warn!(user = %user, error = %err, "backup list read failed");
                Err(RedemptionResult::failed(
                    user,
                    format!("Failed to load backups: {err}"),
                ))
            }
        }
    }

    /// Pending -> Submitted -> Settled for one (user, asset, period). Any failure before
    /// settlement releases the claim, leaving the period pending.
    fn redeem_asset(
        &self,
        grant: &Grant,
        period_start: UnixTimeSec,
        expected: Amount,
        requested: Option<Amount>,
        backups: &[BackupAllocation],
        now: UnixTimeSec,
    ) -> Result<AssetOutcome, RedemptionFault> {
        let outcome = AssetOutcome::pending(grant.asset.clone(), period_start, expected);

        let reserved = lock_store(self.store)?.reserve_period_claim(
            PeriodClaimRequest {
                user: grant.user.clone(),
                asset: grant.asset.clone(),
                granted_at: grant.granted_at,
                period_start,
                period_cap: grant.period_cap,
                requested,
            },
            now,
            self.config.claim_lease_secs,
        );
        let claim = match reserved {
            Ok(claim) => claim,
            Err(StorageError::ClaimConflict { .. }) => {
                tracing::info!(user = %grant.user, asset = %grant.asset, "skipping asset: {}", IN_FLIGHT_DETAIL);
                return Ok(outcome.skipped(IN_FLIGHT_DETAIL));
            }
            Err(StorageError::NothingAvailable { .. }) => {
                return Ok(outcome.skipped(SkipReason::NothingAvailable.as_str()));
            }
            Err(err) => return Ok(outcome.failed(err.to_string())),
        };
        let mut outcome = AssetOutcome {
            amount: claim.amount,
            ..outcome
        };

        let split = match AllocationSplitter::split(claim.amount, backups) {
            Ok(split) => split,
            Err(err) => {
                self.release(&claim)?;
                return Err(err.into());
            }
        };
        outcome.unallocated = AllocationSplitter::unallocated(claim.amount, &split);
        outcome.transfers = split
            .iter()
            .map(|(recipient, amount)| TransferLine {
                recipient: recipient.clone(),
                amount: *amount,
            })
            .collect();
        if split.is_empty() {
            self.release(&claim)?;
            return Ok(outcome.skipped(format!(
                "backup shares allocate nothing from {}",
                claim.amount
            )));
        }

        let batch = match build_batch(grant, &claim, &split) {
            Ok(batch) => batch,
            Err(err) => {
                self.release(&claim)?;
                return Ok(outcome.failed(err));
            }
        };

        let settlement = self
            .submit_with_retry(&batch)
            .and_then(|handle| self.await_settled(&handle));
        let settlement_ref = match settlement {
            Ok(settlement_ref) => settlement_ref,
            Err(err) => {
                tracing::warn!(user = %grant.user, asset = %grant.asset, error = %err, "redemption failed; period stays pending");
                self.release(&claim)?;
                return Ok(outcome.failed(err.to_string()));
            }
        };
        outcome.settlement_ref = Some(settlement_ref.clone());

        let recorded = lock_store(self.store)?.settle_period_claim(&claim, settlement_ref.clone(), now);
        if let Err(err) = recorded {
            // Funds moved but the ledger refused the row. The claim is kept until its lease
            // lapses; a retry reuses the idempotency key so the executor dedupes it.
            tracing::error!(
                user = %grant.user,
                asset = %grant.asset,
                settlement_ref = %settlement_ref,
                error = %err,
                "settled transfer could not be recorded"
            );
            return Ok(outcome.failed(format!("settled as {settlement_ref} but not recorded: {err}")));
        }
        outcome.status = AssetOutcomeStatus::Settled;
        tracing::info!(
            user = %grant.user,
            asset = %grant.asset,
            amount = %claim.amount,
            settlement_ref = %settlement_ref,
            "redemption settled"
        );

        outcome.registry_notified = self.notify_registry(grant, &split);
        Ok(outcome)
    }

    fn submit_with_retry(&self, batch: &TransferBatch) -> Result<BatchHandle, ExecutionError> {
        let max_attempts = self.config.submit_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.executor.submit_batch(batch) {
                Ok(handle) => {
                    tracing::info!(
                        handle = handle.as_str(),
                        idempotency_key = %batch.idempotency_key,
                        transfers = batch.transfers.len(),
                        "transfer batch submitted"
                    );
                    return Ok(handle);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay_ms = submit_backoff_ms(self.config.submit_backoff_ms, attempt);
                    tracing::warn!(attempt, delay_ms, error = %err, "batch submission failed; retrying");
                    if delay_ms > 0 {
                        thread::sleep(Duration::from_millis(delay_ms));
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn await_settled(&self, handle: &BatchHandle) -> Result<String, ExecutionError> {
        let receipt = self.executor.await_settlement(handle)?;
        match receipt.status {
            SettlementStatus::Settled => receipt
                .settlement_ref
                .filter(|r| !r.trim().is_empty())
                .ok_or_else(|| {
                    ExecutionError::InvalidResponse("settled without a settlement reference".to_string())
                }),
            SettlementStatus::Failed => Err(ExecutionError::SettlementFailed(
                receipt.error.unwrap_or_else(|| "no reason given".to_string()),
            )),
            SettlementStatus::Pending => Err(ExecutionError::InvalidResponse(
                "settlement still pending".to_string(),
            )),
        }
    }

    fn release(&self, claim: &PeriodClaim) -> Result<(), RedemptionFault> {
        lock_store(self.store)?.release_period_claim(claim);
        Ok(())
    }

    fn notify_registry(&self, grant: &Grant, split: &BTreeMap<Address, Amount>) -> bool {
        let notice = match DistributionNotice::v1(
            grant.user.clone(),
            &grant.asset,
            split.iter().map(|(r, a)| (r.clone(), *a)),
        ) {
            Ok(notice) => notice,
            Err(err) => {
                tracing::warn!(user = %grant.user, error = %err, "distribution notice not built");
                return false;
            }
        };
        match self.registry.record_distribution(&notice) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(user = %grant.user, asset = %grant.asset, error = %err, "registry distribution notice failed");
                false
            }
        }
    }
}

fn build_batch(
    grant: &Grant,
    claim: &PeriodClaim,
    split: &BTreeMap<Address, Amount>,
) -> Result<TransferBatch, String> {
    let total = split
        .values()
        .try_fold(0u128, |acc, a| acc.checked_add(*a))
        .ok_or_else(|| "allocation total overflows".to_string())?;
    if total > claim.amount {
        return Err(format!(
            "backup shares allocate {total}, more than the {} available",
            claim.amount
        ));
    }
    let transfers = split
        .iter()
        .map(|(recipient, amount)| {
            TransferInstruction::v1(
                grant.asset.clone(),
                recipient.clone(),
                *amount,
                grant.auth_context.clone(),
                grant.auth_manager.clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| err.to_string())?;
    TransferBatch::v1(batch_idempotency_key(claim, split), transfers).map_err(|err| err.to_string())
}

/// Binds the claim's period key to the exact transfer lines. Resubmitting the same batch keeps the
/// key; a batch that differs in amount or recipients never dedupes against an earlier one.
fn batch_idempotency_key(claim: &PeriodClaim, split: &BTreeMap<Address, Amount>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(claim.idempotency_key.as_bytes());
    hasher.update(b"|");
    hasher.update(claim.amount.to_string().as_bytes());
    for (recipient, amount) in split {
        hasher.update(b"|");
        hasher.update(recipient.as_str().as_bytes());
        hasher.update(b"=");
        hasher.update(amount.to_string().as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
