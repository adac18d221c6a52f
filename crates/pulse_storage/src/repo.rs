#![forbid(unsafe_code)]

use pulse_kernel_contracts::grant::{Grant, GrantInput};
use pulse_kernel_contracts::redemption::{RedemptionRecord, RedemptionRecordInput};
use pulse_kernel_contracts::{Address, Amount, UnixTimeSec};

use crate::store::{PeriodClaim, PeriodClaimRequest, PulseStore, StorageError};

/// Typed repository interface for grant rows.
pub trait GrantRepo {
    fn upsert_grant_row(&mut self, input: GrantInput, now: UnixTimeSec)
        -> Result<Grant, StorageError>;
    fn deactivate_grant_row(
        &mut self,
        user: &Address,
        asset: &Address,
        now: UnixTimeSec,
    ) -> Result<Grant, StorageError>;
    fn deactivate_all_grant_rows(
        &mut self,
        user: &Address,
        now: UnixTimeSec,
    ) -> Result<usize, StorageError>;
    fn grant_row(&self, user: &Address, asset: &Address) -> Option<&Grant>;
    fn active_grant_rows_for_user(&self, user: &Address) -> Vec<&Grant>;
    fn users_with_active_grant_rows(&self) -> Vec<Address>;
}

/// Typed repository interface for the append-only redemption ledger.
pub trait RedemptionLedgerRepo {
    fn append_redemption_row(
        &mut self,
        input: RedemptionRecordInput,
        period_cap: Amount,
    ) -> Result<RedemptionRecord, StorageError>;
    fn redemption_ledger_rows(&self) -> &[RedemptionRecord];
    fn redemption_rows_for_user(&self, user: &Address) -> Vec<&RedemptionRecord>;
    fn redemption_rows_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
    ) -> Vec<&RedemptionRecord>;
    fn redeemed_amount_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
    ) -> Amount;
}

/// Typed repository interface for in-flight period reservations.
pub trait PeriodClaimRepo {
    fn reserve_period_claim_row(
        &mut self,
        req: PeriodClaimRequest,
        now: UnixTimeSec,
        lease_secs: u64,
    ) -> Result<PeriodClaim, StorageError>;
    fn settle_period_claim_row(
        &mut self,
        claim: &PeriodClaim,
        settlement_ref: String,
        redeemed_at: UnixTimeSec,
    ) -> Result<RedemptionRecord, StorageError>;
    fn release_period_claim_row(&mut self, claim: &PeriodClaim) -> bool;
    fn in_flight_amount_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
        now: UnixTimeSec,
    ) -> Amount;
    fn live_period_claim_rows(&self, now: UnixTimeSec) -> Vec<&PeriodClaim>;
}

impl GrantRepo for PulseStore {
    fn upsert_grant_row(
        &mut self,
        input: GrantInput,
        now: UnixTimeSec,
    ) -> Result<Grant, StorageError> {
        self.upsert_grant(input, now)
    }

    fn deactivate_grant_row(
        &mut self,
        user: &Address,
        asset: &Address,
        now: UnixTimeSec,
    ) -> Result<Grant, StorageError> {
        self.deactivate_grant(user, asset, now)
    }

    fn deactivate_all_grant_rows(
        &mut self,
        user: &Address,
        now: UnixTimeSec,
    ) -> Result<usize, StorageError> {
        self.deactivate_all_grants(user, now)
    }

    fn grant_row(&self, user: &Address, asset: &Address) -> Option<&Grant> {
        self.grant(user, asset)
    }

    fn active_grant_rows_for_user(&self, user: &Address) -> Vec<&Grant> {
        self.active_grants_for_user(user)
    }

    fn users_with_active_grant_rows(&self) -> Vec<Address> {
        self.users_with_active_grants()
    }
}

impl RedemptionLedgerRepo for PulseStore {
    fn append_redemption_row(
        &mut self,
        input: RedemptionRecordInput,
        period_cap: Amount,
    ) -> Result<RedemptionRecord, StorageError> {
        self.append_redemption(input, period_cap)
    }

    fn redemption_ledger_rows(&self) -> &[RedemptionRecord] {
        self.redemption_rows()
    }

    fn redemption_rows_for_user(&self, user: &Address) -> Vec<&RedemptionRecord> {
        self.redemptions_for_user(user)
    }

    fn redemption_rows_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
    ) -> Vec<&RedemptionRecord> {
        self.redemptions_in_period(user, asset, period_start)
    }

    fn redeemed_amount_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
    ) -> Amount {
        self.redeemed_in_period(user, asset, period_start)
    }
}

impl PeriodClaimRepo for PulseStore {
    fn reserve_period_claim_row(
        &mut self,
        req: PeriodClaimRequest,
        now: UnixTimeSec,
        lease_secs: u64,
    ) -> Result<PeriodClaim, StorageError> {
        self.reserve_period_claim(req, now, lease_secs)
    }

    fn settle_period_claim_row(
        &mut self,
        claim: &PeriodClaim,
        settlement_ref: String,
        redeemed_at: UnixTimeSec,
    ) -> Result<RedemptionRecord, StorageError> {
        self.settle_period_claim(claim, settlement_ref, redeemed_at)
    }

    fn release_period_claim_row(&mut self, claim: &PeriodClaim) -> bool {
        self.release_period_claim(claim)
    }

    fn in_flight_amount_in_period(
        &self,
        user: &Address,
        asset: &Address,
        period_start: UnixTimeSec,
        now: UnixTimeSec,
    ) -> Amount {
        self.in_flight_in_period(user, asset, period_start, now)
    }

    fn live_period_claim_rows(&self, now: UnixTimeSec) -> Vec<&PeriodClaim> {
        self.live_claims(now)
    }
}
