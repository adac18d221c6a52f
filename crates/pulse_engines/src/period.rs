#![forbid(unsafe_code)]

use pulse_kernel_contracts::grant::Grant;
use pulse_kernel_contracts::{amount_string, Address, Amount, UnixTimeSec};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccountingError {
    #[error("period length must be > 0 seconds")]
    ZeroPeriodLength,
    #[error("amount arithmetic overflowed")]
    AmountOverflow,
}

/// Half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodWindow {
    pub start: UnixTimeSec,
    pub end: UnixTimeSec,
}

impl PeriodWindow {
    pub fn contains(&self, t: UnixTimeSec) -> bool {
        self.start <= t && t < self.end
    }
}

/// What has already been committed against one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodUsage {
    pub settled: Amount,
    pub in_flight: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowanceSnapshot {
    pub user: Address,
    pub asset: Address,
    #[serde(with = "amount_string")]
    pub period_cap: Amount,
    pub period_length_seconds: u64,
    pub period: PeriodWindow,
    #[serde(with = "amount_string")]
    pub already_redeemed: Amount,
    #[serde(with = "amount_string")]
    pub in_flight: Amount,
    #[serde(with = "amount_string")]
    pub available_to_redeem: Amount,
    pub expired: bool,
}

/// Start of the period containing `now`, anchored at `granted_at`.
///
/// A `now` earlier than `granted_at` (clock skew between writer and reader) resolves to the
/// first period.
pub fn current_period_start(
    granted_at: UnixTimeSec,
    period_length_seconds: u64,
    now: UnixTimeSec,
) -> Result<UnixTimeSec, AccountingError> {
    if period_length_seconds == 0 {
        return Err(AccountingError::ZeroPeriodLength);
    }
    if now <= granted_at {
        return Ok(granted_at);
    }
    let elapsed = now.0 - granted_at.0;
    let completed_periods = elapsed / period_length_seconds;
    // completed_periods * period_length_seconds <= elapsed, so this cannot overflow.
    Ok(UnixTimeSec(
        granted_at.0 + completed_periods * period_length_seconds,
    ))
}

pub fn current_period_window(
    granted_at: UnixTimeSec,
    period_length_seconds: u64,
    now: UnixTimeSec,
) -> Result<PeriodWindow, AccountingError> {
    let start = current_period_start(granted_at, period_length_seconds, now)?;
    Ok(PeriodWindow {
        start,
        end: start.saturating_add_secs(period_length_seconds),
    })
}

/// `max(0, cap - settled - in_flight)`. Unused allowance never rolls over.
pub fn available_amount(period_cap: Amount, usage: PeriodUsage) -> Amount {
    period_cap.saturating_sub(usage.settled.saturating_add(usage.in_flight))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodAccountant;

impl PeriodAccountant {
    /// Computes the spendable allowance of `grant` at `now`. `usage_for_period` receives the
    /// current period start and returns what is already committed against that period only.
    pub fn snapshot<F>(
        grant: &Grant,
        now: UnixTimeSec,
        usage_for_period: F,
    ) -> Result<AllowanceSnapshot, AccountingError>
    where
        F: FnOnce(UnixTimeSec) -> PeriodUsage,
    {
        let period = current_period_window(grant.granted_at, grant.period_length_seconds, now)?;
        let usage = usage_for_period(period.start);
        let expired = grant.is_expired(now);
        let available_to_redeem = if !grant.active || expired {
            0
        } else {
            available_amount(grant.period_cap, usage)
        };
        Ok(AllowanceSnapshot {
            user: grant.user.clone(),
            asset: grant.asset.clone(),
            period_cap: grant.period_cap,
            period_length_seconds: grant.period_length_seconds,
            period,
            already_redeemed: usage.settled,
            in_flight: usage.in_flight,
            available_to_redeem,
            expired,
        })
    }
}
