#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use pulse_kernel_contracts::registry::{BackupAllocation, BPS_DENOMINATOR};
use pulse_kernel_contracts::{Address, Amount};

use crate::period::AccountingError;

/// Splits a redeemable total across weighted backup recipients.
///
/// Each recipient receives `floor(total * share_bps / 10_000)`. The truncation remainder is
/// dropped, and shares that do not sum to 10_000 scale the output by the same ratio.
/// Zero shares and zero results produce no entry. A recipient listed more than once receives
/// the sum of its entries, which keeps the result independent of input order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationSplitter;

impl AllocationSplitter {
    pub fn split(
        total: Amount,
        recipients: &[BackupAllocation],
    ) -> Result<BTreeMap<Address, Amount>, AccountingError> {
        let mut out: BTreeMap<Address, Amount> = BTreeMap::new();
        for backup in recipients {
            if backup.share_bps == 0 {
                continue;
            }
            let amount = share_of(total, backup.share_bps)?;
            if amount == 0 {
                continue;
            }
            let slot = out.entry(backup.recipient.clone()).or_insert(0);
            *slot = slot
                .checked_add(amount)
                .ok_or(AccountingError::AmountOverflow)?;
        }
        Ok(out)
    }

    /// Units of `total` not assigned to anyone by `split`.
    pub fn unallocated(total: Amount, split: &BTreeMap<Address, Amount>) -> Amount {
        let assigned = split
            .values()
            .fold(0u128, |acc, amount| acc.saturating_add(*amount));
        total.saturating_sub(assigned)
    }
}

/// `floor(total * share_bps / 10_000)` without overflowing the intermediate product.
pub fn share_of(total: Amount, share_bps: u16) -> Result<Amount, AccountingError> {
    let denom = Amount::from(BPS_DENOMINATOR);
    let bps = Amount::from(share_bps);
    let whole = (total / denom)
        .checked_mul(bps)
        .ok_or(AccountingError::AmountOverflow)?;
    let part = (total % denom) * bps / denom;
    whole.checked_add(part).ok_or(AccountingError::AmountOverflow)
}
