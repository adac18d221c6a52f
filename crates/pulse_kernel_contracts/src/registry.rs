#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{amount_string, Address, Amount, ContractViolation, UnixTimeSec, Validate};

/// 100% in basis points.
pub const BPS_DENOMINATOR: u16 = 10_000;

/// Weighted backup recipient as configured in the external registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAllocation {
    pub recipient: Address,
    pub share_bps: u16,
}

impl BackupAllocation {
    pub fn v1(recipient: Address, share_bps: u16) -> Result<Self, ContractViolation> {
        let allocation = Self {
            recipient,
            share_bps,
        };
        allocation.validate()?;
        Ok(allocation)
    }
}

impl Validate for BackupAllocation {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.share_bps > BPS_DENOMINATOR {
            return Err(ContractViolation::InvalidRange {
                field: "backup_allocation.share_bps",
                min: 0,
                max: u64::from(BPS_DENOMINATOR),
                got: u64::from(self.share_bps),
            });
        }
        Ok(())
    }
}

/// Registry view of a user's check-in state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryUserStatus {
    pub registered: bool,
    pub distributing: bool,
    pub deadline: UnixTimeSec,
}

/// Best-effort notice sent to the registry after a settled distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionNotice {
    pub user: Address,
    pub asset: Address,
    pub recipients: Vec<Address>,
    #[serde(with = "amount_string::vec")]
    pub amounts: Vec<Amount>,
}

impl DistributionNotice {
    /// Native-asset distributions are reported against the zero address.
    pub fn v1(
        user: Address,
        asset: &Address,
        lines: impl IntoIterator<Item = (Address, Amount)>,
    ) -> Result<Self, ContractViolation> {
        let (recipients, amounts): (Vec<_>, Vec<_>) = lines.into_iter().unzip();
        let notice = Self {
            user,
            asset: if asset.is_native_asset() {
                Address::zero()
            } else {
                asset.clone()
            },
            recipients,
            amounts,
        };
        notice.validate()?;
        Ok(notice)
    }
}

impl Validate for DistributionNotice {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.recipients.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "distribution_notice.recipients",
                reason: "must not be empty",
            });
        }
        if self.recipients.len() != self.amounts.len() {
            return Err(ContractViolation::InvalidValue {
                field: "distribution_notice.amounts",
                reason: "must align with recipients",
            });
        }
        Ok(())
    }
}
