#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{amount_string, Address, Amount, ContractViolation, SchemaVersion, UnixTimeSec, Validate};

pub const REDEMPTION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_SETTLEMENT_REF_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedemptionId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecordInput {
    pub user: Address,
    pub asset: Address,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub settlement_ref: String,
    pub redeemed_at: UnixTimeSec,
    pub period_start: UnixTimeSec,
}

impl RedemptionRecordInput {
    pub fn v1(
        user: Address,
        asset: Address,
        amount: Amount,
        settlement_ref: String,
        redeemed_at: UnixTimeSec,
        period_start: UnixTimeSec,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            user,
            asset,
            amount,
            settlement_ref,
            redeemed_at,
            period_start,
        };
        input.validate()?;
        Ok(input)
    }
}

impl Validate for RedemptionRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.amount == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "redemption_record_input.amount",
                reason: "must be > 0",
            });
        }
        if self.settlement_ref.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "redemption_record_input.settlement_ref",
                reason: "must not be empty",
            });
        }
        if self.settlement_ref.len() > MAX_SETTLEMENT_REF_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "redemption_record_input.settlement_ref",
                reason: "must be <= 256 chars",
            });
        }
        if self.redeemed_at < self.period_start {
            return Err(ContractViolation::InvalidValue {
                field: "redemption_record_input.redeemed_at",
                reason: "must be >= period_start",
            });
        }
        Ok(())
    }
}

/// Append-only proof of one settled redemption for (user, asset, period_start).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub schema_version: SchemaVersion,
    pub redemption_id: RedemptionId,
    pub user: Address,
    pub asset: Address,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub settlement_ref: String,
    pub redeemed_at: UnixTimeSec,
    pub period_start: UnixTimeSec,
}

impl RedemptionRecord {
    pub fn from_input(redemption_id: RedemptionId, input: RedemptionRecordInput) -> Self {
        Self {
            schema_version: REDEMPTION_CONTRACT_VERSION,
            redemption_id,
            user: input.user,
            asset: input.asset,
            amount: input.amount,
            settlement_ref: input.settlement_ref,
            redeemed_at: input.redeemed_at,
            period_start: input.period_start,
        }
    }
}

impl Validate for RedemptionRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != REDEMPTION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "redemption_record.schema_version",
                reason: "must match REDEMPTION_CONTRACT_VERSION",
            });
        }
        if self.redemption_id.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "redemption_record.redemption_id",
                reason: "must be > 0",
            });
        }
        RedemptionRecordInput {
            user: self.user.clone(),
            asset: self.asset.clone(),
            amount: self.amount,
            settlement_ref: self.settlement_ref.clone(),
            redeemed_at: self.redeemed_at,
            period_start: self.period_start,
        }
        .validate()
    }
}
