#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{amount_string, Address, Amount, ContractViolation, Validate};

pub const MAX_TRANSFERS_PER_BATCH: usize = 64;
pub const IDEMPOTENCY_KEY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Native value transfer straight to the recipient.
    Native,
    /// `transfer(recipient, amount)` call on the asset contract.
    Token,
}

impl TransferKind {
    pub fn for_asset(asset: &Address) -> Self {
        if asset.is_native_asset() {
            TransferKind::Native
        } else {
            TransferKind::Token
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::Native => "NATIVE",
            TransferKind::Token => "TOKEN",
        }
    }
}

/// One transfer to one recipient, tagged with the grant's authorization handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInstruction {
    pub kind: TransferKind,
    pub asset: Address,
    pub recipient: Address,
    #[serde(with = "amount_string")]
    pub amount: Amount,
    pub auth_context: String,
    pub auth_manager: String,
}

impl TransferInstruction {
    pub fn v1(
        asset: Address,
        recipient: Address,
        amount: Amount,
        auth_context: String,
        auth_manager: String,
    ) -> Result<Self, ContractViolation> {
        let instruction = Self {
            kind: TransferKind::for_asset(&asset),
            asset,
            recipient,
            amount,
            auth_context,
            auth_manager,
        };
        instruction.validate()?;
        Ok(instruction)
    }
}

impl Validate for TransferInstruction {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.amount == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "transfer_instruction.amount",
                reason: "must be > 0",
            });
        }
        if self.kind != TransferKind::for_asset(&self.asset) {
            return Err(ContractViolation::InvalidValue {
                field: "transfer_instruction.kind",
                reason: "must match the asset (native vs token)",
            });
        }
        if self.auth_context.trim().is_empty() || self.auth_manager.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "transfer_instruction.auth_context",
                reason: "authorization handles must be present",
            });
        }
        Ok(())
    }
}

/// Transfers for one asset under one delegation; settles atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBatch {
    pub idempotency_key: String,
    pub auth_context: String,
    pub auth_manager: String,
    pub transfers: Vec<TransferInstruction>,
}

impl TransferBatch {
    pub fn v1(
        idempotency_key: String,
        transfers: Vec<TransferInstruction>,
    ) -> Result<Self, ContractViolation> {
        let Some(first) = transfers.first() else {
            return Err(ContractViolation::InvalidValue {
                field: "transfer_batch.transfers",
                reason: "must not be empty",
            });
        };
        let batch = Self {
            idempotency_key,
            auth_context: first.auth_context.clone(),
            auth_manager: first.auth_manager.clone(),
            transfers,
        };
        batch.validate()?;
        Ok(batch)
    }

    pub fn asset(&self) -> Option<&Address> {
        self.transfers.first().map(|t| &t.asset)
    }

    pub fn total_amount(&self) -> Option<Amount> {
        self.transfers
            .iter()
            .try_fold(0u128, |acc, t| acc.checked_add(t.amount))
    }
}

impl Validate for TransferBatch {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.idempotency_key.len() != IDEMPOTENCY_KEY_LEN
            || !self.idempotency_key.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ContractViolation::InvalidValue {
                field: "transfer_batch.idempotency_key",
                reason: "must be 64 hex chars",
            });
        }
        if self.transfers.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "transfer_batch.transfers",
                reason: "must not be empty",
            });
        }
        if self.transfers.len() > MAX_TRANSFERS_PER_BATCH {
            return Err(ContractViolation::InvalidRange {
                field: "transfer_batch.transfers",
                min: 1,
                max: MAX_TRANSFERS_PER_BATCH as u64,
                got: self.transfers.len() as u64,
            });
        }
        let asset = &self.transfers[0].asset;
        for t in &self.transfers {
            t.validate()?;
            if &t.asset != asset {
                return Err(ContractViolation::InvalidValue {
                    field: "transfer_batch.transfers",
                    reason: "must all target the same asset",
                });
            }
            if t.auth_context != self.auth_context || t.auth_manager != self.auth_manager {
                return Err(ContractViolation::InvalidValue {
                    field: "transfer_batch.transfers",
                    reason: "must all use the batch authorization handles",
                });
            }
        }
        if self.total_amount().is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "transfer_batch.transfers",
                reason: "total amount overflows",
            });
        }
        Ok(())
    }
}

/// Opaque handle returned by the execution collaborator for a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchHandle(pub String);

impl BatchHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Settled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub status: SettlementStatus,
    pub settlement_ref: Option<String>,
    pub error: Option<String>,
}

impl SettlementReceipt {
    pub fn settled(settlement_ref: impl Into<String>) -> Self {
        Self {
            status: SettlementStatus::Settled,
            settlement_ref: Some(settlement_ref.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: SettlementStatus::Failed,
            settlement_ref: None,
            error: Some(error.into()),
        }
    }
}
