#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{amount_string, Address, Amount, ContractViolation, SchemaVersion, UnixTimeSec, Validate};

pub const GRANT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_AUTH_CONTEXT_LEN: usize = 65_536;
pub const MAX_AUTH_MANAGER_LEN: usize = 256;

/// Identity of a grant row: one per (user, asset).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    pub user: Address,
    pub asset: Address,
}

impl GrantKey {
    pub fn new(user: Address, asset: Address) -> Self {
        Self { user, asset }
    }
}

/// Grant submission as received from the user. `granted_at` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantInput {
    pub user: Address,
    pub asset: Address,
    pub auth_context: String,
    pub auth_manager: String,
    #[serde(with = "amount_string")]
    pub period_cap: Amount,
    pub period_length_seconds: u64,
    pub expires_at: Option<UnixTimeSec>,
}

impl GrantInput {
    pub fn v1(
        user: Address,
        asset: Address,
        auth_context: String,
        auth_manager: String,
        period_cap: Amount,
        period_length_seconds: u64,
        expires_at: Option<UnixTimeSec>,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            user,
            asset,
            auth_context,
            auth_manager,
            period_cap,
            period_length_seconds,
            expires_at,
        };
        input.validate()?;
        Ok(input)
    }

    pub fn key(&self) -> GrantKey {
        GrantKey::new(self.user.clone(), self.asset.clone())
    }
}

impl Validate for GrantInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_auth_handles(&self.auth_context, &self.auth_manager)?;
        if self.period_length_seconds == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "grant_input.period_length_seconds",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Stored authorization permitting periodic redemption of one asset for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub schema_version: SchemaVersion,
    pub user: Address,
    pub asset: Address,
    pub auth_context: String,
    pub auth_manager: String,
    #[serde(with = "amount_string")]
    pub period_cap: Amount,
    pub period_length_seconds: u64,
    pub granted_at: UnixTimeSec,
    pub expires_at: Option<UnixTimeSec>,
    pub active: bool,
    pub updated_at: UnixTimeSec,
}

impl Grant {
    /// Issues (or re-issues) a grant. The period anchor resets to `now`.
    pub fn issue(input: GrantInput, now: UnixTimeSec) -> Result<Self, ContractViolation> {
        input.validate()?;
        Ok(Self {
            schema_version: GRANT_CONTRACT_VERSION,
            user: input.user,
            asset: input.asset,
            auth_context: input.auth_context,
            auth_manager: input.auth_manager,
            period_cap: input.period_cap,
            period_length_seconds: input.period_length_seconds,
            granted_at: now,
            expires_at: input.expires_at,
            active: true,
            updated_at: now,
        })
    }

    pub fn key(&self) -> GrantKey {
        GrantKey::new(self.user.clone(), self.asset.clone())
    }

    pub fn is_expired(&self, now: UnixTimeSec) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

impl Validate for Grant {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != GRANT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "grant.schema_version",
                reason: "must match GRANT_CONTRACT_VERSION",
            });
        }
        validate_auth_handles(&self.auth_context, &self.auth_manager)?;
        if self.period_length_seconds == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "grant.period_length_seconds",
                reason: "must be > 0",
            });
        }
        if self.updated_at < self.granted_at {
            return Err(ContractViolation::InvalidValue {
                field: "grant.updated_at",
                reason: "must be >= granted_at",
            });
        }
        Ok(())
    }
}

fn validate_auth_handles(auth_context: &str, auth_manager: &str) -> Result<(), ContractViolation> {
    if auth_context.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field: "grant.auth_context",
            reason: "must not be empty",
        });
    }
    if auth_context.len() > MAX_AUTH_CONTEXT_LEN {
        return Err(ContractViolation::InvalidValue {
            field: "grant.auth_context",
            reason: "must be <= 65536 bytes",
        });
    }
    if auth_manager.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field: "grant.auth_manager",
            reason: "must not be empty",
        });
    }
    if auth_manager.len() > MAX_AUTH_MANAGER_LEN {
        return Err(ContractViolation::InvalidValue {
            field: "grant.auth_manager",
            reason: "must be <= 256 bytes",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Address {
        Address::new(format!("0x{:040x}", last)).unwrap()
    }

    fn input(period_length_seconds: u64) -> Result<GrantInput, ContractViolation> {
        GrantInput::v1(
            addr(1),
            addr(2),
            "0xctx".to_string(),
            "0xmanager".to_string(),
            1_000,
            period_length_seconds,
            None,
        )
    }

    #[test]
    fn at_grant_01_zero_period_length_is_rejected() {
        assert!(matches!(
            input(0),
            Err(ContractViolation::InvalidValue {
                field: "grant_input.period_length_seconds",
                ..
            })
        ));
    }

    #[test]
    fn at_grant_02_issue_anchors_period_at_now() {
        let g = Grant::issue(input(86_400).unwrap(), UnixTimeSec(1_700_000_000)).unwrap();
        assert_eq!(g.granted_at, UnixTimeSec(1_700_000_000));
        assert_eq!(g.updated_at, g.granted_at);
        assert!(g.active);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn at_grant_03_expiry_is_inclusive_of_expires_at() {
        let mut g = Grant::issue(input(60).unwrap(), UnixTimeSec(100)).unwrap();
        assert!(!g.is_expired(UnixTimeSec(10_000)));
        g.expires_at = Some(UnixTimeSec(500));
        assert!(!g.is_expired(UnixTimeSec(499)));
        assert!(g.is_expired(UnixTimeSec(500)));
    }

    #[test]
    fn at_grant_04_empty_auth_handles_are_rejected() {
        let r = GrantInput::v1(
            addr(1),
            addr(2),
            " ".to_string(),
            "0xmanager".to_string(),
            1,
            60,
            None,
        );
        assert!(r.is_err());
    }
}
