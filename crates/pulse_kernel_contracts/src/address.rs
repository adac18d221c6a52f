#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ContractViolation;

pub const NATIVE_ASSET: &str = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee";
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// 20-byte account or asset address, normalized to lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into();
        let trimmed = raw.trim();
        let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        else {
            return Err(ContractViolation::InvalidValue {
                field: "address",
                reason: "must start with 0x",
            });
        };
        if hex.len() != 40 {
            return Err(ContractViolation::InvalidValue {
                field: "address",
                reason: "must contain exactly 40 hex digits",
            });
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ContractViolation::InvalidValue {
                field: "address",
                reason: "must contain only hex digits",
            });
        }
        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn native_asset() -> Self {
        Self(NATIVE_ASSET.to_string())
    }

    pub fn zero() -> Self {
        Self(ZERO_ADDRESS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_native_asset(&self) -> bool {
        self.0 == NATIVE_ASSET
    }
}

impl TryFrom<String> for Address {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::new(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_address_01_normalizes_mixed_case() {
        let a = Address::new("0xAbCdEf0000000000000000000000000000000001").unwrap();
        assert_eq!(a.as_str(), "0xabcdef0000000000000000000000000000000001");
        let b = Address::new("0xabcdef0000000000000000000000000000000001").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn at_address_02_rejects_malformed_input() {
        assert!(Address::new("").is_err());
        assert!(Address::new("abcdef0000000000000000000000000000000001").is_err());
        assert!(Address::new("0x1234").is_err());
        assert!(Address::new("0xzzzzzz0000000000000000000000000000000001").is_err());
    }

    #[test]
    fn at_address_03_native_asset_is_recognized_in_any_case() {
        let upper = Address::new("0xEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE").unwrap();
        assert!(upper.is_native_asset());
        assert!(!Address::zero().is_native_asset());
    }

    #[test]
    fn at_address_04_deserialize_validates() {
        let ok: Address =
            serde_json::from_str("\"0x00000000000000000000000000000000000000AA\"").unwrap();
        assert_eq!(ok.as_str(), "0x00000000000000000000000000000000000000aa");
        assert!(serde_json::from_str::<Address>("\"not-an-address\"").is_err());
    }
}
