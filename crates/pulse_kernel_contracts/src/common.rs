#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

/// Seconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTimeSec(pub u64);

impl UnixTimeSec {
    pub fn saturating_add_secs(self, secs: u64) -> Self {
        UnixTimeSec(self.0.saturating_add(secs))
    }
}

/// Asset amount in the asset's smallest unit.
pub type Amount = u128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("{field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field}: {got} outside {min}..={max}")]
    InvalidRange {
        field: &'static str,
        min: u64,
        max: u64,
        got: u64,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

/// Amounts cross the wire as decimal strings so clients without 128-bit integers keep precision.
pub mod amount_string {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::Amount;

    pub fn serialize<S>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<Amount, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("amount '{raw}' must be a non-negative decimal integer"));
        }
        trimmed
            .parse::<Amount>()
            .map_err(|err| format!("amount '{raw}' is out of range: {err}"))
    }

    pub mod vec {
        use serde::ser::SerializeSeq;
        use serde::{Deserialize, Deserializer, Serializer};

        use crate::Amount;

        pub fn serialize<S>(amounts: &[Amount], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut seq = serializer.serialize_seq(Some(amounts.len()))?;
            for amount in amounts {
                seq.serialize_element(&amount.to_string())?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Amount>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Vec::<String>::deserialize(deserializer)?;
            raw.iter()
                .map(|v| super::parse(v).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}
