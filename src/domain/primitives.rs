//! Domain primitives: TxHash, ContractAddress, DonorAddress, RoundId, ProposalId, TimeMs.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Block height on the chain.
pub type BlockNumber = u64;

/// Time in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeMs(pub i64);

impl TimeMs {
    pub fn new(ms: i64) -> Self {
        TimeMs(ms)
    }

    pub fn now() -> Self {
        TimeMs(chrono::Utc::now().timestamp_millis())
    }

    pub fn as_ms(&self) -> i64 {
        self.0
    }
}

/// Declares a string newtype with `new`, `as_str`, `is_empty` and `Display`.
///
/// Hex identifiers (addresses, hashes) are lowercased so that the same
/// on-chain value always produces the same key.
macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident, lowercase = $lower:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer).map($name::new)
            }
        }

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                let value: String = value.into();
                let value = value.trim();
                if $lower {
                    $name(value.to_ascii_lowercase())
                } else {
                    $name(value.to_string())
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_newtype!(
    /// Transaction hash of the transaction that emitted a log.
    TxHash,
    lowercase = true
);

string_newtype!(
    /// Address of a monitored contract.
    ContractAddress,
    lowercase = true
);

string_newtype!(
    /// Wallet address of a donor.
    DonorAddress,
    lowercase = true
);

string_newtype!(
    /// Identifier of a funding round.
    RoundId,
    lowercase = false
);

string_newtype!(
    /// Identifier of a proposal within a round.
    ProposalId,
    lowercase = false
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_identifiers_are_lowercased() {
        let a = TxHash::new("0xABCdef");
        assert_eq!(a.as_str(), "0xabcdef");
        assert_eq!(ContractAddress::new(" 0xFF ").as_str(), "0xff");
    }

    #[test]
    fn test_round_id_keeps_case() {
        assert_eq!(RoundId::new("Round-1").as_str(), "Round-1");
    }

    #[test]
    fn test_newtype_serializes_transparently() {
        let json = serde_json::to_string(&ProposalId::new("p1")).unwrap();
        assert_eq!(json, "\"p1\"");
    }

    #[test]
    fn test_deserialize_normalizes() {
        let donor: DonorAddress = serde_json::from_str("\"0xABC\"").unwrap();
        assert_eq!(donor.as_str(), "0xabc");
    }

    #[test]
    fn test_timems_ordering() {
        assert!(TimeMs::new(1000) < TimeMs::new(2000));
    }
}
