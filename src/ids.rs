//! Identifier primitives: trace IDs, chains, token references.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

/// 128-bit identifier linking every row of one logical action.
///
/// Rendered as 32 lowercase hex characters. Sibling rows (a trade and its
/// gas-fee row) share one trace ID; unrelated actions must never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn new() -> Self {
        TraceId(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for TraceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(CoreError::InputInvalid(format!(
                "trace id must be 32 hex chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|_| CoreError::InputInvalid(format!("trace id not hex: {s}")))?;
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(TraceId(out))
    }
}

impl Serialize for TraceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Supported chains. Addresses are opaque strings tagged with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Ethereum,
    Bsc,
    Polygon,
    Base,
    Arbitrum,
    Solana,
}

impl ChainId {
    pub const ALL: [ChainId; 6] = [
        ChainId::Ethereum,
        ChainId::Bsc,
        ChainId::Polygon,
        ChainId::Base,
        ChainId::Arbitrum,
        ChainId::Solana,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Ethereum => "ethereum",
            ChainId::Bsc => "bsc",
            ChainId::Polygon => "polygon",
            ChainId::Base => "base",
            ChainId::Arbitrum => "arbitrum",
            ChainId::Solana => "solana",
        }
    }

    /// Symbol of the chain's native currency.
    pub fn native_currency(&self) -> &'static str {
        match self {
            ChainId::Ethereum | ChainId::Base | ChainId::Arbitrum => "ETH",
            ChainId::Bsc => "BNB",
            ChainId::Polygon => "MATIC",
            ChainId::Solana => "SOL",
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" => Ok(ChainId::Ethereum),
            "bsc" => Ok(ChainId::Bsc),
            "polygon" => Ok(ChainId::Polygon),
            "base" => Ok(ChainId::Base),
            "arbitrum" => Ok(ChainId::Arbitrum),
            "solana" | "sol" => Ok(ChainId::Solana),
            other => Err(CoreError::InputInvalid(format!("unknown chain: {other}"))),
        }
    }
}

/// Opaque token address tagged with its chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRef {
    pub address: String,
    pub chain: ChainId,
}

impl TokenRef {
    pub fn new(address: impl Into<String>, chain: ChainId) -> Self {
        TokenRef {
            address: address.into(),
            chain,
        }
    }
}

impl fmt::Display for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn trace_id_is_32_hex_chars() {
        let id = TraceId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(s.parse::<TraceId>().unwrap(), id);
    }

    #[test]
    fn trace_ids_do_not_collide_in_practice() {
        let ids: HashSet<String> = (0..1000).map(|_| TraceId::new().to_string()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn trace_id_rejects_bad_input() {
        assert!("short".parse::<TraceId>().is_err());
        assert!("zz".repeat(16).parse::<TraceId>().is_err());
    }

    #[test]
    fn chain_parse_and_native_currency() {
        assert_eq!("Ethereum".parse::<ChainId>().unwrap(), ChainId::Ethereum);
        assert_eq!("bsc".parse::<ChainId>().unwrap().native_currency(), "BNB");
        assert_eq!(ChainId::Base.native_currency(), "ETH");
        assert!("near".parse::<ChainId>().is_err());
    }
}
