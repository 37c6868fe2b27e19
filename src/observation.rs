use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Errors returned when parsing a hex-encoded hash.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    #[error("invalid hex in hash: {0}")]
    InvalidHex(String),

    #[error("hash must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A 32-byte content identifier (transaction or block hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Builds a hash whose last eight bytes hold `n` (big-endian).
    /// Handy for fixtures and benches.
    pub fn from_low_u64(n: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let raw = hex::decode(trimmed).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| HashParseError::InvalidLength(raw.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which kind of content a benchmark compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Transactions,
    Blocks,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::Blocks => "blocks",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-observation metadata carried through to detail rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObservationMeta {
    #[default]
    None,
    Transaction {
        from: String,
        to: Option<String>,
        calldata_size: u64,
    },
    Block {
        tx_count: u64,
    },
}

/// One source's sighting of a hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub hash: Hash,
    /// Local receipt time, microseconds since the Unix epoch.
    pub timestamp_us: i64,
    pub meta: ObservationMeta,
}

impl Observation {
    pub fn new(hash: Hash, timestamp_us: i64) -> Self {
        Self {
            hash,
            timestamp_us,
            meta: ObservationMeta::None,
        }
    }

    pub fn with_meta(mut self, meta: ObservationMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// Authoritative confirmation of a set of hashes, e.g. the transactions of
/// one execution payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationBatch {
    pub number: u64,
    pub hashes: Vec<Hash>,
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
