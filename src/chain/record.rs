//! Sealed Record
//!
//! The unit of the audit trail. A record is produced once by the sealer and
//! never edited afterwards; the only later write is attaching a timestamp
//! token that arrived after the record was appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::chain::hash::{compute_hash, ChainHash};
use crate::error::{IntegrityError, Result};
use crate::tsa::TimestampToken;

/// Identifier of one independent chain, e.g. `application-A-1` or `payments`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > 128 {
            return Err(IntegrityError::encoding(format!(
                "Chain id must be 1..=128 characters, got {}",
                id.len()
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(IntegrityError::encoding(format!(
                "Chain id contains invalid characters: {}",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChainId {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ChainId {
    type Error = IntegrityError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ChainId> for String {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

/// Sealed, signed and (optionally) timestamped record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedRecord {
    pub sequence_number: u64,
    pub payload: serde_json::Value,
    pub previous_hash: ChainHash,
    pub current_hash: ChainHash,
    /// Hex-encoded compact ECDSA signature over `current_hash`.
    pub signature: String,
    pub key_version: u32,
    /// `None` means the record was sealed in degraded mode.
    pub timestamp_token: Option<TimestampToken>,
    /// Local wall clock at seal time. Advisory only.
    pub sealed_at: DateTime<Utc>,
}

impl SealedRecord {
    /// Recompute the chain hash from the stored payload and previous hash.
    pub fn recompute_hash(&self) -> Result<ChainHash> {
        compute_hash(&self.payload, &self.previous_hash)
    }

    /// Check that the stored hash still matches the stored content.
    pub fn verify_hash(&self) -> bool {
        matches!(self.recompute_hash(), Ok(hash) if hash == self.current_hash)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_genesis()
    }

    pub fn is_timestamped(&self) -> bool {
        self.timestamp_token.is_some()
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "#{} {} (key v{}, {})",
            self.sequence_number,
            self.current_hash,
            self.key_version,
            if self.is_timestamped() {
                "timestamped"
            } else {
                "no timestamp"
            }
        )
    }
}

/// Position of a chain's tip: what the next record must link to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainState {
    pub next_sequence: u64,
    pub tip_hash: ChainHash,
}

impl ChainState {
    /// State of an empty chain.
    pub fn genesis() -> Self {
        Self {
            next_sequence: 0,
            tip_hash: ChainHash::GENESIS,
        }
    }

    /// State of a chain whose last record is `tip`. Fails once the
    /// sequence space is exhausted.
    pub fn after(tip: &SealedRecord) -> Result<Self> {
        let next_sequence = tip.sequence_number.checked_add(1).ok_or_else(|| {
            IntegrityError::ChainConflict(format!(
                "no sequence number follows {}",
                tip.sequence_number
            ))
        })?;
        Ok(Self {
            next_sequence,
            tip_hash: tip.current_hash,
        })
    }

    /// Resume from the caller's own previous hash, e.g. when extending a
    /// chain whose tip is tracked outside this process.
    pub fn resume(next_sequence: u64, tip_hash: ChainHash) -> Self {
        Self {
            next_sequence,
            tip_hash,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.next_sequence == 0 && self.tip_hash.is_genesis()
    }

    pub fn advance(&mut self, record: &SealedRecord) -> Result<()> {
        *self = Self::after(record)?;
        Ok(())
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::genesis()
    }
}
