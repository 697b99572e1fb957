//! Chain Verification
//!
//! Walks an ordered run of sealed records and stops at the first record that
//! fails a check. Everything after a break is untrusted, whatever it claims.
//! Verification only reads; it can run alongside sealing of newer records.

use chrono::Duration;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::chain::{ChainHash, ChainState, SealedRecord};
use crate::crypto::KeyManager;
use crate::error::{IntegrityError, Result};

/// Why a record broke the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakReason {
    SequenceGap,
    HashMismatch,
    LinkageBroken,
    SignatureInvalid,
    TimestampInvalid,
    UnknownKeyVersion,
}

impl BreakReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakReason::SequenceGap => "SequenceGap",
            BreakReason::HashMismatch => "HashMismatch",
            BreakReason::LinkageBroken => "LinkageBroken",
            BreakReason::SignatureInvalid => "SignatureInvalid",
            BreakReason::TimestampInvalid => "TimestampInvalid",
            BreakReason::UnknownKeyVersion => "UnknownKeyVersion",
        }
    }
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checking one record against its expected position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordCheck {
    Valid { timestamped: bool },
    Broken { reason: BreakReason, detail: String },
}

impl RecordCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, RecordCheck::Valid { .. })
    }

    fn broken(reason: BreakReason, detail: impl Into<String>) -> Self {
        RecordCheck::Broken {
            reason,
            detail: detail.into(),
        }
    }
}

/// `VerificationReport { valid, brokenAt?, reason?, recordsChecked }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub valid: bool,
    /// Index into the verified slice of the first broken record.
    pub broken_at: Option<usize>,
    pub broken_sequence: Option<u64>,
    pub reason: Option<BreakReason>,
    pub detail: Option<String>,
    /// Records examined, including the broken one.
    pub records_checked: usize,
    /// Records after the break that were not examined.
    pub untrusted: usize,
    /// Valid records sealed in degraded mode.
    pub untimestamped: usize,
}

impl VerificationReport {
    fn valid(records_checked: usize, untimestamped: usize) -> Self {
        Self {
            valid: true,
            broken_at: None,
            broken_sequence: None,
            reason: None,
            detail: None,
            records_checked,
            untrusted: 0,
            untimestamped,
        }
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match (self.valid, self.reason) {
            (true, _) => format!(
                "Chain is valid ({} records, {} without timestamp)",
                self.records_checked, self.untimestamped
            ),
            (false, Some(reason)) => format!(
                "Chain broken at index {} (sequence {}): {}{}; {} later record(s) untrusted",
                self.broken_at.unwrap_or_default(),
                self.broken_sequence.unwrap_or_default(),
                reason,
                self.detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default(),
                self.untrusted
            ),
            (false, None) => "Chain is invalid".to_string(),
        }
    }
}

pub struct ChainVerifier {
    keys: Arc<KeyManager>,
    trusted_tsa_key: Option<PublicKey>,
    clock_skew: Duration,
}

impl ChainVerifier {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self {
            keys,
            trusted_tsa_key: None,
            clock_skew: Duration::seconds(120),
        }
    }

    /// Tokens are only accepted under this key. Without one, any record
    /// carrying a token fails with `TimestampInvalid`.
    pub fn with_trusted_tsa_key(mut self, key: Option<PublicKey>) -> Self {
        self.trusted_tsa_key = key;
        self
    }

    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    /// `verify(records, expectedGenesis?)`.
    ///
    /// `expected_genesis` is the hash the first record must link to. Without
    /// it, a record with sequence 0 must link to the genesis sentinel and a
    /// later starting record is taken as its own anchor.
    ///
    /// Errors are infrastructure failures (e.g. custody unreachable while
    /// fetching a public key); integrity failures are in the report.
    pub async fn verify(
        &self,
        records: &[SealedRecord],
        expected_genesis: Option<&ChainHash>,
    ) -> Result<VerificationReport> {
        match expected_genesis {
            // Linking to the sentinel claims to be the chain's start.
            Some(anchor) => {
                self.walk(records, anchor.is_genesis().then_some(0), Some(*anchor))
                    .await
            }
            None => self.walk(records, None, None).await,
        }
    }

    /// Verify records that must continue from `start`: the first one has
    /// sequence `start.next_sequence` and links to `start.tip_hash`.
    pub async fn verify_from(
        &self,
        records: &[SealedRecord],
        start: &ChainState,
    ) -> Result<VerificationReport> {
        self.walk(records, Some(start.next_sequence), Some(start.tip_hash))
            .await
    }

    async fn walk(
        &self,
        records: &[SealedRecord],
        first_sequence: Option<u64>,
        first_previous: Option<ChainHash>,
    ) -> Result<VerificationReport> {
        let mut untimestamped = 0;
        let mut previous: Option<&SealedRecord> = None;

        for (index, record) in records.iter().enumerate() {
            let check = match previous {
                Some(prev) => match prev.sequence_number.checked_add(1) {
                    Some(next) => {
                        self.check_record(record, Some(next), &prev.current_hash)
                            .await?
                    }
                    None => RecordCheck::broken(
                        BreakReason::SequenceGap,
                        format!("sequence {} has no successor", prev.sequence_number),
                    ),
                },
                None => {
                    let (expected_sequence, expected_previous) = match first_previous {
                        Some(anchor) => (first_sequence, anchor),
                        None if record.sequence_number == 0 => (None, ChainHash::GENESIS),
                        None => (None, record.previous_hash),
                    };
                    self.check_record(record, expected_sequence, &expected_previous)
                        .await?
                }
            };

            match check {
                RecordCheck::Valid { timestamped } => {
                    if !timestamped {
                        untimestamped += 1;
                    }
                }
                RecordCheck::Broken { reason, detail } => {
                    let untrusted = records.len() - index - 1;
                    error!(
                        "Chain broken at index {} (sequence {}): {} ({}); {} later record(s) untrusted",
                        index, record.sequence_number, reason, detail, untrusted
                    );
                    return Ok(VerificationReport {
                        valid: false,
                        broken_at: Some(index),
                        broken_sequence: Some(record.sequence_number),
                        reason: Some(reason),
                        detail: Some(detail),
                        records_checked: index + 1,
                        untrusted,
                        untimestamped,
                    });
                }
            }

            previous = Some(record);
        }

        info!(
            "Chain verified: {} records ({} without timestamp)",
            records.len(),
            untimestamped
        );
        Ok(VerificationReport::valid(records.len(), untimestamped))
    }

    /// Check a single record that should link to `expected_previous`.
    pub async fn verify_record(
        &self,
        record: &SealedRecord,
        expected_previous: &ChainHash,
    ) -> Result<RecordCheck> {
        self.check_record(record, None, expected_previous).await
    }

    async fn check_record(
        &self,
        record: &SealedRecord,
        expected_sequence: Option<u64>,
        expected_previous: &ChainHash,
    ) -> Result<RecordCheck> {
        // Sequence contiguity
        if let Some(expected) = expected_sequence {
            if record.sequence_number != expected {
                return Ok(RecordCheck::broken(
                    BreakReason::SequenceGap,
                    format!("expected sequence {}, found {}", expected, record.sequence_number),
                ));
            }
        }
        if record.previous_hash.is_genesis() && record.sequence_number != 0 {
            return Ok(RecordCheck::broken(
                BreakReason::SequenceGap,
                format!("genesis link on sequence {}", record.sequence_number),
            ));
        }

        // Stored hash against content
        match record.recompute_hash() {
            Ok(hash) if hash == record.current_hash => {}
            Ok(hash) => {
                return Ok(RecordCheck::broken(
                    BreakReason::HashMismatch,
                    format!("stored {}, recomputed {}", record.current_hash, hash),
                ));
            }
            Err(e) => {
                return Ok(RecordCheck::broken(BreakReason::HashMismatch, e.to_string()));
            }
        }

        // Linkage
        if record.previous_hash != *expected_previous {
            return Ok(RecordCheck::broken(
                BreakReason::LinkageBroken,
                format!(
                    "links to {}, expected {}",
                    record.previous_hash, expected_previous
                ),
            ));
        }

        // Signature under the version stamped on the record
        match self
            .keys
            .verify(record.key_version, &record.current_hash, &record.signature)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Ok(RecordCheck::broken(
                    BreakReason::SignatureInvalid,
                    format!("signature does not verify under key v{}", record.key_version),
                ));
            }
            Err(IntegrityError::UnknownKeyVersion(version)) => {
                return Ok(RecordCheck::broken(
                    BreakReason::UnknownKeyVersion,
                    format!("key v{} was never issued", version),
                ));
            }
            Err(e) => return Err(e),
        }

        // Timestamp, when present
        let Some(token) = &record.timestamp_token else {
            debug!("Record #{} has no timestamp token", record.sequence_number);
            return Ok(RecordCheck::Valid { timestamped: false });
        };

        let Some(trusted_tsa_key) = &self.trusted_tsa_key else {
            return Ok(RecordCheck::broken(
                BreakReason::TimestampInvalid,
                "no trusted TSA key configured".to_string(),
            ));
        };

        match token.check(&record.current_hash, trusted_tsa_key) {
            Ok(gen_time) if gen_time + self.clock_skew < record.sealed_at => {
                Ok(RecordCheck::broken(
                    BreakReason::TimestampInvalid,
                    format!(
                        "token time {} precedes seal time {}",
                        gen_time, record.sealed_at
                    ),
                ))
            }
            Ok(_) => Ok(RecordCheck::Valid { timestamped: true }),
            Err(e) => Ok(RecordCheck::broken(BreakReason::TimestampInvalid, e.to_string())),
        }
    }
}
