//! Record Sealer
//!
//! Turns raw payloads into sealed records: canonical hash linked to the
//! previous record, signature by the current key, and a timestamp token when
//! the TSA cooperates. Sealing is split into a signing phase and a stamping
//! phase so callers that persist records can release their chain lock before
//! waiting on the TSA.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::{compute_hash, ChainHash, ChainState, SealedRecord};
use crate::config::BatchTimestampMode;
use crate::crypto::KeyManager;
use crate::error::Result;
use crate::tsa::{TimestampClient, TimestampOutcome, TimestampToken};

pub struct RecordSealer {
    keys: Arc<KeyManager>,
    timestamps: Arc<TimestampClient>,
    batch_mode: BatchTimestampMode,
}

impl RecordSealer {
    pub fn new(keys: Arc<KeyManager>, timestamps: Arc<TimestampClient>) -> Self {
        Self {
            keys,
            timestamps,
            batch_mode: BatchTimestampMode::PerRecord,
        }
    }

    pub fn with_batch_mode(mut self, batch_mode: BatchTimestampMode) -> Self {
        self.batch_mode = batch_mode;
        self
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn timestamps(&self) -> &Arc<TimestampClient> {
        &self.timestamps
    }

    pub fn batch_mode(&self) -> BatchTimestampMode {
        self.batch_mode
    }

    /// `seal(payload, previousHash, chainState)`.
    ///
    /// `state` only advances when a complete record is returned.
    pub async fn seal<T>(&self, payload: &T, state: &mut ChainState) -> Result<SealedRecord>
    where
        T: Serialize + ?Sized,
    {
        let mut record = self.sign_next(payload, state).await?;
        record.timestamp_token = self.stamp(&record.current_hash).await?;
        state.advance(&record)?;
        Ok(record)
    }

    /// Like `seal`, but the timestamp request is abandoned when `cancel`
    /// resolves; the record is then sealed without a token.
    pub async fn seal_with_cancel<T, C>(
        &self,
        payload: &T,
        state: &mut ChainState,
        cancel: C,
    ) -> Result<SealedRecord>
    where
        T: Serialize + ?Sized,
        C: Future<Output = ()>,
    {
        let mut record = self.sign_next(payload, state).await?;
        let outcome = self
            .timestamps
            .request_timestamp_cancellable(&record.current_hash, cancel)
            .await?;
        record.timestamp_token = self.token_from(&record.current_hash, outcome);
        state.advance(&record)?;
        Ok(record)
    }

    /// `sealBatch(payloads, previousHash)`: all-or-nothing.
    ///
    /// Any encoding, key or rejection error leaves `state` untouched and
    /// returns no records.
    pub async fn seal_batch<T>(&self, payloads: &[T], state: &mut ChainState) -> Result<Vec<SealedRecord>>
    where
        T: Serialize,
    {
        let mut records = self.sign_batch(payloads, state).await?;
        let tokens = self.stamp_batch(&records).await?;
        for (record, token) in records.iter_mut().zip(tokens) {
            record.timestamp_token = token;
        }

        if let Some(last) = records.last() {
            state.advance(last)?;
        }
        Ok(records)
    }

    /// Hash and sign the record that would follow `state`, without a
    /// timestamp. Does not advance `state`.
    pub async fn sign_next<T>(&self, payload: &T, state: &ChainState) -> Result<SealedRecord>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        let current_hash = compute_hash(&payload, &state.tip_hash)?;

        let key = self.keys.current_key().await?;
        let signature = key.sign(&current_hash).await?;

        debug!(
            "Signed record #{} {} with key v{}",
            state.next_sequence,
            current_hash,
            key.version()
        );

        Ok(SealedRecord {
            sequence_number: state.next_sequence,
            payload,
            previous_hash: state.tip_hash,
            current_hash,
            signature,
            key_version: key.version(),
            timestamp_token: None,
            sealed_at: Utc::now(),
        })
    }

    /// Hash and sign a contiguous extension of `state`. Nothing is returned
    /// unless every record was signed.
    pub async fn sign_batch<T>(&self, payloads: &[T], state: &ChainState) -> Result<Vec<SealedRecord>>
    where
        T: Serialize,
    {
        let mut cursor = *state;
        let mut records = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let record = self.sign_next(payload, &cursor).await?;
            cursor.advance(&record)?;
            records.push(record);
        }

        Ok(records)
    }

    /// Timestamp one hash. `Ok(None)` is degraded mode.
    pub async fn stamp(&self, hash: &ChainHash) -> Result<Option<TimestampToken>> {
        let outcome = self.timestamps.request_timestamp(hash).await?;
        Ok(self.token_from(hash, outcome))
    }

    /// Timestamp tokens for a signed batch, one slot per record.
    pub async fn stamp_batch(&self, records: &[SealedRecord]) -> Result<Vec<Option<TimestampToken>>> {
        let mut tokens = vec![None; records.len()];
        let Some(last) = records.last() else {
            return Ok(tokens);
        };

        match self.batch_mode {
            BatchTimestampMode::PerRecord => {
                let hashes: Vec<ChainHash> = records.iter().map(|r| r.current_hash).collect();
                let outcomes = self.timestamps.timestamp_batch(&hashes).await?;
                for ((slot, hash), outcome) in tokens.iter_mut().zip(&hashes).zip(outcomes) {
                    *slot = self.token_from(hash, outcome);
                }
            }
            BatchTimestampMode::FinalOnly => {
                if let Some(slot) = tokens.last_mut() {
                    *slot = self.stamp(&last.current_hash).await?;
                }
            }
        }

        Ok(tokens)
    }

    fn token_from(&self, hash: &ChainHash, outcome: TimestampOutcome) -> Option<TimestampToken> {
        match outcome {
            TimestampOutcome::Stamped(token) => Some(token),
            TimestampOutcome::Unavailable { reason } => {
                warn!("Sealing {} without a timestamp: {}", hash, reason);
                None
            }
        }
    }
}
