use std::collections::HashMap;
use tokio::sync::RwLock;

use super::check_extends;
use crate::chain::{ChainHash, ChainId, SealedRecord};
use crate::error::Result;
use crate::tsa::TimestampToken;

/// Process-local store. Records are indexed by position: sequence numbers
/// start at 0 and are contiguous, so `records[n].sequence_number == n`.
#[derive(Default)]
pub struct MemoryStore {
    chains: RwLock<HashMap<ChainId, Vec<SealedRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append_batch(&self, chain: &ChainId, records: &[SealedRecord]) -> Result<()> {
        let mut chains = self.chains.write().await;
        let existing = chains.entry(chain.clone()).or_default();
        check_extends(chain, existing.last(), records)?;
        existing.extend_from_slice(records);
        Ok(())
    }

    pub async fn range(&self, chain: &ChainId, from: u64, to: u64) -> Result<Vec<SealedRecord>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.sequence_number >= from && r.sequence_number <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn by_hash(&self, chain: &ChainId, hash: &ChainHash) -> Result<Option<SealedRecord>> {
        let chains = self.chains.read().await;
        Ok(chains
            .get(chain)
            .and_then(|records| records.iter().find(|r| r.current_hash == *hash))
            .cloned())
    }

    pub async fn tip(&self, chain: &ChainId) -> Result<Option<SealedRecord>> {
        let chains = self.chains.read().await;
        Ok(chains.get(chain).and_then(|records| records.last()).cloned())
    }

    pub async fn attach_timestamp(
        &self,
        chain: &ChainId,
        sequence_number: u64,
        token: &TimestampToken,
    ) -> Result<bool> {
        let mut chains = self.chains.write().await;
        let Some(record) = chains
            .get_mut(chain)
            .and_then(|records| records.get_mut(sequence_number as usize))
        else {
            return Ok(false);
        };
        if record.timestamp_token.is_some() {
            return Ok(false);
        }
        record.timestamp_token = Some(token.clone());
        Ok(true)
    }

    pub async fn chains(&self) -> Result<Vec<ChainId>> {
        let chains = self.chains.read().await;
        Ok(chains
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }
}
