//! Record Store
//!
//! Append-only persistence for sealed records. Each backend supports
//! insert-only appends, ascending range scans by sequence number, lookup by
//! hash, and attaching a timestamp token to a record that has none yet.

pub mod jsonl;
pub mod memory;
pub mod sqlite;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use tracing::info;

use crate::chain::{ChainHash, ChainId, ChainState, SealedRecord};
use crate::config::{StoreBackendKind, StoreConfig};
use crate::error::{IntegrityError, Result};
use crate::tsa::TimestampToken;

pub enum RecordStore {
    Memory(MemoryStore),
    Jsonl(JsonlStore),
    Sqlite(SqliteStore),
}

impl RecordStore {
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let store = match config.backend {
            StoreBackendKind::Memory => RecordStore::Memory(MemoryStore::new()),
            StoreBackendKind::Jsonl => {
                let path = config.path.as_deref().ok_or_else(|| {
                    IntegrityError::Config("store.path is required for jsonl".to_string())
                })?;
                RecordStore::Jsonl(JsonlStore::open(path)?)
            }
            StoreBackendKind::Sqlite => {
                let url = config.database_url.as_deref().ok_or_else(|| {
                    IntegrityError::Config("store.database_url is required for sqlite".to_string())
                })?;
                RecordStore::Sqlite(SqliteStore::connect(url).await?)
            }
        };

        info!("Record store ready ({})", store.backend_name());
        Ok(store)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            RecordStore::Memory(_) => "memory",
            RecordStore::Jsonl(_) => "jsonl",
            RecordStore::Sqlite(_) => "sqlite",
        }
    }

    /// Insert one record. It must extend the chain's current tip.
    pub async fn append(&self, chain: &ChainId, record: &SealedRecord) -> Result<()> {
        self.append_batch(chain, std::slice::from_ref(record)).await
    }

    /// Insert a contiguous run of records atomically: all or none.
    pub async fn append_batch(&self, chain: &ChainId, records: &[SealedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        match self {
            RecordStore::Memory(store) => store.append_batch(chain, records).await,
            RecordStore::Jsonl(store) => store.append_batch(chain, records).await,
            RecordStore::Sqlite(store) => store.append_batch(chain, records).await,
        }
    }

    /// Records with `from <= sequence_number <= to`, ascending.
    pub async fn range(
        &self,
        chain: &ChainId,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<SealedRecord>> {
        let from = from.unwrap_or(0);
        let to = to.unwrap_or(u64::MAX);
        if from > to {
            return Ok(Vec::new());
        }
        match self {
            RecordStore::Memory(store) => store.range(chain, from, to).await,
            RecordStore::Jsonl(store) => store.range(chain, from, to).await,
            RecordStore::Sqlite(store) => store.range(chain, from, to).await,
        }
    }

    pub async fn get(&self, chain: &ChainId, sequence_number: u64) -> Result<Option<SealedRecord>> {
        Ok(self
            .range(chain, Some(sequence_number), Some(sequence_number))
            .await?
            .into_iter()
            .next())
    }

    pub async fn by_hash(&self, chain: &ChainId, hash: &ChainHash) -> Result<Option<SealedRecord>> {
        match self {
            RecordStore::Memory(store) => store.by_hash(chain, hash).await,
            RecordStore::Jsonl(store) => store.by_hash(chain, hash).await,
            RecordStore::Sqlite(store) => store.by_hash(chain, hash).await,
        }
    }

    /// Last record of the chain, if any.
    pub async fn tip(&self, chain: &ChainId) -> Result<Option<SealedRecord>> {
        match self {
            RecordStore::Memory(store) => store.tip(chain).await,
            RecordStore::Jsonl(store) => store.tip(chain).await,
            RecordStore::Sqlite(store) => store.tip(chain).await,
        }
    }

    /// Where the next record of `chain` goes.
    pub async fn chain_state(&self, chain: &ChainId) -> Result<ChainState> {
        Ok(self
            .tip(chain)
            .await?
            .map(|tip| ChainState::after(&tip))
            .transpose()?
            .unwrap_or_default())
    }

    /// Attach a token to a record sealed without one. Returns `false` when
    /// the record is missing or already carries a token.
    pub async fn attach_timestamp(
        &self,
        chain: &ChainId,
        sequence_number: u64,
        token: &TimestampToken,
    ) -> Result<bool> {
        match self {
            RecordStore::Memory(store) => store.attach_timestamp(chain, sequence_number, token).await,
            RecordStore::Jsonl(store) => store.attach_timestamp(chain, sequence_number, token).await,
            RecordStore::Sqlite(store) => store.attach_timestamp(chain, sequence_number, token).await,
        }
    }

    pub async fn chains(&self) -> Result<Vec<ChainId>> {
        match self {
            RecordStore::Memory(store) => store.chains().await,
            RecordStore::Jsonl(store) => store.chains().await,
            RecordStore::Sqlite(store) => store.chains().await,
        }
    }
}

/// Reject records that do not extend `tip` contiguously.
pub(crate) fn check_extends(
    chain: &ChainId,
    tip: Option<&SealedRecord>,
    records: &[SealedRecord],
) -> Result<()> {
    let mut state = tip.map(ChainState::after).transpose()?.unwrap_or_default();

    for record in records {
        if record.sequence_number != state.next_sequence {
            return Err(IntegrityError::ChainConflict(format!(
                "{}: expected sequence {}, got {}",
                chain, state.next_sequence, record.sequence_number
            )));
        }
        if record.previous_hash != state.tip_hash {
            return Err(IntegrityError::ChainConflict(format!(
                "{}: record {} does not link to tip {}",
                chain, record.sequence_number, state.tip_hash
            )));
        }
        state.advance(record)?;
    }

    Ok(())
}
