//! JSONL Record Store
//!
//! One append-only file per chain (`{chain}.jsonl`). A record is written once
//! as a `record` line; a token that arrives later is appended as a
//! `timestamp` line and merged when the file is read back. Existing lines
//! are never rewritten.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, warn};

use super::check_extends;
use crate::chain::{ChainHash, ChainId, SealedRecord};
use crate::error::{IntegrityError, Result};
use crate::tsa::TimestampToken;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogLine {
    Record(SealedRecord),
    Timestamp {
        sequence_number: u64,
        token: TimestampToken,
    },
}

struct ChainLog {
    file: File,
    records: Vec<SealedRecord>,
}

impl ChainLog {
    /// Blocking: read the whole log. A trailing line without its newline is
    /// the remains of an interrupted write and is cut off.
    fn open(path: &Path) -> Result<Self> {
        let mut records: Vec<SealedRecord> = Vec::new();

        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let complete = contents.rfind('\n').map_or(0, |i| i + 1);
            if complete < contents.len() {
                warn!(
                    "Discarding {} byte(s) of torn trailing line in {:?}",
                    contents.len() - complete,
                    path
                );
                OpenOptions::new()
                    .write(true)
                    .open(path)?
                    .set_len(complete as u64)?;
            }

            for (line_num, line) in contents[..complete].lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogLine = serde_json::from_str(line).map_err(|e| {
                    IntegrityError::store(format!(
                        "Failed to parse {:?} line {}: {}",
                        path,
                        line_num + 1,
                        e
                    ))
                })?;
                match entry {
                    LogLine::Record(record) => records.push(record),
                    LogLine::Timestamp {
                        sequence_number,
                        token,
                    } => {
                        if let Some(record) = records
                            .iter_mut()
                            .find(|r| r.sequence_number == sequence_number)
                        {
                            if record.timestamp_token.is_none() {
                                record.timestamp_token = Some(token);
                            }
                        }
                    }
                }
            }
            debug!("Loaded {} records from {:?}", records.len(), path);
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, records })
    }

    async fn write_lines(&self, lines: &[LogLine]) -> Result<()> {
        let mut buffer = String::new();
        for line in lines {
            buffer.push_str(&serde_json::to_string(line)?);
            buffer.push('\n');
        }
        // One write per call, so a batch is never interleaved with anything.
        let mut file = self.file.try_clone()?;
        task::spawn_blocking(move || append_durably(&mut file, buffer.as_bytes()))
            .await
            .map_err(blocking_failed)??;
        Ok(())
    }
}

/// Append and sync. On failure the file is cut back to its previous length
/// so no partial line is left behind.
fn append_durably(file: &mut File, buffer: &[u8]) -> std::io::Result<()> {
    let previous_len = file.metadata()?.len();
    let written = file
        .write_all(buffer)
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_data());

    if let Err(e) = written {
        if let Err(trim) = file.set_len(previous_len) {
            warn!("Failed to trim partial write back to {} bytes: {}", previous_len, trim);
        }
        return Err(e);
    }
    Ok(())
}

fn blocking_failed(e: task::JoinError) -> IntegrityError {
    IntegrityError::store(format!("Blocking file task failed: {}", e))
}

pub struct JsonlStore {
    dir: PathBuf,
    chains: Mutex<HashMap<ChainId, ChainLog>>,
}

impl JsonlStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| IntegrityError::store(format!("Failed to create {:?}: {}", dir, e)))?;
        info!("JSONL record store at {:?}", dir);
        Ok(Self {
            dir: dir.to_path_buf(),
            chains: Mutex::new(HashMap::new()),
        })
    }

    fn chain_path(&self, chain: &ChainId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", chain))
    }

    /// The chain's log, read from disk on first use.
    async fn load<'a>(
        &self,
        chains: &'a mut HashMap<ChainId, ChainLog>,
        chain: &ChainId,
    ) -> Result<&'a mut ChainLog> {
        match chains.entry(chain.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = self.chain_path(chain);
                let log = task::spawn_blocking(move || ChainLog::open(&path))
                    .await
                    .map_err(blocking_failed)??;
                Ok(entry.insert(log))
            }
        }
    }

    pub async fn append_batch(&self, chain: &ChainId, records: &[SealedRecord]) -> Result<()> {
        let mut chains = self.chains.lock().await;
        let log = self.load(&mut chains, chain).await?;

        check_extends(chain, log.records.last(), records)?;
        let lines: Vec<LogLine> = records.iter().cloned().map(LogLine::Record).collect();
        log.write_lines(&lines).await?;
        log.records.extend_from_slice(records);
        Ok(())
    }

    pub async fn range(&self, chain: &ChainId, from: u64, to: u64) -> Result<Vec<SealedRecord>> {
        let mut chains = self.chains.lock().await;
        let log = self.load(&mut chains, chain).await?;
        Ok(log
            .records
            .iter()
            .filter(|r| r.sequence_number >= from && r.sequence_number <= to)
            .cloned()
            .collect())
    }

    pub async fn by_hash(&self, chain: &ChainId, hash: &ChainHash) -> Result<Option<SealedRecord>> {
        let mut chains = self.chains.lock().await;
        let log = self.load(&mut chains, chain).await?;
        Ok(log.records.iter().find(|r| r.current_hash == *hash).cloned())
    }

    pub async fn tip(&self, chain: &ChainId) -> Result<Option<SealedRecord>> {
        let mut chains = self.chains.lock().await;
        let log = self.load(&mut chains, chain).await?;
        Ok(log.records.last().cloned())
    }

    pub async fn attach_timestamp(
        &self,
        chain: &ChainId,
        sequence_number: u64,
        token: &TimestampToken,
    ) -> Result<bool> {
        let mut chains = self.chains.lock().await;
        let log = self.load(&mut chains, chain).await?;

        let Some(index) = log
            .records
            .iter()
            .position(|r| r.sequence_number == sequence_number)
        else {
            return Ok(false);
        };
        if log.records[index].timestamp_token.is_some() {
            return Ok(false);
        }

        log.write_lines(&[LogLine::Timestamp {
            sequence_number,
            token: token.clone(),
        }])
        .await?;
        log.records[index].timestamp_token = Some(token.clone());
        Ok(true)
    }

    pub async fn chains(&self) -> Result<Vec<ChainId>> {
        let dir = self.dir.clone();
        task::spawn_blocking(move || list_chains(&dir))
            .await
            .map_err(blocking_failed)?
    }
}

fn list_chains(dir: &Path) -> Result<Vec<ChainId>> {
    let mut chains = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if fs::metadata(&path)?.len() == 0 {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| ChainId::new(s).ok())
        {
            chains.push(id);
        }
    }
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::super::{test_support, RecordStore};
    use super::*;
    use crate::chain::ChainState;

    #[tokio::test]
    async fn test_jsonl_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::Jsonl(JsonlStore::open(dir.path()).unwrap());
        test_support::exercise(&store).await;
    }

    #[tokio::test]
    async fn test_reopen_merges_timestamp_lines() {
        let dir = tempfile::tempdir().unwrap();
        let chain = ChainId::new("reopen").unwrap();
        let records = test_support::linked_records(&ChainState::genesis(), 2);
        let token = test_support::token();

        {
            let store = JsonlStore::open(dir.path()).unwrap();
            store.append_batch(&chain, &records).await.unwrap();
            assert!(store.attach_timestamp(&chain, 0, &token).await.unwrap());
        }

        let contents = fs::read_to_string(dir.path().join("reopen.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let store = JsonlStore::open(dir.path()).unwrap();
        let loaded = store.range(&chain, 0, u64::MAX).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].timestamp_token, Some(token));
        assert_eq!(loaded[1].timestamp_token, None);
        assert_eq!(loaded[1].current_hash, records[1].current_hash);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.jsonl"), "{not json}\n").unwrap();

        let store = JsonlStore::open(dir.path()).unwrap();
        let chain = ChainId::new("broken").unwrap();
        assert!(matches!(
            store.tip(&chain).await,
            Err(IntegrityError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let chain = ChainId::new("torn").unwrap();
        let records = test_support::linked_records(&ChainState::genesis(), 2);
        let path = dir.path().join("torn.jsonl");

        {
            let store = JsonlStore::open(dir.path()).unwrap();
            store.append_batch(&chain, &records[..1]).await.unwrap();
        }
        // A crash in the middle of the second write.
        let line = serde_json::to_string(&LogLine::Record(records[1].clone())).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&line.as_bytes()[..line.len() / 2]).unwrap();
        drop(file);

        let store = JsonlStore::open(dir.path()).unwrap();
        assert_eq!(store.tip(&chain).await.unwrap(), Some(records[0].clone()));
        store.append_batch(&chain, &records[1..]).await.unwrap();

        let reopened = JsonlStore::open(dir.path()).unwrap();
        assert_eq!(reopened.range(&chain, 0, u64::MAX).await.unwrap(), records);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_failed_append_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readonly.jsonl");
        fs::write(&path, "{}\n").unwrap();

        let mut file = File::open(&path).unwrap();
        assert!(append_durably(&mut file, b"{\"partial\":").is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}\n");
    }
}
