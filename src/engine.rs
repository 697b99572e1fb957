//! Integrity Engine
//!
//! The object business code talks to. It owns the key manager, timestamp
//! client, record store and event bus, and serializes appends per chain:
//! the tip is read, the record hashed, signed and persisted under the
//! chain's lock, and the timestamp is fetched after the lock is released.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{ChainVerifier, RecordSealer, VerificationReport};
use crate::chain::{ChainId, ChainState, SealedRecord};
use crate::config::{BatchTimestampMode, EngineConfig};
use crate::crypto::{KeyManager, KeyMetadata};
use crate::error::{IntegrityError, Result};
use crate::events::{ConnectionState, EngineEvent, EventBus, EventKind, StateCell};
use crate::store::RecordStore;
use crate::tsa::{TimestampClient, TimestampOutcome, TimestampToken};

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: ConnectionState,
    pub key_backend: String,
    pub current_key_version: Option<u32>,
    pub tsa_enabled: bool,
    pub tsa_provider: String,
    pub timestamp_cache_size: usize,
    pub store_backend: String,
    pub event_backend: String,
    pub event_state: ConnectionState,
}

pub struct IntegrityEngine {
    keys: Arc<KeyManager>,
    timestamps: Arc<TimestampClient>,
    sealer: RecordSealer,
    verifier: ChainVerifier,
    store: RecordStore,
    events: EventBus,
    state: StateCell,
    chain_locks: Mutex<HashMap<ChainId, Arc<Mutex<()>>>>,
}

impl IntegrityEngine {
    /// Build every component from configuration.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        info!("Connecting integrity engine");

        let keys = Arc::new(KeyManager::from_config(&config.keys).await?);
        let timestamps = Arc::new(TimestampClient::from_config(&config.tsa)?);
        let store = RecordStore::from_config(&config.store).await?;
        let events = EventBus::from_config(&config.events)?;

        let engine = Self::from_parts(keys, timestamps, store, events)
            .with_batch_mode(config.tsa.batch_mode)
            .with_clock_skew(config.tsa.clock_skew());

        info!(
            "Integrity engine ready (keys: {}, tsa: {}, store: {}, events: {})",
            engine.keys.backend_name(),
            engine.timestamps.provider_name(),
            engine.store.backend_name(),
            engine.events.backend_name()
        );
        Ok(engine)
    }

    /// Assemble an engine from already-built components.
    pub fn from_parts(
        keys: Arc<KeyManager>,
        timestamps: Arc<TimestampClient>,
        store: RecordStore,
        events: EventBus,
    ) -> Self {
        let sealer = RecordSealer::new(keys.clone(), timestamps.clone());
        let verifier =
            ChainVerifier::new(keys.clone()).with_trusted_tsa_key(timestamps.trusted_key().copied());

        Self {
            keys,
            timestamps,
            sealer,
            verifier,
            store,
            events,
            state: StateCell::new(ConnectionState::Ready),
            chain_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_batch_mode(mut self, batch_mode: BatchTimestampMode) -> Self {
        self.sealer = self.sealer.with_batch_mode(batch_mode);
        self
    }

    pub fn with_clock_skew(mut self, clock_skew: chrono::Duration) -> Self {
        self.verifier = self.verifier.with_clock_skew(clock_skew);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn timestamps(&self) -> &Arc<TimestampClient> {
        &self.timestamps
    }

    pub fn verifier(&self) -> &ChainVerifier {
        &self.verifier
    }

    /// In-process event receiver, when that backend is configured.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<EngineEvent>> {
        self.events.subscribe()
    }

    /// Refuse further seals. Verification and key lookups keep working.
    pub fn shutdown(&self) {
        self.state.set(ConnectionState::Disconnected);
        info!("Integrity engine disconnected");
    }

    /// `seal(chainId, payload)`
    pub async fn seal<T>(&self, chain: &ChainId, payload: &T) -> Result<SealedRecord>
    where
        T: Serialize + ?Sized,
    {
        self.seal_with_cancel(chain, payload, std::future::pending::<()>())
            .await
    }

    /// `seal`, abandoning the timestamp request once `cancel` resolves. The
    /// record is persisted either way.
    pub async fn seal_with_cancel<T, C>(
        &self,
        chain: &ChainId,
        payload: &T,
        cancel: C,
    ) -> Result<SealedRecord>
    where
        T: Serialize + ?Sized,
        C: Future<Output = ()>,
    {
        self.ensure_ready()?;

        let lock = self.chain_lock(chain).await;
        let sealed = async {
            let _guard = lock.lock().await;
            let state = self.store.chain_state(chain).await?;
            let record = self
                .sealer
                .sign_next(payload, &state)
                .await
                .map_err(|e| self.note_failure(e))?;
            self.store.append(chain, &record).await?;
            Ok::<_, IntegrityError>(record)
        }
        .await;
        self.release_chain_lock(chain, lock).await;
        let mut record = sealed?;
        self.note_success();
        debug!("Persisted {} #{}", chain, record.sequence_number);

        let outcome = self
            .timestamps
            .request_timestamp_cancellable(&record.current_hash, cancel)
            .await;
        match outcome {
            Ok(TimestampOutcome::Stamped(token)) => {
                if self.attach(chain, record.sequence_number, &token).await {
                    record.timestamp_token = Some(token);
                }
            }
            Ok(TimestampOutcome::Unavailable { reason }) => {
                warn!(
                    "{} #{} sealed without a timestamp: {}",
                    chain, record.sequence_number, reason
                );
            }
            Err(e) => {
                // The record is already durable; it stays, unstamped.
                warn!(
                    "{} #{} sealed without a timestamp: {}",
                    chain, record.sequence_number, e
                );
            }
        }

        self.events
            .publish_quietly(EngineEvent::record_sealed(chain, &record))
            .await;
        Ok(record)
    }

    /// `sealBatch(chainId, payloads)`: every record is persisted or none is.
    pub async fn seal_batch<T>(&self, chain: &ChainId, payloads: &[T]) -> Result<Vec<SealedRecord>>
    where
        T: Serialize,
    {
        self.ensure_ready()?;

        let lock = self.chain_lock(chain).await;
        let sealed = async {
            let _guard = lock.lock().await;
            let state = self.store.chain_state(chain).await?;
            let records = self
                .sealer
                .sign_batch(payloads, &state)
                .await
                .map_err(|e| self.note_failure(e))?;
            self.store.append_batch(chain, &records).await?;
            Ok::<_, IntegrityError>(records)
        }
        .await;
        self.release_chain_lock(chain, lock).await;
        let mut records = sealed?;
        self.note_success();

        let tokens = match self.sealer.stamp_batch(&records).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(
                    "Batch of {} on {} sealed without timestamps: {}",
                    records.len(),
                    chain,
                    e
                );
                vec![None; records.len()]
            }
        };
        for (record, token) in records.iter_mut().zip(tokens) {
            if let Some(token) = token {
                if self.attach(chain, record.sequence_number, &token).await {
                    record.timestamp_token = Some(token);
                }
            }
        }

        if let Some(event) = EngineEvent::batch_sealed(chain, &records) {
            self.events.publish_quietly(event).await;
        }
        info!("Sealed batch of {} records on {}", records.len(), chain);
        Ok(records)
    }

    /// `verifyChain(chainId, fromSeq?, toSeq?)`, both bounds inclusive.
    pub async fn verify_chain(
        &self,
        chain: &ChainId,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<VerificationReport> {
        let records = self.store.range(chain, from, to).await?;

        let report = match from {
            None | Some(0) => {
                self.verifier
                    .verify_from(&records, &ChainState::genesis())
                    .await?
            }
            Some(start) => match self.store.get(chain, start - 1).await? {
                Some(previous) => {
                    self.verifier
                        .verify_from(&records, &ChainState::after(&previous)?)
                        .await?
                }
                None => {
                    warn!(
                        "{} has no record {}; verifying from {} without an anchor",
                        chain,
                        start - 1,
                        start
                    );
                    self.verifier.verify(&records, None).await?
                }
            },
        };

        self.events
            .publish_quietly(EngineEvent::chain_verified(chain, &report))
            .await;
        Ok(report)
    }

    /// `rotateKeys() -> newKeyVersion`
    pub async fn rotate_keys(&self) -> Result<u32> {
        let metadata = self.keys.rotate().await?;
        self.events
            .publish_quietly(EngineEvent::new(EventKind::KeyRotated {
                version: metadata.version,
            }))
            .await;
        Ok(metadata.version)
    }

    /// `getPublicKey(version?)`
    pub async fn get_public_key(&self, version: Option<u32>) -> Result<KeyMetadata> {
        self.keys.public_key(version).await
    }

    pub async fn status(&self) -> EngineStatus {
        let current_key_version = match self.keys.current_version().await {
            Ok(version) => Some(version),
            Err(e) => {
                warn!("Current key version unavailable: {}", e);
                None
            }
        };
        let cache = self.timestamps.cache_stats().await;

        EngineStatus {
            state: self.state(),
            key_backend: self.keys.backend_name().to_string(),
            current_key_version,
            tsa_enabled: self.timestamps.is_enabled(),
            tsa_provider: cache.provider,
            timestamp_cache_size: cache.size,
            store_backend: self.store.backend_name().to_string(),
            event_backend: self.events.backend_name().to_string(),
            event_state: self.events.state(),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected => Err(IntegrityError::NotReady(
                ConnectionState::Disconnected.as_str().to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Custody outages mark the engine failed until a seal succeeds again.
    fn note_failure(&self, error: IntegrityError) -> IntegrityError {
        if matches!(error, IntegrityError::KeyUnavailable(_)) {
            self.state.set(ConnectionState::Failed);
        }
        error
    }

    fn note_success(&self) {
        if self.state() == ConnectionState::Failed {
            self.state.set(ConnectionState::Ready);
        }
    }

    async fn attach(&self, chain: &ChainId, sequence_number: u64, token: &TimestampToken) -> bool {
        match self
            .store
            .attach_timestamp(chain, sequence_number, token)
            .await
        {
            Ok(true) => {
                self.events
                    .publish_quietly(EngineEvent::new(EventKind::TimestampAttached {
                        chain_id: chain.clone(),
                        sequence_number,
                    }))
                    .await;
                true
            }
            Ok(false) => {
                warn!("{} #{} already carries a timestamp", chain, sequence_number);
                false
            }
            Err(e) => {
                warn!(
                    "Failed to store timestamp for {} #{}: {}",
                    chain, sequence_number, e
                );
                false
            }
        }
    }

    async fn chain_lock(&self, chain: &ChainId) -> Arc<Mutex<()>> {
        let mut locks = self.chain_locks.lock().await;
        locks.entry(chain.clone()).or_default().clone()
    }

    /// Drop our handle and forget the lock once nobody else holds or waits
    /// on it.
    async fn release_chain_lock(&self, chain: &ChainId, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.chain_locks.lock().await;
        if locks
            .get(chain)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(chain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::BreakReason;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn engine() -> IntegrityEngine {
        IntegrityEngine::from_parts(
            Arc::new(KeyManager::ephemeral()),
            Arc::new(TimestampClient::disabled()),
            RecordStore::Memory(MemoryStore::new()),
            EventBus::in_process(16),
        )
    }

    #[tokio::test]
    async fn test_concurrent_seals_stay_contiguous() {
        let engine = Arc::new(engine());
        let chain = ChainId::new("concurrent").unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let engine = engine.clone();
            let chain = chain.clone();
            handles.push(tokio::spawn(async move {
                engine.seal(&chain, &json!({"i": i})).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records = engine.store().range(&chain, None, None).await.unwrap();
        assert_eq!(records.len(), 20);
        for (n, record) in records.iter().enumerate() {
            assert_eq!(record.sequence_number, n as u64);
        }
        assert!(engine.verify_chain(&chain, None, None).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_chain_locks_are_released() {
        let engine = Arc::new(engine());

        let mut handles = Vec::new();
        for i in 0..50 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let chain = ChainId::new(format!("short-lived-{}", i % 5)).unwrap();
                engine.seal(&chain, &json!({"i": i})).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let batch = ChainId::new("batched").unwrap();
        engine
            .seal_batch(&batch, &[json!({"i": 0}), json!({"i": 1})])
            .await
            .unwrap();

        assert!(engine.chain_locks.lock().await.is_empty());
        assert_eq!(engine.store().chains().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_chains_are_independent() {
        let engine = engine();
        let a = ChainId::new("a").unwrap();
        let b = ChainId::new("b").unwrap();

        engine.seal(&a, &json!({"x": 1})).await.unwrap();
        engine.seal(&a, &json!({"x": 2})).await.unwrap();
        let first_b = engine.seal(&b, &json!({"x": 1})).await.unwrap();

        assert_eq!(first_b.sequence_number, 0);
        assert!(first_b.previous_hash.is_genesis());
    }

    #[tokio::test]
    async fn test_verify_partial_range() {
        let engine = engine();
        let chain = ChainId::new("range").unwrap();
        let payloads: Vec<_> = (0..5).map(|i| json!({"i": i})).collect();
        engine.seal_batch(&chain, &payloads).await.unwrap();

        let report = engine.verify_chain(&chain, Some(2), Some(3)).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.records_checked, 2);

        let report = engine.verify_chain(&chain, Some(7), None).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.records_checked, 0);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let engine = engine();
        let mut events = engine.subscribe().unwrap();
        let chain = ChainId::new("events").unwrap();

        engine.seal(&chain, &json!({"id": 1})).await.unwrap();
        let version = engine.rotate_keys().await.unwrap();
        assert_eq!(version, 2);

        match events.recv().await.unwrap().kind {
            EventKind::RecordSealed {
                sequence_number,
                timestamped,
                ..
            } => {
                assert_eq!(sequence_number, 0);
                assert!(!timestamped);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            events.recv().await.unwrap().kind,
            EventKind::KeyRotated { version: 2 }
        );
    }

    #[tokio::test]
    async fn test_shutdown_refuses_seals() {
        let engine = engine();
        let chain = ChainId::new("closed").unwrap();
        engine.seal(&chain, &json!({"id": 1})).await.unwrap();

        engine.shutdown();
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(matches!(
            engine.seal(&chain, &json!({"id": 2})).await,
            Err(IntegrityError::NotReady(_))
        ));
        // Reads still work.
        assert!(engine.verify_chain(&chain, None, None).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let engine = engine();
        let status = engine.status().await;
        assert_eq!(status.state, ConnectionState::Ready);
        assert_eq!(status.key_backend, "local");
        assert_eq!(status.current_key_version, Some(1));
        assert!(!status.tsa_enabled);
        assert_eq!(status.tsa_provider, "disabled");
        assert_eq!(status.store_backend, "memory");
        assert_eq!(status.event_backend, "in_process");
    }

    #[tokio::test]
    async fn test_tampered_store_is_reported() {
        let engine = engine();
        let chain = ChainId::new("tamper").unwrap();
        let payloads: Vec<_> = (0..3).map(|i| json!({"i": i})).collect();
        let mut records = engine.seal_batch(&chain, &payloads).await.unwrap();

        // Verify a doctored copy directly.
        records[1].payload = json!({"i": 100});
        let report = engine
            .verifier()
            .verify(&records, Some(&crate::chain::ChainHash::GENESIS))
            .await
            .unwrap();
        assert_eq!(report.reason, Some(BreakReason::HashMismatch));
        assert_eq!(report.broken_at, Some(1));
    }
}
