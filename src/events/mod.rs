//! Engine Events
//!
//! Seals, rotations and verification results are published to whoever is
//! listening: subscribers inside the process (broadcast channel) or an
//! external HTTP endpoint. The backend is chosen once at construction.
//! Publishing never decides the outcome of the operation that emitted it.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{BreakReason, VerificationReport};
use crate::chain::{ChainHash, ChainId, SealedRecord};
use crate::config::{EventBackendKind, EventsConfig};
use crate::error::{IntegrityError, Result};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a dependency, readable without awaiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Ready,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Ready => 2,
            ConnectionState::Failed => 3,
        }
    }
}

/// Shared, lock-free `ConnectionState` holder.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RecordSealed {
        chain_id: ChainId,
        sequence_number: u64,
        current_hash: ChainHash,
        key_version: u32,
        timestamped: bool,
    },
    BatchSealed {
        chain_id: ChainId,
        first_sequence: u64,
        last_sequence: u64,
        count: usize,
        timestamped: usize,
    },
    TimestampAttached {
        chain_id: ChainId,
        sequence_number: u64,
    },
    KeyRotated {
        version: u32,
    },
    ChainVerified {
        chain_id: ChainId,
        valid: bool,
        records_checked: usize,
        broken_sequence: Option<u64>,
        reason: Option<BreakReason>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EngineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            kind,
        }
    }

    pub fn record_sealed(chain: &ChainId, record: &SealedRecord) -> Self {
        Self::new(EventKind::RecordSealed {
            chain_id: chain.clone(),
            sequence_number: record.sequence_number,
            current_hash: record.current_hash,
            key_version: record.key_version,
            timestamped: record.is_timestamped(),
        })
    }

    /// `None` for an empty batch.
    pub fn batch_sealed(chain: &ChainId, records: &[SealedRecord]) -> Option<Self> {
        let first = records.first()?;
        let last = records.last()?;
        Some(Self::new(EventKind::BatchSealed {
            chain_id: chain.clone(),
            first_sequence: first.sequence_number,
            last_sequence: last.sequence_number,
            count: records.len(),
            timestamped: records.iter().filter(|r| r.is_timestamped()).count(),
        }))
    }

    pub fn chain_verified(chain: &ChainId, report: &VerificationReport) -> Self {
        Self::new(EventKind::ChainVerified {
            chain_id: chain.clone(),
            valid: report.valid,
            records_checked: report.records_checked,
            broken_sequence: report.broken_sequence,
            reason: report.reason,
        })
    }
}

pub enum EventBus {
    InProcess {
        sender: broadcast::Sender<EngineEvent>,
    },
    Webhook {
        client: Client,
        url: String,
        state: StateCell,
    },
    Disabled,
}

impl EventBus {
    pub fn from_config(config: &EventsConfig) -> Result<Self> {
        match config.backend {
            EventBackendKind::Disabled => Ok(EventBus::Disabled),
            EventBackendKind::InProcess => Ok(Self::in_process(config.channel_capacity)),
            EventBackendKind::Webhook => {
                let url = config.webhook_url.as_deref().ok_or_else(|| {
                    IntegrityError::Config("events.webhook_url is required".to_string())
                })?;
                Self::webhook(url)
            }
        }
    }

    pub fn in_process(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus::InProcess { sender }
    }

    pub fn webhook(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| IntegrityError::Config(format!("Failed to build HTTP client: {}", e)))?;
        info!("Publishing engine events to {}", url);
        Ok(EventBus::Webhook {
            client,
            url: url.to_string(),
            state: StateCell::new(ConnectionState::Ready),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            EventBus::InProcess { .. } => "in_process",
            EventBus::Webhook { .. } => "webhook",
            EventBus::Disabled => "disabled",
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            EventBus::InProcess { .. } => ConnectionState::Ready,
            EventBus::Webhook { state, .. } => state.get(),
            EventBus::Disabled => ConnectionState::Disconnected,
        }
    }

    /// Deliver `event`; returns how many receivers got it.
    pub async fn publish(&self, event: EngineEvent) -> Result<usize> {
        match self {
            EventBus::InProcess { sender } => {
                // No subscribers is not an error.
                let delivered = sender.send(event).unwrap_or(0);
                Ok(delivered)
            }
            EventBus::Webhook { client, url, state } => {
                let response = client.post(url).json(&event).send().await.map_err(|e| {
                    state.set(ConnectionState::Failed);
                    IntegrityError::store(format!("Event webhook {} unreachable: {}", url, e))
                })?;

                if !response.status().is_success() {
                    state.set(ConnectionState::Failed);
                    return Err(IntegrityError::store(format!(
                        "Event webhook {} returned {}",
                        url,
                        response.status()
                    )));
                }

                state.set(ConnectionState::Ready);
                debug!("Published event {} to {}", event.id, url);
                Ok(1)
            }
            EventBus::Disabled => Ok(0),
        }
    }

    /// Publish and log failures instead of returning them.
    pub async fn publish_quietly(&self, event: EngineEvent) {
        if let Err(e) = self.publish(event).await {
            warn!("Failed to publish engine event: {}", e);
        }
    }

    /// A receiver for in-process events; `None` for other backends.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<EngineEvent>> {
        match self {
            EventBus::InProcess { sender } => Some(sender.subscribe()),
            _ => None,
        }
    }
}
