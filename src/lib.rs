//! Cryptographic record-integrity engine
//!
//! Seals payloads into hash-chained, signed and timestamped records, and
//! verifies chains of them down to the first broken record.

pub mod audit;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod retry;
pub mod store;
pub mod tsa;

pub use audit::{BreakReason, ChainVerifier, RecordSealer, VerificationReport};
pub use chain::{ChainHash, ChainId, ChainState, SealedRecord};
pub use config::EngineConfig;
pub use engine::{EngineStatus, IntegrityEngine};
pub use error::{IntegrityError, Result};
