//! Sealing and verification of hash-chained records

pub mod sealer;
pub mod verify;

pub use sealer::RecordSealer;
pub use verify::{BreakReason, ChainVerifier, RecordCheck, VerificationReport};
