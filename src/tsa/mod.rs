//! Trusted Timestamping
//!
//! Client side of an external Time-Stamping Authority: request, cache,
//! degrade, and verify tokens offline.

pub mod client;
pub mod token;

pub use client::{CacheStats, TimestampClient, TimestampOutcome};
pub use token::{parse_response, verify_token, SignedTstInfo, TimestampToken, TstInfo};
