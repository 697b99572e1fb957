//! Hash Chain
//!
//! Canonical content hashing and the sealed-record data model.

pub mod hash;
pub mod record;

pub use hash::{canonicalize, compute_hash, hash_canonical, ChainHash, HASH_LEN};
pub use record::{ChainId, ChainState, SealedRecord};
