//! Hash-Chain Builder
//!
//! Binds a canonicalized payload to its position in a chain:
//!
//! ```text
//! current_hash = SHA-256( JCS(payload) || previous_hash[32] )
//! ```
//!
//! `JCS` is RFC 8785 JSON canonicalization (sorted keys, no insignificant
//! whitespace, ES6 number formatting). The previous hash is appended as its
//! 32 raw bytes, never as hex. The genesis record uses 32 zero bytes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{IntegrityError, Result};

/// Length in bytes of every chain hash.
pub const HASH_LEN: usize = 32;

/// Fixed-length SHA-256 digest used for `previous_hash` and `current_hash`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainHash([u8; HASH_LEN]);

impl ChainHash {
    /// The all-zero sentinel carried by a genesis record.
    pub const GENESIS: ChainHash = ChainHash([0u8; HASH_LEN]);

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; HASH_LEN] = bytes.try_into().map_err(|_| {
            IntegrityError::encoding(format!(
                "Hash must be {} bytes, got {}",
                HASH_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::GENESIS
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainHash({})", self.to_hex())
    }
}

impl FromStr for ChainHash {
    type Err = IntegrityError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim_start_matches("sha256:"))
            .map_err(|e| IntegrityError::encoding(format!("Invalid hash hex: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for ChainHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Canonical RFC 8785 bytes of any serializable payload.
///
/// Fails with `Encoding` when the payload has no JSON representation
/// (for example a map keyed by non-string values).
pub fn canonicalize<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(payload)
        .map_err(|e| IntegrityError::encoding(format!("Payload is not serializable: {}", e)))?;
    canonicalize_value(&value)
}

/// Canonical RFC 8785 bytes of an already-structured JSON value.
pub fn canonicalize_value(value: &serde_json::Value) -> Result<Vec<u8>> {
    serde_json_canonicalizer::to_string(value)
        .map(String::into_bytes)
        .map_err(|e| IntegrityError::encoding(format!("Failed to canonicalize payload: {}", e)))
}

/// Hash already-canonical payload bytes onto `previous_hash`.
pub fn hash_canonical(canonical_payload: &[u8], previous_hash: &ChainHash) -> ChainHash {
    let mut hasher = Sha256::new();
    hasher.update(canonical_payload);
    hasher.update(previous_hash.as_bytes());
    ChainHash(hasher.finalize().into())
}

/// `computeHash(payload, previousHash)`: pure and deterministic.
pub fn compute_hash<T: Serialize + ?Sized>(
    payload: &T,
    previous_hash: &ChainHash,
) -> Result<ChainHash> {
    let canonical = canonicalize(payload)?;
    Ok(hash_canonical(&canonical, previous_hash))
}

/// Plain SHA-256 helper, used for signing preimages outside the chain.
pub fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_compute_hash_is_deterministic() {
        let payload = json!({"event": "APPLICATION_APPROVED", "id": "A-1"});
        let h1 = compute_hash(&payload, &ChainHash::GENESIS).unwrap();
        let h2 = compute_hash(&payload, &ChainHash::GENESIS).unwrap();
        assert_eq!(h1, h2);
        assert!(!h1.is_genesis());
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"id":"A-1","event":"APPLICATION_APPROVED"}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{ "event" : "APPLICATION_APPROVED", "id" : "A-1" }"#).unwrap();
        assert_eq!(
            compute_hash(&a, &ChainHash::GENESIS).unwrap(),
            compute_hash(&b, &ChainHash::GENESIS).unwrap()
        );
    }

    #[test]
    fn test_concatenation_order() {
        let payload = json!({"event": "CERTIFICATE_ISSUED", "id": "A-1"});
        let previous = ChainHash::from_bytes([7u8; HASH_LEN]);

        let mut preimage = canonicalize(&payload).unwrap();
        assert_eq!(preimage, br#"{"event":"CERTIFICATE_ISSUED","id":"A-1"}"#.to_vec());
        preimage.extend_from_slice(previous.as_bytes());

        let expected = ChainHash::from_bytes(sha256(&preimage));
        assert_eq!(compute_hash(&payload, &previous).unwrap(), expected);
    }

    #[test]
    fn test_previous_hash_changes_output() {
        let payload = json!({"event": "PAYMENT_CONFIRMED"});
        let mut other = [0u8; HASH_LEN];
        other[31] = 1;
        assert_ne!(
            compute_hash(&payload, &ChainHash::GENESIS).unwrap(),
            compute_hash(&payload, &ChainHash::from_bytes(other)).unwrap()
        );
    }

    #[test]
    fn test_non_string_keys_are_encoding_errors() {
        let mut payload: HashMap<(u8, u8), u8> = HashMap::new();
        payload.insert((1, 2), 3);
        let err = compute_hash(&payload, &ChainHash::GENESIS).unwrap_err();
        assert!(matches!(err, IntegrityError::Encoding(_)));
    }

    #[test]
    fn test_hex_round_trip_and_prefix() {
        let hash = compute_hash(&json!({"a": 1}), &ChainHash::GENESIS).unwrap();
        let parsed: ChainHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        let prefixed: ChainHash = format!("sha256:{}", hash).parse().unwrap();
        assert_eq!(prefixed, hash);
        assert!("abcd".parse::<ChainHash>().is_err());
    }
}
