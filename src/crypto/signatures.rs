use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use std::str::FromStr;

use crate::chain::ChainHash;
use crate::error::IntegrityError;

/// Identifier stamped on exported public keys.
pub const SIGNATURE_ALGORITHM: &str = "ecdsa-secp256k1-sha256";

/// ECDSA over secp256k1. The message is always a 32-byte SHA-256 digest,
/// signed as-is (no second hashing), with RFC 6979 deterministic nonces.
pub struct SignatureManager {
    secp: Secp256k1<secp256k1::All>,
}

impl SignatureManager {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    pub fn sign_digest(&self, digest: &ChainHash, secret_key: &SecretKey) -> Signature {
        let message = Message::from_digest(*digest.as_bytes());
        self.secp.sign_ecdsa(&message, secret_key)
    }

    pub fn verify_digest(
        &self,
        digest: &ChainHash,
        signature: &Signature,
        public_key: &PublicKey,
    ) -> bool {
        let message = Message::from_digest(*digest.as_bytes());
        self.secp
            .verify_ecdsa(&message, signature, public_key)
            .is_ok()
    }

    /// Verify a hex-encoded compact signature. Malformed input is simply invalid.
    pub fn verify_hex(&self, digest: &ChainHash, signature_hex: &str, public_key: &PublicKey) -> bool {
        match decode_signature(signature_hex) {
            Ok(signature) => self.verify_digest(digest, &signature, public_key),
            Err(_) => false,
        }
    }

    pub fn public_key_from_secret(&self, secret_key: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&self.secp, secret_key)
    }

    /// Generate a new keypair
    pub fn generate_keypair(&self) -> (SecretKey, PublicKey) {
        let mut rng = rand::rngs::OsRng;
        self.secp.generate_keypair(&mut rng)
    }
}

impl Default for SignatureManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn encode_signature(signature: &Signature) -> String {
    hex::encode(signature.serialize_compact())
}

pub fn decode_signature(signature_hex: &str) -> Result<Signature, IntegrityError> {
    let bytes = hex::decode(signature_hex)
        .map_err(|e| IntegrityError::Crypto(format!("Invalid signature hex: {}", e)))?;
    Signature::from_compact(&bytes)
        .map_err(|e| IntegrityError::Crypto(format!("Invalid signature format: {}", e)))
}

/// Parse a hex SEC1 public key (compressed or uncompressed).
pub fn parse_public_key(public_key_hex: &str) -> Result<PublicKey, IntegrityError> {
    PublicKey::from_str(public_key_hex)
        .map_err(|e| IntegrityError::Crypto(format!("Invalid public key: {}", e)))
}

pub fn parse_secret_key(secret_hex: &str) -> Result<SecretKey, IntegrityError> {
    let bytes = hex::decode(secret_hex.trim())
        .map_err(|e| IntegrityError::Crypto(format!("Invalid secret key hex: {}", e)))?;
    SecretKey::from_slice(&bytes)
        .map_err(|e| IntegrityError::Crypto(format!("Invalid secret key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::hash::sha256;

    #[test]
    fn test_sign_and_verify_digest() {
        let manager = SignatureManager::new();
        let (secret_key, public_key) = manager.generate_keypair();
        let digest = ChainHash::from_bytes(sha256(b"record"));

        let signature = manager.sign_digest(&digest, &secret_key);
        assert!(manager.verify_digest(&digest, &signature, &public_key));

        let other = ChainHash::from_bytes(sha256(b"tampered"));
        assert!(!manager.verify_digest(&other, &signature, &public_key));
    }

    #[test]
    fn test_signatures_are_deterministic() {
        let manager = SignatureManager::new();
        let (secret_key, _) = manager.generate_keypair();
        let digest = ChainHash::from_bytes(sha256(b"same input"));
        assert_eq!(
            encode_signature(&manager.sign_digest(&digest, &secret_key)),
            encode_signature(&manager.sign_digest(&digest, &secret_key))
        );
    }

    #[test]
    fn test_wrong_key_and_garbage_signature() {
        let manager = SignatureManager::new();
        let (secret_key, _) = manager.generate_keypair();
        let (_, other_public) = manager.generate_keypair();
        let digest = ChainHash::from_bytes(sha256(b"record"));
        let signature_hex = encode_signature(&manager.sign_digest(&digest, &secret_key));

        assert!(!manager.verify_hex(&digest, &signature_hex, &other_public));
        assert!(!manager.verify_hex(&digest, "not-hex", &other_public));
        assert!(!manager.verify_hex(&digest, "abcd", &other_public));
    }

    #[test]
    fn test_key_hex_round_trip() {
        let manager = SignatureManager::new();
        let (secret_key, public_key) = manager.generate_keypair();
        let parsed_public = parse_public_key(&public_key.to_string()).unwrap();
        assert_eq!(parsed_public, public_key);
        let parsed_secret = parse_secret_key(&hex::encode(secret_key.secret_bytes())).unwrap();
        assert_eq!(manager.public_key_from_secret(&parsed_secret), public_key);
        assert!(parse_public_key("zz").is_err());
    }
}
