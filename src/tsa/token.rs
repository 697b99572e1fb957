//! Timestamp tokens
//!
//! Wire contract with the TSA and the self-contained token format. Parsing is
//! a pure function over a fully-buffered HTTP response; verification needs
//! nothing but the token and the hash it claims to cover.
//!
//! A token is the base64 encoding of a JSON `SignedTstInfo`:
//!
//! ```text
//! { "info": { version, hash_algorithm, message_imprint, serial_number,
//!             gen_time, nonce, tsa_public_key },
//!   "signature": hex(ECDSA-secp256k1(SHA-256(JCS(info)))) }
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::chain::hash::{canonicalize, sha256};
use crate::chain::ChainHash;
use crate::crypto::signatures::{encode_signature, parse_public_key, SignatureManager};
use crate::error::{IntegrityError, Result};

pub const HASH_ALGORITHM: &str = "sha256";
pub const TST_INFO_VERSION: u8 = 1;

/// Body POSTed to the TSA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRequest {
    pub hash: String,
    pub hash_algorithm: String,
    pub nonce: String,
}

impl TimestampRequest {
    pub fn new(hash: &ChainHash) -> Self {
        Self {
            hash: hash.to_hex(),
            hash_algorithm: HASH_ALGORITHM.to_string(),
            nonce: hex::encode(rand::random::<[u8; 8]>()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TsaStatus {
    Granted,
    GrantedWithMods,
    Rejection,
    Waiting,
}

/// Body returned by the TSA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampResponse {
    pub status: TsaStatus,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub gen_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_text: Option<String>,
}

/// The statement a TSA signs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TstInfo {
    pub version: u8,
    pub hash_algorithm: String,
    /// Hex of the timestamped hash.
    pub message_imprint: String,
    pub serial_number: u64,
    pub gen_time: DateTime<Utc>,
    #[serde(default)]
    pub nonce: Option<String>,
    /// Hex SEC1 key the TSA signed with.
    pub tsa_public_key: String,
}

impl TstInfo {
    fn signing_digest(&self) -> Result<ChainHash> {
        Ok(ChainHash::from_bytes(sha256(&canonicalize(self)?)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTstInfo {
    pub info: TstInfo,
    pub signature: String,
}

impl SignedTstInfo {
    /// Produce a signed statement. TSA-side operation, used by test doubles
    /// and local tooling.
    pub fn issue(info: TstInfo, tsa_key: &SecretKey) -> Result<Self> {
        let digest = info.signing_digest()?;
        let signature = SignatureManager::new().sign_digest(&digest, tsa_key);
        Ok(Self {
            info,
            signature: encode_signature(&signature),
        })
    }

    pub fn to_token_string(&self) -> Result<String> {
        Ok(BASE64.encode(serde_json::to_vec(self)?))
    }

    pub fn from_token_string(token: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(token.trim())
            .map_err(|e| IntegrityError::MalformedToken(format!("Invalid base64: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| IntegrityError::MalformedToken(format!("Invalid TST info: {}", e)))
    }

    fn tsa_key(&self) -> Result<PublicKey> {
        parse_public_key(&self.info.tsa_public_key)
            .map_err(|e| IntegrityError::MalformedToken(e.to_string()))
    }

    /// Check that the statement covers `hash` and was signed by
    /// `trusted_key`. The embedded key is never trusted on its own.
    /// Returns the attested time.
    pub fn check(&self, hash: &ChainHash, trusted_key: &PublicKey) -> Result<DateTime<Utc>> {
        if self.info.version != TST_INFO_VERSION {
            return Err(IntegrityError::MalformedToken(format!(
                "Unsupported TST info version {}",
                self.info.version
            )));
        }
        if self.info.hash_algorithm != HASH_ALGORITHM {
            return Err(IntegrityError::MalformedToken(format!(
                "Unsupported hash algorithm {}",
                self.info.hash_algorithm
            )));
        }
        if !self.info.message_imprint.eq_ignore_ascii_case(&hash.to_hex()) {
            return Err(IntegrityError::MalformedToken(
                "Token covers a different hash".to_string(),
            ));
        }

        if self.tsa_key()? != *trusted_key {
            return Err(IntegrityError::MalformedToken(
                "Token signed by an untrusted TSA key".to_string(),
            ));
        }

        let digest = self.info.signing_digest()?;
        if !SignatureManager::new().verify_hex(&digest, &self.signature, trusted_key) {
            return Err(IntegrityError::MalformedToken(
                "TSA signature does not verify".to_string(),
            ));
        }

        Ok(self.info.gen_time)
    }
}

/// Timestamp evidence stored on a sealed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampToken {
    /// Opaque base64 blob, kept byte-for-byte as issued.
    pub token: String,
    /// Convenience copy of the attested time; the blob is authoritative.
    pub gen_time: DateTime<Utc>,
    pub provider: String,
    pub hash_algorithm: String,
}

impl TimestampToken {
    pub fn decode(&self) -> Result<SignedTstInfo> {
        SignedTstInfo::from_token_string(&self.token)
    }

    /// Full offline verification against `hash`; returns the attested time.
    pub fn check(&self, hash: &ChainHash, trusted_key: &PublicKey) -> Result<DateTime<Utc>> {
        let signed = self.decode()?;
        let gen_time = signed.check(hash, trusted_key)?;
        if gen_time != self.gen_time {
            return Err(IntegrityError::MalformedToken(
                "Stored time disagrees with the signed time".to_string(),
            ));
        }
        Ok(gen_time)
    }
}

/// `verifyTimestamp(token, hash) -> bool`
pub fn verify_token(token: &TimestampToken, hash: &ChainHash, trusted_key: &PublicKey) -> bool {
    token.check(hash, trusted_key).is_ok()
}

/// Turn a buffered TSA response into a token or a typed error.
///
/// HTTP 408/429/5xx and `waiting` are transient (`TsaUnreachable`); other 4xx
/// and `rejection` are `TsaRejected`; anything unparsable or not covering
/// the requested hash is `MalformedToken`.
pub fn parse_response(
    http_status: u16,
    body: &[u8],
    request: &TimestampRequest,
    provider: &str,
    trusted_key: &PublicKey,
) -> Result<TimestampToken> {
    match http_status {
        200..=299 => {}
        408 | 429 | 500..=599 => {
            return Err(IntegrityError::TsaUnreachable(format!(
                "TSA returned status {}",
                http_status
            )))
        }
        400..=499 => {
            return Err(IntegrityError::TsaRejected(format!(
                "TSA returned status {}",
                http_status
            )))
        }
        _ => {
            return Err(IntegrityError::TsaUnreachable(format!(
                "Unexpected TSA status {}",
                http_status
            )))
        }
    }

    let response: TimestampResponse = serde_json::from_slice(body)
        .map_err(|e| IntegrityError::MalformedToken(format!("Invalid TSA response: {}", e)))?;

    match response.status {
        TsaStatus::Granted | TsaStatus::GrantedWithMods => {}
        TsaStatus::Rejection => {
            return Err(IntegrityError::TsaRejected(
                response
                    .status_text
                    .unwrap_or_else(|| "request rejected".to_string()),
            ))
        }
        TsaStatus::Waiting => {
            return Err(IntegrityError::TsaUnreachable(
                "TSA asked the client to wait".to_string(),
            ))
        }
    }

    let token = response
        .token
        .ok_or_else(|| IntegrityError::MalformedToken("Granted response without token".to_string()))?;

    let hash: ChainHash = request
        .hash
        .parse()
        .map_err(|e: IntegrityError| IntegrityError::MalformedToken(e.to_string()))?;
    let signed = SignedTstInfo::from_token_string(&token)?;
    let gen_time = signed.check(&hash, trusted_key)?;

    if signed.info.nonce.as_deref() != Some(request.nonce.as_str()) {
        return Err(IntegrityError::MalformedToken(
            "Nonce does not match the request".to_string(),
        ));
    }

    Ok(TimestampToken {
        token,
        gen_time,
        provider: provider.to_string(),
        hash_algorithm: HASH_ALGORITHM.to_string(),
    })
}
