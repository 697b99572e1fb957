//! Key Custody Service client
//!
//! Private keys never leave the custody service. The engine asks it to sign
//! digests and to publish public keys; every call is retried with bounded
//! backoff, and exhaustion is always fatal (`KeyUnavailable`).

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chain::ChainHash;
use crate::crypto::key_management::KeyMetadata;
use crate::error::{IntegrityError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_version: Option<u32>,
    algorithm: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustodySignature {
    pub signature: String,
    pub key_version: u32,
}

/// Failure of one HTTP exchange, before retry classification.
enum CallError {
    Transient(String),
    Fatal(IntegrityError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Transient(msg) => f.write_str(msg),
            CallError::Fatal(e) => write!(f, "{}", e),
        }
    }
}

pub struct CustodyClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
    /// Current version and when it was learned. Another engine may rotate
    /// the shared service, so the value expires after `version_ttl`.
    current_version: RwLock<Option<(u32, Instant)>>,
    version_ttl: Duration,
}

pub const DEFAULT_VERSION_TTL: Duration = Duration::from_secs(30);

impl CustodyClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IntegrityError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            retry,
            current_version: RwLock::new(None),
            version_ttl: DEFAULT_VERSION_TTL,
        })
    }

    pub fn with_version_ttl(mut self, ttl: Duration) -> Self {
        self.version_ttl = ttl;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current version, refetched once the cached value is older than the
    /// TTL.
    pub async fn current_version(&self) -> Result<u32> {
        if let Some((version, learned)) = *self.current_version.read().await {
            if learned.elapsed() < self.version_ttl {
                return Ok(version);
            }
        }
        Ok(self.current_key().await?.version)
    }

    /// `getPublicKey(current)`
    pub async fn current_key(&self) -> Result<KeyMetadata> {
        let metadata: KeyMetadata = self.get("keys/current").await?;
        self.remember_version(metadata.version).await;
        Ok(metadata)
    }

    /// `getPublicKey(version)`
    pub async fn public_key(&self, version: u32) -> Result<KeyMetadata> {
        let metadata: KeyMetadata = self.get(&format!("keys/{}", version)).await.map_err(|e| {
            match e {
                IntegrityError::Store(_) => IntegrityError::UnknownKeyVersion(version),
                other => other,
            }
        })?;
        if metadata.version != version {
            return Err(IntegrityError::KeyUnavailable(format!(
                "Custody returned key v{} for v{}",
                metadata.version, version
            )));
        }
        Ok(metadata)
    }

    /// `sign(hash, keyVersion?)`
    pub async fn sign(&self, digest: &ChainHash, key_version: Option<u32>) -> Result<CustodySignature> {
        let body = SignRequest {
            digest: digest.to_hex(),
            key_version,
            algorithm: crate::crypto::signatures::SIGNATURE_ALGORITHM,
        };
        let signed: CustodySignature = self.post("sign", &body).await?;
        debug!("Custody signed {} with key v{}", digest, signed.key_version);
        Ok(signed)
    }

    /// `rotate() -> newVersion`
    pub async fn rotate(&self) -> Result<KeyMetadata> {
        let metadata: KeyMetadata = self.post("keys/rotate", &serde_json::json!({})).await?;
        self.remember_version(metadata.version).await;
        info!("Custody service rotated signing key to v{}", metadata.version);
        Ok(metadata)
    }

    async fn remember_version(&self, version: u32) {
        let mut current = self.current_version.write().await;
        if let Some((known, _)) = *current {
            if known != version {
                debug!("Custody current key moved from v{} to v{}", known, version);
            }
        }
        *current = Some((version, Instant::now()));
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/v1/{}", self.base_url, path);
        self.call(&url, || {
            let mut request = self.client.get(&url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            request
        })
        .await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}/v1/{}", self.base_url, path);
        self.call(&url, || {
            let mut request = self.client.post(&url).json(body);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            request
        })
        .await
    }

    async fn call<T, F>(&self, url: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let (result, attempts) = self
            .retry
            .run(
                "Key custody request",
                || async {
                    let response = build()
                        .send()
                        .await
                        .map_err(|e| CallError::Transient(format!("{}: {}", url, e)))?;
                    let status = response.status();

                    if status == StatusCode::NOT_FOUND {
                        // Mapped to UnknownKeyVersion by key lookups.
                        return Err(CallError::Fatal(IntegrityError::store(format!(
                            "{} not found",
                            url
                        ))));
                    }
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(CallError::Transient(format!(
                            "{} returned {}",
                            url, status
                        )));
                    }
                    if !status.is_success() {
                        return Err(CallError::Fatal(IntegrityError::KeyUnavailable(format!(
                            "{} returned {}",
                            url, status
                        ))));
                    }

                    response.json::<T>().await.map_err(|e| {
                        CallError::Fatal(IntegrityError::KeyUnavailable(format!(
                            "Invalid custody response from {}: {}",
                            url, e
                        )))
                    })
                },
                |e| matches!(e, CallError::Transient(_)),
            )
            .await;

        result.map_err(|e| match e {
            CallError::Transient(msg) => IntegrityError::KeyUnavailable(format!(
                "{} (after {} attempts)",
                msg, attempts
            )),
            CallError::Fatal(e) => e,
        })
    }
}
