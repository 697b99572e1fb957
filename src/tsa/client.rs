//! Timestamp Client
//!
//! Requests trusted timestamps over HTTPS with bounded retries, caches them
//! per hash for the life of the process, and degrades to an explicit
//! `Unavailable` outcome instead of failing when the TSA cannot be reached.

use reqwest::Client;
use secp256k1::PublicKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::ChainHash;
use crate::config::TsaConfig;
use crate::crypto::signatures::parse_public_key;
use crate::error::{IntegrityError, Result};
use crate::retry::RetryPolicy;
use crate::tsa::token::{parse_response, verify_token, TimestampRequest, TimestampToken};

/// Result of asking for a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampOutcome {
    Stamped(TimestampToken),
    /// Degraded mode: the record must be sealed without a token.
    Unavailable { reason: String },
}

impl TimestampOutcome {
    pub fn token(self) -> Option<TimestampToken> {
        match self {
            TimestampOutcome::Stamped(token) => Some(token),
            TimestampOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_stamped(&self) -> bool {
        matches!(self, TimestampOutcome::Stamped(_))
    }
}

/// Timestamp cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub provider: String,
}

enum TsaTransport {
    Http {
        client: Client,
        url: String,
        api_key: Option<String>,
    },
    Disabled,
}

pub struct TimestampClient {
    transport: TsaTransport,
    provider: String,
    retry: RetryPolicy,
    /// Always set while the transport is live; a disabled client may still
    /// carry one so earlier tokens stay verifiable.
    trusted_key: Option<PublicKey>,
    min_interval: Duration,
    cache: Arc<RwLock<HashMap<ChainHash, TimestampToken>>>,
    last_request: Mutex<Option<Instant>>,
}

impl TimestampClient {
    pub fn from_config(config: &TsaConfig) -> Result<Self> {
        let trusted_key = config
            .trusted_public_key
            .as_deref()
            .map(parse_public_key)
            .transpose()?;

        if !config.enabled {
            info!("Timestamping disabled; records will be sealed without tokens");
            return Ok(Self {
                trusted_key,
                ..Self::disabled()
            });
        }

        let url = config
            .url
            .clone()
            .ok_or_else(|| IntegrityError::Config("tsa.enabled requires tsa.url".to_string()))?;
        let trusted_key = trusted_key.ok_or_else(|| {
            IntegrityError::Config("tsa.enabled requires tsa.trusted_public_key".to_string())
        })?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| IntegrityError::Config(format!("Failed to build HTTP client: {}", e)))?;

        info!(
            "Timestamp client initialized (provider: {}, url: {})",
            config.provider, url
        );

        Ok(Self {
            transport: TsaTransport::Http {
                client,
                url,
                api_key: config.api_key.clone(),
            },
            provider: config.provider.clone(),
            retry: RetryPolicy::new(config.max_attempts, config.initial_backoff()),
            trusted_key: Some(trusted_key),
            min_interval: config.min_request_interval(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            last_request: Mutex::new(None),
        })
    }

    /// A client that never contacts a TSA; every request degrades.
    pub fn disabled() -> Self {
        Self {
            transport: TsaTransport::Disabled,
            provider: "disabled".to_string(),
            retry: RetryPolicy::immediate(1),
            trusted_key: None,
            min_interval: Duration::ZERO,
            cache: Arc::new(RwLock::new(HashMap::new())),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.transport, TsaTransport::Http { .. })
    }

    pub fn provider_name(&self) -> &str {
        &self.provider
    }

    pub fn trusted_key(&self) -> Option<&PublicKey> {
        self.trusted_key.as_ref()
    }

    /// `requestTimestamp(hash)`.
    ///
    /// `TsaRejected` is the only error: the TSA refused this hash and the
    /// caller must not treat the seal as complete. Unreachable (after
    /// retries), malformed and disabled all degrade to `Unavailable`.
    pub async fn request_timestamp(&self, hash: &ChainHash) -> Result<TimestampOutcome> {
        if let Some(token) = self.cache.read().await.get(hash) {
            debug!("Using cached timestamp for {}", hash);
            return Ok(TimestampOutcome::Stamped(token.clone()));
        }

        if !self.is_enabled() {
            return Ok(TimestampOutcome::Unavailable {
                reason: "timestamping disabled".to_string(),
            });
        }

        let (result, attempts) = self
            .retry
            .run(
                "Timestamp request",
                || self.request_once(hash),
                IntegrityError::is_retryable,
            )
            .await;

        match result {
            Ok(token) => {
                self.cache.write().await.insert(*hash, token.clone());
                info!(
                    "Timestamp obtained from {} for {} ({} attempt(s))",
                    self.provider,
                    hash,
                    attempts
                );
                Ok(TimestampOutcome::Stamped(token))
            }
            Err(IntegrityError::TsaRejected(reason)) => {
                warn!("TSA rejected timestamp request for {}: {}", hash, reason);
                Err(IntegrityError::TsaRejected(reason))
            }
            Err(e) => {
                warn!(
                    "Timestamp unavailable for {} after {} attempt(s): {}",
                    hash, attempts, e
                );
                Ok(TimestampOutcome::Unavailable {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Same as `request_timestamp`, but gives up as soon as `cancel`
    /// resolves. Cancellation degrades exactly like an unreachable TSA.
    pub async fn request_timestamp_cancellable<C>(
        &self,
        hash: &ChainHash,
        cancel: C,
    ) -> Result<TimestampOutcome>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            outcome = self.request_timestamp(hash) => outcome,
            _ = cancel => {
                warn!("Timestamp request for {} cancelled", hash);
                Ok(TimestampOutcome::Unavailable {
                    reason: IntegrityError::Cancelled.to_string(),
                })
            }
        }
    }

    /// Timestamp several hashes one after another, respecting the
    /// configured pacing. A rejection aborts the batch.
    pub async fn timestamp_batch(&self, hashes: &[ChainHash]) -> Result<Vec<TimestampOutcome>> {
        let mut outcomes = Vec::with_capacity(hashes.len());
        for hash in hashes {
            outcomes.push(self.request_timestamp(hash).await?);
        }
        Ok(outcomes)
    }

    /// `verifyTimestamp(token, hash)`. Without a trusted TSA key nothing
    /// verifies.
    pub fn verify_timestamp(&self, token: &TimestampToken, hash: &ChainHash) -> bool {
        self.trusted_key
            .as_ref()
            .is_some_and(|key| verify_token(token, hash, key))
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        info!("Timestamp cache cleared");
    }

    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            size: self.cache.read().await.len(),
            provider: self.provider_name().to_string(),
        }
    }

    async fn request_once(&self, hash: &ChainHash) -> Result<TimestampToken> {
        let (
            TsaTransport::Http {
                client,
                url,
                api_key,
            },
            Some(trusted_key),
        ) = (&self.transport, self.trusted_key.as_ref())
        else {
            return Err(IntegrityError::TsaUnreachable(
                "timestamping disabled".to_string(),
            ));
        };

        self.pace().await;

        let request = TimestampRequest::new(hash);
        let mut builder = client.post(url).json(&request);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| IntegrityError::TsaUnreachable(format!("TSA request failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| IntegrityError::TsaUnreachable(format!("Failed to read TSA response: {}", e)))?;

        parse_response(
            status,
            &body,
            &request,
            &self.provider,
            trusted_key,
        )
    }

    /// Space request starts at least `min_interval` apart.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let next_allowed = previous + self.min_interval;
            if next_allowed > Instant::now() {
                tokio::time::sleep_until(next_allowed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
