//! Shared fixtures: in-process fakes for the TSA and the key custody
//! service, plus engine builders.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use secp256k1::{PublicKey, SecretKey};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use integrity_engine::chain::ChainHash;
use integrity_engine::config::TsaConfig;
use integrity_engine::crypto::signatures::encode_signature;
use integrity_engine::crypto::{CustodyClient, KeyManager, KeyMetadata, SignatureManager};
use integrity_engine::events::EventBus;
use integrity_engine::retry::RetryPolicy;
use integrity_engine::store::{MemoryStore, RecordStore};
use integrity_engine::tsa::token::{TimestampRequest, HASH_ALGORITHM, TST_INFO_VERSION};
use integrity_engine::tsa::{SignedTstInfo, TimestampClient, TimestampToken, TstInfo};
use integrity_engine::{ChainId, IntegrityEngine};

pub fn chain(name: &str) -> ChainId {
    ChainId::new(name).expect("valid chain id")
}

/// A TSA that grants every request with a correctly signed token.
#[derive(Clone)]
pub struct FakeTsa {
    secret: SecretKey,
    pub public_key: PublicKey,
    serial: Arc<AtomicU64>,
}

impl FakeTsa {
    pub fn new() -> Self {
        let (secret, public_key) = SignatureManager::new().generate_keypair();
        Self {
            secret,
            public_key,
            serial: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    fn sign(&self, info: TstInfo) -> String {
        SignedTstInfo::issue(info, &self.secret)
            .and_then(|signed| signed.to_token_string())
            .expect("fake TSA can sign")
    }

    /// A token for `hash` attesting `gen_time`, issued outside any request.
    pub fn issue(&self, hash: &ChainHash, gen_time: DateTime<Utc>) -> TimestampToken {
        let token = self.sign(TstInfo {
            version: TST_INFO_VERSION,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            message_imprint: hash.to_hex(),
            serial_number: self.serial.fetch_add(1, Ordering::SeqCst),
            gen_time,
            nonce: None,
            tsa_public_key: self.public_key_hex(),
        });
        TimestampToken {
            token,
            gen_time,
            provider: "fake-tsa".to_string(),
            hash_algorithm: HASH_ALGORITHM.to_string(),
        }
    }
}

impl Respond for FakeTsa {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: TimestampRequest = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };

        let gen_time = Utc::now();
        let info = TstInfo {
            version: TST_INFO_VERSION,
            hash_algorithm: body.hash_algorithm,
            message_imprint: body.hash,
            serial_number: self.serial.fetch_add(1, Ordering::SeqCst),
            gen_time,
            nonce: Some(body.nonce),
            tsa_public_key: self.public_key_hex(),
        };
        let token = self.sign(info);

        ResponseTemplate::new(200).set_body_json(json!({
            "status": "granted",
            "token": token,
            "gen_time": gen_time,
        }))
    }
}

/// Start a granting TSA at `/tsr`.
pub async fn start_tsa() -> (MockServer, FakeTsa) {
    let server = MockServer::start().await;
    let tsa = FakeTsa::new();
    Mock::given(method("POST"))
        .and(path("/tsr"))
        .respond_with(tsa.clone())
        .mount(&server)
        .await;
    (server, tsa)
}

/// Start a TSA that always answers with `response`, whatever the request.
pub async fn start_tsa_with(response: ResponseTemplate) -> (MockServer, FakeTsa) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tsr"))
        .respond_with(response)
        .mount(&server)
        .await;
    (server, FakeTsa::new())
}

/// Client settings for `server`, trusting only `tsa`'s key.
pub fn tsa_config(server: &MockServer, tsa: &FakeTsa) -> TsaConfig {
    TsaConfig {
        enabled: true,
        provider: "fake-tsa".to_string(),
        url: Some(format!("{}/tsr", server.uri())),
        timeout_ms: 2_000,
        initial_backoff_ms: 0,
        min_request_interval_ms: 0,
        trusted_public_key: Some(tsa.public_key_hex()),
        ..TsaConfig::default()
    }
}

pub fn timestamp_client(server: &MockServer, tsa: &FakeTsa) -> TimestampClient {
    TimestampClient::from_config(&tsa_config(server, tsa))
        .expect("TSA config is valid")
        .with_retry_policy(RetryPolicy::immediate(3))
}

/// Engine over an ephemeral keyring, an in-memory store and no events.
pub fn memory_engine(timestamps: TimestampClient) -> IntegrityEngine {
    IntegrityEngine::from_parts(
        Arc::new(KeyManager::ephemeral()),
        Arc::new(timestamps),
        RecordStore::Memory(MemoryStore::new()),
        EventBus::Disabled,
    )
}

/// Engine signing with `keys`, without timestamps.
pub fn keyed_engine(keys: KeyManager) -> IntegrityEngine {
    IntegrityEngine::from_parts(
        Arc::new(keys),
        Arc::new(TimestampClient::disabled()),
        RecordStore::Memory(MemoryStore::new()),
        EventBus::Disabled,
    )
}

pub fn untimestamped_engine() -> IntegrityEngine {
    memory_engine(TimestampClient::disabled())
}

struct CustodyKey {
    secret: SecretKey,
    metadata: KeyMetadata,
}

/// A key custody service keeping versioned keys in memory.
#[derive(Clone)]
pub struct FakeCustody {
    keys: Arc<Mutex<BTreeMap<u32, CustodyKey>>>,
    available: Arc<AtomicBool>,
    sign_calls: Arc<AtomicU64>,
}

impl FakeCustody {
    pub fn new() -> Self {
        let custody = Self {
            keys: Arc::new(Mutex::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            sign_calls: Arc::new(AtomicU64::new(0)),
        };
        custody.add_key(1);
        custody
    }

    /// While unavailable every call answers 503.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn sign_calls(&self) -> u64 {
        self.sign_calls.load(Ordering::SeqCst)
    }

    pub fn current_version(&self) -> u32 {
        let keys = self.keys.lock().unwrap();
        *keys.keys().next_back().unwrap()
    }

    fn add_key(&self, version: u32) -> KeyMetadata {
        let manager = SignatureManager::new();
        let (secret, public_key) = manager.generate_keypair();
        let metadata = KeyMetadata {
            version,
            algorithm: "ecdsa-secp256k1-sha256".to_string(),
            public_key: hex::encode(public_key.serialize()),
            created_at: Utc::now(),
            retired_at: None,
        };
        self.keys.lock().unwrap().insert(
            version,
            CustodyKey {
                secret,
                metadata: metadata.clone(),
            },
        );
        metadata
    }

    fn metadata(&self, version: u32) -> ResponseTemplate {
        let keys = self.keys.lock().unwrap();
        match keys.get(&version) {
            Some(key) => ResponseTemplate::new(200).set_body_json(&key.metadata),
            None => ResponseTemplate::new(404),
        }
    }

    fn sign(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let digest: ChainHash = match body["digest"].as_str().map(str::parse::<ChainHash>) {
            Some(Ok(digest)) => digest,
            _ => return ResponseTemplate::new(400),
        };
        let version = body["key_version"]
            .as_u64()
            .map(|v| v as u32)
            .unwrap_or_else(|| self.current_version());

        let keys = self.keys.lock().unwrap();
        let Some(key) = keys.get(&version) else {
            return ResponseTemplate::new(404);
        };
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let signature = SignatureManager::new().sign_digest(&digest, &key.secret);

        ResponseTemplate::new(200).set_body_json(json!({
            "signature": encode_signature(&signature),
            "key_version": version,
        }))
    }

    /// Rotate inside the service, as another engine sharing it would.
    pub fn rotate_key(&self) -> KeyMetadata {
        let previous = self.current_version();
        if let Some(key) = self.keys.lock().unwrap().get_mut(&previous) {
            key.metadata.retired_at = Some(Utc::now());
        }
        self.add_key(previous + 1)
    }

    fn rotate(&self) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(self.rotate_key())
    }
}

impl Respond for FakeCustody {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if !self.available.load(Ordering::SeqCst) {
            return ResponseTemplate::new(503);
        }

        let route = request.url.path().trim_start_matches("/v1/").to_string();
        match (request.method.as_str(), route.as_str()) {
            ("GET", "keys/current") => self.metadata(self.current_version()),
            ("POST", "keys/rotate") => self.rotate(),
            ("POST", "sign") => self.sign(request),
            ("GET", other) => match other
                .strip_prefix("keys/")
                .and_then(|v| v.parse::<u32>().ok())
            {
                Some(version) => self.metadata(version),
                None => ResponseTemplate::new(404),
            },
            _ => ResponseTemplate::new(405),
        }
    }
}

pub async fn start_custody() -> (MockServer, FakeCustody) {
    let server = MockServer::start().await;
    let custody = FakeCustody::new();
    Mock::given(path_regex(r"^/v1/"))
        .respond_with(custody.clone())
        .mount(&server)
        .await;
    (server, custody)
}

pub fn custody_client(server: &MockServer) -> CustodyClient {
    CustodyClient::new(
        server.uri(),
        Some("test-token".to_string()),
        Duration::from_secs(2),
        RetryPolicy::immediate(3),
    )
    .expect("custody client builds")
}

/// Engine signing through the custody fake, without timestamps.
pub fn custody_engine(server: &MockServer) -> IntegrityEngine {
    keyed_engine(KeyManager::with_custody(custody_client(server)))
}
