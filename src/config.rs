use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::crypto::signatures::parse_public_key;
use crate::error::IntegrityError;

/// Environment prefix, e.g. `INTEGRITY__TSA__URL`.
pub const ENV_PREFIX: &str = "INTEGRITY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub keys: KeyConfig,
    pub tsa: TsaConfig,
    pub store: StoreConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBackendKind {
    Local,
    Custody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub backend: KeyBackendKind,
    /// Absent means an ephemeral in-memory keyring.
    pub key_dir: Option<PathBuf>,
    pub custody_url: Option<String>,
    pub custody_token: Option<String>,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    /// How long the custody service's current version is trusted before
    /// it is asked again.
    pub version_refresh_ms: u64,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            backend: KeyBackendKind::Local,
            key_dir: None,
            custody_url: None,
            custody_token: None,
            request_timeout_ms: 5_000,
            max_attempts: 3,
            version_refresh_ms: 30_000,
        }
    }
}

impl KeyConfig {
    /// Local keys with nowhere to persist them vanish with the process.
    pub fn is_ephemeral(&self) -> bool {
        self.backend == KeyBackendKind::Local && self.key_dir.is_none()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn version_ttl(&self) -> Duration {
        Duration::from_millis(self.version_refresh_ms)
    }
}

/// How a batch seal obtains timestamp evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTimestampMode {
    /// One paced request per record.
    PerRecord,
    /// A single request for the batch's final hash.
    FinalOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsaConfig {
    pub enabled: bool,
    /// Label recorded on every token this TSA issues.
    pub provider: String,
    /// Endpoint speaking the JSON timestamp contract. Required when enabled.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    /// Minimum spacing between request starts, for rate-limited TSAs.
    pub min_request_interval_ms: u64,
    /// Hex public key the TSA signs tokens with. Required when enabled;
    /// tokens under any other key are rejected.
    pub trusted_public_key: Option<String>,
    pub batch_mode: BatchTimestampMode,
    pub clock_skew_secs: i64,
}

impl Default for TsaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "tsa".to_string(),
            url: None,
            api_key: None,
            timeout_ms: 5_000,
            max_attempts: 3,
            initial_backoff_ms: 200,
            min_request_interval_ms: 0,
            trusted_public_key: None,
            batch_mode: BatchTimestampMode::PerRecord,
            clock_skew_secs: 120,
        }
    }
}

impl TsaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    Memory,
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    /// Directory for the JSONL backend (one file per chain).
    pub path: Option<PathBuf>,
    pub database_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            path: None,
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBackendKind {
    Disabled,
    InProcess,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub backend: EventBackendKind,
    pub webhook_url: Option<String>,
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            backend: EventBackendKind::Disabled,
            webhook_url: None,
            channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Layer defaults, an optional TOML file and `INTEGRITY__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, IntegrityError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading engine configuration from: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Refuse settings under which nothing sealed outlives the process.
    /// Library users may embed a transient engine; a one-shot command
    /// cannot.
    pub fn require_durable(&self) -> Result<(), IntegrityError> {
        if self.keys.is_ephemeral() {
            return Err(IntegrityError::Config(
                "an ephemeral keyring cannot be verified later; set keys.key_dir or use keys.backend = custody"
                    .to_string(),
            ));
        }
        if self.store.backend == StoreBackendKind::Memory {
            return Err(IntegrityError::Config(
                "store.backend = memory keeps nothing between runs; use jsonl or sqlite".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), IntegrityError> {
        if self.keys.backend == KeyBackendKind::Custody && self.keys.custody_url.is_none() {
            return Err(IntegrityError::Config(
                "keys.backend = custody requires keys.custody_url".to_string(),
            ));
        }

        if self.keys.max_attempts == 0 || self.tsa.max_attempts == 0 {
            return Err(IntegrityError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.tsa.enabled && self.tsa.url.is_none() {
            return Err(IntegrityError::Config(
                "tsa.enabled requires tsa.url".to_string(),
            ));
        }

        if self.tsa.enabled && self.tsa.trusted_public_key.is_none() {
            return Err(IntegrityError::Config(
                "tsa.enabled requires tsa.trusted_public_key".to_string(),
            ));
        }

        if self.tsa.clock_skew_secs < 0 {
            return Err(IntegrityError::Config(format!(
                "tsa.clock_skew_secs ({}) cannot be negative",
                self.tsa.clock_skew_secs
            )));
        }

        if let Some(key) = &self.tsa.trusted_public_key {
            parse_public_key(key).map_err(|e| {
                IntegrityError::Config(format!("tsa.trusted_public_key: {}", e))
            })?;
        }

        if self.keys.is_ephemeral() && self.store.backend != StoreBackendKind::Memory {
            return Err(IntegrityError::Config(format!(
                "store.backend = {:?} outlives an ephemeral keyring; set keys.key_dir",
                self.store.backend
            )));
        }

        match self.store.backend {
            StoreBackendKind::Jsonl if self.store.path.is_none() => {
                return Err(IntegrityError::Config(
                    "store.backend = jsonl requires store.path".to_string(),
                ));
            }
            StoreBackendKind::Sqlite if self.store.database_url.is_none() => {
                return Err(IntegrityError::Config(
                    "store.backend = sqlite requires store.database_url".to_string(),
                ));
            }
            _ => {}
        }

        if self.events.backend == EventBackendKind::Webhook && self.events.webhook_url.is_none() {
            return Err(IntegrityError::Config(
                "events.backend = webhook requires events.webhook_url".to_string(),
            ));
        }

        if self.events.channel_capacity == 0 {
            return Err(IntegrityError::Config(
                "events.channel_capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn trusted_key_hex() -> String {
        let (_, public_key) = crate::crypto::SignatureManager::new().generate_keypair();
        hex::encode(public_key.serialize())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.tsa.enabled);
        assert!(config.tsa.url.is_none());
        assert_eq!(config.tsa.max_attempts, 3);
        assert_eq!(config.tsa.min_request_interval(), Duration::ZERO);
        assert!(config.require_durable().is_err());
    }

    #[test]
    fn test_enabled_tsa_needs_endpoint_and_trust_anchor() {
        let mut config = EngineConfig::default();
        config.tsa.enabled = true;
        config.tsa.trusted_public_key = Some(trusted_key_hex());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("tsa.url"), "{}", err);

        config.tsa.url = Some("https://tsa.example.test/stamp".to_string());
        assert!(config.validate().is_ok());

        config.tsa.trusted_public_key = None;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("tsa.trusted_public_key"), "{}", err);
    }

    #[test]
    fn test_durable_store_needs_durable_keys() {
        let mut config = EngineConfig::default();
        config.store.backend = StoreBackendKind::Jsonl;
        config.store.path = Some(PathBuf::from("/var/lib/integrity/chains"));
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("keys.key_dir"), "{}", err);

        config.keys.key_dir = Some(PathBuf::from("/var/lib/integrity/keys"));
        assert!(config.validate().is_ok());
        assert!(config.require_durable().is_ok());

        config.store.backend = StoreBackendKind::Memory;
        let err = config.require_durable().unwrap_err().to_string();
        assert!(err.contains("memory"), "{}", err);
        config.store.backend = StoreBackendKind::Jsonl;

        config.keys.key_dir = None;
        config.keys.backend = KeyBackendKind::Custody;
        config.keys.custody_url = Some("https://custody.example.test".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inconsistent_backends() {
        let mut config = EngineConfig::default();
        config.keys.backend = KeyBackendKind::Custody;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.store.backend = StoreBackendKind::Jsonl;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.events.backend = EventBackendKind::Webhook;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.tsa.trusted_public_key = Some("not-a-key".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[keys]
key_dir = "/var/lib/integrity/keys"

[tsa]
enabled = true
provider = "acme-tsa"
url = "https://tsa.example.test/stamp"
min_request_interval_ms = 6000
trusted_public_key = "{}"
batch_mode = "final_only"

[store]
backend = "sqlite"
database_url = "sqlite::memory:"
"#,
            trusted_key_hex()
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert!(config.tsa.enabled);
        assert_eq!(config.tsa.provider, "acme-tsa");
        assert_eq!(
            config.tsa.url.as_deref(),
            Some("https://tsa.example.test/stamp")
        );
        assert_eq!(config.tsa.min_request_interval(), Duration::from_secs(6));
        assert_eq!(config.tsa.batch_mode, BatchTimestampMode::FinalOnly);
        assert_eq!(config.store.backend, StoreBackendKind::Sqlite);
        assert_eq!(config.keys.backend, KeyBackendKind::Local);
    }
}
