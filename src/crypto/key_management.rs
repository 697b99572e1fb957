//! Signing Key Management
//!
//! Versioned signing keys with rotation. Versions start at 1 and only grow;
//! a rotated key is retired, never deleted, so older records stay
//! verifiable. Keys live either in a local keyring (ephemeral or backed by a
//! key directory) or in a remote custody service.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::custody::CustodyClient;
use super::signatures::{
    encode_signature, parse_public_key, parse_secret_key, SignatureManager, SIGNATURE_ALGORITHM,
};
use crate::chain::ChainHash;
use crate::config::{KeyBackendKind, KeyConfig};
use crate::error::{IntegrityError, Result};
use crate::retry::RetryPolicy;

const KEYRING_FILE: &str = "keyring.json";

/// Key status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Retired => "retired",
        }
    }
}

/// Public half of a signing key, as exported by `getPublicKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub version: u32,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    pub public_key: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
}

fn default_algorithm() -> String {
    SIGNATURE_ALGORITHM.to_string()
}

impl KeyMetadata {
    pub fn status(&self) -> KeyStatus {
        if self.retired_at.is_some() {
            KeyStatus::Retired
        } else {
            KeyStatus::Active
        }
    }

    pub fn parsed_public_key(&self) -> Result<PublicKey> {
        parse_public_key(&self.public_key)
    }
}

struct LocalKey {
    metadata: KeyMetadata,
    secret: SecretKey,
}

#[derive(Serialize, Deserialize)]
struct Keyring {
    current_version: u32,
    keys: Vec<KeyMetadata>,
}

/// In-process keyring. With a key directory, every version is written as
/// `signing-v{N}.key` (hex secret) next to a `keyring.json` index.
pub struct LocalKeyStore {
    key_dir: Option<PathBuf>,
    keys: BTreeMap<u32, LocalKey>,
    current: u32,
}

impl LocalKeyStore {
    /// Fresh keyring holding only version 1, never written to disk.
    pub fn ephemeral(signatures: &SignatureManager) -> Self {
        let mut store = Self {
            key_dir: None,
            keys: BTreeMap::new(),
            current: 0,
        };
        store.insert_new_key(signatures, 1);
        store
    }

    /// Load the keyring from `key_dir`, creating version 1 if it is empty.
    pub fn open(key_dir: &Path, signatures: &SignatureManager) -> Result<Self> {
        fs::create_dir_all(key_dir)?;
        let index_path = key_dir.join(KEYRING_FILE);

        if !index_path.exists() {
            let mut store = Self {
                key_dir: Some(key_dir.to_path_buf()),
                keys: BTreeMap::new(),
                current: 0,
            };
            store.insert_new_key(signatures, 1);
            store.persist()?;
            info!("Created signing keyring in {:?}", key_dir);
            return Ok(store);
        }

        let keyring: Keyring = serde_json::from_str(&fs::read_to_string(&index_path)?)?;
        let mut keys = BTreeMap::new();

        for metadata in keyring.keys {
            let secret_hex = fs::read_to_string(key_file(key_dir, metadata.version))?;
            let secret = parse_secret_key(&secret_hex)?;
            let derived = signatures.public_key_from_secret(&secret);
            if derived != metadata.parsed_public_key()? {
                return Err(IntegrityError::Crypto(format!(
                    "Key file for v{} does not match its public key",
                    metadata.version
                )));
            }
            keys.insert(metadata.version, LocalKey { metadata, secret });
        }

        if !keys.contains_key(&keyring.current_version) {
            return Err(IntegrityError::Crypto(format!(
                "Keyring current version v{} has no key",
                keyring.current_version
            )));
        }

        info!(
            "Loaded {} signing key(s) from {:?}, current v{}",
            keys.len(),
            key_dir,
            keyring.current_version
        );

        Ok(Self {
            key_dir: Some(key_dir.to_path_buf()),
            keys,
            current: keyring.current_version,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.current
    }

    fn current_key(&self) -> Result<&LocalKey> {
        self.keys
            .get(&self.current)
            .ok_or(IntegrityError::UnknownKeyVersion(self.current))
    }

    fn metadata(&self, version: u32) -> Result<KeyMetadata> {
        self.keys
            .get(&version)
            .map(|key| key.metadata.clone())
            .ok_or(IntegrityError::UnknownKeyVersion(version))
    }

    fn all_metadata(&self) -> Vec<KeyMetadata> {
        self.keys.values().map(|key| key.metadata.clone()).collect()
    }

    fn rotate(&mut self, signatures: &SignatureManager) -> Result<KeyMetadata> {
        let previous = self.current;
        let next = previous + 1;
        let now = Utc::now();

        self.insert_new_key(signatures, next);
        if let Some(old) = self.keys.get_mut(&previous) {
            old.metadata.retired_at = Some(now);
        }

        if let Err(e) = self.persist() {
            // Keep memory consistent with what is on disk.
            self.keys.remove(&next);
            self.current = previous;
            if let Some(dir) = &self.key_dir {
                let _ = fs::remove_file(key_file(dir, next));
            }
            if let Some(old) = self.keys.get_mut(&previous) {
                old.metadata.retired_at = None;
            }
            return Err(e);
        }

        self.metadata(next)
    }

    fn insert_new_key(&mut self, signatures: &SignatureManager, version: u32) {
        let (secret, public) = signatures.generate_keypair();
        let metadata = KeyMetadata {
            version,
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            public_key: public.to_string(),
            created_at: Utc::now(),
            retired_at: None,
        };
        self.keys.insert(version, LocalKey { metadata, secret });
        self.current = version;
    }

    fn persist(&self) -> Result<()> {
        let Some(dir) = &self.key_dir else {
            return Ok(());
        };

        for (version, key) in &self.keys {
            let path = key_file(dir, *version);
            if !path.exists() {
                write_secret(&path, &hex::encode(key.secret.secret_bytes()))?;
            }
        }

        let keyring = Keyring {
            current_version: self.current,
            keys: self.all_metadata(),
        };
        let tmp = dir.join(format!("{}.tmp", KEYRING_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(&keyring)?)?;
        fs::rename(&tmp, dir.join(KEYRING_FILE))?;
        Ok(())
    }
}

fn key_file(dir: &Path, version: u32) -> PathBuf {
    dir.join(format!("signing-v{}.key", version))
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

enum KeyBackend {
    Local(RwLock<LocalKeyStore>),
    Custody(CustodyClient),
}

/// A signing key pinned to one version. Rotating the manager does not
/// affect a handle that is already out.
pub struct SigningKey<'a> {
    version: u32,
    signer: Signer<'a>,
}

enum Signer<'a> {
    Local {
        secret: SecretKey,
        signatures: &'a SignatureManager,
    },
    Custody(&'a CustodyClient),
}

impl SigningKey<'_> {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Sign a 32-byte digest, returning the hex compact signature.
    pub async fn sign(&self, digest: &ChainHash) -> Result<String> {
        match &self.signer {
            Signer::Local { secret, signatures } => {
                Ok(encode_signature(&signatures.sign_digest(digest, secret)))
            }
            Signer::Custody(client) => {
                let signed = client.sign(digest, Some(self.version)).await?;
                if signed.key_version != self.version {
                    return Err(IntegrityError::KeyUnavailable(format!(
                        "Custody signed with v{} instead of v{}",
                        signed.key_version, self.version
                    )));
                }
                Ok(signed.signature)
            }
        }
    }
}

/// Versioned key manager shared by the sealer and the verifier.
pub struct KeyManager {
    backend: KeyBackend,
    signature_manager: SignatureManager,
    key_cache: Arc<RwLock<HashMap<u32, PublicKey>>>,
}

impl KeyManager {
    pub async fn from_config(config: &KeyConfig) -> Result<Self> {
        match config.backend {
            KeyBackendKind::Local => match &config.key_dir {
                Some(dir) => Self::open_local(dir),
                None => Ok(Self::ephemeral()),
            },
            KeyBackendKind::Custody => {
                let url = config.custody_url.as_deref().ok_or_else(|| {
                    IntegrityError::Config("keys.custody_url is required".to_string())
                })?;
                let client = CustodyClient::new(
                    url,
                    config.custody_token.clone(),
                    config.request_timeout(),
                    RetryPolicy::new(config.max_attempts, RetryPolicy::default().initial_delay),
                )?
                .with_version_ttl(config.version_ttl());
                let manager = Self::with_custody(client);
                let version = manager.current_version().await?;
                info!("Key custody service ready at {} (current v{})", url, version);
                Ok(manager)
            }
        }
    }

    /// In-memory keyring; keys are lost when the process exits.
    pub fn ephemeral() -> Self {
        let signature_manager = SignatureManager::new();
        let store = LocalKeyStore::ephemeral(&signature_manager);
        warn!("Using an ephemeral signing keyring; keys will not survive restart");
        Self::from_parts(KeyBackend::Local(RwLock::new(store)), signature_manager)
    }

    pub fn open_local(key_dir: &Path) -> Result<Self> {
        let signature_manager = SignatureManager::new();
        let store = LocalKeyStore::open(key_dir, &signature_manager)?;
        Ok(Self::from_parts(
            KeyBackend::Local(RwLock::new(store)),
            signature_manager,
        ))
    }

    pub fn with_custody(client: CustodyClient) -> Self {
        Self::from_parts(KeyBackend::Custody(client), SignatureManager::new())
    }

    fn from_parts(backend: KeyBackend, signature_manager: SignatureManager) -> Self {
        Self {
            backend,
            signature_manager,
            key_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            KeyBackend::Local(_) => "local",
            KeyBackend::Custody(_) => "custody",
        }
    }

    pub fn signature_manager(&self) -> &SignatureManager {
        &self.signature_manager
    }

    pub async fn current_version(&self) -> Result<u32> {
        match &self.backend {
            KeyBackend::Local(store) => Ok(store.read().await.current_version()),
            KeyBackend::Custody(client) => client.current_version().await,
        }
    }

    /// `currentKey()`: the key new records are signed with.
    pub async fn current_key(&self) -> Result<SigningKey<'_>> {
        match &self.backend {
            KeyBackend::Local(store) => {
                let store = store.read().await;
                let key = store.current_key()?;
                Ok(SigningKey {
                    version: key.metadata.version,
                    signer: Signer::Local {
                        secret: key.secret,
                        signatures: &self.signature_manager,
                    },
                })
            }
            KeyBackend::Custody(client) => Ok(SigningKey {
                version: client.current_version().await?,
                signer: Signer::Custody(client),
            }),
        }
    }

    /// `keyFor(version)`: the public key for verification.
    pub async fn key_for(&self, version: u32) -> Result<PublicKey> {
        if let Some(key) = self.key_cache.read().await.get(&version) {
            return Ok(*key);
        }

        let metadata = self.metadata(version).await?;
        let key = metadata.parsed_public_key()?;
        self.key_cache.write().await.insert(version, key);
        debug!("Cached public key v{}", version);
        Ok(key)
    }

    /// Check a hex signature over `digest` against key `version`.
    pub async fn verify(&self, version: u32, digest: &ChainHash, signature_hex: &str) -> Result<bool> {
        let key = self.key_for(version).await?;
        Ok(self
            .signature_manager
            .verify_hex(digest, signature_hex, &key))
    }

    /// `rotate()`: activate a new version and retire the previous one.
    pub async fn rotate(&self) -> Result<KeyMetadata> {
        let metadata = match &self.backend {
            KeyBackend::Local(store) => {
                let mut store = store.write().await;
                store.rotate(&self.signature_manager)?
            }
            KeyBackend::Custody(client) => client.rotate().await?,
        };

        info!("Signing key rotated to v{}", metadata.version);
        Ok(metadata)
    }

    /// `getPublicKey(version?)`, defaulting to the current version.
    pub async fn public_key(&self, version: Option<u32>) -> Result<KeyMetadata> {
        let version = match version {
            Some(version) => version,
            None => self.current_version().await?,
        };
        self.metadata(version).await
    }

    /// Every known version, oldest first. Custody only reports what it has
    /// been asked for.
    pub async fn list_keys(&self) -> Result<Vec<KeyMetadata>> {
        match &self.backend {
            KeyBackend::Local(store) => Ok(store.read().await.all_metadata()),
            KeyBackend::Custody(client) => Ok(vec![client.current_key().await?]),
        }
    }

    async fn metadata(&self, version: u32) -> Result<KeyMetadata> {
        match &self.backend {
            KeyBackend::Local(store) => store.read().await.metadata(version),
            KeyBackend::Custody(client) => client.public_key(version).await,
        }
    }
}
