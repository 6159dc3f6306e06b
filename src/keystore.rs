//! Key provider — lifecycle and pluggable back-ends
//!
//! The capability interface is deliberately small: `generate`, `activate`,
//! `rotate`, `revoke`, `lookup`. Concrete back-ends implement it directly;
//! there is no runtime type probing. The crate ships two:
//!
//! - [`MemoryProvider`] — development and tests.
//! - [`LocalFileProvider`] — one encrypted blob per key plus a plaintext
//!   JSON metadata sidecar. At-rest encryption stretches the deployment
//!   master secret with argon2id over a per-store salt, expands the result
//!   into a ChaCha20 keystream for the XOR wrap, and authenticates the blob
//!   with a keyed BLAKE3 MAC. A wrong master secret is a MAC failure, never
//!   silently-wrong key material.
//!
//! External KMS back-ends implement the same trait out-of-crate: the handle
//! stays opaque and material is unwrapped per operation.
//!
//! Lifecycle: REGISTERED → ACTIVE → (EXPIRED | REVOKED). Only ACTIVE keys
//! may encrypt; REGISTERED and EXPIRED keys may still decrypt historical
//! packages; REVOKED keys may not be used at all. Every transition emits an
//! evidence event when the provider is wired to a log.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::cipher::{SecretKey, SecurityLevel};
use crate::csprng::{SeedContext, StreamTag};
use crate::evidence::{EventType, EvidenceError, EvidenceLog};
use crate::{Classify, ErrorKind, KeyId};

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("unknown key `{key_id}`")]
    UnknownKey { key_id: KeyId },
    #[error("key `{key_id}` is {actual:?}, operation requires {required:?}")]
    BadState { key_id: KeyId, actual: KeyState, required: KeyState },
    #[error("key `{key_id}` is revoked")]
    Revoked { key_id: KeyId },
    #[error("key store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("key blob authentication failed for `{key_id}` (wrong master secret or corrupted blob)")]
    MacMismatch { key_id: KeyId },
    #[error("key material for `{key_id}` is malformed")]
    BadMaterial { key_id: KeyId },
    #[error("metadata sidecar corrupt: {0}")]
    Sidecar(String),
    #[error("master-secret derivation failed: {0}")]
    Kdf(String),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

impl Classify for KeystoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            KeystoreError::Io(_) => ErrorKind::Resource,
            KeystoreError::MacMismatch { .. } | KeystoreError::BadMaterial { .. } => {
                ErrorKind::Crypto
            }
            KeystoreError::Kdf(_) => ErrorKind::Config,
            KeystoreError::Evidence(e) => e.kind(),
            _ => ErrorKind::Validation,
        }
    }
}

/// Key lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Registered,
    Active,
    Expired,
    Revoked,
}

/// Plaintext key metadata (the sidecar content for file-backed stores).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: KeyId,
    pub state: KeyState,
    pub security_bits: u16,
    pub owner: String,
    /// Milliseconds since epoch.
    pub created_at: i64,
    pub activation_time: Option<i64>,
    pub expiry_time: Option<i64>,
    /// Successor when this key was rotated out.
    pub rotated_to: Option<KeyId>,
}

impl KeyMetadata {
    /// Only ACTIVE keys may seal new packages.
    pub fn can_encrypt(&self) -> bool {
        self.state == KeyState::Active
    }

    /// Anything but REVOKED may decrypt historical packages.
    pub fn can_decrypt(&self) -> bool {
        self.state != KeyState::Revoked
    }
}

/// Metadata plus unwrapped secret material.
pub struct KeyMaterial {
    pub metadata: KeyMetadata,
    pub secret: SecretKey,
}

/// The provider capability. Back-ends must be shareable across aggregator
/// tasks (read-mostly access).
pub trait KeyProvider: Send + Sync {
    /// Create a key in REGISTERED state and return its id.
    fn generate(&self, security: SecurityLevel, owner: &str) -> Result<KeyId, KeystoreError>;
    /// REGISTERED → ACTIVE.
    fn activate(&self, key_id: &KeyId) -> Result<(), KeystoreError>;
    /// Generate-and-activate a successor; the old key becomes EXPIRED.
    fn rotate(&self, old: &KeyId) -> Result<KeyId, KeystoreError>;
    /// Any state → REVOKED (terminal).
    fn revoke(&self, key_id: &KeyId) -> Result<(), KeystoreError>;
    /// Metadata plus unwrapped secret material.
    fn lookup(&self, key_id: &KeyId) -> Result<KeyMaterial, KeystoreError>;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Derive a key id from the sampled secret: stable, unique per material.
fn derive_key_id(secret: &SecretKey) -> KeyId {
    let digest = blake3::hash(&secret.to_bytes());
    KeyId(format!("k-{}", hex::encode(&digest.as_bytes()[..8])))
}

// ============================================================================
// In-memory provider
// ============================================================================

/// Volatile provider for development and tests.
pub struct MemoryProvider {
    seed: SeedContext,
    counter: Mutex<u64>,
    keys: Mutex<BTreeMap<KeyId, (KeyMetadata, SecretKey)>>,
    evidence: Option<Arc<EvidenceLog>>,
}

impl MemoryProvider {
    pub fn new(seed: SeedContext) -> Self {
        Self { seed, counter: Mutex::new(0), keys: Mutex::new(BTreeMap::new()), evidence: None }
    }

    /// Wire lifecycle transitions into an evidence log.
    pub fn with_evidence(mut self, evidence: Arc<EvidenceLog>) -> Self {
        self.evidence = Some(evidence);
        self
    }

    fn record(&self, event: EventType, subject: &str) -> Result<(), KeystoreError> {
        if let Some(log) = &self.evidence {
            log.append(event, "keystore", subject)?;
        }
        Ok(())
    }

    fn sample_secret(&self, security: SecurityLevel, owner: &str) -> SecretKey {
        let nonce = {
            let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
            *counter += 1;
            *counter
        };
        let mut rng =
            self.seed.substream(StreamTag::SecretKey, &[owner.as_bytes(), &nonce.to_be_bytes()]);
        SecretKey::sample(security, &mut rng)
    }
}

impl KeyProvider for MemoryProvider {
    fn generate(&self, security: SecurityLevel, owner: &str) -> Result<KeyId, KeystoreError> {
        let secret = self.sample_secret(security, owner);
        let key_id = derive_key_id(&secret);
        let metadata = KeyMetadata {
            key_id: key_id.clone(),
            state: KeyState::Registered,
            security_bits: security.bits(),
            owner: owner.to_string(),
            created_at: now_ms(),
            activation_time: None,
            expiry_time: None,
            rotated_to: None,
        };
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_id.clone(), (metadata, secret));
        self.record(EventType::KeyGenerated, &key_id.0)?;
        tracing::info!(key_id = %key_id, owner, "key generated");
        Ok(key_id)
    }

    fn activate(&self, key_id: &KeyId) -> Result<(), KeystoreError> {
        {
            let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            let (metadata, _) = keys
                .get_mut(key_id)
                .ok_or_else(|| KeystoreError::UnknownKey { key_id: key_id.clone() })?;
            if metadata.state != KeyState::Registered {
                return Err(KeystoreError::BadState {
                    key_id: key_id.clone(),
                    actual: metadata.state,
                    required: KeyState::Registered,
                });
            }
            metadata.state = KeyState::Active;
            metadata.activation_time = Some(now_ms());
        }
        self.record(EventType::KeyActivated, &key_id.0)?;
        Ok(())
    }

    fn rotate(&self, old: &KeyId) -> Result<KeyId, KeystoreError> {
        let (security, owner) = {
            let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            let (metadata, _) = keys
                .get(old)
                .ok_or_else(|| KeystoreError::UnknownKey { key_id: old.clone() })?;
            if metadata.state != KeyState::Active {
                return Err(KeystoreError::BadState {
                    key_id: old.clone(),
                    actual: metadata.state,
                    required: KeyState::Active,
                });
            }
            let security = SecurityLevel::from_bits(metadata.security_bits)
                .ok_or_else(|| KeystoreError::BadMaterial { key_id: old.clone() })?;
            (security, metadata.owner.clone())
        };

        let new_id = self.generate(security, &owner)?;
        self.activate(&new_id)?;
        {
            let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((metadata, _)) = keys.get_mut(old) {
                metadata.state = KeyState::Expired;
                metadata.expiry_time = Some(now_ms());
                metadata.rotated_to = Some(new_id.clone());
            }
        }
        self.record(EventType::KeyRotated, &format!("{old} -> {new_id}"))?;
        self.record(EventType::KeyExpired, &old.0)?;
        Ok(new_id)
    }

    fn revoke(&self, key_id: &KeyId) -> Result<(), KeystoreError> {
        {
            let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            let (metadata, _) = keys
                .get_mut(key_id)
                .ok_or_else(|| KeystoreError::UnknownKey { key_id: key_id.clone() })?;
            metadata.state = KeyState::Revoked;
        }
        self.record(EventType::KeyRevoked, &key_id.0)?;
        Ok(())
    }

    fn lookup(&self, key_id: &KeyId) -> Result<KeyMaterial, KeystoreError> {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let (metadata, secret) = keys
            .get(key_id)
            .ok_or_else(|| KeystoreError::UnknownKey { key_id: key_id.clone() })?;
        if metadata.state == KeyState::Revoked {
            return Err(KeystoreError::Revoked { key_id: key_id.clone() });
        }
        Ok(KeyMaterial { metadata: metadata.clone(), secret: secret.clone() })
    }
}

// ============================================================================
// Local file provider (encrypted at rest)
// ============================================================================

const SALT_FILE: &str = "store.salt";
const SALT_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// File-backed provider: `<key_id>.key` encrypted blob + `<key_id>.meta.json`
/// plaintext sidecar, all under one directory.
pub struct LocalFileProvider {
    dir: PathBuf,
    /// argon2id-stretched master secret (32 bytes).
    wrap_root: [u8; 32],
    salt: [u8; SALT_LEN],
    seed: SeedContext,
    counter: Mutex<u64>,
    evidence: Option<Arc<EvidenceLog>>,
}

impl std::fmt::Debug for LocalFileProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileProvider").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl LocalFileProvider {
    /// Open (or initialize) the store at `dir`. The per-store salt is
    /// created on first use; the master secret is stretched once here.
    pub fn open(
        dir: impl AsRef<Path>,
        master_secret: &[u8],
        seed: SeedContext,
    ) -> Result<Self, KeystoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let salt_path = dir.join(SALT_FILE);
        let salt: [u8; SALT_LEN] = if salt_path.exists() {
            let bytes = std::fs::read(&salt_path)?;
            bytes
                .try_into()
                .map_err(|_| KeystoreError::Sidecar("store salt is not 16 bytes".into()))?
        } else {
            let mut salt = [0u8; SALT_LEN];
            rand::rngs::OsRng.fill_bytes(&mut salt);
            std::fs::write(&salt_path, salt)?;
            salt
        };

        let mut wrap_root = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(master_secret, &salt, &mut wrap_root)
            .map_err(|e| KeystoreError::Kdf(e.to_string()))?;

        Ok(Self { dir, wrap_root, salt, seed, counter: Mutex::new(0), evidence: None })
    }

    /// Wire lifecycle transitions into an evidence log.
    pub fn with_evidence(mut self, evidence: Arc<EvidenceLog>) -> Self {
        self.evidence = Some(evidence);
        self
    }

    fn record(&self, event: EventType, subject: &str) -> Result<(), KeystoreError> {
        if let Some(log) = &self.evidence {
            log.append(event, "keystore", subject)?;
        }
        Ok(())
    }

    fn meta_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.meta.json", key_id.0))
    }

    fn blob_path(&self, key_id: &KeyId) -> PathBuf {
        self.dir.join(format!("{}.key", key_id.0))
    }

    fn load_metadata(&self, key_id: &KeyId) -> Result<KeyMetadata, KeystoreError> {
        let path = self.meta_path(key_id);
        if !path.exists() {
            return Err(KeystoreError::UnknownKey { key_id: key_id.clone() });
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| KeystoreError::Sidecar(e.to_string()))
    }

    fn store_metadata(&self, metadata: &KeyMetadata) -> Result<(), KeystoreError> {
        let raw = serde_json::to_string(metadata)
            .map_err(|e| KeystoreError::Sidecar(e.to_string()))?;
        std::fs::write(self.meta_path(&metadata.key_id), raw)?;
        Ok(())
    }

    /// Per-key keystream from the wrap root and the store salt.
    fn keystream(&self, key_id: &KeyId, len: usize) -> Vec<u8> {
        let root_ctx = SeedContext::new(self.wrap_root);
        let mut rng = root_ctx.substream(StreamTag::MasterWrap, &[&self.salt, key_id.as_bytes()]);
        let mut stream = vec![0u8; len];
        rng.fill_bytes(&mut stream);
        stream
    }

    fn mac_key(&self) -> [u8; 32] {
        blake3::derive_key("tensorguard.keystore.v1.mac", &self.wrap_root)
    }

    /// Blob layout: `MAC(32) ∥ keystream ⊕ secret_bytes`.
    fn wrap_secret(&self, key_id: &KeyId, secret: &SecretKey) -> Vec<u8> {
        let plain = secret.to_bytes();
        let stream = self.keystream(key_id, plain.len());
        let body: Vec<u8> = plain.iter().zip(&stream).map(|(p, s)| p ^ s).collect();
        let mac = blake3::keyed_hash(&self.mac_key(), &body);
        let mut blob = Vec::with_capacity(MAC_LEN + body.len());
        blob.extend_from_slice(mac.as_bytes());
        blob.extend_from_slice(&body);
        blob
    }

    fn unwrap_secret(&self, key_id: &KeyId, blob: &[u8]) -> Result<SecretKey, KeystoreError> {
        if blob.len() <= MAC_LEN {
            return Err(KeystoreError::BadMaterial { key_id: key_id.clone() });
        }
        let (mac_bytes, body) = blob.split_at(MAC_LEN);
        let expected = blake3::keyed_hash(&self.mac_key(), body);
        // blake3::Hash equality is constant-time.
        if expected != *mac_bytes {
            return Err(KeystoreError::MacMismatch { key_id: key_id.clone() });
        }
        let stream = self.keystream(key_id, body.len());
        let plain: Vec<u8> = body.iter().zip(&stream).map(|(c, s)| c ^ s).collect();
        SecretKey::from_bytes(&plain)
            .ok_or_else(|| KeystoreError::BadMaterial { key_id: key_id.clone() })
    }
}

impl KeyProvider for LocalFileProvider {
    fn generate(&self, security: SecurityLevel, owner: &str) -> Result<KeyId, KeystoreError> {
        let nonce = {
            let mut counter = self.counter.lock().unwrap_or_else(|e| e.into_inner());
            *counter += 1;
            *counter
        };
        let mut rng =
            self.seed.substream(StreamTag::SecretKey, &[owner.as_bytes(), &nonce.to_be_bytes()]);
        let secret = SecretKey::sample(security, &mut rng);
        let key_id = derive_key_id(&secret);

        std::fs::write(self.blob_path(&key_id), self.wrap_secret(&key_id, &secret))?;
        self.store_metadata(&KeyMetadata {
            key_id: key_id.clone(),
            state: KeyState::Registered,
            security_bits: security.bits(),
            owner: owner.to_string(),
            created_at: now_ms(),
            activation_time: None,
            expiry_time: None,
            rotated_to: None,
        })?;
        self.record(EventType::KeyGenerated, &key_id.0)?;
        tracing::info!(key_id = %key_id, owner, "key generated");
        Ok(key_id)
    }

    fn activate(&self, key_id: &KeyId) -> Result<(), KeystoreError> {
        let mut metadata = self.load_metadata(key_id)?;
        if metadata.state != KeyState::Registered {
            return Err(KeystoreError::BadState {
                key_id: key_id.clone(),
                actual: metadata.state,
                required: KeyState::Registered,
            });
        }
        metadata.state = KeyState::Active;
        metadata.activation_time = Some(now_ms());
        self.store_metadata(&metadata)?;
        self.record(EventType::KeyActivated, &key_id.0)?;
        Ok(())
    }

    fn rotate(&self, old: &KeyId) -> Result<KeyId, KeystoreError> {
        let mut old_metadata = self.load_metadata(old)?;
        if old_metadata.state != KeyState::Active {
            return Err(KeystoreError::BadState {
                key_id: old.clone(),
                actual: old_metadata.state,
                required: KeyState::Active,
            });
        }
        let security = SecurityLevel::from_bits(old_metadata.security_bits)
            .ok_or_else(|| KeystoreError::BadMaterial { key_id: old.clone() })?;

        let new_id = self.generate(security, &old_metadata.owner)?;
        self.activate(&new_id)?;

        old_metadata.state = KeyState::Expired;
        old_metadata.expiry_time = Some(now_ms());
        old_metadata.rotated_to = Some(new_id.clone());
        self.store_metadata(&old_metadata)?;
        self.record(EventType::KeyRotated, &format!("{old} -> {new_id}"))?;
        self.record(EventType::KeyExpired, &old.0)?;
        Ok(new_id)
    }

    fn revoke(&self, key_id: &KeyId) -> Result<(), KeystoreError> {
        let mut metadata = self.load_metadata(key_id)?;
        metadata.state = KeyState::Revoked;
        self.store_metadata(&metadata)?;
        self.record(EventType::KeyRevoked, &key_id.0)?;
        Ok(())
    }

    fn lookup(&self, key_id: &KeyId) -> Result<KeyMaterial, KeystoreError> {
        let metadata = self.load_metadata(key_id)?;
        if metadata.state == KeyState::Revoked {
            return Err(KeystoreError::Revoked { key_id: key_id.clone() });
        }
        let blob = std::fs::read(self.blob_path(key_id))?;
        let secret = self.unwrap_secret(key_id, &blob)?;
        Ok(KeyMaterial { metadata, secret })
    }
}

// ============================================================================
// Tests
// ============================================================================
