//! Package signature capability
//!
//! Packages are signed over their 32-byte content hash. The primitive is a
//! capability interface: the crate ships a shared-secret fleet identity
//! (HMAC-SHA256), and deployments that need a hybrid classical∥PQC
//! signature implement the same pair of traits out-of-crate and register
//! their own `sig_alg` label. The envelope format treats signature bytes as
//! opaque either way.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{Classify, Digest32, ErrorKind};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signature verification failed for algorithm `{algorithm}`")]
    VerificationFailed { algorithm: String },
    #[error("signature algorithm mismatch: package says `{package}`, verifier is `{verifier}`")]
    AlgorithmMismatch { package: String, verifier: String },
    #[error("bad signing key material: {0}")]
    BadKey(String),
}

impl Classify for SignerError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Crypto
    }
}

/// Produces a signature over a package content hash.
pub trait PackageSigner: Send + Sync {
    /// Stable algorithm label recorded in the package header (`sig_alg`).
    fn algorithm(&self) -> &str;
    /// Sign the content hash; the bytes are opaque to the envelope format.
    fn sign(&self, content_hash: &Digest32) -> Vec<u8>;
}

/// Verifies a signature over a package content hash.
pub trait PackageVerifier: Send + Sync {
    /// Algorithm label this verifier accepts.
    fn algorithm(&self) -> &str;
    /// Check `signature` against `content_hash`.
    fn verify(&self, content_hash: &Digest32, signature: &[u8]) -> Result<(), SignerError>;
}

// ============================================================================
// Fleet identity (HMAC-SHA256)
// ============================================================================

/// Shared-secret fleet identity. Every worker in a fleet holds the same key;
/// the aggregator verifies against the published fleet identity rather than
/// per-worker certificates.
#[derive(Clone)]
pub struct FleetHmacSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for FleetHmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetHmacSigner").finish_non_exhaustive()
    }
}

pub const FLEET_HMAC_ALGORITHM: &str = "hmac-sha256.v1";

impl FleetHmacSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, SignerError> {
        let key = key.into();
        if key.len() < 16 {
            return Err(SignerError::BadKey("fleet key must be at least 16 bytes".into()));
        }
        let mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| SignerError::BadKey(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Key material supplied through config, `base64:`-prefixed or raw.
    pub fn from_config_value(raw: &str) -> Result<Self, SignerError> {
        let key = if let Some(encoded) = raw.strip_prefix("base64:") {
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| SignerError::BadKey(format!("bad base64: {e}")))?
        } else {
            raw.as_bytes().to_vec()
        };
        Self::new(key)
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }
}

impl PackageSigner for FleetHmacSigner {
    fn algorithm(&self) -> &str {
        FLEET_HMAC_ALGORITHM
    }

    fn sign(&self, content_hash: &Digest32) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(content_hash);
        mac.finalize().into_bytes().to_vec()
    }
}

impl PackageVerifier for FleetHmacSigner {
    fn algorithm(&self) -> &str {
        FLEET_HMAC_ALGORITHM
    }

    fn verify(&self, content_hash: &Digest32, signature: &[u8]) -> Result<(), SignerError> {
        let mut mac = self.mac();
        mac.update(content_hash);
        mac.verify_slice(signature).map_err(|_| SignerError::VerificationFailed {
            algorithm: FLEET_HMAC_ALGORITHM.to_string(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let signer = FleetHmacSigner::new(*b"0123456789abcdef0123456789abcdef").unwrap();
        let hash = [7u8; 32];
        let sig = signer.sign(&hash);
        assert_eq!(sig.len(), 32);
        signer.verify(&hash, &sig).unwrap();
    }

    #[test]
    fn tampered_hash_or_signature_fails() {
        let signer = FleetHmacSigner::new(*b"0123456789abcdef0123456789abcdef").unwrap();
        let hash = [7u8; 32];
        let mut sig = signer.sign(&hash);

        let mut wrong_hash = hash;
        wrong_hash[0] ^= 1;
        assert!(signer.verify(&wrong_hash, &sig).is_err());

        sig[5] ^= 1;
        assert!(signer.verify(&hash, &sig).is_err());
    }

    #[test]
    fn different_keys_do_not_cross_verify() {
        let a = FleetHmacSigner::new(*b"0123456789abcdef0123456789abcdef").unwrap();
        let b = FleetHmacSigner::new(*b"fedcba9876543210fedcba9876543210").unwrap();
        let hash = [1u8; 32];
        assert!(b.verify(&hash, &a.sign(&hash)).is_err());
    }

    #[test]
    fn key_material_rules() {
        assert!(FleetHmacSigner::new(*b"short").is_err());
        assert!(FleetHmacSigner::from_config_value("a-sufficiently-long-raw-key").is_ok());
        let b64 = format!(
            "base64:{}",
            base64::engine::general_purpose::STANDARD.encode([9u8; 32])
        );
        assert!(FleetHmacSigner::from_config_value(&b64).is_ok());
        assert!(FleetHmacSigner::from_config_value("base64:###").is_err());
    }
}
