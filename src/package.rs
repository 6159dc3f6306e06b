//! Update package — versioned binary envelope (wire format v2)
//!
//! Byte-exact layout, all integers big-endian:
//!
//! ```text
//! offset  size  field
//! 0       6     magic = "TGUE\x02\x00"
//! 6       1     format_version (u8, currently 2)
//! 7       4     header_len (u32)
//! 11      H     header JSON  (key_id, round, sig_alg, timestamp_ms, worker_id)
//! 11+H    4     manifest_len (u32)
//! ...     M     manifest JSON (compression_meta, expert_weights, safety_stats, training_meta)
//! ...     8     payload_len (u64)
//! ...     P     ciphertext payload: per slot (A: [u32; n_lwe], b: u32)
//! ...     32    content_hash = SHA-256(bytes[0 .. payload_end])
//! ...     2     sig_len (u16)
//! ...     S     signature over content_hash (opaque)
//! ```
//!
//! ## Determinism
//! JSON serialization is canonical: struct fields are declared in key-sorted
//! order, every map is a `BTreeMap`, output is compact. Sealing identical
//! inputs therefore yields identical bytes, and `parse ∘ to_bytes` is the
//! identity on well-formed packages — a tested law, required for the content
//! hash to be reproducible on the receiving side.
//!
//! ## Verification order on receive
//! (i) magic and version, (ii) JSON parse, (iii) content hash, (iv)
//! signature, (v) key lookup and activation (aggregator), (vi) envelope size
//! limits (aggregator). Steps i–ii live in [`UpdatePackage::parse`], iii–iv
//! in [`UpdatePackage::verify`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cipher::Ciphertext;
use crate::signer::{PackageSigner, PackageVerifier, SignerError};
use crate::{Classify, Digest32, ErrorKind, KeyId, Round, WorkerId};

/// Envelope magic: format name plus the two reserved bytes.
pub const MAGIC: [u8; 6] = *b"TGUE\x02\x00";

/// Current envelope version.
pub const FORMAT_VERSION: u8 = 2;

/// Errors surfaced while sealing, parsing, or verifying a package.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// The leading magic bytes are wrong.
    #[error("bad package magic")]
    BadMagic,
    /// The envelope version is not supported.
    #[error("unsupported package version {got} (expected {FORMAT_VERSION})")]
    UnsupportedVersion {
        /// Version byte found on the wire.
        got: u8,
    },
    /// The byte stream ended before the structure did.
    #[error("truncated package while reading {section}")]
    Truncated {
        /// Which section ran out of bytes.
        section: &'static str,
    },
    /// Bytes remained after the signature.
    #[error("trailing bytes after package end")]
    TrailingBytes,
    /// The header JSON does not parse or misses required keys.
    #[error("header JSON invalid: {0}")]
    HeaderJson(String),
    /// The manifest JSON does not parse or misses required keys.
    #[error("manifest JSON invalid: {0}")]
    ManifestJson(String),
    /// The payload length is inconsistent with the manifest slot count.
    #[error("payload shape invalid: {reason}")]
    PayloadShape {
        /// What failed to line up.
        reason: String,
    },
    /// The stored content hash does not match the recomputed one.
    #[error("content hash mismatch")]
    HashMismatch,
    /// Signature failure from the verifier capability.
    #[error(transparent)]
    Signature(#[from] SignerError),
    /// Serialized size exceeds the operating envelope.
    #[error("package size {bytes} bytes exceeds limit {max_bytes} bytes")]
    TooLarge {
        /// Serialized size observed.
        bytes: usize,
        /// Envelope ceiling.
        max_bytes: usize,
    },
}

impl Classify for PackageError {
    fn kind(&self) -> ErrorKind {
        match self {
            PackageError::HashMismatch | PackageError::Signature(_) => ErrorKind::Crypto,
            _ => ErrorKind::Validation,
        }
    }
}

// ============================================================================
// JSON sections (field order == key-sorted order; keep it that way)
// ============================================================================

/// Envelope header. Bound into the content hash before anything else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PackageHeader {
    /// Encryption key this payload references.
    pub key_id: KeyId,
    /// Training round.
    pub round: Round,
    /// Signature algorithm label (see [`crate::signer`]).
    pub sig_alg: String,
    /// Seal time, milliseconds since epoch.
    pub timestamp_ms: i64,
    /// Submitting worker.
    pub worker_id: WorkerId,
}

/// Per-parameter compression metadata. `indices` carries the Rand-K index
/// set explicitly; `substream_tag` is the hex of its public derivation so
/// the aggregator can recompute and cross-check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionEntry {
    /// Quantization width (2, 4, or 8).
    pub bits: u8,
    /// Kept coordinate indices, ascending.
    pub indices: Vec<u32>,
    /// Dense length of the parameter vector.
    pub n_elements: u32,
    /// Number of ciphertext slots (= kept coordinates).
    pub n_slots: u32,
    /// Affine scale.
    pub scale: f64,
    /// Hex of the 32-byte public Rand-K substream seed.
    pub substream_tag: String,
    /// Affine zero point.
    pub zero_point: u32,
}

/// Safety statistics the aggregator filters on without touching ciphertext.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyStats {
    /// Clip factor actually applied (1.0 = no clipping).
    pub clip_norm_applied: f64,
    /// Cumulative ε after this package.
    pub dp_epsilon_consumed: f64,
    /// Pre-clip gradient L2 norm (MAD filter input).
    pub gradient_l2_pre_clip: f64,
    /// Serialized dense gradient size before compression.
    pub payload_bytes_precompression: u64,
    /// Rand-K keep ratio used this round.
    pub sparsity_ratio: f64,
}

/// Optimizer bookkeeping carried for the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingMeta {
    /// Learning rate at seal time.
    pub learning_rate: f64,
    /// Objective label.
    pub objective: String,
    /// Optimizer label.
    pub optimizer: String,
    /// Local step count.
    pub steps: u64,
}

/// The manifest: everything the aggregator needs besides the ciphertexts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Parameter name → compression metadata, key-sorted. Slot assignment is
    /// positional: parameters in this order, `n_slots` slots each.
    pub compression_meta: BTreeMap<String, CompressionEntry>,
    /// Surviving expert gate weights.
    pub expert_weights: BTreeMap<String, f32>,
    /// DP and robustness statistics.
    pub safety_stats: SafetyStats,
    /// Optimizer bookkeeping.
    pub training_meta: TrainingMeta,
}

impl Manifest {
    /// Total ciphertext slot count (sum of per-parameter `n_slots`).
    pub fn total_slots(&self) -> u64 {
        self.compression_meta.values().map(|e| u64::from(e.n_slots)).sum()
    }
}

// ============================================================================
// Package
// ============================================================================

/// A parsed (or freshly sealed) update package.
#[derive(Clone, Debug)]
pub struct UpdatePackage {
    /// Envelope header.
    pub header: PackageHeader,
    /// Manifest JSON content.
    pub manifest: Manifest,
    /// One ciphertext per plaintext slot, in manifest order.
    pub payload: Vec<Ciphertext>,
    /// SHA-256 over every byte preceding it.
    pub content_hash: Digest32,
    /// Opaque signature over the content hash.
    pub signature: Vec<u8>,
}

fn header_json(header: &PackageHeader) -> Result<Vec<u8>, PackageError> {
    serde_json::to_vec(header).map_err(|e| PackageError::HeaderJson(e.to_string()))
}

fn manifest_json(manifest: &Manifest) -> Result<Vec<u8>, PackageError> {
    serde_json::to_vec(manifest).map_err(|e| PackageError::ManifestJson(e.to_string()))
}

/// Serialize everything up to and including the payload (the hashed prefix).
fn prefix_bytes(
    header: &PackageHeader,
    manifest: &Manifest,
    payload: &[Ciphertext],
) -> Result<Vec<u8>, PackageError> {
    let header_bytes = header_json(header)?;
    let manifest_bytes = manifest_json(manifest)?;
    let payload_len: u64 =
        payload.iter().map(|ct| (ct.a.len() as u64 + 1) * 4).sum();

    let mut out = Vec::with_capacity(
        MAGIC.len() + 1 + 4 + header_bytes.len() + 4 + manifest_bytes.len() + 8
            + payload_len as usize,
    );
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&(manifest_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&manifest_bytes);
    out.extend_from_slice(&payload_len.to_be_bytes());
    for ct in payload {
        for &word in &ct.a {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&ct.b.to_be_bytes());
    }
    Ok(out)
}

fn sha256(bytes: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Cursor-style reader over the wire bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, section: &'static str) -> Result<&'a [u8], PackageError> {
        if self.pos + n > self.bytes.len() {
            return Err(PackageError::Truncated { section });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, section: &'static str) -> Result<u8, PackageError> {
        Ok(self.take(1, section)?[0])
    }

    fn u16(&mut self, section: &'static str) -> Result<u16, PackageError> {
        let b = self.take(2, section)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, section: &'static str) -> Result<u32, PackageError> {
        let b = self.take(4, section)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, section: &'static str) -> Result<u64, PackageError> {
        let b = self.take(8, section)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

impl UpdatePackage {
    /// Seal a package: serialize the prefix, hash it, sign the hash.
    pub fn seal(
        header: PackageHeader,
        manifest: Manifest,
        payload: Vec<Ciphertext>,
        signer: &dyn PackageSigner,
    ) -> Result<Self, PackageError> {
        debug_assert_eq!(header.sig_alg, signer.algorithm(), "header must carry the signer's label");
        let prefix = prefix_bytes(&header, &manifest, &payload)?;
        let content_hash = sha256(&prefix);
        let signature = signer.sign(&content_hash);
        Ok(Self { header, manifest, payload, content_hash, signature })
    }

    /// Serialize the full envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PackageError> {
        let mut out = prefix_bytes(&self.header, &self.manifest, &self.payload)?;
        out.extend_from_slice(&self.content_hash);
        out.extend_from_slice(&(self.signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
        Ok(out)
    }

    /// Parse the wire bytes: magic, version, JSON sections, payload shape.
    /// Cryptographic checks are a separate step ([`UpdatePackage::verify`]).
    pub fn parse(bytes: &[u8]) -> Result<Self, PackageError> {
        let mut r = Reader { bytes, pos: 0 };

        if r.take(MAGIC.len(), "magic")? != MAGIC {
            return Err(PackageError::BadMagic);
        }
        let version = r.u8("format_version")?;
        if version != FORMAT_VERSION {
            return Err(PackageError::UnsupportedVersion { got: version });
        }

        let header_len = r.u32("header_len")? as usize;
        let header: PackageHeader = serde_json::from_slice(r.take(header_len, "header")?)
            .map_err(|e| PackageError::HeaderJson(e.to_string()))?;

        let manifest_len = r.u32("manifest_len")? as usize;
        let manifest: Manifest = serde_json::from_slice(r.take(manifest_len, "manifest")?)
            .map_err(|e| PackageError::ManifestJson(e.to_string()))?;

        let payload_len = r.u64("payload_len")?;
        let slot_count = manifest.total_slots();
        let payload = if slot_count == 0 {
            if payload_len != 0 {
                return Err(PackageError::PayloadShape {
                    reason: format!("manifest declares 0 slots but payload is {payload_len} bytes"),
                });
            }
            Vec::new()
        } else {
            if payload_len % (4 * slot_count) != 0 {
                return Err(PackageError::PayloadShape {
                    reason: format!(
                        "payload length {payload_len} not divisible across {slot_count} slots"
                    ),
                });
            }
            let words_per_slot = payload_len / (4 * slot_count);
            if words_per_slot < 2 {
                return Err(PackageError::PayloadShape {
                    reason: "ciphertext slots must carry at least one A word and b".into(),
                });
            }
            let n_lwe = (words_per_slot - 1) as usize;
            let mut payload = Vec::with_capacity(slot_count as usize);
            for _ in 0..slot_count {
                let mut a = Vec::with_capacity(n_lwe);
                for _ in 0..n_lwe {
                    a.push(r.u32("payload")?);
                }
                let b = r.u32("payload")?;
                payload.push(Ciphertext::from_wire(a, b));
            }
            payload
        };

        let content_hash: Digest32 = r
            .take(32, "content_hash")?
            .try_into()
            .map_err(|_| PackageError::Truncated { section: "content_hash" })?;
        let sig_len = r.u16("sig_len")? as usize;
        let signature = r.take(sig_len, "signature")?.to_vec();

        if r.pos != bytes.len() {
            return Err(PackageError::TrailingBytes);
        }

        Ok(Self { header, manifest, payload, content_hash, signature })
    }

    /// Recompute the content hash and verify the signature (receive steps
    /// iii–iv).
    pub fn verify(&self, verifier: &dyn PackageVerifier) -> Result<(), PackageError> {
        let prefix = prefix_bytes(&self.header, &self.manifest, &self.payload)?;
        if sha256(&prefix) != self.content_hash {
            return Err(PackageError::HashMismatch);
        }
        if self.header.sig_alg != verifier.algorithm() {
            return Err(PackageError::Signature(SignerError::AlgorithmMismatch {
                package: self.header.sig_alg.clone(),
                verifier: verifier.algorithm().to_string(),
            }));
        }
        verifier.verify(&self.content_hash, &self.signature)?;
        Ok(())
    }

    /// Receive step vi: enforce the envelope size ceiling on the serialized
    /// byte length.
    pub fn check_size(serialized_len: usize, max_update_size_kb: usize) -> Result<(), PackageError> {
        let max_bytes = max_update_size_kb * 1024;
        if serialized_len > max_bytes {
            return Err(PackageError::TooLarge { bytes: serialized_len, max_bytes });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
