//! Seeded CSPRNG with explicit substream derivation
//!
//! Every random draw in the pipeline — LWE secret keys, public matrix rows,
//! Skellam noise, Rand-K index sampling, key-wrap keystreams — comes from a
//! substream derived here. There is **no** global generator and no
//! non-cryptographic randomness anywhere in the crate.
//!
//! ## Derivation discipline
//! A substream is `ChaCha20Rng` seeded with
//! `BLAKE3-derive_key(tag_context, seed ∥ parts)`, where `parts` are
//! length-delimited before hashing. Consequences:
//! - **Deterministic.** Same seed + tag + parts ⇒ byte-identical stream. The
//!   aggregator exploits this to recompute a worker's Rand-K index sets from
//!   the announced substream key parts.
//! - **Independent.** Distinct tags use distinct KDF contexts, so streams
//!   share no state and cannot collide even for identical parts.
//! - **Unambiguous.** Length prefixes prevent `("ab","c")` and `("a","bc")`
//!   from deriving the same stream.
//!
//! Tag contexts are stable strings. Renaming one is a compatibility break
//! for every previously sealed package.

#![forbid(unsafe_code)]

use rand::RngCore;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Canonical substream tags. One per consumer; adding variants is
/// backward-compatible, reordering or renaming contexts is not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamTag {
    /// LWE secret-key sampling (keystore `generate`).
    SecretKey,
    /// LWE public matrix rows, keyed by (key_id, round, slot).
    LweMatrix,
    /// Skellam encryption noise, keyed by (key_id, round, slot).
    SkellamNoise,
    /// Rand-K index sampling, keyed by (worker_id, round, parameter).
    RandKIndices,
    /// Keystore at-rest wrap keystream, keyed by (store salt, key_id).
    MasterWrap,
}

impl StreamTag {
    /// Stable KDF context string for this tag.
    #[inline]
    pub fn context(self) -> &'static str {
        match self {
            StreamTag::SecretKey => "tensorguard.stream.v1.secret_key",
            StreamTag::LweMatrix => "tensorguard.stream.v1.lwe_matrix",
            StreamTag::SkellamNoise => "tensorguard.stream.v1.skellam_noise",
            StreamTag::RandKIndices => "tensorguard.stream.v1.randk_indices",
            StreamTag::MasterWrap => "tensorguard.stream.v1.master_wrap",
        }
    }
}

/// Process-level seed from which every substream derives.
///
/// Cloning is cheap and safe: clones derive identical substreams, which is
/// exactly the determinism the pipeline relies on.
#[derive(Clone)]
pub struct SeedContext {
    seed: [u8; 32],
}

impl std::fmt::Debug for SeedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print seed material.
        f.debug_struct("SeedContext").finish_non_exhaustive()
    }
}

impl SeedContext {
    /// Build from an explicit 32-byte seed (deployments, tests).
    pub fn new(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Build from OS entropy.
    pub fn from_entropy() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    /// Derive the 32-byte substream seed for `(tag, parts)`.
    ///
    /// Encoding fed to the KDF: `seed ∥ u64_be(len(p)) ∥ p` for each part.
    fn derive_seed(&self, tag: StreamTag, parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(tag.context());
        hasher.update(&self.seed);
        for p in parts {
            hasher.update(&(p.len() as u64).to_be_bytes());
            hasher.update(p);
        }
        *hasher.finalize().as_bytes()
    }

    /// Open the deterministic substream for `(tag, parts)`.
    pub fn substream(&self, tag: StreamTag, parts: &[&[u8]]) -> ChaCha20Rng {
        ChaCha20Rng::from_seed(self.derive_seed(tag, parts))
    }
}

// ============================================================================
// Public substreams (no private seed)
// ============================================================================

/// Derive a **public** substream seed: KDF over the parts only.
///
/// Used where the stream must be recomputable by a party that does not hold
/// the worker's seed — specifically Rand-K index sampling, whose announced
/// derivation lets the aggregator rebuild per-worker index sets. The draw is
/// data-independent, so publishing it leaks nothing about the gradients.
pub fn public_substream_seed(tag: StreamTag, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(tag.context());
    for p in parts {
        hasher.update(&(p.len() as u64).to_be_bytes());
        hasher.update(p);
    }
    *hasher.finalize().as_bytes()
}

/// Open the public substream for `(tag, parts)`. See [`public_substream_seed`].
pub fn public_substream(tag: StreamTag, parts: &[&[u8]]) -> ChaCha20Rng {
    ChaCha20Rng::from_seed(public_substream_seed(tag, parts))
}

// ============================================================================
// Discrete sampling helpers (Skellam = Poisson − Poisson)
// ============================================================================

/// Draw one Poisson(μ) variate by CDF inversion from `rng`.
///
/// A single uniform in [0,1) is inverted against the running CDF
/// `F(k) = Σ_{i≤k} e^{−μ} μ^i / i!`. For the envelope-permitted μ ∈ [1, 10]
/// the walk terminates after O(μ) terms with overwhelming probability; the
/// loop is additionally capped so a pathological uniform cannot spin.
pub fn sample_poisson(rng: &mut ChaCha20Rng, mu: f64) -> u64 {
    debug_assert!(mu > 0.0 && mu.is_finite(), "poisson rate must be positive");
    // 53-bit uniform in [0, 1).
    let u = (rng.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64);

    let mut k: u64 = 0;
    let mut p = (-mu).exp(); // P(X = 0)
    let mut cdf = p;
    // Cap: μ + 40σ is unreachable for any u representable above.
    let cap = (mu + 40.0 * mu.sqrt()).ceil() as u64 + 1;
    while u > cdf && k < cap {
        k += 1;
        p *= mu / k as f64;
        cdf += p;
    }
    k
}

/// Draw one Skellam(μ) variate: the difference of two independent
/// Poisson(μ) draws. Mean 0, variance 2μ.
pub fn sample_skellam(rng: &mut ChaCha20Rng, mu: f64) -> i64 {
    let a = sample_poisson(rng, mu) as i64;
    let b = sample_poisson(rng, mu) as i64;
    a - b
}

// ============================================================================
// Tests
// ============================================================================
