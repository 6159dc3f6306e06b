//! Crate root: public surface, core identifiers, and pipeline-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the identifier newtypes, the shared error-kind
//! taxonomy, and re-exports the submodules that implement the federated
//! update pipeline.
//!
//! ## Invariants (pipeline-wide)
//!
//! - **Randomness.** Every random draw comes from a [`csprng::SeedContext`]
//!   substream or a public Rand-K substream; there is no global generator and
//!   no non-cryptographic RNG in the crate. Determinism for a fixed seed is a
//!   tested property, not an accident.
//! - **Homomorphic recovery.** Ciphertext addition is exactly associative and
//!   commutative mod q = 2³². `Dec(Σ cᵢ) = Σ mᵢ (mod t)` holds whenever the
//!   accumulated addition count stays within the published noise budget; the
//!   budget is enforced, never assumed.
//! - **Privacy discipline.** Clipping bounds sensitivity, Skellam noise is
//!   injected inside the ciphertext, and the DP accountant refuses work
//!   **before** any I/O once the ε cap would be exceeded.
//! - **Evidence.** Every state transition at the worker and the aggregator
//!   appends to a hash-chained log; appends are durable before they return.
//!
//! If any invariant is violated at runtime, the failure mode is a **precise
//! error** (never UB, never silent corruption).

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

use serde::{Deserialize, Serialize};

/// DP accountant: per-round ε derivation and the hard-stop budget.
pub mod accountant;
/// Aggregator: round state machine, quorum, MAD filter, homomorphic sum.
pub mod aggregator;
/// Ergonomic builders and one-shot helpers over the core modules.
pub mod api;
/// N2HE cipher: additively homomorphic LWE encryption with Skellam noise.
pub mod cipher;
/// Seeded CSPRNG with domain-separated substream derivation.
pub mod csprng;
/// Operating envelope (immutable deployment limits) and environment config.
pub mod envelope;
/// Hash-chained append-only evidence log with durable persistence.
pub mod evidence;
/// Post-aggregation evaluation gate (pure threshold checks).
pub mod gate;
/// Key provider capability interface and local back-ends.
pub mod keystore;
/// Update package: versioned binary envelope, seal/parse/verify.
pub mod package;
/// Worker-side per-round gradient pipeline.
pub mod pipeline;
/// Affine uniform quantizer and plaintext slot packing.
pub mod quantize;
/// Fleet signature capability (HMAC-SHA256 in-crate implementation).
pub mod signer;
/// Rand-K sparsifier and error-feedback memory.
pub mod sparsify;
/// Gradient tensor sets, parameter schema, gating, clipping.
pub mod tensor;

// ============================================================================
// Canonical identifiers
// ============================================================================

/// A 256-bit digest as produced by the hashing stack.
pub type Digest32 = [u8; 32];

/// Stable worker identity. Unique within a fleet; travels in package headers
/// and evidence events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Byte view for substream derivation and hashing.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Training round number. Rounds are processed strictly in order per key.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Round(pub u64);

impl Round {
    /// Big-endian encoding used in substream derivation.
    #[inline]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// The following round.
    #[inline]
    pub fn next(self) -> Round {
        Round(self.0 + 1)
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable key identifier issued by the key provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    /// Byte view for substream derivation and hashing.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Error-kind taxonomy and embedded exit codes
// ============================================================================

/// The seven error concepts every concrete error maps onto.
///
/// The mapping drives evidence recording and the exit codes used when the
/// library is embedded under a process wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed package, missing manifest field, size over envelope.
    Validation,
    /// Decryption/signature/hash failure, noise budget overrun.
    Crypto,
    /// DP ε budget exhausted (worker-fatal for the session).
    Budget,
    /// Not enough valid packages by deadline (round-fatal).
    Quorum,
    /// Evidence chain mismatch (operator-fatal, fail-closed).
    Integrity,
    /// Backpressure, disk full, other retryable resource pressure.
    Resource,
    /// Missing production secret, malformed envelope (startup-fatal).
    Config,
}

impl ErrorKind {
    /// Process exit code when embedded: 0 success, 1 validation, 2 crypto,
    /// 3 budget, 4 quorum, 5 I/O. Integrity failures surface as crypto (2),
    /// configuration failures as validation (1).
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Validation | ErrorKind::Config => 1,
            ErrorKind::Crypto | ErrorKind::Integrity => 2,
            ErrorKind::Budget => 3,
            ErrorKind::Quorum => 4,
            ErrorKind::Resource => 5,
        }
    }

    /// Stable lowercase label used in evidence events and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Budget => "budget",
            ErrorKind::Quorum => "quorum",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Resource => "resource",
            ErrorKind::Config => "config",
        }
    }
}

/// Implemented by every module error so callers can classify failures
/// without matching concrete variants.
pub trait Classify {
    /// The concept kind this error maps onto.
    fn kind(&self) -> ErrorKind;
}

// ============================================================================
// Root-level re-exports (centralization)
// ============================================================================

pub use crate::accountant::DpAccountant;
pub use crate::aggregator::{AggregationWeights, Aggregator, RoundOutcome, RoundState};
pub use crate::cipher::{CipherParams, Ciphertext, N2heCipher, SecurityLevel};
pub use crate::csprng::{SeedContext, StreamTag};
pub use crate::envelope::{Environment, OperatingEnvelope};
pub use crate::evidence::{EventType, EvidenceLog};
pub use crate::gate::{GateDecision, GateThresholds};
pub use crate::keystore::{KeyProvider, KeyState, LocalFileProvider, MemoryProvider};
pub use crate::package::UpdatePackage;
pub use crate::pipeline::GradientPipeline;
pub use crate::tensor::{ParameterSchema, TensorSet};
