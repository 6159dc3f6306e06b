//! Operating envelope — immutable deployment limits
//!
//! Every knob the pipeline consults is an explicitly enumerated field here,
//! validated **once** at startup. There is no free-form configuration map:
//! an unknown option is a compile error at the call site, and an
//! out-of-range value is a startup error naming the offending field.
//!
//! The envelope may be reloaded (producing a fresh shared handle) but is
//! never mutated in place; an active round keeps the handle it started with.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::cipher::SecurityLevel;
use crate::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope field `{field}` invalid: {reason}")]
    Field { field: &'static str, reason: String },
    #[error("environment key `{key}` invalid: {reason}")]
    Env { key: &'static str, reason: String },
    #[error("SFUP_MASTER_SECRET is required when SFUP_ENVIRONMENT=production")]
    MissingMasterSecret,
}

impl Classify for EnvelopeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Immutable per-deployment operating limits. See each field's check in
/// [`OperatingEnvelope::validate`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatingEnvelope {
    /// L2 clipping bound applied to every combined gradient.
    pub clip_norm: f64,
    /// Rand-K keep ratio ρ ∈ (0, 1].
    pub sparsity_ratio: f64,
    /// Quantization width (2, 4, or 8).
    pub bits: u8,
    /// Skellam noise parameter μ ∈ [1, 10].
    pub mu: f64,
    /// Lifetime ε cap per worker.
    pub epsilon_cap: f64,
    /// δ of the (ε, δ) guarantee.
    pub delta: f64,
    /// Refuse submissions once the cap would be exceeded.
    pub hard_stop: bool,
    /// Minimum valid packages to commit a round.
    pub quorum_threshold: usize,
    /// MAD outlier multiplier k.
    pub mad_k: f64,
    /// Serialized package ceiling.
    pub max_update_size_kb: usize,
    /// Minimum seconds between rounds.
    pub min_round_interval_seconds: u64,
    /// Maximum seconds between rounds; doubles as the aggregator's
    /// collection deadline.
    pub max_round_interval_seconds: u64,
    /// Evaluation-gate ceiling on the aggregated delta norm.
    pub max_delta_norm: f64,
    /// Evaluation-gate ceiling on the KL proxy vs the previous delta.
    pub max_kl: f64,
    /// Experts below this gate weight are dropped.
    pub gate_threshold: f64,
    /// Quantization reconstruction-MSE ceiling.
    pub max_quality_mse: f64,
    /// Lattice security preset (128 or 192 bits).
    pub security_bits: u16,
}

impl Default for OperatingEnvelope {
    fn default() -> Self {
        Self {
            clip_norm: 1.0,
            sparsity_ratio: 0.01,
            bits: 8,
            mu: 3.19,
            epsilon_cap: 8.0,
            delta: 1e-5,
            hard_stop: true,
            quorum_threshold: 3,
            mad_k: 3.0,
            max_update_size_kb: 4096,
            min_round_interval_seconds: 10,
            max_round_interval_seconds: 600,
            max_delta_norm: 10.0,
            max_kl: 1.0,
            gate_threshold: 0.15,
            max_quality_mse: 0.05,
            security_bits: 128,
        }
    }
}

impl OperatingEnvelope {
    /// Validate every field; the first violation is returned with its name.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        fn bad(field: &'static str, reason: impl Into<String>) -> EnvelopeError {
            EnvelopeError::Field { field, reason: reason.into() }
        }
        if !(self.clip_norm > 0.0 && self.clip_norm.is_finite()) {
            return Err(bad("clip_norm", "must be a positive finite number"));
        }
        if !(self.sparsity_ratio > 0.0 && self.sparsity_ratio <= 1.0) {
            return Err(bad("sparsity_ratio", "must be in (0, 1]"));
        }
        if !matches!(self.bits, 2 | 4 | 8) {
            return Err(bad("bits", "must be 2, 4, or 8"));
        }
        if !(1.0..=10.0).contains(&self.mu) {
            return Err(bad("mu", "must be in [1.0, 10.0]"));
        }
        if !(self.epsilon_cap > 0.0 && self.epsilon_cap.is_finite()) {
            return Err(bad("epsilon_cap", "must be a positive finite number"));
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(bad("delta", "must be in (0, 1)"));
        }
        if self.quorum_threshold == 0 {
            return Err(bad("quorum_threshold", "must be at least 1"));
        }
        if !(self.mad_k > 0.0) {
            return Err(bad("mad_k", "must be positive"));
        }
        if self.max_update_size_kb == 0 {
            return Err(bad("max_update_size_kb", "must be at least 1"));
        }
        if self.min_round_interval_seconds > self.max_round_interval_seconds {
            return Err(bad("min_round_interval_seconds", "must not exceed the maximum interval"));
        }
        if !(self.max_delta_norm > 0.0) {
            return Err(bad("max_delta_norm", "must be positive"));
        }
        if !(self.max_kl > 0.0) {
            return Err(bad("max_kl", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.gate_threshold) {
            return Err(bad("gate_threshold", "must be in [0, 1]"));
        }
        if !(self.max_quality_mse > 0.0) {
            return Err(bad("max_quality_mse", "must be positive"));
        }
        if SecurityLevel::from_bits(self.security_bits).is_none() {
            return Err(bad("security_bits", "must be 128 or 192"));
        }
        Ok(())
    }

    /// Cipher preset for this deployment.
    pub fn security_level(&self) -> SecurityLevel {
        // validate() guarantees the bits are a known preset.
        SecurityLevel::from_bits(self.security_bits).unwrap_or(SecurityLevel::Bits128)
    }

    /// Validate and freeze into the shared handle rounds hold onto.
    pub fn into_shared(self) -> Result<Arc<Self>, EnvelopeError> {
        self.validate()?;
        Ok(Arc::new(self))
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Deployment mode from `SFUP_ENVIRONMENT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Production,
    Development,
}

/// Process-level configuration read from the recognized `SFUP_*` keys.
#[derive(Clone, Debug)]
pub struct Environment {
    pub mode: Mode,
    /// Key-store master secret; mandatory in production.
    pub master_secret: Option<Vec<u8>>,
    pub evidence_dir: PathBuf,
    pub max_concurrent_rounds: usize,
}

impl Environment {
    /// Read the recognized environment keys. Unrecognized keys are ignored;
    /// recognized-but-malformed values are startup errors.
    pub fn from_env() -> Result<Self, EnvelopeError> {
        let mode = match std::env::var("SFUP_ENVIRONMENT").ok().as_deref() {
            None | Some("development") => Mode::Development,
            Some("production") => Mode::Production,
            Some(other) => {
                return Err(EnvelopeError::Env {
                    key: "SFUP_ENVIRONMENT",
                    reason: format!("expected `production` or `development`, got `{other}`"),
                })
            }
        };

        let master_secret = match std::env::var("SFUP_MASTER_SECRET") {
            Ok(raw) => Some(decode_secret(&raw)?),
            Err(_) => None,
        };
        if mode == Mode::Production && master_secret.is_none() {
            return Err(EnvelopeError::MissingMasterSecret);
        }

        let evidence_dir = std::env::var("SFUP_EVIDENCE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("evidence"));

        let max_concurrent_rounds = match std::env::var("SFUP_MAX_CONCURRENT_ROUNDS") {
            Ok(raw) => raw.parse::<usize>().map_err(|e| EnvelopeError::Env {
                key: "SFUP_MAX_CONCURRENT_ROUNDS",
                reason: e.to_string(),
            })?,
            Err(_) => 1,
        };

        Ok(Self { mode, master_secret, evidence_dir, max_concurrent_rounds })
    }
}

/// Secrets may be supplied raw or as `base64:`-prefixed material.
fn decode_secret(raw: &str) -> Result<Vec<u8>, EnvelopeError> {
    if let Some(encoded) = raw.strip_prefix("base64:") {
        base64::engine::general_purpose::STANDARD.decode(encoded).map_err(|e| {
            EnvelopeError::Env { key: "SFUP_MASTER_SECRET", reason: format!("bad base64: {e}") }
        })
    } else {
        Ok(raw.as_bytes().to_vec())
    }
}

// ============================================================================
// Tests
// ============================================================================
