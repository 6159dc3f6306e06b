//! DP accountant — cumulative privacy-loss tracking with a hard stop
//!
//! Each sealed package spends privacy. The per-round ε is derived from the
//! Skellam mechanism parameters via the Gaussian-equivalent analysis: a
//! Skellam(μ) draw has variance 2μ, so the mechanism behaves as a Gaussian
//! mechanism with σ = √(2μ) and
//!
//! ```text
//! ε_round = Δ₂ · √(2·ln(1.25/δ)) / σ,    Δ₂ = clip_norm · √ρ
//! ```
//!
//! where Δ₂ is the effective L2 sensitivity after clipping and Rand-K
//! sparsification (index selection is data-independent, so only the kept
//! mass contributes). Several tighter Skellam bounds exist; this closed form
//! is the one that stays valid across the whole μ ∈ [1, 10] envelope and is
//! deliberately conservative.
//!
//! The accountant is owned by the pipeline (it holds no pipeline
//! references) and refuses work **before any I/O** once the cap would be
//! exceeded: `can_submit` goes false, `record` fails, and the worker session
//! is HALTED.

#![forbid(unsafe_code)]

use crate::{Classify, ErrorKind};

/// Errors surfaced by the accountant.
#[derive(Debug, thiserror::Error)]
pub enum AccountantError {
    /// The ε cap would be exceeded; the worker session is halted.
    #[error(
        "privacy budget exhausted: consumed {consumed:.4} + requested {requested:.4} exceeds cap {cap:.4}; \
         this worker must stop submitting for the current deployment"
    )]
    BudgetExhausted {
        /// ε spent so far.
        consumed: f64,
        /// Deployment cap.
        cap: f64,
        /// The refused round's ε.
        requested: f64,
    },
}

impl Classify for AccountantError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Budget
    }
}

/// Per-round ε under the Gaussian-equivalent Skellam bound.
///
/// `delta` is the broken-with-probability slack of the (ε, δ) guarantee and
/// must be in (0, 1).
pub fn per_round_epsilon(clip_norm: f64, mu: f64, sparsity_ratio: f64, delta: f64) -> f64 {
    debug_assert!(delta > 0.0 && delta < 1.0, "δ must be in (0, 1)");
    let sensitivity = clip_norm * sparsity_ratio.sqrt();
    let sigma = (2.0 * mu).sqrt();
    sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / sigma
}

/// Cumulative ε tracker for one worker.
#[derive(Clone, Debug)]
pub struct DpAccountant {
    consumed: f64,
    cap: f64,
    delta: f64,
    hard_stop: bool,
    halted: bool,
}

impl DpAccountant {
    /// New accountant with nothing consumed.
    pub fn new(cap: f64, delta: f64, hard_stop: bool) -> Self {
        Self { consumed: 0.0, cap, delta, hard_stop, halted: false }
    }

    /// ε spent so far.
    #[inline]
    pub fn consumed(&self) -> f64 {
        self.consumed
    }

    /// ε headroom left under the cap.
    #[inline]
    pub fn remaining(&self) -> f64 {
        (self.cap - self.consumed).max(0.0)
    }

    /// The δ of the (ε, δ) guarantee.
    #[inline]
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Whether the hard stop has tripped.
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Would a round costing `eps_round` be admitted?
    pub fn can_submit(&self, eps_round: f64) -> bool {
        if self.halted {
            return false;
        }
        if !self.hard_stop {
            return true;
        }
        self.consumed + eps_round <= self.cap
    }

    /// Record a round's spend, or refuse and halt when the cap would be
    /// exceeded under hard stop.
    pub fn record(&mut self, eps_round: f64) -> Result<(), AccountantError> {
        if !self.can_submit(eps_round) {
            self.halted = true;
            tracing::warn!(
                consumed = self.consumed,
                cap = self.cap,
                requested = eps_round,
                "privacy hard stop tripped"
            );
            return Err(AccountantError::BudgetExhausted {
                consumed: self.consumed,
                cap: self.cap,
                requested: eps_round,
            });
        }
        self.consumed += eps_round;
        tracing::debug!(consumed = self.consumed, remaining = self.remaining(), "epsilon recorded");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
