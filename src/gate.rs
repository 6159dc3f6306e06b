//! Post-aggregation evaluation gate
//!
//! A pure decision: `(current metrics, reference metrics, thresholds) →
//! (passed, failures)`. The gate owns no state and performs no I/O; the
//! aggregator records the decision in evidence and fails the round on a
//! negative outcome.
//!
//! Recognized thresholds are exactly the four fields of
//! [`GateThresholds`]; anything else a deployment wants gated belongs in a
//! new named field, not a side channel.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::tensor::TensorSet;

/// Explicit gate configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GateThresholds {
    pub min_success_rate: f64,
    pub max_kl_divergence: f64,
    pub max_delta_norm: f64,
    pub require_monotone_loss: bool,
}

/// Metrics observed for one aggregated round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GateMetrics {
    pub success_rate: f64,
    pub kl_divergence: f64,
    pub delta_norm: f64,
    pub loss: f64,
}

/// One threshold violation, with the observed and allowed values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GateFailure {
    SuccessRateBelowMinimum { observed: f64, minimum: f64 },
    KlDivergenceAboveMaximum { observed: f64, maximum: f64 },
    DeltaNormAboveMaximum { observed: f64, maximum: f64 },
    LossNotMonotone { observed: f64, reference: f64 },
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateFailure::SuccessRateBelowMinimum { observed, minimum } => {
                write!(f, "success rate {observed:.4} below minimum {minimum:.4}")
            }
            GateFailure::KlDivergenceAboveMaximum { observed, maximum } => {
                write!(f, "kl divergence {observed:.4} above maximum {maximum:.4}")
            }
            GateFailure::DeltaNormAboveMaximum { observed, maximum } => {
                write!(f, "delta norm {observed:.4} above maximum {maximum:.4}")
            }
            GateFailure::LossNotMonotone { observed, reference } => {
                write!(f, "loss {observed:.4} regressed past reference {reference:.4}")
            }
        }
    }
}

/// The gate's verdict. `failures` preserves check order:
/// success rate, KL, delta norm, monotone loss.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub passed: bool,
    pub failures: Vec<GateFailure>,
}

/// Evaluate the gate. `reference` is the previous accepted round's metrics;
/// the monotone-loss check is skipped when there is none.
pub fn evaluate(
    current: &GateMetrics,
    reference: Option<&GateMetrics>,
    thresholds: &GateThresholds,
) -> GateDecision {
    let mut failures = Vec::new();

    if current.success_rate < thresholds.min_success_rate {
        failures.push(GateFailure::SuccessRateBelowMinimum {
            observed: current.success_rate,
            minimum: thresholds.min_success_rate,
        });
    }
    if current.kl_divergence > thresholds.max_kl_divergence {
        failures.push(GateFailure::KlDivergenceAboveMaximum {
            observed: current.kl_divergence,
            maximum: thresholds.max_kl_divergence,
        });
    }
    if current.delta_norm > thresholds.max_delta_norm {
        failures.push(GateFailure::DeltaNormAboveMaximum {
            observed: current.delta_norm,
            maximum: thresholds.max_delta_norm,
        });
    }
    if thresholds.require_monotone_loss {
        if let Some(reference) = reference {
            if current.loss > reference.loss {
                failures.push(GateFailure::LossNotMonotone {
                    observed: current.loss,
                    reference: reference.loss,
                });
            }
        }
    }

    GateDecision { passed: failures.is_empty(), failures }
}

/// KL-divergence proxy between two deltas: each delta's per-element squared
/// mass is normalized into a distribution and compared with smoothing. A
/// first round (no previous delta) scores 0.
pub fn kl_proxy(current: &TensorSet, previous: Option<&TensorSet>) -> f64 {
    const SMOOTH: f64 = 1e-9;
    let previous = match previous {
        Some(p) => p,
        None => return 0.0,
    };

    let mass = |set: &TensorSet| -> Vec<f64> {
        set.iter().flat_map(|(_, v)| v.iter().map(|&x| f64::from(x) * f64::from(x))).collect()
    };
    let p_raw = mass(current);
    let q_raw = mass(previous);
    if p_raw.len() != q_raw.len() || p_raw.is_empty() {
        // Shape drift between rounds is itself maximal divergence territory;
        // report a large finite value the gate can threshold on.
        return f64::MAX.sqrt();
    }

    let p_sum: f64 = p_raw.iter().sum::<f64>() + SMOOTH * p_raw.len() as f64;
    let q_sum: f64 = q_raw.iter().sum::<f64>() + SMOOTH * q_raw.len() as f64;
    p_raw
        .iter()
        .zip(&q_raw)
        .map(|(&p, &q)| {
            let p = (p + SMOOTH) / p_sum;
            let q = (q + SMOOTH) / q_sum;
            p * (p / q).ln()
        })
        .sum()
}

// ============================================================================
// Tests
// ============================================================================
