//! Affine uniform quantization over plaintext slots
//!
//! Each sparse tensor's kept values are encoded as unsigned integers of
//! 2/4/8 bits with per-tensor affine metadata:
//!
//! ```text
//! scale      = (max − min) / (2^bits − 1)
//! zero_point = round(−min / scale)
//! value      ≈ (q − zero_point) · scale
//! ```
//!
//! Quantization is linear, which is what lets the aggregator fold worker
//! weights into `scale` and sum zero-points alongside the homomorphic sum.
//! Quality is checked empirically: if the reconstruction MSE exceeds the
//! envelope's `max_quality_mse` the round refuses with a quality error
//! rather than shipping a degraded update.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum QuantizeError {
    #[error("bit width {bits} unsupported (must be 2, 4, or 8)")]
    InvalidBits { bits: u8 },
    #[error("quantization quality loss: mse {mse:.6} exceeds limit {max:.6}")]
    QualityLoss { mse: f64, max: f64 },
}

impl Classify for QuantizeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Per-tensor quantization metadata. Travels in the manifest and is required
/// for dequantization on the aggregator side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantMeta {
    pub scale: f64,
    pub zero_point: u32,
    pub bits: u8,
}

/// Quantized values plus their metadata. Values are stored widened to `u16`
/// (the plaintext slot width); each is `< 2^bits`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedTensor {
    pub meta: QuantMeta,
    pub q: Vec<u16>,
}

#[inline]
fn max_level(bits: u8) -> u32 {
    (1u32 << bits) - 1
}

fn check_bits(bits: u8) -> Result<(), QuantizeError> {
    match bits {
        2 | 4 | 8 => Ok(()),
        _ => Err(QuantizeError::InvalidBits { bits }),
    }
}

/// Quantize `values` at the given width, deriving scale and zero-point from
/// the tensor's own min/max.
pub fn quantize(values: &[f32], bits: u8) -> Result<QuantizedTensor, QuantizeError> {
    check_bits(bits)?;
    let levels = max_level(bits);

    let (min, max) = values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(f64::from(v)), hi.max(f64::from(v)))
    });
    let (min, max) = if values.is_empty() { (0.0, 0.0) } else { (min, max) };

    let range = max - min;
    // Degenerate constant tensor: pick a scale that still represents the
    // constant exactly ((q − zp)·scale = c).
    let scale = if range > 0.0 {
        range / f64::from(levels)
    } else if min == 0.0 {
        1.0
    } else {
        min.abs()
    };
    let zero_point = (-min / scale).round().clamp(0.0, f64::from(levels)) as u32;

    let meta = QuantMeta { scale, zero_point, bits };
    Ok(QuantizedTensor { q: quantize_with_meta(values, &meta), meta })
}

/// Quantize against **existing** metadata. Re-applying to already-quantized
/// values with identical metadata is a no-op on the codes.
pub fn quantize_with_meta(values: &[f32], meta: &QuantMeta) -> Vec<u16> {
    let levels = f64::from(max_level(meta.bits));
    values
        .iter()
        .map(|&v| {
            let q = (f64::from(v) / meta.scale + f64::from(meta.zero_point)).round();
            q.clamp(0.0, levels) as u16
        })
        .collect()
}

/// Reconstruct a single value from its code.
#[inline]
pub fn reconstruct(q: u16, meta: &QuantMeta) -> f32 {
    ((f64::from(q) - f64::from(meta.zero_point)) * meta.scale) as f32
}

/// Dequantize a code vector.
pub fn dequantize(q: &[u16], meta: &QuantMeta) -> Vec<f32> {
    q.iter().map(|&qi| reconstruct(qi, meta)).collect()
}

/// Mean squared reconstruction error of `qt` against the original values.
pub fn reconstruction_mse(values: &[f32], qt: &QuantizedTensor) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values
        .iter()
        .zip(&qt.q)
        .map(|(&v, &q)| {
            let d = f64::from(v) - f64::from(reconstruct(q, &qt.meta));
            d * d
        })
        .sum::<f64>()
        / values.len() as f64
}

/// Quantize and enforce the envelope's quality bound in one step.
pub fn quantize_checked(
    values: &[f32],
    bits: u8,
    max_quality_mse: f64,
) -> Result<QuantizedTensor, QuantizeError> {
    let qt = quantize(values, bits)?;
    let mse = reconstruction_mse(values, &qt);
    if mse > max_quality_mse {
        return Err(QuantizeError::QualityLoss { mse, max: max_quality_mse });
    }
    Ok(qt)
}

/// Deployment-fixed symmetric grid over `[−range, range]`.
///
/// Every worker quantizing against the same grid is what keeps the
/// aggregator's inverse exact: summed codes share one scale and one
/// zero-point, so the weighted recovery divides back out without
/// cross-grid error.
pub fn symmetric_meta(range: f64, bits: u8) -> Result<QuantMeta, QuantizeError> {
    check_bits(bits)?;
    let levels = max_level(bits);
    Ok(QuantMeta {
        scale: 2.0 * range / f64::from(levels),
        zero_point: (levels + 1) / 2,
        bits,
    })
}

/// Quantize against fixed metadata and enforce the quality bound.
pub fn quantize_with_meta_checked(
    values: &[f32],
    meta: &QuantMeta,
    max_quality_mse: f64,
) -> Result<QuantizedTensor, QuantizeError> {
    let qt = QuantizedTensor { q: quantize_with_meta(values, meta), meta: meta.clone() };
    let mse = reconstruction_mse(values, &qt);
    if mse > max_quality_mse {
        return Err(QuantizeError::QualityLoss { mse, max: max_quality_mse });
    }
    Ok(qt)
}

// ============================================================================
// Tests
// ============================================================================
