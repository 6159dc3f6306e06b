//! Gradient tensor sets, parameter schema, expert gating, and clipping
//!
//! Gradients are dense `f32` vectors keyed by parameter name. Shapes are
//! **fixed per deployment** and come from a [`ParameterSchema`] loaded at
//! init; they are never inferred per call, so a shape mismatch is always a
//! caller bug surfaced as [`TensorError::ShapeMismatch`].
//!
//! Expert-gated inputs are combined before clipping: experts under the gate
//! threshold are dropped, the survivors are weight-scaled and summed into a
//! single gradient set. Clipping then bounds the concatenated L2 norm, which
//! is the quantity the DP sensitivity analysis relies on.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Classify, ErrorKind};

/// Division guard used when computing the clip factor.
pub const EPS_DIV: f64 = 1e-12;

#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("parameter `{name}`: expected shape {expected}, got {got}")]
    ShapeMismatch { name: String, expected: usize, got: usize },
    #[error("parameter `{name}` is not in the deployment schema")]
    UnknownParameter { name: String },
    #[error("schema must declare at least one parameter")]
    EmptySchema,
}

impl Classify for TensorError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Fixed parameter shapes for a deployment. All fleet participants share one
/// schema; the aggregator uses it to size reconstruction buffers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    shapes: BTreeMap<String, usize>,
}

impl ParameterSchema {
    pub fn new(shapes: impl IntoIterator<Item = (String, usize)>) -> Result<Self, TensorError> {
        let shapes: BTreeMap<String, usize> = shapes.into_iter().collect();
        if shapes.is_empty() {
            return Err(TensorError::EmptySchema);
        }
        Ok(Self { shapes })
    }

    /// Declared length of `name`, or an error if the parameter is unknown.
    pub fn len_of(&self, name: &str) -> Result<usize, TensorError> {
        self.shapes
            .get(name)
            .copied()
            .ok_or_else(|| TensorError::UnknownParameter { name: name.to_string() })
    }

    /// Parameter names in canonical (sorted) order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shapes.keys().map(String::as_str)
    }

    /// Check that every tensor in `set` matches its declared shape.
    pub fn validate(&self, set: &TensorSet) -> Result<(), TensorError> {
        for (name, values) in set.iter() {
            let expected = self.len_of(name)?;
            if values.len() != expected {
                return Err(TensorError::ShapeMismatch {
                    name: name.to_string(),
                    expected,
                    got: values.len(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tensor set
// ============================================================================

/// A gradient: parameter name → dense `f32` vector. Iteration order is the
/// canonical sorted order, which every serialization in the crate relies on.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorSet {
    tensors: BTreeMap<String, Vec<f32>>,
}

impl TensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.tensors.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.tensors.get(name).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<f32>> {
        self.tensors.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn param_count(&self) -> usize {
        self.tensors.len()
    }

    /// Total element count across all parameters.
    pub fn element_count(&self) -> usize {
        self.tensors.values().map(Vec::len).sum()
    }

    /// L2 norm over the concatenation of all parameter vectors.
    pub fn l2_norm(&self) -> f64 {
        self.tensors
            .values()
            .flat_map(|v| v.iter())
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt()
    }

    /// Scale every element uniformly.
    pub fn scale_in_place(&mut self, factor: f64) {
        for v in self.tensors.values_mut() {
            for x in v.iter_mut() {
                *x = (f64::from(*x) * factor) as f32;
            }
        }
    }

    /// Elementwise add `other` into `self`, creating missing parameters.
    /// Shape agreement is the caller's responsibility (schema-validated
    /// upstream); mismatched lengths add over the common prefix.
    pub fn add_assign(&mut self, other: &TensorSet) {
        for (name, values) in other.iter() {
            match self.tensors.get_mut(name) {
                Some(mine) => {
                    for (m, o) in mine.iter_mut().zip(values) {
                        *m += *o;
                    }
                }
                None => {
                    self.tensors.insert(name.to_string(), values.to_vec());
                }
            }
        }
    }
}

impl FromIterator<(String, Vec<f32>)> for TensorSet {
    fn from_iter<T: IntoIterator<Item = (String, Vec<f32>)>>(iter: T) -> Self {
        Self { tensors: iter.into_iter().collect() }
    }
}

// ============================================================================
// Expert gating
// ============================================================================

/// Per-expert gradients with their gate weights for one round.
#[derive(Clone, Debug, Default)]
pub struct ExpertGradients {
    experts: BTreeMap<String, (f32, TensorSet)>,
}

impl ExpertGradients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, expert: impl Into<String>, gate_weight: f32, grads: TensorSet) {
        self.experts.insert(expert.into(), (gate_weight, grads));
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    /// Drop experts with `gate_weight < gate_threshold`, scale the survivors
    /// by their weights, and sum into a single gradient set. Returns the
    /// combined set and the surviving weights (recorded in the manifest).
    pub fn gate_and_combine(
        &self,
        schema: &ParameterSchema,
        gate_threshold: f64,
    ) -> Result<(TensorSet, BTreeMap<String, f32>), TensorError> {
        let mut combined = TensorSet::new();
        let mut kept = BTreeMap::new();

        for (expert, (weight, grads)) in &self.experts {
            if f64::from(*weight) < gate_threshold {
                continue;
            }
            schema.validate(grads)?;
            let mut scaled = grads.clone();
            scaled.scale_in_place(f64::from(*weight));
            combined.add_assign(&scaled);
            kept.insert(expert.clone(), *weight);
        }
        Ok((combined, kept))
    }
}

// ============================================================================
// Clipping
// ============================================================================

/// Outcome of an L2 clip: the pre-clip norm and the uniform factor applied.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipReport {
    pub pre_clip_norm: f64,
    pub factor: f64,
}

/// Clip `set` to `clip_norm` in concatenated L2:
/// `c = min(1, clip_norm / (‖g‖₂ + ε))`, applied uniformly.
pub fn clip_l2(set: &mut TensorSet, clip_norm: f64) -> ClipReport {
    let pre_clip_norm = set.l2_norm();
    let factor = (clip_norm / (pre_clip_norm + EPS_DIV)).min(1.0);
    if factor < 1.0 {
        set.scale_in_place(factor);
    }
    ClipReport { pre_clip_norm, factor }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ParameterSchema {
        ParameterSchema::new([("w".to_string(), 4), ("b".to_string(), 2)]).unwrap()
    }

    #[test]
    fn schema_rejects_unknown_and_misshapen_parameters() {
        let s = schema();
        let mut set = TensorSet::new();
        set.insert("w", vec![1.0; 4]);
        set.insert("b", vec![0.5; 2]);
        s.validate(&set).unwrap();

        let mut wrong_shape = set.clone();
        wrong_shape.insert("w", vec![1.0; 3]);
        assert!(matches!(s.validate(&wrong_shape), Err(TensorError::ShapeMismatch { .. })));

        let mut unknown = set;
        unknown.insert("mystery", vec![1.0]);
        assert!(matches!(s.validate(&unknown), Err(TensorError::UnknownParameter { .. })));

        assert!(matches!(ParameterSchema::new([]), Err(TensorError::EmptySchema)));
    }

    #[test]
    fn l2_norm_concatenates_parameters() {
        let mut set = TensorSet::new();
        set.insert("w", vec![3.0, 0.0]);
        set.insert("b", vec![4.0]);
        assert!((set.l2_norm() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn clip_is_identity_below_threshold_and_uniform_above() {
        let mut small = TensorSet::new();
        small.insert("w", vec![1.0, 1.0]);
        let report = clip_l2(&mut small, 100.0);
        assert_eq!(report.factor, 1.0);
        assert_eq!(small.get("w").unwrap(), &[1.0, 1.0]);

        let mut large = TensorSet::new();
        large.insert("w", vec![30.0, 40.0]); // norm 50
        let report = clip_l2(&mut large, 5.0);
        assert!((report.pre_clip_norm - 50.0).abs() < 1e-9);
        assert!((report.factor - 0.1).abs() < 1e-9);
        assert!((large.l2_norm() - 5.0).abs() < 1e-6);
        // Direction preserved.
        let w = large.get("w").unwrap();
        assert!((f64::from(w[0]) / f64::from(w[1]) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn gating_drops_weak_experts_and_weights_survivors() {
        let s = schema();
        let mut tensor = TensorSet::new();
        tensor.insert("w", vec![1.0, 2.0, 3.0, 4.0]);
        tensor.insert("b", vec![1.0, 1.0]);

        let mut experts = ExpertGradients::new();
        experts.insert("strong", 0.5, tensor.clone());
        experts.insert("weak", 0.1, tensor.clone());
        experts.insert("other", 1.0, tensor);

        let (combined, kept) = experts.gate_and_combine(&s, 0.15).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains_key("strong") && kept.contains_key("other"));
        // 0.5·g + 1.0·g = 1.5·g
        assert!((f64::from(combined.get("w").unwrap()[3]) - 6.0).abs() < 1e-6);
        assert!((f64::from(combined.get("b").unwrap()[0]) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn empty_expert_set_combines_to_empty_gradient() {
        let s = schema();
        let experts = ExpertGradients::new();
        let (combined, kept) = experts.gate_and_combine(&s, 0.15).unwrap();
        assert!(combined.is_empty());
        assert!(kept.is_empty());
    }
}
