//! Rand-K sparsification and error-feedback memory
//!
//! Rand-K keeps `k = ⌈ρ·n⌉` uniformly chosen coordinates per parameter
//! vector. The index draw is **data-independent** — it comes from a public
//! substream keyed by `(worker_id, round, parameter_name)` — which is what
//! lets the DP analysis ignore the selection and lets the aggregator
//! recompute every worker's index sets from the announced derivation.
//!
//! Dropped mass is not lost: the error-feedback memory carries
//! `mem[p] ← g[p] − scatter(sparse[p])` into the next round, so every
//! coordinate is eventually transmitted. Because `scatter` only zeroes kept
//! coordinates, `‖mem[p]‖₂ ≤ ‖g[p]‖₂` holds unconditionally.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;

use crate::csprng::{public_substream, public_substream_seed, StreamTag};
use crate::tensor::TensorSet;
use crate::{Round, WorkerId};

/// A parameter's memory entry is evicted when the parameter has been absent
/// for this many consecutive rounds.
pub const MEMORY_EVICTION_ROUNDS: u64 = 10;

/// Sparse view of one parameter vector: ascending unique indices and their
/// values; everything else is implicitly zero.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseTensor {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseTensor {
    /// Scatter back into a dense vector of length `n`.
    pub fn scatter(&self, n: usize) -> Vec<f32> {
        let mut dense = vec![0.0f32; n];
        for (&i, &v) in self.indices.iter().zip(&self.values) {
            dense[i as usize] = v;
        }
        dense
    }
}

/// Number of kept coordinates for a vector of length `n` at ratio ρ.
#[inline]
pub fn sparsity_k(n: usize, ratio: f64) -> usize {
    ((n as f64) * ratio).ceil() as usize
}

/// The 32-byte public derivation for a worker/round/parameter index stream.
/// Announced in the manifest (`substream_tag`) so the aggregator can rebuild
/// the same stream without holding the worker's private seed.
pub fn randk_substream_seed(worker: &WorkerId, round: Round, param: &str) -> [u8; 32] {
    public_substream_seed(
        StreamTag::RandKIndices,
        &[worker.as_bytes(), &round.to_be_bytes(), param.as_bytes()],
    )
}

/// Draw the Rand-K index set: `k` unique indices in `[0, n)`, ascending.
///
/// Uses Floyd's sampling so the subset is uniform without materializing a
/// permutation of `[0, n)`.
pub fn randk_indices(worker: &WorkerId, round: Round, param: &str, n: usize, k: usize) -> Vec<u32> {
    let k = k.min(n);
    let mut rng = public_substream(
        StreamTag::RandKIndices,
        &[worker.as_bytes(), &round.to_be_bytes(), param.as_bytes()],
    );
    let mut chosen: BTreeSet<u32> = BTreeSet::new();
    for j in (n - k)..n {
        let t = rng.gen_range(0..=j) as u32;
        if !chosen.insert(t) {
            chosen.insert(j as u32);
        }
    }
    chosen.into_iter().collect()
}

/// Sparsify every parameter of `set` at ratio ρ.
pub fn sparsify(
    set: &TensorSet,
    worker: &WorkerId,
    round: Round,
    ratio: f64,
) -> BTreeMap<String, SparseTensor> {
    let mut out = BTreeMap::new();
    for (name, values) in set.iter() {
        let k = sparsity_k(values.len(), ratio);
        let indices = randk_indices(worker, round, name, values.len(), k);
        let kept = indices.iter().map(|&i| values[i as usize]).collect();
        out.insert(name.to_string(), SparseTensor { indices, values: kept });
    }
    out
}

// ============================================================================
// Error-feedback memory
// ============================================================================

/// Per-worker residual memory. Exclusive to its worker; the pipeline mutates
/// it only at the end of a round (consecutive rounds are serialized by the
/// worker mutex upstream).
#[derive(Clone, Debug, Default)]
pub struct ErrorFeedback {
    // name → (residual, last round the parameter appeared)
    memory: BTreeMap<String, (Vec<f32>, u64)>,
}

impl ErrorFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn residual(&self, name: &str) -> Option<&[f32]> {
        self.memory.get(name).map(|(v, _)| v.as_slice())
    }

    /// Add carried residuals into `g` for every parameter present in memory.
    pub fn apply(&self, g: &mut TensorSet) {
        for (name, (residual, _)) in &self.memory {
            if let Some(values) = g.get_mut(name) {
                for (v, r) in values.iter_mut().zip(residual) {
                    *v += *r;
                }
            }
        }
    }

    /// Record this round's residuals (`mem[p] ← g[p] − scatter(sparse[p])`)
    /// and evict parameters untouched for [`MEMORY_EVICTION_ROUNDS`].
    pub fn update(
        &mut self,
        round: Round,
        dense: &TensorSet,
        sparse: &BTreeMap<String, SparseTensor>,
    ) {
        for (name, values) in dense.iter() {
            let mut residual = values.to_vec();
            if let Some(sp) = sparse.get(name) {
                for &i in &sp.indices {
                    residual[i as usize] = 0.0;
                }
            }
            self.memory.insert(name.to_string(), (residual, round.0));
        }
        self.memory.retain(|_, (_, last_seen)| round.0.saturating_sub(*last_seen) < MEMORY_EVICTION_ROUNDS);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> WorkerId {
        WorkerId("w-1".into())
    }

    #[test]
    fn index_draw_is_deterministic_and_recomputable() {
        let a = randk_indices(&worker(), Round(5), "layer.0", 1000, 10);
        let b = randk_indices(&worker(), Round(5), "layer.0", 1000, 10);
        assert_eq!(a, b);

        // Another round or parameter draws a different set.
        let c = randk_indices(&worker(), Round(6), "layer.0", 1000, 10);
        let d = randk_indices(&worker(), Round(5), "layer.1", 1000, 10);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn indices_are_unique_ascending_and_in_range() {
        let idx = randk_indices(&worker(), Round(1), "p", 257, 31);
        assert_eq!(idx.len(), 31);
        for w in idx.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(*idx.last().unwrap() < 257);
    }

    #[test]
    fn full_ratio_keeps_every_coordinate() {
        let idx = randk_indices(&worker(), Round(1), "p", 16, sparsity_k(16, 1.0));
        assert_eq!(idx, (0..16).collect::<Vec<u32>>());
    }

    #[test]
    fn k_is_the_ceiling_of_rho_n() {
        assert_eq!(sparsity_k(1000, 0.01), 10);
        assert_eq!(sparsity_k(1001, 0.01), 11);
        assert_eq!(sparsity_k(5, 0.5), 3);
        assert_eq!(sparsity_k(4, 1.0), 4);
    }

    #[test]
    fn sparsify_gathers_the_selected_values() {
        let mut set = TensorSet::new();
        let values: Vec<f32> = (0..100).map(|i| i as f32).collect();
        set.insert("p", values.clone());
        let sparse = sparsify(&set, &worker(), Round(2), 0.1);
        let sp = &sparse["p"];
        assert_eq!(sp.indices.len(), 10);
        for (&i, &v) in sp.indices.iter().zip(&sp.values) {
            assert_eq!(v, values[i as usize]);
        }
        // Scatter restores the kept coordinates and zeroes the rest.
        let dense = sp.scatter(100);
        assert_eq!(dense.iter().filter(|&&x| x != 0.0).count(), sp.indices.len() - usize::from(sp.indices.contains(&0)));
    }

    #[test]
    fn residual_norm_never_exceeds_gradient_norm() {
        let mut set = TensorSet::new();
        set.insert("p", (0..64).map(|i| (i as f32) - 31.5).collect());
        let sparse = sparsify(&set, &worker(), Round(3), 0.25);

        let mut ef = ErrorFeedback::new();
        ef.update(Round(3), &set, &sparse);

        let g_norm: f64 =
            set.get("p").unwrap().iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
        let m_norm: f64 =
            ef.residual("p").unwrap().iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
        assert!(m_norm <= g_norm + 1e-9);

        // Residual is zero exactly on kept coordinates.
        for &i in &sparse["p"].indices {
            assert_eq!(ef.residual("p").unwrap()[i as usize], 0.0);
        }
    }

    #[test]
    fn apply_carries_residual_into_next_round() {
        let mut g1 = TensorSet::new();
        g1.insert("p", vec![1.0, 2.0, 3.0, 4.0]);
        let mut ef = ErrorFeedback::new();
        // Keep nothing: the whole gradient becomes residual.
        ef.update(Round(0), &g1, &BTreeMap::new());

        let mut g2 = TensorSet::new();
        g2.insert("p", vec![10.0, 10.0, 10.0, 10.0]);
        ef.apply(&mut g2);
        assert_eq!(g2.get("p").unwrap(), &[11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn untouched_parameters_are_evicted_after_the_window() {
        let mut g = TensorSet::new();
        g.insert("stale", vec![1.0]);
        let mut ef = ErrorFeedback::new();
        ef.update(Round(0), &g, &BTreeMap::new());
        assert!(ef.residual("stale").is_some());

        let mut fresh = TensorSet::new();
        fresh.insert("live", vec![1.0]);
        // One round before the window closes the entry survives.
        ef.update(Round(MEMORY_EVICTION_ROUNDS - 1), &fresh, &BTreeMap::new());
        assert!(ef.residual("stale").is_some());
        // At the window boundary it is gone.
        ef.update(Round(MEMORY_EVICTION_ROUNDS), &fresh, &BTreeMap::new());
        assert!(ef.residual("stale").is_none());
        assert!(ef.residual("live").is_some());
    }
}
