//! Worker-side gradient pipeline
//!
//! Per round, in fixed stage order:
//!
//! 1. **Gate & combine** expert gradients (drop weak experts, weight, sum).
//! 2. **Clip** to the envelope's L2 bound.
//! 3. **Add error feedback**, re-clipping if the carried residual pushes the
//!    norm back over the bound. A post-feedback norm above `2·clip_norm` is
//!    impossible from honest state and fails the round as memory corruption.
//! 4. **Sparsify** (Rand-K, public deterministic index draw).
//! 5. **Update memory** (`mem ← g − scatter`, with eviction).
//! 6. **Quantize** per tensor, enforcing the envelope's MSE ceiling.
//! 7. **Pack** kept values into plaintext slots (manifest order).
//! 8. **Encrypt** one ciphertext per slot.
//! 9. **Seal** the update package and record evidence.
//!
//! The DP accountant is consulted **before stage 1**: an exhausted budget
//! refuses the round before any work or I/O happens. Given identical seed,
//! envelope, and inputs (including the caller-supplied timestamp), the
//! sealed bytes are identical — determinism is a tested property.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::accountant::{per_round_epsilon, AccountantError, DpAccountant};
use crate::cipher::{CipherError, CipherParams, N2heCipher};
use crate::csprng::SeedContext;
use crate::envelope::OperatingEnvelope;
use crate::evidence::{EventType, EvidenceError, EvidenceLog};
use crate::keystore::{KeyProvider, KeyState, KeystoreError};
use crate::package::{
    CompressionEntry, Manifest, PackageError, PackageHeader, SafetyStats, TrainingMeta,
    UpdatePackage,
};
use crate::quantize::{quantize_with_meta_checked, symmetric_meta, QuantizeError};
use crate::signer::PackageSigner;
use crate::sparsify::{randk_substream_seed, sparsify, ErrorFeedback};
use crate::tensor::{clip_l2, ExpertGradients, ParameterSchema, TensorError};
use crate::{Classify, ErrorKind, KeyId, Round, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Budget(#[from] AccountantError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Quantize(#[from] QuantizeError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error(
        "post-feedback gradient norm {norm:.4} exceeds twice the clip bound {clip_norm:.4}; \
         error-feedback memory is corrupt, reset the worker state"
    )]
    ClipNormExceeded { norm: f64, clip_norm: f64 },
    #[error("key `{key_id}` is {state:?} and may not encrypt new packages")]
    KeyNotUsable { key_id: KeyId, state: KeyState },
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Budget(e) => e.kind(),
            PipelineError::Tensor(e) => e.kind(),
            PipelineError::Quantize(e) => e.kind(),
            PipelineError::Cipher(e) => e.kind(),
            PipelineError::Package(e) => e.kind(),
            PipelineError::Keystore(e) => e.kind(),
            PipelineError::Evidence(e) => e.kind(),
            PipelineError::ClipNormExceeded { .. } => ErrorKind::Validation,
            PipelineError::KeyNotUsable { .. } => ErrorKind::Validation,
        }
    }
}

/// Everything one round needs from the caller.
#[derive(Clone, Debug)]
pub struct RoundInput {
    pub round: Round,
    pub key_id: KeyId,
    pub experts: ExpertGradients,
    pub training: TrainingMeta,
    /// Seal timestamp. Caller-supplied so sealed bytes are reproducible.
    pub timestamp_ms: i64,
}

/// The per-worker pipeline. Exclusive ownership of the error-feedback
/// memory and the accountant lives here; callers that run rounds from
/// multiple tasks wrap the pipeline in a mutex so consecutive rounds of one
/// worker never interleave (see `api::Worker`).
pub struct GradientPipeline {
    worker_id: WorkerId,
    envelope: Arc<OperatingEnvelope>,
    schema: ParameterSchema,
    cipher: N2heCipher,
    accountant: DpAccountant,
    feedback: ErrorFeedback,
    keys: Arc<dyn KeyProvider>,
    signer: Arc<dyn PackageSigner>,
    evidence: Option<Arc<EvidenceLog>>,
}

impl GradientPipeline {
    pub fn new(
        worker_id: WorkerId,
        envelope: Arc<OperatingEnvelope>,
        schema: ParameterSchema,
        seed: SeedContext,
        keys: Arc<dyn KeyProvider>,
        signer: Arc<dyn PackageSigner>,
    ) -> Result<Self, PipelineError> {
        let params = CipherParams::new(envelope.security_level(), envelope.mu)?;
        let accountant = DpAccountant::new(envelope.epsilon_cap, envelope.delta, envelope.hard_stop);
        Ok(Self {
            worker_id,
            envelope,
            schema,
            cipher: N2heCipher::new(params, seed),
            accountant,
            feedback: ErrorFeedback::new(),
            keys,
            signer,
            evidence: None,
        })
    }

    /// Wire worker-side evidence recording.
    pub fn with_evidence(mut self, evidence: Arc<EvidenceLog>) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn accountant(&self) -> &DpAccountant {
        &self.accountant
    }

    fn record(&self, event: EventType, subject: &str) -> Result<(), PipelineError> {
        if let Some(log) = &self.evidence {
            log.append(event, &self.worker_id.0, subject)?;
        }
        Ok(())
    }

    /// Run one round end to end, producing a sealed package.
    pub fn run_round(&mut self, input: RoundInput) -> Result<UpdatePackage, PipelineError> {
        let env = Arc::clone(&self.envelope);
        let round = input.round;
        let span = tracing::info_span!("round", worker = %self.worker_id, round = round.0);
        let _guard = span.enter();

        let eps_round = per_round_epsilon(env.clip_norm, env.mu, env.sparsity_ratio, env.delta);

        // 1. Gate & combine.
        let (mut g, expert_weights) =
            input.experts.gate_and_combine(&self.schema, env.gate_threshold)?;
        let empty = g.is_empty();

        // DP gate before any further work or I/O. An empty gradient carries
        // no spend and skips the charge entirely.
        if !empty {
            if let Err(e) = self.accountant.record(eps_round) {
                self.record(EventType::BudgetHalted, &format!("round-{round}"))?;
                return Err(e.into());
            }
        }

        // 2. Clip.
        let clip = clip_l2(&mut g, env.clip_norm);
        tracing::debug!(pre_norm = clip.pre_clip_norm, factor = clip.factor, "clipped");

        // 3. Error feedback, re-clip if the residual pushed us back out.
        self.feedback.apply(&mut g);
        let post_feedback_norm = g.l2_norm();
        if post_feedback_norm > 2.0 * env.clip_norm {
            self.record(EventType::PipelineFailed, &format!("round-{round} clip-guard"))?;
            return Err(PipelineError::ClipNormExceeded {
                norm: post_feedback_norm,
                clip_norm: env.clip_norm,
            });
        }
        if post_feedback_norm > env.clip_norm {
            clip_l2(&mut g, env.clip_norm);
        }

        // 4. Sparsify.
        let sparse = sparsify(&g, &self.worker_id, round, env.sparsity_ratio);

        // 5. Update memory (and evict stale parameters).
        self.feedback.update(round, &g, &sparse);

        // 6–7. Quantize and pack into slots, manifest (sorted) order. The
        // grid is deployment-fixed (symmetric over ±clip_norm): every worker
        // shares it, which keeps the aggregator's inverse exact.
        let grid = symmetric_meta(env.clip_norm, env.bits)?;
        let precompression_bytes = g.element_count() as u64 * 4;
        let mut compression_meta = BTreeMap::new();
        let mut slots: Vec<u16> = Vec::new();
        for (name, sp) in &sparse {
            let qt = quantize_with_meta_checked(&sp.values, &grid, env.max_quality_mse)?;
            let n_elements = self.schema.len_of(name)? as u32;
            compression_meta.insert(
                name.clone(),
                CompressionEntry {
                    bits: qt.meta.bits,
                    indices: sp.indices.clone(),
                    n_elements,
                    n_slots: sp.indices.len() as u32,
                    scale: qt.meta.scale,
                    substream_tag: hex::encode(randk_substream_seed(
                        &self.worker_id,
                        round,
                        name,
                    )),
                    zero_point: qt.meta.zero_point,
                },
            );
            slots.extend_from_slice(&qt.q);
        }

        // 8. Encrypt (skipped for the empty package, which carries no ε cost).
        let payload = if slots.is_empty() {
            Vec::new()
        } else {
            let material = self.keys.lookup(&input.key_id)?;
            if !material.metadata.can_encrypt() {
                return Err(PipelineError::KeyNotUsable {
                    key_id: input.key_id.clone(),
                    state: material.metadata.state,
                });
            }
            self.cipher.encrypt_vector(&material.secret, &slots, &input.key_id, round, 0)?
        };

        // 9. Seal.
        let header = PackageHeader {
            key_id: input.key_id,
            round,
            sig_alg: self.signer.algorithm().to_string(),
            timestamp_ms: input.timestamp_ms,
            worker_id: self.worker_id.clone(),
        };
        let manifest = Manifest {
            compression_meta,
            expert_weights,
            safety_stats: SafetyStats {
                clip_norm_applied: clip.factor,
                dp_epsilon_consumed: self.accountant.consumed(),
                gradient_l2_pre_clip: clip.pre_clip_norm,
                payload_bytes_precompression: precompression_bytes,
                sparsity_ratio: if empty { 0.0 } else { env.sparsity_ratio },
            },
            training_meta: input.training,
        };
        let package = UpdatePackage::seal(header, manifest, payload, self.signer.as_ref())?;

        let bytes = package.to_bytes()?;
        UpdatePackage::check_size(bytes.len(), env.max_update_size_kb)?;

        self.record(EventType::PackageSealed, &hex::encode(package.content_hash))?;
        tracing::info!(
            bytes = bytes.len(),
            slots = package.payload.len(),
            eps_consumed = self.accountant.consumed(),
            "package sealed"
        );
        Ok(package)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::SecurityLevel;
    use crate::keystore::MemoryProvider;
    use crate::signer::FleetHmacSigner;
    use crate::tensor::TensorSet;

    fn schema() -> ParameterSchema {
        ParameterSchema::new([("layer.w".to_string(), 64), ("layer.b".to_string(), 8)]).unwrap()
    }

    fn training() -> TrainingMeta {
        TrainingMeta {
            learning_rate: 1e-4,
            objective: "causal-lm".into(),
            optimizer: "adamw".into(),
            steps: 100,
        }
    }

    fn experts(scale: f32) -> ExpertGradients {
        let mut set = TensorSet::new();
        set.insert("layer.w", (0..64).map(|i| (i as f32) * 0.01 * scale).collect());
        set.insert("layer.b", (0..8).map(|i| (i as f32) * 0.1 * scale).collect());
        let mut ex = ExpertGradients::new();
        ex.insert("expert-a", 1.0, set);
        ex
    }

    struct Fixture {
        pipeline: GradientPipeline,
        key_id: KeyId,
        keys: Arc<MemoryProvider>,
    }

    fn fixture(seed: u8, envelope: OperatingEnvelope) -> Fixture {
        let envelope = envelope.into_shared().unwrap();
        let keys = Arc::new(MemoryProvider::new(SeedContext::new([seed; 32])));
        let key_id = keys.generate(SecurityLevel::Bits128, "fleet").unwrap();
        keys.activate(&key_id).unwrap();
        let signer =
            Arc::new(FleetHmacSigner::new(*b"0123456789abcdef0123456789abcdef").unwrap());
        let pipeline = GradientPipeline::new(
            WorkerId(format!("w-{seed}")),
            envelope,
            schema(),
            SeedContext::new([seed; 32]),
            Arc::clone(&keys) as Arc<dyn KeyProvider>,
            signer,
        )
        .unwrap();
        Fixture { pipeline, key_id, keys }
    }

    fn envelope_relaxed() -> OperatingEnvelope {
        OperatingEnvelope {
            sparsity_ratio: 0.5,
            epsilon_cap: 100.0,
            ..OperatingEnvelope::default()
        }
    }

    fn input(fx: &Fixture, round: u64) -> RoundInput {
        RoundInput {
            round: Round(round),
            key_id: fx.key_id.clone(),
            experts: experts(1.0),
            training: training(),
            timestamp_ms: 1_722_470_400_000,
        }
    }

    #[test]
    fn sealed_output_is_deterministic_for_fixed_seed_and_inputs() {
        let mut a = fixture(1, envelope_relaxed());
        let mut b = fixture(1, envelope_relaxed());
        let pkg_a = a.pipeline.run_round(input(&a, 1)).unwrap();
        let pkg_b = b.pipeline.run_round(input(&b, 1)).unwrap();
        assert_eq!(pkg_a.to_bytes().unwrap(), pkg_b.to_bytes().unwrap());
    }

    #[test]
    fn manifest_reflects_clip_sparsity_and_budget() {
        let mut fx = fixture(2, envelope_relaxed());
        let pkg = fx.pipeline.run_round(input(&fx, 1)).unwrap();

        let stats = &pkg.manifest.safety_stats;
        assert!(stats.gradient_l2_pre_clip > 0.0);
        assert!(stats.dp_epsilon_consumed > 0.0);
        assert_eq!(stats.sparsity_ratio, 0.5);
        assert_eq!(stats.payload_bytes_precompression, (64 + 8) * 4);

        // 72 elements at ρ=0.5 ⇒ 32 + 4 slots.
        assert_eq!(pkg.manifest.total_slots(), 36);
        assert_eq!(pkg.payload.len(), 36);
        let entry = &pkg.manifest.compression_meta["layer.w"];
        assert_eq!(entry.n_elements, 64);
        assert_eq!(entry.n_slots, 32);
        assert_eq!(entry.indices.len(), 32);
        assert_eq!(
            entry.substream_tag,
            hex::encode(randk_substream_seed(&WorkerId("w-2".into()), Round(1), "layer.w"))
        );
        assert_eq!(pkg.manifest.expert_weights["expert-a"], 1.0);
    }

    #[test]
    fn dp_hard_stop_refuses_the_fourth_round_before_any_io() {
        // Size the cap so exactly three rounds fit.
        let probe = envelope_relaxed();
        let eps =
            per_round_epsilon(probe.clip_norm, probe.mu, probe.sparsity_ratio, probe.delta);
        let envelope = OperatingEnvelope { epsilon_cap: eps * 3.49, ..envelope_relaxed() };

        let mut fx = fixture(3, envelope);
        for round in 1..=3 {
            fx.pipeline.run_round(input(&fx, round)).unwrap();
        }
        match fx.pipeline.run_round(input(&fx, 4)) {
            Err(PipelineError::Budget(AccountantError::BudgetExhausted { .. })) => {}
            other => panic!("expected budget refusal, got {other:?}"),
        }
        assert!(fx.pipeline.accountant().is_halted());
        // And the refusal sticks.
        assert!(matches!(
            fx.pipeline.run_round(input(&fx, 5)),
            Err(PipelineError::Budget(_))
        ));
    }

    #[test]
    fn empty_expert_set_seals_an_empty_package_at_zero_cost() {
        let mut fx = fixture(4, envelope_relaxed());
        let consumed_before = fx.pipeline.accountant().consumed();
        let pkg = fx
            .pipeline
            .run_round(RoundInput {
                round: Round(1),
                key_id: fx.key_id.clone(),
                experts: ExpertGradients::new(),
                training: training(),
                timestamp_ms: 0,
            })
            .unwrap();
        assert!(pkg.payload.is_empty());
        assert!(pkg.manifest.compression_meta.is_empty());
        assert_eq!(fx.pipeline.accountant().consumed(), consumed_before);
        assert_eq!(pkg.manifest.safety_stats.dp_epsilon_consumed, 0.0);
    }

    #[test]
    fn inactive_key_is_refused() {
        let mut fx = fixture(5, envelope_relaxed());
        // A registered-but-never-activated key.
        let dormant = fx.keys.generate(SecurityLevel::Bits128, "fleet").unwrap();
        let result = fx.pipeline.run_round(RoundInput {
            round: Round(1),
            key_id: dormant,
            experts: experts(1.0),
            training: training(),
            timestamp_ms: 0,
        });
        assert!(matches!(result, Err(PipelineError::KeyNotUsable { .. })));
    }

    #[test]
    fn coarse_bits_on_wide_values_fail_quality() {
        let envelope = OperatingEnvelope {
            bits: 2,
            clip_norm: 1e6,
            max_quality_mse: 1e-6,
            // The huge clip bound inflates per-round ε; budget is not under test.
            epsilon_cap: 1e12,
            ..envelope_relaxed()
        };
        let mut fx = fixture(6, envelope);
        let result = fx.pipeline.run_round(RoundInput {
            round: Round(1),
            key_id: fx.key_id.clone(),
            experts: experts(100.0),
            training: training(),
            timestamp_ms: 0,
        });
        match result {
            Err(PipelineError::Quantize(QuantizeError::QualityLoss { .. })) => {}
            other => panic!("expected QualityLoss, got {other:?}"),
        }
    }

    #[test]
    fn oversize_packages_are_refused() {
        let envelope = OperatingEnvelope { max_update_size_kb: 1, ..envelope_relaxed() };
        let mut fx = fixture(7, envelope);
        assert!(matches!(
            fx.pipeline.run_round(input(&fx, 1)),
            Err(PipelineError::Package(PackageError::TooLarge { .. }))
        ));
    }

    #[test]
    fn error_feedback_carries_dropped_mass_into_the_next_round() {
        let mut fx = fixture(8, envelope_relaxed());
        fx.pipeline.run_round(input(&fx, 1)).unwrap();
        // After a ρ=0.5 round, residual mass exists for the next round.
        assert!(!fx.pipeline.feedback.is_empty());
        let res = fx.pipeline.feedback.residual("layer.w").unwrap();
        assert!(res.iter().any(|&x| x != 0.0));
        // Residual zeroed on the kept coordinates of round 1.
        let kept = crate::sparsify::randk_indices(&WorkerId("w-8".into()), Round(1), "layer.w", 64, 32);
        for &i in &kept {
            assert_eq!(res[i as usize], 0.0);
        }
    }
}
