//! Aggregator — quorum, outlier rejection, homomorphic sum, recovery
//!
//! ## Round state machine
//! ```text
//! COLLECTING → QUORUM_REACHED → FILTERED → SUMMED → DECRYPTED → GATED → PUBLISHED
//!      └──────────────────────────────────────────────────────────────→ FAILED
//! ```
//!
//! Collection runs as a task consuming a **bounded** submit channel
//! (backpressure is the channel's capacity); the deadline and cancellation
//! are the task's select arms. The heavy sum/decrypt path runs on the
//! blocking pool. Rounds are strictly sequential per key: a new round will
//! not start until its predecessor reaches PUBLISHED or FAILED, and round
//! numbers must increase.
//!
//! ## Robustness before crypto
//! Outliers are rejected on **ciphertext-free metadata**: the MAD filter
//! runs over the reported pre-clip L2 norms, so no decryption happens before
//! Byzantine filtering. With `f` flagged reporters the design tolerates
//! `f < n − quorum_threshold`; coordinated collusion past that is out of
//! scope.
//!
//! ## Recovery equation
//! Worker weights are integer numerators over one common denominator; a
//! weight-`n` contribution is its ciphertext accumulated `n` times. Per
//! dense coordinate the decoded sum `Q`, the weighted zero-point sum, the
//! weighted mean scale, and the contributor weight `C` recover
//!
//! ```text
//! delta[j] = (Q − Σ nᵢ·zpᵢ) · scale_avg / C
//! ```
//!
//! exactly when all scales agree, and within the quantization step
//! otherwise. Rand-K index sets are recomputed from the announced public
//! derivation and cross-checked against the manifest before anything is
//! summed.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::cipher::{CipherError, CipherParams, Ciphertext, N2heCipher, PLAINTEXT_MODULUS};
use crate::csprng::SeedContext;
use crate::envelope::OperatingEnvelope;
use crate::evidence::{EventType, EvidenceError, EvidenceLog};
use crate::gate::{self, GateFailure, GateMetrics, GateThresholds};
use crate::keystore::{KeyProvider, KeystoreError};
use crate::package::UpdatePackage;
use crate::signer::PackageVerifier;
use crate::sparsify::{randk_indices, sparsity_k};
use crate::tensor::{ParameterSchema, TensorSet};
use crate::{Classify, ErrorKind, KeyId, Round, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("quorum failed: {valid} valid packages, {required} required")]
    Quorum { valid: usize, required: usize },
    #[error("round {round} for key `{key_id}` is already in flight or out of order")]
    RoundBusy { key_id: KeyId, round: Round },
    #[error("round {got} is not after the last completed round {last} for key `{key_id}`")]
    RoundOutOfOrder { key_id: KeyId, got: Round, last: u64 },
    #[error(
        "weighted contributions overflow the plaintext modulus: \
         total weight {total_weight} at {bits} bits"
    )]
    WeightOverflow { total_weight: u64, bits: u8 },
    #[error("evaluation gate failed: {}", failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
    Gate { failures: Vec<GateFailure> },
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error("aggregation internals: {0}")]
    Internal(String),
}

impl Classify for AggregateError {
    fn kind(&self) -> ErrorKind {
        match self {
            AggregateError::Quorum { .. } => ErrorKind::Quorum,
            AggregateError::Gate { .. } => ErrorKind::Validation,
            AggregateError::WeightOverflow { .. } => ErrorKind::Validation,
            AggregateError::RoundBusy { .. } | AggregateError::RoundOutOfOrder { .. } => {
                ErrorKind::Validation
            }
            AggregateError::Cipher(e) => e.kind(),
            AggregateError::Keystore(e) => e.kind(),
            AggregateError::Evidence(e) => e.kind(),
            AggregateError::Internal(_) => ErrorKind::Resource,
        }
    }
}

/// Round lifecycle states, queryable via [`Aggregator::round_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundState {
    Collecting,
    QuorumReached,
    Filtered,
    Summed,
    Decrypted,
    Gated,
    Published,
    Failed,
}

/// Integer worker weights over one common denominator. The denominator is
/// carried for reporting; the recovery math divides by per-coordinate
/// contributor weight, so means are denominator-free.
#[derive(Clone, Debug)]
pub struct AggregationWeights {
    numerators: BTreeMap<WorkerId, u64>,
    denominator: u64,
}

impl AggregationWeights {
    /// Uniform weights: numerator 1 for every worker.
    pub fn uniform() -> Self {
        Self { numerators: BTreeMap::new(), denominator: 1 }
    }

    /// Explicit weights. Every numerator and the denominator must be
    /// positive; workers missing from the map weigh 1.
    pub fn new(
        numerators: BTreeMap<WorkerId, u64>,
        denominator: u64,
    ) -> Result<Self, AggregateError> {
        if denominator == 0 || numerators.values().any(|&n| n == 0) {
            return Err(AggregateError::Internal(
                "aggregation weights must have positive numerators and denominator".into(),
            ));
        }
        Ok(Self { numerators, denominator })
    }

    pub fn denominator(&self) -> u64 {
        self.denominator
    }

    fn numerator(&self, worker: &WorkerId) -> u64 {
        self.numerators.get(worker).copied().unwrap_or(1)
    }
}

/// What a published round emits.
#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub round: Round,
    pub key_id: KeyId,
    pub model_delta: TensorSet,
    pub participant_count: usize,
    pub safety_summary: SafetySummary,
}

/// Ciphertext-free statistics published alongside the delta.
#[derive(Clone, Debug)]
pub struct SafetySummary {
    pub submitted_valid: usize,
    pub outliers_excluded: usize,
    pub delta_norm: f64,
    pub kl_divergence: f64,
    pub max_epsilon_reported: f64,
}

/// Synchronous submit verdicts surfaced to transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected { reason: String },
    /// The bounded receive queue is full; transport should retry (503).
    Backpressure,
}

// ============================================================================
// MAD filter
// ============================================================================

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Flag reporters whose value deviates from the median by more than
/// `k · MAD`. Returns a parallel `bool` vector (`true` = outlier).
///
/// With fewer than four reporters the MAD has no breakdown headroom (one
/// bad value owns the scale estimate), so no filtering happens.
pub fn mad_outliers(values: &[f64], k: f64) -> Vec<bool> {
    if values.len() < 4 {
        return vec![false; values.len()];
    }
    let med = median(&mut values.to_vec());
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    let mad = median(&mut deviations);
    values.iter().map(|v| (v - med).abs() > k * mad).collect()
}

// ============================================================================
// Aggregator
// ============================================================================

struct KeyProgress {
    active: bool,
    last_completed: Option<u64>,
}

/// The aggregation service. Cheap to share (`Arc`); all mutable state is
/// internal.
pub struct Aggregator {
    envelope: Arc<OperatingEnvelope>,
    schema: ParameterSchema,
    keys: Arc<dyn KeyProvider>,
    verifier: Arc<dyn PackageVerifier>,
    evidence: Arc<EvidenceLog>,
    thresholds: GateThresholds,
    seed: SeedContext,
    progress: Mutex<BTreeMap<KeyId, KeyProgress>>,
    states: Mutex<BTreeMap<(KeyId, u64), RoundState>>,
    published: Mutex<BTreeMap<(KeyId, u64), RoundOutcome>>,
    previous_delta: Mutex<Option<TensorSet>>,
}

const ACTOR: &str = "aggregator";

impl Aggregator {
    pub fn new(
        envelope: Arc<OperatingEnvelope>,
        schema: ParameterSchema,
        keys: Arc<dyn KeyProvider>,
        verifier: Arc<dyn PackageVerifier>,
        evidence: Arc<EvidenceLog>,
    ) -> Self {
        let thresholds = GateThresholds {
            min_success_rate: 0.0,
            max_kl_divergence: envelope.max_kl,
            max_delta_norm: envelope.max_delta_norm,
            require_monotone_loss: false,
        };
        Self {
            envelope,
            schema,
            keys,
            verifier,
            evidence,
            thresholds,
            seed: SeedContext::from_entropy(),
            progress: Mutex::new(BTreeMap::new()),
            states: Mutex::new(BTreeMap::new()),
            published: Mutex::new(BTreeMap::new()),
            previous_delta: Mutex::new(None),
        }
    }

    /// Override the evaluation-gate thresholds (defaults derive from the
    /// envelope's `max_kl` / `max_delta_norm`).
    pub fn with_gate_thresholds(mut self, thresholds: GateThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    fn set_state(&self, key_id: &KeyId, round: Round, state: RoundState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((key_id.clone(), round.0), state);
        tracing::info!(key_id = %key_id, round = round.0, ?state, "round state");
    }

    /// Control plane: current state of a round, if known.
    pub fn round_status(&self, key_id: &KeyId, round: Round) -> Option<RoundState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(key_id.clone(), round.0))
            .copied()
    }

    /// Control plane: the published delta for a round, if ready.
    pub fn model_delta(&self, key_id: &KeyId, round: Round) -> Option<TensorSet> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(key_id.clone(), round.0))
            .map(|o| o.model_delta.clone())
    }

    // ------------------------------------------------------------------
    // Package admission (receive-order checks i–vi)
    // ------------------------------------------------------------------

    /// Validate one submission against this round. Duplicates are tracked in
    /// `seen`. Returns the parsed package or a rejection reason string.
    pub fn admit(
        &self,
        round: Round,
        key_id: &KeyId,
        bytes: &[u8],
        seen: &mut BTreeSet<WorkerId>,
    ) -> Result<UpdatePackage, String> {
        // i–ii: structure.
        let package = UpdatePackage::parse(bytes).map_err(|e| e.to_string())?;
        // iii–iv: content hash, signature.
        package.verify(self.verifier.as_ref()).map_err(|e| e.to_string())?;
        // v: key binding and usability.
        if package.header.key_id != *key_id {
            return Err(format!(
                "package key `{}` does not match round key `{key_id}`",
                package.header.key_id
            ));
        }
        if package.header.round != round {
            return Err(format!(
                "package round {} does not match collecting round {round}",
                package.header.round
            ));
        }
        let material = self.keys.lookup(key_id).map_err(|e| e.to_string())?;
        if !material.metadata.can_decrypt() {
            return Err(format!("key `{key_id}` may not be used for decryption"));
        }
        // vi: envelope size ceiling.
        UpdatePackage::check_size(bytes.len(), self.envelope.max_update_size_kb)
            .map_err(|e| e.to_string())?;

        // Shape and derivation checks the sum relies on.
        let n_lwe = self.envelope.security_level().lwe_dimension();
        if package.payload.iter().any(|ct| ct.a.len() != n_lwe) {
            return Err(format!("ciphertext dimension differs from deployment n_lwe={n_lwe}"));
        }
        let worker = package.header.worker_id.clone();
        for (name, entry) in &package.manifest.compression_meta {
            let expected_len = self.schema.len_of(name).map_err(|e| e.to_string())?;
            if entry.n_elements as usize != expected_len {
                return Err(format!(
                    "parameter `{name}` declares {} elements, schema says {expected_len}",
                    entry.n_elements
                ));
            }
            if entry.bits != self.envelope.bits {
                return Err(format!(
                    "parameter `{name}` quantized at {} bits, envelope requires {}",
                    entry.bits, self.envelope.bits
                ));
            }
            if entry.indices.len() != entry.n_slots as usize {
                return Err(format!("parameter `{name}` index/slot count mismatch"));
            }
            let expected_k = sparsity_k(expected_len, self.envelope.sparsity_ratio);
            if entry.indices.len() != expected_k {
                return Err(format!(
                    "parameter `{name}` keeps {} coordinates, envelope ratio requires {expected_k}",
                    entry.indices.len()
                ));
            }
            // Rand-K indices must match the announced public derivation.
            let expected_indices = randk_indices(
                &worker,
                round,
                name,
                expected_len,
                entry.indices.len(),
            );
            if entry.indices != expected_indices {
                return Err(format!(
                    "parameter `{name}` index set does not match its Rand-K derivation"
                ));
            }
        }
        if package.payload.len() as u64 != package.manifest.total_slots() {
            return Err("payload slot count disagrees with manifest".into());
        }
        if package.payload.is_empty() {
            return Err("empty package carries no contribution".into());
        }

        // Duplicates by worker id.
        if !seen.insert(worker.clone()) {
            return Err(format!("duplicate submission from worker `{worker}`"));
        }
        Ok(package)
    }

    // ------------------------------------------------------------------
    // Synchronous aggregation core (quorum already established)
    // ------------------------------------------------------------------

    /// Run MAD filtering, the homomorphic sum, decryption, inverse
    /// compression, and the evaluation gate over already-admitted packages.
    pub fn aggregate_round(
        &self,
        round: Round,
        key_id: &KeyId,
        packages: Vec<UpdatePackage>,
        weights: &AggregationWeights,
    ) -> Result<RoundOutcome, AggregateError> {
        let quorum = self.envelope.quorum_threshold;
        if packages.len() < quorum {
            return self.fail(round, key_id, AggregateError::Quorum {
                valid: packages.len(),
                required: quorum,
            });
        }
        self.set_state(key_id, round, RoundState::QuorumReached);
        self.evidence.append(EventType::QuorumReached, ACTOR, &format!("round-{round}"))?;

        // MAD outlier rejection on reported pre-clip norms.
        let norms: Vec<f64> =
            packages.iter().map(|p| p.manifest.safety_stats.gradient_l2_pre_clip).collect();
        let flagged = mad_outliers(&norms, self.envelope.mad_k);
        let mut survivors = Vec::with_capacity(packages.len());
        let mut excluded = 0usize;
        for (package, outlier) in packages.into_iter().zip(&flagged) {
            if *outlier {
                excluded += 1;
                self.evidence.append(
                    EventType::OutlierExcluded,
                    ACTOR,
                    &format!("round-{round} worker-{}", package.header.worker_id),
                )?;
            } else {
                survivors.push(package);
            }
        }
        let valid_total = survivors.len() + excluded;
        if survivors.len() < quorum {
            return self.fail(round, key_id, AggregateError::Quorum {
                valid: survivors.len(),
                required: quorum,
            });
        }
        self.set_state(key_id, round, RoundState::Filtered);

        // Headroom guard: weighted code sums must stay below t.
        let total_weight: u64 =
            survivors.iter().map(|p| weights.numerator(&p.header.worker_id)).sum();
        let max_level = (1u64 << self.envelope.bits) - 1;
        if total_weight * max_level >= u64::from(PLAINTEXT_MODULUS) {
            let err = AggregateError::WeightOverflow {
                total_weight,
                bits: self.envelope.bits,
            };
            return self.fail(round, key_id, err);
        }

        // Homomorphic sum, grouped by dense coordinate.
        let params = CipherParams::new(self.envelope.security_level(), self.envelope.mu)?;
        let engine = N2heCipher::new(params, self.seed.clone());
        let summed = match self.sum_by_coordinate(&engine, &survivors, weights) {
            Ok(s) => s,
            Err(e) => return self.fail(round, key_id, e),
        };
        self.set_state(key_id, round, RoundState::Summed);
        self.evidence.append(EventType::RoundSummed, ACTOR, &format!("round-{round}"))?;

        // Decrypt and invert compression.
        let material = self.keys.lookup(key_id)?;
        let delta = match self.decrypt_and_reconstruct(&engine, &material.secret, summed) {
            Ok(d) => d,
            Err(e) => return self.fail(round, key_id, e),
        };
        self.set_state(key_id, round, RoundState::Decrypted);
        self.evidence.append(EventType::RoundDecrypted, ACTOR, &format!("round-{round}"))?;

        // Evaluation gate.
        let delta_norm = delta.l2_norm();
        let kl = {
            let previous = self.previous_delta.lock().unwrap_or_else(|e| e.into_inner());
            gate::kl_proxy(&delta, previous.as_ref())
        };
        let metrics = GateMetrics {
            success_rate: survivors.len() as f64 / valid_total as f64,
            kl_divergence: kl,
            delta_norm,
            loss: 0.0,
        };
        let decision = gate::evaluate(&metrics, None, &self.thresholds);
        self.set_state(key_id, round, RoundState::Gated);
        self.evidence.append(
            EventType::RoundGated,
            ACTOR,
            &format!("round-{round} passed={}", decision.passed),
        )?;
        if !decision.passed {
            return self.fail(round, key_id, AggregateError::Gate { failures: decision.failures });
        }

        // Publish.
        let max_epsilon_reported = survivors
            .iter()
            .map(|p| p.manifest.safety_stats.dp_epsilon_consumed)
            .fold(0.0f64, f64::max);
        let outcome = RoundOutcome {
            round,
            key_id: key_id.clone(),
            model_delta: delta.clone(),
            participant_count: survivors.len(),
            safety_summary: SafetySummary {
                submitted_valid: valid_total,
                outliers_excluded: excluded,
                delta_norm,
                kl_divergence: kl,
                max_epsilon_reported,
            },
        };
        *self.previous_delta.lock().unwrap_or_else(|e| e.into_inner()) = Some(delta);
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((key_id.clone(), round.0), outcome.clone());
        self.set_state(key_id, round, RoundState::Published);
        self.evidence.append(EventType::RoundPublished, ACTOR, &format!("round-{round}"))?;
        tracing::info!(
            round = round.0,
            participants = outcome.participant_count,
            delta_norm,
            "round published"
        );
        Ok(outcome)
    }

    fn fail(
        &self,
        round: Round,
        key_id: &KeyId,
        err: AggregateError,
    ) -> Result<RoundOutcome, AggregateError> {
        self.set_state(key_id, round, RoundState::Failed);
        self.evidence.append(
            EventType::RoundFailed,
            ACTOR,
            &format!("round-{round} kind={}", err.kind().as_str()),
        )?;
        tracing::warn!(round = round.0, error = %err, "round failed");
        Err(err)
    }

    /// Accumulate ciphertexts per `(parameter, dense index)`, applying
    /// integer weights by repeated addition (exactly associative mod q, so
    /// accumulation order is irrelevant).
    fn sum_by_coordinate(
        &self,
        engine: &N2heCipher,
        survivors: &[UpdatePackage],
        weights: &AggregationWeights,
    ) -> Result<BTreeMap<String, ParamAccumulator>, AggregateError> {
        let mut acc: BTreeMap<String, ParamAccumulator> = BTreeMap::new();
        for package in survivors {
            let numerator = weights.numerator(&package.header.worker_id);
            let mut cursor = 0usize;
            for (name, entry) in &package.manifest.compression_meta {
                let param = acc.entry(name.clone()).or_insert_with(|| ParamAccumulator {
                    n_elements: entry.n_elements,
                    slots: BTreeMap::new(),
                });
                for (&dense_idx, ct) in
                    entry.indices.iter().zip(&package.payload[cursor..cursor + entry.n_slots as usize])
                {
                    let slot = param.slots.entry(dense_idx).or_insert_with(SlotAcc::empty);
                    for _ in 0..numerator {
                        slot.ct = match &slot.ct {
                            None => Some(ct.clone()),
                            Some(existing) => Some(engine.add(existing, ct)?),
                        };
                    }
                    slot.weight += numerator;
                    slot.zp_weighted += numerator * u64::from(entry.zero_point);
                    slot.scale_weighted += numerator as f64 * entry.scale;
                }
                cursor += entry.n_slots as usize;
            }
        }
        Ok(acc)
    }

    /// Decrypt every accumulated coordinate (parallel across parameters) and
    /// divide by the per-coordinate contributor weight.
    fn decrypt_and_reconstruct(
        &self,
        engine: &N2heCipher,
        secret: &crate::cipher::SecretKey,
        summed: BTreeMap<String, ParamAccumulator>,
    ) -> Result<TensorSet, AggregateError> {
        let entries: Vec<(String, ParamAccumulator)> = summed.into_iter().collect();
        let mut results: Vec<Result<(String, Vec<f32>), AggregateError>> =
            Vec::with_capacity(entries.len());

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(entries.len());
            for (name, param) in entries {
                handles.push(scope.spawn(move || -> Result<(String, Vec<f32>), AggregateError> {
                    let mut dense = vec![0.0f32; param.n_elements as usize];
                    for (dense_idx, slot) in param.slots {
                        let ct = slot
                            .ct
                            .ok_or_else(|| AggregateError::Internal("empty slot".into()))?;
                        let q_sum = i64::from(engine.decrypt(secret, &ct)?);
                        let scale_avg = slot.scale_weighted / slot.weight as f64;
                        let value = (q_sum - slot.zp_weighted as i64) as f64 * scale_avg
                            / slot.weight as f64;
                        dense[dense_idx as usize] = value as f32;
                    }
                    Ok((name, dense))
                }));
            }
            for handle in handles {
                results.push(handle.join().unwrap_or_else(|_| {
                    Err(AggregateError::Internal("decryption worker panicked".into()))
                }));
            }
        });

        let mut delta = TensorSet::new();
        for result in results {
            let (name, dense) = result?;
            delta.insert(name, dense);
        }
        Ok(delta)
    }

    // ------------------------------------------------------------------
    // Async collection driver
    // ------------------------------------------------------------------

    /// Begin collecting a round. Submissions flow through the returned
    /// handle's bounded queue; at the deadline (or when the handle is
    /// finished) the round proceeds if quorum was reached and fails
    /// otherwise.
    pub fn start_round(
        self: &Arc<Self>,
        round: Round,
        key_id: KeyId,
        weights: AggregationWeights,
        collect_for: Duration,
        queue_capacity: usize,
    ) -> Result<RoundHandle, AggregateError> {
        {
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            let entry = progress
                .entry(key_id.clone())
                .or_insert(KeyProgress { active: false, last_completed: None });
            if entry.active {
                return Err(AggregateError::RoundBusy { key_id, round });
            }
            if let Some(last) = entry.last_completed {
                if round.0 <= last {
                    return Err(AggregateError::RoundOutOfOrder { key_id, got: round, last });
                }
            }
            entry.active = true;
        }

        self.set_state(&key_id, round, RoundState::Collecting);
        if let Err(e) = self.evidence.append(EventType::RoundCollecting, ACTOR, &format!("round-{round}")) {
            // Evidence is fail-closed; release the slot before surfacing.
            if let Some(entry) =
                self.progress.lock().unwrap_or_else(|p| p.into_inner()).get_mut(&key_id)
            {
                entry.active = false;
            }
            return Err(e.into());
        }

        let (tx, mut rx) = mpsc::channel::<SubmitMsg>(queue_capacity.max(1));
        let (result_tx, result_rx) = oneshot::channel();
        let aggregator = Arc::clone(self);

        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + collect_for;
            let quorum = aggregator.envelope.quorum_threshold;
            let mut seen: BTreeSet<WorkerId> = BTreeSet::new();
            let mut valid: Vec<UpdatePackage> = Vec::new();
            let mut quorum_announced = false;

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(SubmitMsg { bytes, reply }) => {
                            let outcome = match aggregator.admit(round, &key_id, &bytes, &mut seen) {
                                Ok(package) => {
                                    let digest = hex::encode(package.content_hash);
                                    if aggregator
                                        .evidence
                                        .append(EventType::PackageAccepted, ACTOR, &digest)
                                        .is_err()
                                    {
                                        // Evidence is fail-closed: stop accepting.
                                        break;
                                    }
                                    valid.push(package);
                                    SubmitOutcome::Accepted
                                }
                                Err(reason) => {
                                    let _ = aggregator.evidence.append(
                                        EventType::PackageRejected,
                                        ACTOR,
                                        &format!("round-{round} {reason}"),
                                    );
                                    SubmitOutcome::Rejected { reason }
                                }
                            };
                            if valid.len() >= quorum && !quorum_announced {
                                quorum_announced = true;
                                aggregator.set_state(&key_id, round, RoundState::QuorumReached);
                            }
                            let _ = reply.send(outcome);
                        }
                        // Handle dropped: submissions closed, flush what we have.
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
            rx.close();

            let result = if valid.len() >= quorum {
                let aggregator_for_sum = Arc::clone(&aggregator);
                let key_for_sum = key_id.clone();
                tokio::task::spawn_blocking(move || {
                    aggregator_for_sum.aggregate_round(round, &key_for_sum, valid, &weights)
                })
                .await
                .unwrap_or_else(|e| Err(AggregateError::Internal(e.to_string())))
            } else {
                aggregator.fail(round, &key_id, AggregateError::Quorum {
                    valid: valid.len(),
                    required: quorum,
                })
            };

            {
                let mut progress =
                    aggregator.progress.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = progress.get_mut(&key_id) {
                    entry.active = false;
                    entry.last_completed = Some(round.0);
                }
            }
            let _ = result_tx.send(result);
        });

        Ok(RoundHandle { tx, result: result_rx })
    }
}

struct ParamAccumulator {
    n_elements: u32,
    slots: BTreeMap<u32, SlotAcc>,
}

struct SlotAcc {
    ct: Option<Ciphertext>,
    weight: u64,
    zp_weighted: u64,
    scale_weighted: f64,
}

impl SlotAcc {
    fn empty() -> Self {
        Self { ct: None, weight: 0, zp_weighted: 0, scale_weighted: 0.0 }
    }
}

struct SubmitMsg {
    bytes: Vec<u8>,
    reply: oneshot::Sender<SubmitOutcome>,
}

/// Client handle for one collecting round.
pub struct RoundHandle {
    tx: mpsc::Sender<SubmitMsg>,
    result: oneshot::Receiver<Result<RoundOutcome, AggregateError>>,
}

impl RoundHandle {
    /// Submit a serialized package. `Backpressure` when the bounded queue is
    /// full — transport maps this to 503.
    pub async fn submit(&self, bytes: Vec<u8>) -> SubmitOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.tx.try_send(SubmitMsg { bytes, reply: reply_tx }) {
            Ok(()) => reply_rx
                .await
                .unwrap_or(SubmitOutcome::Rejected { reason: "round closed".into() }),
            Err(mpsc::error::TrySendError::Full(_)) => SubmitOutcome::Backpressure,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                SubmitOutcome::Rejected { reason: "round closed".into() }
            }
        }
    }

    /// Close submissions and wait for the round to publish or fail.
    pub async fn finish(self) -> Result<RoundOutcome, AggregateError> {
        drop(self.tx);
        self.result
            .await
            .unwrap_or_else(|_| Err(AggregateError::Internal("round driver dropped".into())))
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
    use crate::package::TrainingMeta;
    use crate::pipeline::{GradientPipeline, RoundInput};
    use crate::signer::FleetHmacSigner;
    use crate::tensor::{ExpertGradients, TensorSet};
    use tempfile::tempdir;

    const FLEET_KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

    fn schema() -> ParameterSchema {
        ParameterSchema::new([("p".to_string(), 4)]).unwrap()
    }

    fn envelope() -> OperatingEnvelope {
        OperatingEnvelope {
            clip_norm: 100.0,
            sparsity_ratio: 1.0,
            bits: 8,
            quorum_threshold: 3,
            epsilon_cap: 1000.0,
            max_delta_norm: 1000.0,
            max_kl: 1000.0,
            max_quality_mse: 1.0,
            ..OperatingEnvelope::default()
        }
    }

    struct Cluster {
        aggregator: Arc<Aggregator>,
        keys: Arc<MemoryProvider>,
        key_id: KeyId,
        envelope: Arc<OperatingEnvelope>,
        _evidence_dir: tempfile::TempDir,
        evidence: Arc<EvidenceLog>,
    }

    fn cluster(env: OperatingEnvelope) -> Cluster {
        let envelope = env.into_shared().unwrap();
        let evidence_dir = tempdir().unwrap();
        let evidence = Arc::new(EvidenceLog::open(evidence_dir.path()).unwrap());
        let keys = Arc::new(MemoryProvider::new(SeedContext::new([100; 32])));
        let key_id = keys.generate(SecurityLevel::Bits128, "fleet").unwrap();
        keys.activate(&key_id).unwrap();
        let verifier = Arc::new(FleetHmacSigner::new(*FLEET_KEY).unwrap());
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&envelope),
            schema(),
            Arc::clone(&keys) as Arc<dyn KeyProvider>,
            verifier,
            Arc::clone(&evidence),
        ));
        Cluster { aggregator, keys, key_id, envelope, _evidence_dir: evidence_dir, evidence }
    }

    fn seal_worker_package(
        cluster: &Cluster,
        worker: &str,
        seed: u8,
        values: Vec<f32>,
        round: u64,
    ) -> UpdatePackage {
        let mut set = TensorSet::new();
        set.insert("p", values);
        let mut experts = ExpertGradients::new();
        experts.insert("expert", 1.0, set);

        let signer = Arc::new(FleetHmacSigner::new(*FLEET_KEY).unwrap());
        let mut pipeline = GradientPipeline::new(
            WorkerId(worker.to_string()),
            Arc::clone(&cluster.envelope),
            schema(),
            SeedContext::new([seed; 32]),
            Arc::clone(&cluster.keys) as Arc<dyn KeyProvider>,
            signer,
        )
        .unwrap();
        pipeline
            .run_round(RoundInput {
                round: Round(round),
                key_id: cluster.key_id.clone(),
                experts,
                training: TrainingMeta {
                    learning_rate: 1e-3,
                    objective: "t".into(),
                    optimizer: "sgd".into(),
                    steps: 1,
                },
                timestamp_ms: 0,
            })
            .unwrap()
    }

    fn admit_all(cluster: &Cluster, round: u64, packages: &[UpdatePackage]) -> Vec<UpdatePackage> {
        let mut seen = BTreeSet::new();
        packages
            .iter()
            .map(|p| {
                cluster
                    .aggregator
                    .admit(Round(round), &cluster.key_id, &p.to_bytes().unwrap(), &mut seen)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn happy_path_three_workers_mean_recovery() {
        let cluster = cluster(envelope());
        let packages = vec![
            seal_worker_package(&cluster, "w-1", 1, vec![1.0, 2.0, 3.0, 4.0], 1),
            seal_worker_package(&cluster, "w-2", 2, vec![2.0, 2.0, 2.0, 2.0], 1),
            seal_worker_package(&cluster, "w-3", 3, vec![3.0, 0.0, 3.0, 0.0], 1),
        ];
        let admitted = admit_all(&cluster, 1, &packages);
        let outcome = cluster
            .aggregator
            .aggregate_round(Round(1), &cluster.key_id, admitted, &AggregationWeights::uniform())
            .unwrap();

        let expected = [2.0f64, 4.0 / 3.0, 8.0 / 3.0, 2.0];
        let delta = outcome.model_delta.get("p").unwrap();
        // Tolerance: the deployment grid spans ±clip_norm at 8 bits.
        let scale_avg = 200.0 / 255.0;
        for (got, want) in delta.iter().zip(expected) {
            assert!(
                (f64::from(*got) - want).abs() <= 3.0 * scale_avg,
                "got {got}, want {want}"
            );
        }
        assert_eq!(outcome.participant_count, 3);
        assert_eq!(outcome.safety_summary.outliers_excluded, 0);
        assert_eq!(
            cluster.aggregator.round_status(&cluster.key_id, Round(1)),
            Some(RoundState::Published)
        );
        assert!(cluster.aggregator.model_delta(&cluster.key_id, Round(1)).is_some());
        cluster.evidence.verify_chain().unwrap();
    }

    #[test]
    fn mad_filter_excludes_the_norm_outlier() {
        let env = OperatingEnvelope { quorum_threshold: 3, ..envelope() };
        let cluster = cluster(env);
        let mut packages = vec![
            seal_worker_package(&cluster, "w-1", 1, vec![1.0, 2.0, 3.0, 4.0], 1),
            seal_worker_package(&cluster, "w-2", 2, vec![2.0, 2.0, 2.0, 2.0], 1),
            seal_worker_package(&cluster, "w-3", 3, vec![3.0, 0.0, 3.0, 0.0], 1),
        ];
        // A fourth reporter with an absurd pre-clip norm. Clipping rescales
        // its values, but the reported norm is what the filter sees.
        packages.push(seal_worker_package(&cluster, "w-4", 4, vec![1e6, 0.0, 0.0, 0.0], 1));

        let admitted = admit_all(&cluster, 1, &packages);
        let outcome = cluster
            .aggregator
            .aggregate_round(Round(1), &cluster.key_id, admitted, &AggregationWeights::uniform())
            .unwrap();

        assert_eq!(outcome.participant_count, 3);
        assert_eq!(outcome.safety_summary.outliers_excluded, 1);
        // The surviving aggregate matches the three-worker case.
        let expected = [2.0f64, 4.0 / 3.0, 8.0 / 3.0, 2.0];
        let delta = outcome.model_delta.get("p").unwrap();
        let scale_avg = 200.0 / 255.0;
        for (got, want) in delta.iter().zip(expected) {
            assert!((f64::from(*got) - want).abs() <= 3.0 * scale_avg);
        }
        assert_eq!(
            cluster.evidence.events_by_type(EventType::OutlierExcluded).unwrap().len(),
            1
        );
    }

    #[test]
    fn quorum_is_refused_below_threshold() {
        let cluster = cluster(envelope());
        let packages =
            vec![seal_worker_package(&cluster, "w-1", 1, vec![1.0, 2.0, 3.0, 4.0], 1)];
        let admitted = admit_all(&cluster, 1, &packages);
        match cluster.aggregator.aggregate_round(
            Round(1),
            &cluster.key_id,
            admitted,
            &AggregationWeights::uniform(),
        ) {
            Err(AggregateError::Quorum { valid: 1, required: 3 }) => {}
            other => panic!("expected quorum failure, got {other:?}"),
        }
        assert_eq!(
            cluster.aggregator.round_status(&cluster.key_id, Round(1)),
            Some(RoundState::Failed)
        );
    }

    #[test]
    fn duplicate_and_tampered_submissions_are_rejected() {
        let cluster = cluster(envelope());
        let package = seal_worker_package(&cluster, "w-1", 1, vec![1.0, 2.0, 3.0, 4.0], 1);
        let bytes = package.to_bytes().unwrap();
        let mut seen = BTreeSet::new();

        cluster.aggregator.admit(Round(1), &cluster.key_id, &bytes, &mut seen).unwrap();
        // Same worker again.
        let dup = cluster.aggregator.admit(Round(1), &cluster.key_id, &bytes, &mut seen);
        assert!(dup.unwrap_err().contains("duplicate"));

        // Wrong round.
        let wrong_round = cluster.aggregator.admit(Round(2), &cluster.key_id, &bytes, &mut seen);
        assert!(wrong_round.unwrap_err().contains("round"));

        // Bit flip in the payload region.
        let mut tampered = bytes.clone();
        let mid = tampered.len() / 2;
        tampered[mid] ^= 0x40;
        let bad = cluster.aggregator.admit(Round(1), &cluster.key_id, &tampered, &mut BTreeSet::new());
        assert!(bad.is_err());
    }

    #[test]
    fn weighted_aggregation_shifts_the_mean() {
        let cluster = cluster(envelope());
        let packages = vec![
            seal_worker_package(&cluster, "w-1", 1, vec![0.0, 6.0, 0.0, 0.0], 1),
            seal_worker_package(&cluster, "w-2", 2, vec![3.0, 3.0, 3.0, 3.0], 1),
            seal_worker_package(&cluster, "w-3", 3, vec![3.0, 3.0, 3.0, 3.0], 1),
        ];
        let admitted = admit_all(&cluster, 1, &packages);

        // Weight w-1 three times as heavily as the others (numerators 3,1,1
        // over a common denominator of 5):
        //   coordinate 1: (3·6 + 3 + 3)/5 = 4.8, elsewhere (0 + 3 + 3)/5 = 1.2.
        let mut numerators = BTreeMap::new();
        numerators.insert(WorkerId("w-1".into()), 3u64);
        let weights = AggregationWeights::new(numerators, 5).unwrap();
        assert_eq!(weights.denominator(), 5);
        let outcome = cluster
            .aggregator
            .aggregate_round(Round(1), &cluster.key_id, admitted, &weights)
            .unwrap();
        let delta = outcome.model_delta.get("p").unwrap();
        let expected = [1.2f64, 4.8, 1.2, 1.2];
        // Half a grid step of tolerance.
        for (&v, want) in delta.iter().zip(expected) {
            assert!((f64::from(v) - want).abs() < 0.4, "got {v}, want {want}");
        }
    }

    #[test]
    fn gate_failure_fails_the_round() {
        let env = OperatingEnvelope { max_delta_norm: 1e-6, ..envelope() };
        let cluster = cluster(env);
        let packages = vec![
            seal_worker_package(&cluster, "w-1", 1, vec![1.0, 2.0, 3.0, 4.0], 1),
            seal_worker_package(&cluster, "w-2", 2, vec![2.0, 2.0, 2.0, 2.0], 1),
            seal_worker_package(&cluster, "w-3", 3, vec![3.0, 0.0, 3.0, 0.0], 1),
        ];
        let admitted = admit_all(&cluster, 1, &packages);
        match cluster.aggregator.aggregate_round(
            Round(1),
            &cluster.key_id,
            admitted,
            &AggregationWeights::uniform(),
        ) {
            Err(AggregateError::Gate { failures }) => {
                assert!(failures
                    .iter()
                    .any(|f| matches!(f, GateFailure::DeltaNormAboveMaximum { .. })));
            }
            other => panic!("expected gate failure, got {other:?}"),
        }
    }

    #[test]
    fn single_worker_roundtrip_preserves_kept_coordinates() {
        // A random gradient drawn under a fixed seed, clipped at 1.0,
        // sparsified at ρ=0.01, quantized at 8 bits, encrypted, summed
        // (n=1), decrypted, dequantized: per-element error within the
        // envelope's MSE bound on every kept coordinate.
        use rand::Rng as _;

        let env = OperatingEnvelope {
            clip_norm: 1.0,
            sparsity_ratio: 0.01,
            bits: 8,
            quorum_threshold: 1,
            epsilon_cap: 10.0,
            max_delta_norm: 1000.0,
            max_kl: 1000.0,
            ..OperatingEnvelope::default()
        };
        let big_schema = ParameterSchema::new([("p".to_string(), 1000)]).unwrap();

        let envelope = env.into_shared().unwrap();
        let evidence_dir = tempdir().unwrap();
        let evidence = Arc::new(EvidenceLog::open(evidence_dir.path()).unwrap());
        let keys = Arc::new(MemoryProvider::new(SeedContext::new([42; 32])));
        let key_id = keys.generate(SecurityLevel::Bits128, "fleet").unwrap();
        keys.activate(&key_id).unwrap();
        let verifier = Arc::new(FleetHmacSigner::new(*FLEET_KEY).unwrap());
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&envelope),
            big_schema.clone(),
            Arc::clone(&keys) as Arc<dyn KeyProvider>,
            Arc::clone(&verifier) as Arc<dyn crate::signer::PackageVerifier>,
            Arc::clone(&evidence),
        ));

        // Deterministic "random" gradient under seed 42.
        let mut rng = SeedContext::new([42; 32])
            .substream(crate::csprng::StreamTag::RandKIndices, &[b"roundtrip-gradient"]);
        let values: Vec<f32> = (0..1000).map(|_| rng.gen_range(-0.05f32..0.05)).collect();
        let mut set = TensorSet::new();
        set.insert("p", values.clone());
        let mut experts = ExpertGradients::new();
        experts.insert("e", 1.0, set);

        let signer = Arc::new(FleetHmacSigner::new(*FLEET_KEY).unwrap());
        let mut pipeline = GradientPipeline::new(
            WorkerId("w-rt".into()),
            Arc::clone(&envelope),
            big_schema,
            SeedContext::new([42; 32]),
            Arc::clone(&keys) as Arc<dyn KeyProvider>,
            signer,
        )
        .unwrap();
        let package = pipeline
            .run_round(RoundInput {
                round: Round(1),
                key_id: key_id.clone(),
                experts,
                training: TrainingMeta {
                    learning_rate: 1e-3,
                    objective: "t".into(),
                    optimizer: "sgd".into(),
                    steps: 1,
                },
                timestamp_ms: 0,
            })
            .unwrap();
        assert_eq!(package.payload.len(), 10); // ⌈0.01·1000⌉

        let mut seen = BTreeSet::new();
        let admitted = aggregator
            .admit(Round(1), &key_id, &package.to_bytes().unwrap(), &mut seen)
            .unwrap();
        let kept = admitted.manifest.compression_meta["p"].indices.clone();
        let clip_factor = admitted.manifest.safety_stats.clip_norm_applied;
        let outcome = aggregator
            .aggregate_round(Round(1), &key_id, vec![admitted], &AggregationWeights::uniform())
            .unwrap();

        let delta = outcome.model_delta.get("p").unwrap();
        let mut squared_error = 0.0f64;
        for &idx in &kept {
            let want = f64::from(values[idx as usize]) * clip_factor;
            let got = f64::from(delta[idx as usize]);
            squared_error += (got - want).powi(2);
        }
        assert!(squared_error / kept.len() as f64 <= 0.05, "mse {squared_error}");
        // Untouched coordinates stay exactly zero.
        for (i, &v) in delta.iter().enumerate() {
            if !kept.contains(&(i as u32)) {
                assert_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn mad_math_matches_the_definition() {
        // Median 4, deviations [3,1,0,1,3], MAD 1.
        let values = [1.0, 3.0, 4.0, 5.0, 7.0];
        assert_eq!(mad_outliers(&values, 3.0), vec![false; 5]);
        // Add an outlier far past 3·MAD.
        let with_outlier = [1.0, 3.0, 4.0, 5.0, 7.0, 1e6];
        let flags = mad_outliers(&with_outlier, 3.0);
        assert!(flags[5]);
        assert_eq!(&flags[..5], &[false; 5]);
        // Below four reporters the scale estimate is untrustworthy: no
        // filtering, even with an extreme value present.
        assert_eq!(mad_outliers(&[1.0, 1e9], 3.0), vec![false, false]);
        assert_eq!(mad_outliers(&[1.0, 2.0, 1e9], 3.0), vec![false; 3]);
    }

    #[tokio::test]
    async fn async_round_collects_submits_and_publishes() {
        let cluster = cluster(envelope());
        let packages = vec![
            seal_worker_package(&cluster, "w-1", 1, vec![1.0, 2.0, 3.0, 4.0], 1),
            seal_worker_package(&cluster, "w-2", 2, vec![2.0, 2.0, 2.0, 2.0], 1),
            seal_worker_package(&cluster, "w-3", 3, vec![3.0, 0.0, 3.0, 0.0], 1),
        ];

        let handle = cluster
            .aggregator
            .start_round(
                Round(1),
                cluster.key_id.clone(),
                AggregationWeights::uniform(),
                Duration::from_secs(30),
                16,
            )
            .unwrap();

        // A second round on the same key is refused while this one runs.
        assert!(matches!(
            cluster.aggregator.start_round(
                Round(2),
                cluster.key_id.clone(),
                AggregationWeights::uniform(),
                Duration::from_secs(1),
                4,
            ),
            Err(AggregateError::RoundBusy { .. })
        ));

        for p in &packages {
            assert_eq!(handle.submit(p.to_bytes().unwrap()).await, SubmitOutcome::Accepted);
        }
        // Garbage is rejected without affecting the round.
        assert!(matches!(
            handle.submit(vec![0u8; 16]).await,
            SubmitOutcome::Rejected { .. }
        ));

        let outcome = handle.finish().await.unwrap();
        assert_eq!(outcome.participant_count, 3);
        assert_eq!(
            cluster.aggregator.round_status(&cluster.key_id, Round(1)),
            Some(RoundState::Published)
        );

        // Rounds must move strictly forward per key.
        assert!(matches!(
            cluster.aggregator.start_round(
                Round(1),
                cluster.key_id.clone(),
                AggregationWeights::uniform(),
                Duration::from_secs(1),
                4,
            ),
            Err(AggregateError::RoundOutOfOrder { .. })
        ));
    }

    #[tokio::test]
    async fn deadline_without_quorum_fails_the_round() {
        let cluster = cluster(envelope());
        let package = seal_worker_package(&cluster, "w-1", 1, vec![1.0, 2.0, 3.0, 4.0], 1);

        let handle = cluster
            .aggregator
            .start_round(
                Round(1),
                cluster.key_id.clone(),
                AggregationWeights::uniform(),
                Duration::from_millis(200),
                4,
            )
            .unwrap();
        assert_eq!(handle.submit(package.to_bytes().unwrap()).await, SubmitOutcome::Accepted);

        match handle.finish().await {
            Err(AggregateError::Quorum { valid: 1, required: 3 }) => {}
            other => panic!("expected quorum failure, got {other:?}"),
        }
        assert_eq!(
            cluster.aggregator.round_status(&cluster.key_id, Round(1)),
            Some(RoundState::Failed)
        );
        // The next round may proceed after the failure.
        let next = cluster
            .aggregator
            .start_round(
                Round(2),
                cluster.key_id.clone(),
                AggregationWeights::uniform(),
                Duration::from_millis(50),
                4,
            )
            .unwrap();
        let _ = next.finish().await;
    }
}
