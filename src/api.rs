//! Ergonomic crate surface
//!
//! This module wraps the protocol core with a small, builder-style API:
//! - `WorkerBuilder` / `AggregatorBuilder` hide envelope/keystore/evidence
//!   wiring (safe defaults)
//! - `Worker` serializes consecutive rounds of one worker behind a mutex
//! - `io::write_package` / `io::read_package` for file-backed exchange
//! - `telemetry::init` for tracing subscriber setup (the core never installs
//!   a global subscriber itself)
//!
//! Everything delegates to the existing modules; no protocol behavior lives
//! here.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;

use crate::aggregator::Aggregator;
use crate::csprng::SeedContext;
use crate::envelope::OperatingEnvelope;
use crate::evidence::EvidenceLog;
use crate::gate::GateThresholds;
use crate::keystore::KeyProvider;
use crate::package::UpdatePackage;
use crate::pipeline::{GradientPipeline, RoundInput};
use crate::signer::{PackageSigner, PackageVerifier};
use crate::tensor::ParameterSchema;
use crate::WorkerId;

// ===============================================================================================
// Telemetry
// ===============================================================================================

pub mod telemetry {
    //! Subscriber bootstrap for embedding processes.

    use tracing_subscriber::EnvFilter;

    /// Install a plain-text subscriber honoring `RUST_LOG`. Safe to call
    /// more than once; later calls are no-ops.
    pub fn init() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    /// Install a JSON-lines subscriber honoring `RUST_LOG` (service
    /// deployments).
    pub fn init_json() {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }
}

// ===============================================================================================
// Worker
// ===============================================================================================

/// Ergonomic constructor for a worker-side pipeline.
pub struct WorkerBuilder {
    worker_id: WorkerId,
    envelope: OperatingEnvelope,
    schema: ParameterSchema,
    keys: Arc<dyn KeyProvider>,
    signer: Arc<dyn PackageSigner>,
    seed: Option<SeedContext>,
    evidence: Option<Arc<EvidenceLog>>,
}

impl WorkerBuilder {
    pub fn new(
        worker_id: WorkerId,
        envelope: OperatingEnvelope,
        schema: ParameterSchema,
        keys: Arc<dyn KeyProvider>,
        signer: Arc<dyn PackageSigner>,
    ) -> Self {
        Self { worker_id, envelope, schema, keys, signer, seed: None, evidence: None }
    }

    /// Explicit seed (deployments pin this; tests rely on it for
    /// reproducibility). Defaults to OS entropy.
    pub fn seed(mut self, seed: SeedContext) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Record worker-side evidence into `log`.
    pub fn evidence(mut self, log: Arc<EvidenceLog>) -> Self {
        self.evidence = Some(log);
        self
    }

    pub fn build(self) -> anyhow::Result<Worker> {
        let envelope = self.envelope.into_shared().context("operating envelope invalid")?;
        let seed = self.seed.unwrap_or_else(SeedContext::from_entropy);
        let mut pipeline = GradientPipeline::new(
            self.worker_id,
            envelope,
            self.schema,
            seed,
            self.keys,
            self.signer,
        )
        .context("pipeline construction failed")?;
        if let Some(log) = self.evidence {
            pipeline = pipeline.with_evidence(log);
        }
        Ok(Worker { pipeline: Mutex::new(pipeline) })
    }
}

/// A worker with its round pipeline behind a mutex: two rounds of the same
/// worker can never run concurrently, which is what keeps the error-feedback
/// memory single-writer.
pub struct Worker {
    pipeline: Mutex<GradientPipeline>,
}

impl Worker {
    /// Run one round to a sealed package.
    pub fn run_round(&self, input: RoundInput) -> anyhow::Result<UpdatePackage> {
        let mut pipeline = self.pipeline.lock().unwrap_or_else(|e| e.into_inner());
        pipeline.run_round(input).context("round failed")
    }

    /// Remaining ε under the cap.
    pub fn epsilon_remaining(&self) -> f64 {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner()).accountant().remaining()
    }
}

// ===============================================================================================
// Aggregator
// ===============================================================================================

/// Ergonomic constructor for the aggregation service.
pub struct AggregatorBuilder {
    envelope: OperatingEnvelope,
    schema: ParameterSchema,
    keys: Arc<dyn KeyProvider>,
    verifier: Arc<dyn PackageVerifier>,
    evidence: Option<Arc<EvidenceLog>>,
    thresholds: Option<GateThresholds>,
}

impl AggregatorBuilder {
    pub fn new(
        envelope: OperatingEnvelope,
        schema: ParameterSchema,
        keys: Arc<dyn KeyProvider>,
        verifier: Arc<dyn PackageVerifier>,
    ) -> Self {
        Self { envelope, schema, keys, verifier, evidence: None, thresholds: None }
    }

    /// Use an already-open evidence log.
    pub fn evidence(mut self, log: Arc<EvidenceLog>) -> Self {
        self.evidence = Some(log);
        self
    }

    /// Override gate thresholds (defaults derive from the envelope).
    pub fn gate_thresholds(mut self, thresholds: GateThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Build, opening the evidence log under `evidence_dir` when none was
    /// supplied explicitly.
    pub fn build(self, evidence_dir: impl AsRef<Path>) -> anyhow::Result<Arc<Aggregator>> {
        let envelope = self.envelope.into_shared().context("operating envelope invalid")?;
        let evidence = match self.evidence {
            Some(log) => log,
            None => Arc::new(
                EvidenceLog::open(evidence_dir).context("opening evidence log failed")?,
            ),
        };
        let mut aggregator =
            Aggregator::new(envelope, self.schema, self.keys, self.verifier, evidence);
        if let Some(thresholds) = self.thresholds {
            aggregator = aggregator.with_gate_thresholds(thresholds);
        }
        Ok(Arc::new(aggregator))
    }
}

// ===============================================================================================
// Package file I/O
// ===============================================================================================

pub mod io {
    //! File-backed package exchange for transports that stage to disk.

    use super::*;

    /// Write a sealed package to `path`.
    pub fn write_package(path: &Path, package: &UpdatePackage) -> anyhow::Result<()> {
        let bytes = package.to_bytes().context("serialize package")?;
        std::fs::write(path, bytes)
            .with_context(|| format!("write package to {}", path.display()))?;
        Ok(())
    }

    /// Read and structurally parse a package from `path`. Cryptographic
    /// verification is still the receiver's job.
    pub fn read_package(path: &Path) -> anyhow::Result<UpdatePackage> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read package from {}", path.display()))?;
        UpdatePackage::parse(&bytes).context("parse package")
    }
}

// ===============================================================================================
// Tests
// ===============================================================================================
