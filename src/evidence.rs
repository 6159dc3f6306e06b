//! Evidence log — hash-chained, append-only, durable
//!
//! Every state transition at the worker and the aggregator lands here as one
//! JSON line. Each event binds its predecessor:
//!
//! ```text
//! event_hash = H(seq ∥ ts ∥ type ∥ actor ∥ subject ∥ prev_hash)
//! chain_hash = H(prev_hash ∥ event_hash)
//! prev_hash  = previous event's chain_hash (genesis: 32 zero bytes)
//! ```
//!
//! Hashing is BLAKE3 with explicit domain separation and length-delimited
//! string fields, so no two field layouts can collide. Appends are durable
//! (`sync_data`) before they return, and a companion `.idx` file of
//! big-endian byte offsets gives O(1) seek by sequence number.
//!
//! Writes serialize through a mutex; readers use their own file handles and
//! a shared read-lock over the offset index, so they never block the writer.
//! A failed chain verification **poisons** the log: further appends are
//! refused until an operator acknowledges the failure. Fail closed.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::{Classify, Digest32, ErrorKind};

const LOG_FILE: &str = "evidence.log";
const IDX_FILE: &str = "evidence.idx";

/// Errors surfaced by the evidence log.
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    /// Underlying file I/O failed; retry may help once the disk condition
    /// clears.
    #[error("evidence I/O: {0}")]
    Io(#[from] std::io::Error),
    /// The chain does not verify at `sequence`.
    #[error("evidence chain mismatch at seq {sequence}: expected {expected}, actual {actual}")]
    ChainMismatch {
        /// First sequence number whose hashes do not recompute.
        sequence: u64,
        /// Hex of the recomputed (expected) hash.
        expected: String,
        /// Hex of the stored (actual) hash.
        actual: String,
    },
    /// A prior integrity failure halted the log; appends are refused until
    /// the failure is acknowledged by an operator.
    #[error("evidence log is halted after an integrity failure")]
    WriteHalted,
    /// The requested sequence number is not in the log.
    #[error("unknown evidence sequence {seq}")]
    UnknownSequence {
        /// The missing sequence number.
        seq: u64,
    },
    /// A stored line does not parse as an evidence record.
    #[error("corrupt evidence record at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number in the log file.
        line: u64,
        /// Parse failure detail.
        reason: String,
    },
}

impl Classify for EvidenceError {
    fn kind(&self) -> ErrorKind {
        match self {
            EvidenceError::Io(_) => ErrorKind::Resource,
            EvidenceError::UnknownSequence { .. } => ErrorKind::Validation,
            _ => ErrorKind::Integrity,
        }
    }
}

/// Everything the pipeline and aggregator record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum EventType {
    // Worker side
    PackageSealed,
    PipelineFailed,
    BudgetHalted,
    // Aggregator side
    PackageAccepted,
    PackageRejected,
    RoundCollecting,
    QuorumReached,
    OutlierExcluded,
    RoundSummed,
    RoundDecrypted,
    RoundGated,
    RoundPublished,
    RoundFailed,
    // Key lifecycle
    KeyGenerated,
    KeyActivated,
    KeyRotated,
    KeyRevoked,
    KeyExpired,
}

impl EventType {
    /// Stable wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PackageSealed => "package_sealed",
            EventType::PipelineFailed => "pipeline_failed",
            EventType::BudgetHalted => "budget_halted",
            EventType::PackageAccepted => "package_accepted",
            EventType::PackageRejected => "package_rejected",
            EventType::RoundCollecting => "round_collecting",
            EventType::QuorumReached => "quorum_reached",
            EventType::OutlierExcluded => "outlier_excluded",
            EventType::RoundSummed => "round_summed",
            EventType::RoundDecrypted => "round_decrypted",
            EventType::RoundGated => "round_gated",
            EventType::RoundPublished => "round_published",
            EventType::RoundFailed => "round_failed",
            EventType::KeyGenerated => "key_generated",
            EventType::KeyActivated => "key_activated",
            EventType::KeyRotated => "key_rotated",
            EventType::KeyRevoked => "key_revoked",
            EventType::KeyExpired => "key_expired",
        }
    }
}

/// One appended event, hashes included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvidenceEvent {
    /// Strictly increasing, starting at 1.
    pub seq: u64,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    /// Wire label of the event type.
    pub event_type: String,
    /// Initiating party (worker id, aggregator id, key provider).
    pub actor: String,
    /// Acted-upon entity (package digest, round, key id).
    pub subject: String,
    /// Previous event's chain hash (zero for genesis).
    pub prev_hash: Digest32,
    /// `H(seq ∥ ts ∥ type ∥ actor ∥ subject ∥ prev_hash)`.
    pub event_hash: Digest32,
    /// `H(prev_hash ∥ event_hash)`.
    pub chain_hash: Digest32,
}

/// Persisted JSON shape: one object per line, digests in hex.
#[derive(Serialize, Deserialize)]
struct EventRecord {
    seq: u64,
    ts: i64,
    #[serde(rename = "type")]
    kind: String,
    actor: String,
    subject: String,
    prev_hash_hex: String,
    event_hash_hex: String,
    chain_hash_hex: String,
}

fn hash_event(seq: u64, ts: i64, kind: &str, actor: &str, subject: &str, prev: &Digest32) -> Digest32 {
    let mut h = blake3::Hasher::new_derive_key("tensorguard.evidence.v1.event");
    h.update(&seq.to_be_bytes());
    h.update(&ts.to_be_bytes());
    for field in [kind, actor, subject] {
        h.update(&(field.len() as u64).to_be_bytes());
        h.update(field.as_bytes());
    }
    h.update(prev);
    *h.finalize().as_bytes()
}

fn hash_chain(prev: &Digest32, event_hash: &Digest32) -> Digest32 {
    let mut h = blake3::Hasher::new_derive_key("tensorguard.evidence.v1.chain");
    h.update(prev);
    h.update(event_hash);
    *h.finalize().as_bytes()
}

fn decode_digest(hex_str: &str, line: u64) -> Result<Digest32, EvidenceError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| EvidenceError::Corrupt { line, reason: format!("bad hex digest: {e}") })?;
    bytes.try_into().map_err(|_| EvidenceError::Corrupt {
        line,
        reason: "digest is not 32 bytes".to_string(),
    })
}

impl EvidenceEvent {
    fn to_record(&self) -> EventRecord {
        EventRecord {
            seq: self.seq,
            ts: self.ts,
            kind: self.event_type.clone(),
            actor: self.actor.clone(),
            subject: self.subject.clone(),
            prev_hash_hex: hex::encode(self.prev_hash),
            event_hash_hex: hex::encode(self.event_hash),
            chain_hash_hex: hex::encode(self.chain_hash),
        }
    }

    fn from_record(record: EventRecord, line: u64) -> Result<Self, EvidenceError> {
        Ok(Self {
            seq: record.seq,
            ts: record.ts,
            event_type: record.kind,
            actor: record.actor,
            subject: record.subject,
            prev_hash: decode_digest(&record.prev_hash_hex, line)?,
            event_hash: decode_digest(&record.event_hash_hex, line)?,
            chain_hash: decode_digest(&record.chain_hash_hex, line)?,
        })
    }
}

// ============================================================================
// Log
// ============================================================================

struct WriterState {
    log: File,
    idx: File,
    next_seq: u64,
    last_chain: Digest32,
    next_offset: u64,
    halted: bool,
}

/// The append-only evidence store. Shared freely; appends serialize through
/// the internal writer mutex.
pub struct EvidenceLog {
    dir: PathBuf,
    writer: Mutex<WriterState>,
    // seq n lives at offsets[n − 1]; readers take the read lock only.
    offsets: RwLock<Vec<u64>>,
    by_type: RwLock<BTreeMap<String, Vec<u64>>>,
}

impl std::fmt::Debug for EvidenceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceLog").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl EvidenceLog {
    /// Open (or create) the log in `dir`. Existing events are replayed to
    /// restore the chain head and rebuild the in-memory indexes; the `.idx`
    /// companion is rebuilt if missing or short.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, EvidenceError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let log_path = dir.join(LOG_FILE);
        let idx_path = dir.join(IDX_FILE);

        let mut offsets = Vec::new();
        let mut by_type: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut next_seq = 1u64;
        let mut last_chain = [0u8; 32];
        let mut next_offset = 0u64;

        if log_path.exists() {
            let reader = BufReader::new(File::open(&log_path)?);
            let mut line_no = 0u64;
            for line in reader.lines() {
                let line = line?;
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let record: EventRecord = serde_json::from_str(&line).map_err(|e| {
                    EvidenceError::Corrupt { line: line_no, reason: e.to_string() }
                })?;
                let event = EvidenceEvent::from_record(record, line_no)?;
                offsets.push(next_offset);
                by_type.entry(event.event_type.clone()).or_default().push(event.seq);
                next_offset += line.len() as u64 + 1;
                next_seq = event.seq + 1;
                last_chain = event.chain_hash;
            }
        }

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let mut idx = OpenOptions::new().create(true).write(true).open(&idx_path)?;
        // Rewrite the index wholesale when it disagrees with the replay.
        let expected_idx_len = offsets.len() as u64 * 8;
        if idx.metadata()?.len() != expected_idx_len {
            idx.set_len(0)?;
            idx.seek(SeekFrom::Start(0))?;
            for off in &offsets {
                idx.write_all(&off.to_be_bytes())?;
            }
            idx.sync_data()?;
        } else {
            idx.seek(SeekFrom::End(0))?;
        }

        Ok(Self {
            dir,
            writer: Mutex::new(WriterState {
                log,
                idx,
                next_seq,
                last_chain,
                next_offset,
                halted: false,
            }),
            offsets: RwLock::new(offsets),
            by_type: RwLock::new(by_type),
        })
    }

    /// Append one event. Durable (log fsynced) before returning.
    pub fn append(
        &self,
        event_type: EventType,
        actor: &str,
        subject: &str,
    ) -> Result<EvidenceEvent, EvidenceError> {
        let ts = chrono::Utc::now().timestamp_millis();
        let mut w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if w.halted {
            return Err(EvidenceError::WriteHalted);
        }

        let seq = w.next_seq;
        let prev_hash = w.last_chain;
        let kind = event_type.as_str();
        let event_hash = hash_event(seq, ts, kind, actor, subject, &prev_hash);
        let chain_hash = hash_chain(&prev_hash, &event_hash);
        let event = EvidenceEvent {
            seq,
            ts,
            event_type: kind.to_string(),
            actor: actor.to_string(),
            subject: subject.to_string(),
            prev_hash,
            event_hash,
            chain_hash,
        };

        let mut line = serde_json::to_string(&event.to_record())
            .map_err(|e| EvidenceError::Corrupt { line: seq, reason: e.to_string() })?;
        line.push('\n');

        let offset = w.next_offset;
        w.log.write_all(line.as_bytes())?;
        w.log.sync_data()?;
        w.idx.write_all(&offset.to_be_bytes())?;
        w.idx.sync_data()?;

        w.next_offset += line.len() as u64;
        w.next_seq += 1;
        w.last_chain = chain_hash;
        drop(w);

        self.offsets.write().unwrap_or_else(|e| e.into_inner()).push(offset);
        self.by_type
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind.to_string())
            .or_default()
            .push(seq);

        tracing::debug!(seq, kind, actor, subject, "evidence appended");
        Ok(event)
    }

    /// Number of events in the log.
    pub fn len(&self) -> usize {
        self.offsets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch one event by sequence number via the offset index.
    pub fn read(&self, seq: u64) -> Result<EvidenceEvent, EvidenceError> {
        let offset = {
            let offsets = self.offsets.read().unwrap_or_else(|e| e.into_inner());
            if seq == 0 || seq as usize > offsets.len() {
                return Err(EvidenceError::UnknownSequence { seq });
            }
            offsets[(seq - 1) as usize]
        };
        let mut file = File::open(self.dir.join(LOG_FILE))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line)?;
        let record: EventRecord = serde_json::from_str(line.trim_end())
            .map_err(|e| EvidenceError::Corrupt { line: seq, reason: e.to_string() })?;
        EvidenceEvent::from_record(record, seq)
    }

    /// All events of a given type, in append order.
    pub fn events_by_type(&self, event_type: EventType) -> Result<Vec<EvidenceEvent>, EvidenceError> {
        let seqs: Vec<u64> = self
            .by_type
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type.as_str())
            .cloned()
            .unwrap_or_default();
        seqs.into_iter().map(|s| self.read(s)).collect()
    }

    /// Walk the whole chain from genesis, recomputing every hash.
    ///
    /// On the first mismatch the log is **halted** (appends refused) and the
    /// offending `(sequence, expected, actual)` triple is returned.
    pub fn verify_chain(&self) -> Result<(), EvidenceError> {
        let result = self.verify_chain_inner();
        if matches!(result, Err(EvidenceError::ChainMismatch { .. })) {
            self.writer.lock().unwrap_or_else(|e| e.into_inner()).halted = true;
        }
        result
    }

    fn verify_chain_inner(&self) -> Result<(), EvidenceError> {
        let file = match File::open(self.dir.join(LOG_FILE)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut expected_prev = [0u8; 32];
        let mut expected_seq = 1u64;
        let mut line_no = 0u64;
        for line in BufReader::new(file).lines() {
            let line = line?;
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(&line)
                .map_err(|e| EvidenceError::Corrupt { line: line_no, reason: e.to_string() })?;
            let event = EvidenceEvent::from_record(record, line_no)?;

            if event.seq != expected_seq || event.prev_hash != expected_prev {
                return Err(EvidenceError::ChainMismatch {
                    sequence: expected_seq,
                    expected: hex::encode(expected_prev),
                    actual: hex::encode(event.prev_hash),
                });
            }
            let recomputed_event = hash_event(
                event.seq,
                event.ts,
                &event.event_type,
                &event.actor,
                &event.subject,
                &event.prev_hash,
            );
            if recomputed_event != event.event_hash {
                return Err(EvidenceError::ChainMismatch {
                    sequence: event.seq,
                    expected: hex::encode(recomputed_event),
                    actual: hex::encode(event.event_hash),
                });
            }
            let recomputed_chain = hash_chain(&event.prev_hash, &event.event_hash);
            if recomputed_chain != event.chain_hash {
                return Err(EvidenceError::ChainMismatch {
                    sequence: event.seq,
                    expected: hex::encode(recomputed_chain),
                    actual: hex::encode(event.chain_hash),
                });
            }
            expected_prev = event.chain_hash;
            expected_seq += 1;
        }
        Ok(())
    }

    /// Operator hook: clear the halt after the underlying storage has been
    /// repaired. Verification should be re-run afterwards.
    pub fn acknowledge_integrity_failure(&self) {
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).halted = false;
        tracing::warn!("evidence integrity failure acknowledged; writes re-enabled");
    }
}

// ============================================================================
// Tests
// ============================================================================
