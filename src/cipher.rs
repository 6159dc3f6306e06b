//! N2HE cipher — additively homomorphic symmetric LWE encryption
//!
//! One ciphertext encodes one integer message `m ∈ [0, t)` as
//!
//! ```text
//! b = ⟨A, s⟩ + e + ⌊q/t⌋·m   (mod q)
//! ```
//!
//! with `q = 2³²` (native wrapping `u32` arithmetic), `t = 2¹⁶`, secret `s`
//! ternary in {−1, 0, 1}, and `e` Skellam-distributed. Addition is
//! componentwise `(A₁+A₂, b₁+b₂) mod q` and is **exactly** associative and
//! commutative, so parallel reduction order never affects results.
//!
//! ## Noise budget
//! Each fresh ciphertext carries one Skellam(μ) error term (variance 2μ).
//! After accumulating `N` terms the decoder must still land within
//! `±⌊q/2t⌋ = ±2¹⁵` of the encoded point. Requiring a Gaussian-tail failure
//! probability ≤ 2⁻⁴⁰ (k = 7.45 standard deviations) gives
//!
//! ```text
//! N_max = ⌊ (q/2t)² / (C·μ) ⌋,   C = 2·k² ≈ 111
//! ```
//!
//! The budget is tracked per ciphertext as an addition counter and enforced
//! at every [`N2heCipher::add`]; overrunning it is a refused operation, never
//! a silent decryption corruption.
//!
//! ## Determinism
//! The public row `A` and the noise draw for a slot derive from the worker's
//! seed via the `LweMatrix` / `SkellamNoise` substreams keyed by
//! `(key_id, round, slot)`. A fixed seed therefore reproduces ciphertexts
//! byte-for-byte; distinct workers hold distinct seeds, so rows never repeat
//! across the fleet.

#![forbid(unsafe_code)]

use rand::Rng;
use rand_chacha::ChaCha20Rng;

use crate::csprng::{sample_skellam, SeedContext, StreamTag};
use crate::{Classify, ErrorKind, KeyId, Round};

/// Plaintext modulus `t = 2¹⁶`. Messages are `u16`.
pub const PLAINTEXT_MODULUS: u32 = 1 << 16;

/// Encoding step `Δ = ⌊q/t⌋ = 2¹⁶`.
pub const DELTA_SHIFT: u32 = 16;

/// Gaussian-tail constant for the 2⁻⁴⁰ decryption-failure target
/// (`C = 2·k²`, `k = 7.45`).
const TAIL_CONSTANT: f64 = 111.0;

/// Lattice security presets. Both share `q = 2³²` and `t = 2¹⁶`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityLevel {
    /// 128-bit: LWE dimension 1024.
    Bits128,
    /// 192-bit: LWE dimension 2048.
    Bits192,
}

impl SecurityLevel {
    /// LWE dimension `n` for this preset.
    #[inline]
    pub fn lwe_dimension(self) -> usize {
        match self {
            SecurityLevel::Bits128 => 1024,
            SecurityLevel::Bits192 => 2048,
        }
    }

    /// Numeric label persisted in key metadata (128 or 192).
    #[inline]
    pub fn bits(self) -> u16 {
        match self {
            SecurityLevel::Bits128 => 128,
            SecurityLevel::Bits192 => 192,
        }
    }

    /// Parse from the numeric label.
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            128 => Some(SecurityLevel::Bits128),
            192 => Some(SecurityLevel::Bits192),
            _ => None,
        }
    }
}

/// Errors surfaced by the cipher.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// The Skellam parameter is outside the supported envelope.
    #[error("skellam parameter μ={mu} outside supported range [1.0, 10.0]")]
    MuOutOfRange {
        /// The rejected parameter.
        mu: f64,
    },
    /// Ciphertext vectors of different LWE dimension cannot combine.
    #[error("LWE dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension required by the parameters.
        expected: usize,
        /// Dimension actually present.
        got: usize,
    },
    /// Accumulating further ciphertexts would exceed the noise budget.
    #[error("noise budget exhausted: budget {budget} additions, attempted {attempted}")]
    NoiseBudgetExhausted {
        /// Maximum accumulated fresh-ciphertext count.
        budget: u64,
        /// The count the refused operation would have produced.
        attempted: u64,
    },
}

impl Classify for CipherError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Crypto
    }
}

/// Validated cipher parameters.
#[derive(Clone, Copy, Debug)]
pub struct CipherParams {
    security: SecurityLevel,
    mu: f64,
}

impl CipherParams {
    /// Construct parameters, refusing μ outside `[1.0, 10.0]`.
    pub fn new(security: SecurityLevel, mu: f64) -> Result<Self, CipherError> {
        if !(1.0..=10.0).contains(&mu) || !mu.is_finite() {
            return Err(CipherError::MuOutOfRange { mu });
        }
        Ok(Self { security, mu })
    }

    /// Security preset.
    #[inline]
    pub fn security(&self) -> SecurityLevel {
        self.security
    }

    /// LWE dimension `n`.
    #[inline]
    pub fn lwe_dimension(&self) -> usize {
        self.security.lwe_dimension()
    }

    /// Skellam parameter μ.
    #[inline]
    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Maximum number of fresh ciphertexts that may accumulate into one sum
    /// while keeping the decryption-failure probability ≤ 2⁻⁴⁰.
    pub fn noise_budget(&self) -> u64 {
        let half_step = (1u64 << (DELTA_SHIFT - 1)) as f64; // q/2t = 2¹⁵
        (half_step * half_step / (TAIL_CONSTANT * self.mu)) as u64
    }
}

/// LWE secret key: `n` ternary coefficients stored mod q
/// (−1 is represented as `q − 1`).
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey {
    coeffs: Vec<u32>,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("SecretKey").field("n", &self.coeffs.len()).finish()
    }
}

impl SecretKey {
    /// Sample a fresh ternary key from `rng` (uniform over {−1, 0, 1}).
    pub fn sample(level: SecurityLevel, rng: &mut ChaCha20Rng) -> Self {
        let coeffs = (0..level.lwe_dimension())
            .map(|_| match rng.gen_range(0u8..3) {
                0 => 0u32,
                1 => 1u32,
                _ => u32::MAX, // q − 1 ≡ −1 (mod 2³²)
            })
            .collect();
        Self { coeffs }
    }

    /// Dimension `n` of this key.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.coeffs.len()
    }

    /// Serialize as big-endian `u32`s (keystore blob interior).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.coeffs.len() * 4);
        for c in &self.coeffs {
            out.extend_from_slice(&c.to_be_bytes());
        }
        out
    }

    /// Deserialize from [`SecretKey::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let coeffs = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { coeffs })
    }
}

/// One LWE ciphertext: public row `a`, body `b`, and the count of fresh
/// ciphertexts accumulated into it (1 for a fresh encryption).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    /// Public row, length `n_lwe`, entries mod q.
    pub a: Vec<u32>,
    /// Body `⟨a, s⟩ + e + Δ·m (mod q)`.
    pub b: u32,
    additions: u32,
}

impl Ciphertext {
    /// Rehydrate a ciphertext parsed off the wire. Wire ciphertexts are
    /// always fresh (workers never ship partial sums), so the accumulated
    /// count restarts at 1.
    pub fn from_wire(a: Vec<u32>, b: u32) -> Self {
        Self { a, b, additions: 1 }
    }

    /// Number of fresh ciphertexts accumulated into this one.
    #[inline]
    pub fn accumulated(&self) -> u64 {
        u64::from(self.additions)
    }
}

/// The cipher engine: validated parameters plus the seed context that feeds
/// the matrix and noise substreams.
#[derive(Clone, Debug)]
pub struct N2heCipher {
    params: CipherParams,
    seed: SeedContext,
}

impl N2heCipher {
    /// Build an engine over validated parameters.
    pub fn new(params: CipherParams, seed: SeedContext) -> Self {
        Self { params, seed }
    }

    /// The engine's parameters.
    #[inline]
    pub fn params(&self) -> &CipherParams {
        &self.params
    }

    /// Remaining headroom (in further fresh-ciphertext accumulations) before
    /// `ct` exhausts the noise budget.
    pub fn remaining_budget(&self, ct: &Ciphertext) -> u64 {
        self.params.noise_budget().saturating_sub(ct.accumulated())
    }

    /// Encrypt one message into the addressed slot.
    pub fn encrypt(
        &self,
        sk: &SecretKey,
        m: u16,
        key_id: &KeyId,
        round: Round,
        slot: u64,
    ) -> Result<Ciphertext, CipherError> {
        let n = self.params.lwe_dimension();
        if sk.dimension() != n {
            return Err(CipherError::DimensionMismatch { expected: n, got: sk.dimension() });
        }

        let parts: [&[u8]; 3] = [key_id.as_bytes(), &round.to_be_bytes(), &slot.to_be_bytes()];
        let mut a_rng = self.seed.substream(StreamTag::LweMatrix, &parts);
        let a: Vec<u32> = (0..n).map(|_| a_rng.gen::<u32>()).collect();

        let mut e_rng = self.seed.substream(StreamTag::SkellamNoise, &parts);
        let e = sample_skellam(&mut e_rng, self.params.mu);
        // i64 → u32 truncation is exactly reduction mod 2³².
        let e_mod_q = e as u32;

        let b = dot_mod_q(&a, &sk.coeffs)
            .wrapping_add(e_mod_q)
            .wrapping_add(u32::from(m) << DELTA_SHIFT);

        Ok(Ciphertext { a, b, additions: 1 })
    }

    /// Decrypt one ciphertext (fresh or accumulated) to `[0, t)`.
    pub fn decrypt(&self, sk: &SecretKey, ct: &Ciphertext) -> Result<u16, CipherError> {
        let n = self.params.lwe_dimension();
        if ct.a.len() != n {
            return Err(CipherError::DimensionMismatch { expected: n, got: ct.a.len() });
        }
        if sk.dimension() != n {
            return Err(CipherError::DimensionMismatch { expected: n, got: sk.dimension() });
        }
        let diff = ct.b.wrapping_sub(dot_mod_q(&ct.a, &sk.coeffs));
        // Round to the nearest multiple of Δ, then reduce mod t. The u64
        // widening keeps the +Δ/2 rounding bias from wrapping.
        let m = ((u64::from(diff) + (1u64 << (DELTA_SHIFT - 1))) >> DELTA_SHIFT)
            & u64::from(PLAINTEXT_MODULUS - 1);
        Ok(m as u16)
    }

    /// Homomorphic addition: componentwise mod q. Refuses the operation when
    /// the combined accumulation count would exceed the noise budget.
    pub fn add(&self, x: &Ciphertext, y: &Ciphertext) -> Result<Ciphertext, CipherError> {
        if x.a.len() != y.a.len() {
            return Err(CipherError::DimensionMismatch { expected: x.a.len(), got: y.a.len() });
        }
        let budget = self.params.noise_budget();
        let attempted = x.accumulated() + y.accumulated();
        if attempted > budget {
            return Err(CipherError::NoiseBudgetExhausted { budget, attempted });
        }
        let a = x.a.iter().zip(&y.a).map(|(p, q)| p.wrapping_add(*q)).collect();
        Ok(Ciphertext {
            a,
            b: x.b.wrapping_add(y.b),
            additions: (attempted).min(u64::from(u32::MAX)) as u32,
        })
    }

    /// Encrypt a batch of messages into consecutive slots starting at
    /// `base_slot`.
    pub fn encrypt_vector(
        &self,
        sk: &SecretKey,
        messages: &[u16],
        key_id: &KeyId,
        round: Round,
        base_slot: u64,
    ) -> Result<Vec<Ciphertext>, CipherError> {
        messages
            .iter()
            .enumerate()
            .map(|(i, &m)| self.encrypt(sk, m, key_id, round, base_slot + i as u64))
            .collect()
    }

    /// Decrypt a batch of ciphertexts.
    pub fn decrypt_vector(
        &self,
        sk: &SecretKey,
        cts: &[Ciphertext],
    ) -> Result<Vec<u16>, CipherError> {
        cts.iter().map(|ct| self.decrypt(sk, ct)).collect()
    }
}

/// `⟨a, s⟩ mod 2³²` via native wrapping arithmetic.
#[inline]
fn dot_mod_q(a: &[u32], s: &[u32]) -> u32 {
    a.iter().zip(s).fold(0u32, |acc, (&ai, &si)| acc.wrapping_add(ai.wrapping_mul(si)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(seed_byte: u8) -> (N2heCipher, SecretKey) {
        let params = CipherParams::new(SecurityLevel::Bits128, 3.19).unwrap();
        let seed = SeedContext::new([seed_byte; 32]);
        let mut kr = seed.substream(StreamTag::SecretKey, &[b"test-key"]);
        let sk = SecretKey::sample(params.security(), &mut kr);
        (N2heCipher::new(params, seed), sk)
    }

    fn kid() -> KeyId {
        KeyId("k-test".into())
    }

    #[test]
    fn mu_outside_envelope_is_refused() {
        assert!(matches!(
            CipherParams::new(SecurityLevel::Bits128, 0.5),
            Err(CipherError::MuOutOfRange { .. })
        ));
        assert!(matches!(
            CipherParams::new(SecurityLevel::Bits128, 10.5),
            Err(CipherError::MuOutOfRange { .. })
        ));
        assert!(CipherParams::new(SecurityLevel::Bits192, 1.0).is_ok());
        assert!(CipherParams::new(SecurityLevel::Bits192, 10.0).is_ok());
    }

    #[test]
    fn encrypt_decrypt_roundtrip_is_exact() {
        let (eng, sk) = engine(1);
        let messages: [u16; 6] = [0, 1, 255, 4096, 65534, 65535];
        for (slot, &m) in messages.iter().enumerate() {
            let ct = eng.encrypt(&sk, m, &kid(), Round(3), slot as u64).unwrap();
            assert_eq!(eng.decrypt(&sk, &ct).unwrap(), m);
        }
    }

    #[test]
    fn batch_interface_matches_scalar_path() {
        let (eng, sk) = engine(2);
        let msgs: Vec<u16> = vec![17, 0, 999, 65535];
        let cts = eng.encrypt_vector(&sk, &msgs, &kid(), Round(0), 0).unwrap();
        assert_eq!(eng.decrypt_vector(&sk, &cts).unwrap(), msgs);
    }

    #[test]
    fn homomorphic_sum_recovers_message_sum_mod_t() {
        let (eng, sk) = engine(3);
        let m = [1000u16, 2000, 3000];
        let cts: Vec<Ciphertext> = m
            .iter()
            .enumerate()
            .map(|(i, &v)| eng.encrypt(&sk, v, &kid(), Round(1), i as u64).unwrap())
            .collect();
        let sum = eng.add(&eng.add(&cts[0], &cts[1]).unwrap(), &cts[2]).unwrap();
        assert_eq!(eng.decrypt(&sk, &sum).unwrap(), 6000);
        assert_eq!(sum.accumulated(), 3);

        // Wraparound mod t is well-defined.
        let big = [60000u16, 10000];
        let c0 = eng.encrypt(&sk, big[0], &kid(), Round(2), 0).unwrap();
        let c1 = eng.encrypt(&sk, big[1], &kid(), Round(2), 1).unwrap();
        let s = eng.add(&c0, &c1).unwrap();
        assert_eq!(eng.decrypt(&sk, &s).unwrap(), ((60000u32 + 10000) % 65536) as u16);
    }

    #[test]
    fn addition_is_associative_and_commutative() {
        let (eng, sk) = engine(4);
        let cts: Vec<Ciphertext> = (0..3)
            .map(|i| eng.encrypt(&sk, (i * 7 + 1) as u16, &kid(), Round(9), i as u64).unwrap())
            .collect();
        let left = eng.add(&eng.add(&cts[0], &cts[1]).unwrap(), &cts[2]).unwrap();
        let right = eng.add(&cts[0], &eng.add(&cts[1], &cts[2]).unwrap()).unwrap();
        let swapped = eng.add(&cts[1], &cts[0]).unwrap();
        assert_eq!(left, right);
        assert_eq!(swapped.a, eng.add(&cts[0], &cts[1]).unwrap().a);
        assert_eq!(swapped.b, eng.add(&cts[0], &cts[1]).unwrap().b);
    }

    #[test]
    fn ciphertexts_are_deterministic_per_seed_and_slot() {
        let (eng, sk) = engine(5);
        let c1 = eng.encrypt(&sk, 42, &kid(), Round(7), 11).unwrap();
        let c2 = eng.encrypt(&sk, 42, &kid(), Round(7), 11).unwrap();
        assert_eq!(c1, c2);

        // Different slot ⇒ different row.
        let c3 = eng.encrypt(&sk, 42, &kid(), Round(7), 12).unwrap();
        assert_ne!(c1.a, c3.a);

        // Different seed (another worker) ⇒ different row for the same slot.
        let (eng2, _) = engine(6);
        let c4 = eng2.encrypt(&sk, 42, &kid(), Round(7), 11).unwrap();
        assert_ne!(c1.a, c4.a);
    }

    #[test]
    fn noise_budget_boundary_is_enforced_not_corrupted() {
        let (eng, sk) = engine(7);
        let budget = eng.params().noise_budget();
        assert!(budget > 100_000, "μ=3.19 budget should clear the stress target");

        // A ciphertext sitting exactly at the budget still decrypts.
        let mut at_budget = eng.encrypt(&sk, 5, &kid(), Round(0), 0).unwrap();
        at_budget.additions = budget as u32;
        assert_eq!(eng.decrypt(&sk, &at_budget).unwrap(), 5);
        assert_eq!(eng.remaining_budget(&at_budget), 0);

        // One more accumulation is refused, not silently corrupted.
        let fresh = eng.encrypt(&sk, 1, &kid(), Round(0), 1).unwrap();
        match eng.add(&at_budget, &fresh) {
            Err(CipherError::NoiseBudgetExhausted { budget: b, attempted }) => {
                assert_eq!(b, budget);
                assert_eq!(attempted, budget + 1);
            }
            other => panic!("expected NoiseBudgetExhausted, got {other:?}"),
        }
    }

    #[test]
    fn repeated_accumulation_stress() {
        // Scaled-down form of the aggregate-the-same-ciphertext stress: the
        // sum of 1000 identical encryptions of 3 decrypts to 3000.
        let (eng, sk) = engine(8);
        let ct = eng.encrypt(&sk, 3, &kid(), Round(4), 0).unwrap();
        let mut acc = ct.clone();
        for _ in 1..1000 {
            acc = eng.add(&acc, &ct).unwrap();
        }
        assert_eq!(acc.accumulated(), 1000);
        assert_eq!(eng.decrypt(&sk, &acc).unwrap(), 3000);
    }

    #[test]
    fn secret_key_bytes_roundtrip() {
        let (_, sk) = engine(9);
        let bytes = sk.to_bytes();
        let back = SecretKey::from_bytes(&bytes).unwrap();
        assert_eq!(sk, back);
        assert!(SecretKey::from_bytes(&bytes[..7]).is_none());
        assert!(SecretKey::from_bytes(&[]).is_none());
    }

    #[test]
    fn dimension_mismatch_is_detected() {
        let (eng, sk) = engine(10);
        let params192 = CipherParams::new(SecurityLevel::Bits192, 3.19).unwrap();
        let seed = SeedContext::new([11; 32]);
        let mut kr = seed.substream(StreamTag::SecretKey, &[b"other"]);
        let sk192 = SecretKey::sample(params192.security(), &mut kr);
        assert!(matches!(
            eng.encrypt(&sk192, 1, &kid(), Round(0), 0),
            Err(CipherError::DimensionMismatch { .. })
        ));
        let ct = eng.encrypt(&sk, 1, &kid(), Round(0), 0).unwrap();
        let eng192 = N2heCipher::new(params192, seed);
        assert!(matches!(
            eng192.decrypt(&sk192, &ct),
            Err(CipherError::DimensionMismatch { .. })
        ));
    }
}
