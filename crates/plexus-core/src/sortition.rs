//! VRF sortition: deterministic vote-weight assignment.
//!
//! A vote's weight is drawn from a binomial distribution seeded by the
//! voter's VRF output. With stake `s`, total eligible stake `T` and
//! committee threshold `t`, the weight is the smallest `k` such that
//! `BinomialCDF(k; s, t/T) >= H / 2^256`, where `H` mixes the VRF output
//! with the voter address. Expected weight is `s * t / T`, so the committee
//! seat count concentrates around the threshold regardless of how stake is
//! distributed across accounts.

use crate::rlp::{append_bytes, RlpCursor};
use crate::vote::SortitionMessage;
use crate::{Address, CoreError, Hash, Result};
use plexus_crypto::vrf::{expand_output, vrf_verify, VrfKeypair, VrfOutput, VrfProof};
use plexus_crypto::keccak256_concat;

/// Sortition credential attached to every vote: the seeded message, the
/// VRF proof over its RLP encoding, and the derived output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfSortition {
    pub message: SortitionMessage,
    pub proof: VrfProof,
    pub output: VrfOutput,
}

impl VrfSortition {
    /// Generate a credential for `message` with the node's VRF key.
    pub fn generate(vrf_keypair: &VrfKeypair, message: SortitionMessage) -> Self {
        let (output, proof) = vrf_keypair.prove(&message.rlp());
        Self { message, proof, output }
    }

    /// Rebuild a credential from a received proof. The output is derived
    /// from the proof and only trustworthy after [`VrfSortition::verify`].
    pub fn from_proof(message: SortitionMessage, proof: VrfProof) -> Self {
        let output = expand_output(&proof);
        Self { message, proof, output }
    }

    /// Verify the proof against the voter's registered VRF public key.
    pub fn verify(&self, vrf_public_key: &[u8; 32]) -> Result<()> {
        let output = vrf_verify(vrf_public_key, &self.message.rlp(), &self.proof)
            .map_err(|_| CoreError::InvalidVrfProof)?;
        if output != self.output {
            return Err(CoreError::InvalidVrfProof);
        }
        Ok(())
    }

    /// Calculate the vote weight for this credential.
    ///
    /// The voter address is hashed into the draw to decorrelate accounts
    /// that share a VRF key.
    pub fn calculate_weight(
        &self,
        stake: u64,
        total_stake: u64,
        threshold: u64,
        address: &Address,
    ) -> u64 {
        let hash = voter_index_hash(&self.output, address, 0);
        binomial_weight(stake, total_stake, threshold, &hash)
    }

    /// Append the credential fields (message fields plus proof) to an RLP
    /// payload.
    pub fn rlp_append(&self, out: &mut Vec<u8>) {
        self.message.rlp_append(out);
        append_bytes(out, &self.proof.to_bytes());
    }

    /// Decode the credential fields from a cursor positioned at the
    /// message type item.
    pub fn rlp_decode(cursor: &mut RlpCursor<'_>) -> Result<Self> {
        let message = SortitionMessage::rlp_decode(cursor)?;
        let proof_bytes = cursor.next_array::<96>()?;
        let proof = VrfProof::from_bytes(&proof_bytes);
        Ok(Self::from_proof(message, proof))
    }
}

/// Hash combining VRF output, voter address and vote weight index.
pub fn voter_index_hash(output: &VrfOutput, address: &Address, index: u64) -> Hash {
    keccak256_concat(&[&output[..], &address[..], &index.to_be_bytes()])
}

/// Interpret a 256-bit hash as a uniform draw in [0, 1).
///
/// Only the top 128 bits participate; an f64 keeps 53 significant bits, so
/// nothing below bit 128 can influence the result.
pub fn hash_ratio(hash: &Hash) -> f64 {
    let hi = u64::from_be_bytes(hash[0..8].try_into().unwrap());
    let lo = u64::from_be_bytes(hash[8..16].try_into().unwrap());
    (hi as f64) / 2f64.powi(64) + (lo as f64) / 2f64.powi(128)
}

/// The smallest weight `k` in `[0, stake]` whose binomial CDF reaches the
/// draw, found by binary search over `[0, stake - 1]` with endpoint checks.
pub fn binomial_weight(stake: u64, total_stake: u64, threshold: u64, hash: &Hash) -> u64 {
    if stake == 0 || total_stake == 0 || threshold == 0 {
        return 0;
    }

    let p = threshold as f64 / total_stake as f64;
    if p >= 1.0 {
        // Degenerate distribution: all mass at k = stake
        return stake;
    }

    let ratio = hash_ratio(hash);

    let mut start = 0u64;
    let mut end = stake - 1;
    while start + 1 < end {
        let mid = start + (end - start) / 2;
        if ratio <= binomial_cdf(mid, stake, p) {
            end = mid;
        } else {
            start = mid;
        }
    }
    if ratio <= binomial_cdf(start, stake, p) {
        return start;
    }
    if ratio <= binomial_cdf(end, stake, p) {
        return end;
    }
    stake
}

/// Cumulative distribution of Binomial(n, p) at k, via the regularized
/// incomplete beta function: CDF(k; n, p) = I_{1-p}(n - k, k + 1).
pub fn binomial_cdf(k: u64, n: u64, p: f64) -> f64 {
    if k >= n {
        return 1.0;
    }
    if p <= 0.0 {
        return 1.0;
    }
    if p >= 1.0 {
        return 0.0;
    }
    incomplete_beta((n - k) as f64, (k + 1) as f64, 1.0 - p)
}

/// Regularized incomplete beta function I_x(a, b), evaluated with the
/// continued-fraction expansion (Lentz's method).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    // The continued fraction converges rapidly for x < (a + 1) / (a + b + 2);
    // use the symmetry I_x(a, b) = 1 - I_{1-x}(b, a) otherwise.
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-15;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        // Even step
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        // Odd step
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;

        if (del - 1.0).abs() < EPS {
            break;
        }
    }

    h
}

/// Natural log of the gamma function (Lanczos approximation, g = 5).
fn ln_gamma(x: f64) -> f64 {
    const COF: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];

    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000000000190015;
    let mut y = x;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vote::{SortitionMessage, VoteType};
    use proptest::prelude::*;

    #[test]
    fn test_ln_gamma_factorials() {
        // ln(Gamma(n + 1)) = ln(n!)
        assert!((ln_gamma(1.0)).abs() < 1e-10);
        assert!((ln_gamma(2.0)).abs() < 1e-10);
        assert!((ln_gamma(5.0) - (24.0f64).ln()).abs() < 1e-9);
        assert!((ln_gamma(11.0) - (3628800.0f64).ln()).abs() < 1e-8);
    }

    #[test]
    fn test_binomial_cdf_known_values() {
        // Binomial(2, 0.5): P(X <= 0) = 0.25, P(X <= 1) = 0.75
        assert!((binomial_cdf(0, 2, 0.5) - 0.25).abs() < 1e-12);
        assert!((binomial_cdf(1, 2, 0.5) - 0.75).abs() < 1e-12);
        assert_eq!(binomial_cdf(2, 2, 0.5), 1.0);

        // Binomial(10, 0.1): P(X <= 0) = 0.9^10
        let expect = 0.9f64.powi(10);
        assert!((binomial_cdf(0, 10, 0.1) - expect).abs() < 1e-12);
    }

    #[test]
    fn test_binomial_cdf_monotone_in_k() {
        let mut prev = 0.0;
        for k in 0..50 {
            let cdf = binomial_cdf(k, 50, 0.3);
            assert!(cdf >= prev);
            prev = cdf;
        }
    }

    #[test]
    fn test_weight_zero_stake() {
        let hash = [0xabu8; 32];
        assert_eq!(binomial_weight(0, 100, 10, &hash), 0);
        assert_eq!(binomial_weight(10, 0, 10, &hash), 0);
        assert_eq!(binomial_weight(10, 100, 0, &hash), 0);
    }

    #[test]
    fn test_weight_degenerate_full_selection() {
        // threshold >= total: p = 1, everyone gets full stake
        let hash = [0x55u8; 32];
        assert_eq!(binomial_weight(7, 5, 5, &hash), 7);
    }

    #[test]
    fn test_weight_bounded_by_stake() {
        for seed in 0u8..32 {
            let hash = plexus_crypto::keccak256(&[seed]);
            let w = binomial_weight(10, 1000, 100, &hash);
            assert!(w <= 10);
        }
    }

    #[test]
    fn test_weight_deterministic() {
        let hash = [0x42u8; 32];
        assert_eq!(
            binomial_weight(25, 500, 50, &hash),
            binomial_weight(25, 500, 50, &hash)
        );
    }

    #[test]
    fn test_sampled_mean_tracks_expectation() {
        // Over N deterministic VRF draws the observed mean weight must sit
        // within 2.5% of N * s * t / T.
        let keypair = VrfKeypair::from_seed(&[9u8; 32]);
        let address = [0x11u8; 20];
        let (stake, total, threshold) = (10u64, 100u64, 20u64);
        let trials = 10_000u64;

        let mut sum = 0u64;
        for i in 0..trials {
            let message = SortitionMessage::new(VoteType::Cert, i + 1, 1, 3);
            let sortition = VrfSortition::generate(&keypair, message);
            sum += sortition.calculate_weight(stake, total, threshold, &address);
        }

        let mean = sum as f64 / trials as f64;
        let expected = stake as f64 * threshold as f64 / total as f64;
        let deviation = (mean - expected).abs() / expected;
        assert!(
            deviation < 0.025,
            "mean {mean} deviates {deviation} from expected {expected}"
        );
    }

    #[test]
    fn test_sortition_verify_round_trip() {
        let keypair = VrfKeypair::from_seed(&[3u8; 32]);
        let message = SortitionMessage::new(VoteType::Soft, 5, 2, 2);
        let sortition = VrfSortition::generate(&keypair, message.clone());

        sortition.verify(&keypair.public_key).unwrap();

        // Reconstructed from proof alone
        let rebuilt = VrfSortition::from_proof(message, sortition.proof);
        assert_eq!(rebuilt.output[..], sortition.output[..]);
        rebuilt.verify(&keypair.public_key).unwrap();

        let other = VrfKeypair::from_seed(&[4u8; 32]);
        assert!(sortition.verify(&other.public_key).is_err());
    }

    proptest! {
        #[test]
        fn prop_weight_monotone_in_stake(
            seed in any::<[u8; 32]>(),
            base_stake in 1u64..200,
            extra in 0u64..200,
            threshold in 1u64..100,
        ) {
            let total = 1000u64;
            let hash = plexus_crypto::keccak256(&seed);
            let w1 = binomial_weight(base_stake, total, threshold, &hash);
            let w2 = binomial_weight(base_stake + extra, total, threshold, &hash);
            prop_assert!(w2 >= w1);
        }

        #[test]
        fn prop_weight_never_exceeds_stake(
            seed in any::<[u8; 32]>(),
            stake in 0u64..500,
            threshold in 0u64..200,
        ) {
            let hash = plexus_crypto::keccak256(&seed);
            prop_assert!(binomial_weight(stake, 1000, threshold, &hash) <= stake);
        }
    }
}
