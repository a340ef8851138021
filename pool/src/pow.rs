/// Proof-of-work primitives
///
/// Double-SHA256 hashing, 256-bit targets (compact bits, difficulty and
/// leading-zero forms) and the share score used by the ledger.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::fmt;

/// Decimal places kept when turning a target ratio into a score
const SCORE_SCALE: u32 = 18;

/// Ceiling for one share's score. Real tier/network ratios sit far below
/// it; a share target near zero would otherwise overflow `Decimal`.
pub const MAX_SHARE_SCORE: u64 = 1 << 32;

/// Double SHA-256
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Block hash in display order (byte-reversed hex)
pub fn hash_to_hex(hash: &[u8; 32]) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Leading zero bits of a hash read as a little-endian 256-bit integer
pub fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for byte in hash.iter().rev() {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// 256-bit target, stored big-endian
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target([u8; 32]);

impl Target {
    pub const MAX: Target = Target([0xff; 32]);

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Saturates at `Target::MAX`
    pub fn from_biguint(value: &BigUint) -> Self {
        let bytes = value.to_bytes_be();
        if bytes.len() > 32 {
            return Self::MAX;
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(&bytes);
        Self(out)
    }

    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Target whose hashes need at least `bits` leading zero bits
    pub fn from_leading_zero_bits(bits: u32) -> Self {
        if bits >= 256 {
            return Self([0u8; 32]);
        }
        Self::from_biguint(&(Self::MAX.to_biguint() >> bits as usize))
    }

    /// Pool difficulty 1 target: 0x00000000ffff0000...0000
    pub fn diff1() -> Self {
        Self::from_biguint(&(BigUint::from(0xffffu32) << 208usize))
    }

    /// Target for a share difficulty, `diff1 / difficulty`
    pub fn from_difficulty(difficulty: u64) -> Self {
        let d = difficulty.max(1);
        Self::from_biguint(&(Self::diff1().to_biguint() / BigUint::from(d)))
    }

    /// Decode compact `nBits` form
    pub fn from_compact(bits: u32) -> Self {
        let exponent = bits >> 24;
        let mantissa = BigUint::from(bits & 0x007f_ffff);
        let value = if exponent <= 3 {
            mantissa >> (8 * (3 - exponent) as usize)
        } else {
            mantissa << (8 * (exponent - 3) as usize)
        };
        Self::from_biguint(&value)
    }

    /// True when the hash, read as a little-endian integer, is at or below the target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        for i in 0..32 {
            let h = hash[31 - i];
            let t = self.0[i];
            if h != t {
                return h < t;
            }
        }
        true
    }

    /// Difficulty relative to `diff1`, as sent in `mining.set_difficulty`
    pub fn difficulty(&self) -> f64 {
        let target = self.to_biguint();
        if target.is_zero() {
            return f64::MAX;
        }
        let diff1 = Self::diff1().to_biguint().to_f64().unwrap_or(f64::MAX);
        diff1 / target.to_f64().unwrap_or(f64::MAX)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.to_hex())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Score credited for one accepted share: `network_target / share_target`.
///
/// Equals `share_difficulty / network_difficulty`, so a share at the
/// network target is worth exactly 1.
pub fn share_score(share_target: &Target, network_target: &Target) -> Decimal {
    let share = share_target.to_biguint();
    if share.is_zero() {
        return Decimal::ZERO;
    }
    let unit = BigUint::from(10u64).pow(SCORE_SCALE);
    let scaled = network_target.to_biguint() * &unit / share;
    if scaled >= BigUint::from(MAX_SHARE_SCORE) * unit {
        return Decimal::from(MAX_SHARE_SCORE);
    }
    scaled
        .to_i128()
        .and_then(|q| Decimal::try_from_i128_with_scale(q, SCORE_SCALE).ok())
        .map(|d| d.normalize())
        .unwrap_or(Decimal::from(MAX_SHARE_SCORE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sha256d_known_vector() {
        // sha256d("") = 5df6e0e2...
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_leading_zero_bits_reads_little_endian() {
        let mut hash = [0xffu8; 32];
        hash[31] = 0;
        hash[30] = 0x0f;
        assert_eq!(leading_zero_bits(&hash), 12);
    }

    #[test]
    fn test_target_from_leading_zero_bits() {
        let t = Target::from_leading_zero_bits(8);
        assert_eq!(t.to_be_bytes()[0], 0x00);
        assert_eq!(t.to_be_bytes()[1], 0xff);

        let mut ok = [0xffu8; 32];
        ok[31] = 0x00;
        assert!(t.is_met_by(&ok));

        let mut bad = [0x00u8; 32];
        bad[31] = 0x01;
        assert!(!t.is_met_by(&bad));
    }

    #[test]
    fn test_from_compact_genesis_bits() {
        let t = Target::from_compact(0x1d00ffff);
        assert_eq!(t, Target::diff1());
        assert!((t.difficulty() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_from_difficulty_scales_diff1() {
        let t = Target::from_difficulty(1024);
        assert!((t.difficulty() - 1024.0).abs() < 1e-6);
        assert!(t.to_biguint() < Target::diff1().to_biguint());
    }

    #[test]
    fn test_share_score_is_ratio_of_targets() {
        let network = Target::from_leading_zero_bits(20);
        let share = Target::from_leading_zero_bits(10);
        let score = share_score(&share, &network);
        // 2^-10 within 18 decimal places
        assert!((score - dec!(0.0009765625)).abs() < dec!(0.000000000000001));

        assert_eq!(share_score(&network, &network), dec!(1));
    }

    #[test]
    fn test_share_score_is_capped() {
        let mut one = [0u8; 32];
        one[31] = 1;
        let score = share_score(&Target::from_be_bytes(one), &Target::MAX);
        assert_eq!(score, Decimal::from(MAX_SHARE_SCORE));
        // a window of such shares still sums
        assert!(score.checked_add(score).is_some());
    }
}
