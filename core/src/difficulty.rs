//! Difficulty <-> target conversion.
//!
//! Targets are 256-bit little-endian integers (byte 31 is the most
//! significant). Difficulty is `DIFF1 / target`, evaluated as four 64-bit
//! words weighted by 2^0, 2^64, 2^128 and 2^192.

/// 32-byte little-endian share target.
pub type Target = [u8; 32];

/// Difficulty-1 target as a float (0xffff * 2^208).
pub const DIFF1: f64 = 26959946667150639794667015087019630673637144422540572481103610249216.0;

const BITS64: f64 = 18446744073709551616.0;
const BITS256: f64 = BITS64 * BITS64 * BITS64 * BITS64;

/// Smallest usable target, substituted whenever a pool hands us zero.
pub const MIN_TARGET: Target = {
    let mut t = [0u8; 32];
    t[0] = 1;
    t
};

pub const MAX_TARGET: Target = [0xff; 32];

fn word(t: &[u8; 32], i: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&t[i * 8..i * 8 + 8]);
    u64::from_le_bytes(b)
}

/// Value of a 256-bit little-endian integer as a float.
pub fn le256_to_f64(t: &[u8; 32]) -> f64 {
    let mut value = 0.0;
    for i in (0..4).rev() {
        value = value * BITS64 + word(t, i) as f64;
    }
    value
}

pub fn is_zero(t: &Target) -> bool {
    t.iter().all(|b| *b == 0)
}

/// Replace an all-zero target with [`MIN_TARGET`].
pub fn sanitize(target: Target) -> Target {
    if is_zero(&target) {
        MIN_TARGET
    } else {
        target
    }
}

pub fn difficulty_from_target(target: &Target) -> f64 {
    let value = le256_to_f64(target);
    DIFF1 / value.max(1.0)
}

/// Difficulty a hash would satisfy. Same arithmetic as a target.
pub fn hash_difficulty(hash: &[u8; 32]) -> f64 {
    difficulty_from_target(hash)
}

// Round to 32 significant bits so that a target survives
// target -> difficulty -> target unchanged.
fn quantize(value: f64) -> f64 {
    if value < 4294967296.0 {
        return value.round();
    }
    let exp = value.log2().floor() as i32;
    let scale = 2f64.powi(exp - 31);
    (value / scale).round() * scale
}

pub fn target_from_difficulty(difficulty: f64) -> Target {
    if difficulty.is_nan() || difficulty <= 0.0 || difficulty.is_infinite() {
        return MAX_TARGET;
    }
    let value = DIFF1 / difficulty;
    if value >= BITS256 {
        return MAX_TARGET;
    }
    let mut rem = quantize(value);
    if rem < 1.0 {
        return MIN_TARGET;
    }

    let mut target = [0u8; 32];
    for i in (0..4).rev() {
        let base = BITS64.powi(i as i32);
        let w = (rem / base).floor();
        rem -= w * base;
        let w = if w >= BITS64 { u64::MAX } else { w as u64 };
        target[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
    }
    sanitize(target)
}

/// Compare a little-endian hash against a little-endian target.
pub fn hash_meets_target(hash: &[u8; 32], target: &Target) -> bool {
    for i in (0..32).rev() {
        if hash[i] < target[i] {
            return true;
        }
        if hash[i] > target[i] {
            return false;
        }
    }
    true
}

/// Expand a compact `nbits` value into a full target.
pub fn compact_to_target(bits: u32) -> Target {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let mut target = [0u8; 32];
    if exponent <= 3 {
        let value = mantissa >> (8 * (3 - exponent));
        target[..4].copy_from_slice(&value.to_le_bytes());
    } else {
        let bytes = mantissa.to_le_bytes();
        for (i, b) in bytes.iter().take(3).enumerate() {
            let pos = exponent - 3 + i;
            if pos < 32 {
                target[pos] = *b;
            }
        }
    }
    target
}

/// Network difficulty encoded by a header's `nbits` field.
pub fn network_difficulty(bits: u32) -> f64 {
    difficulty_from_target(&compact_to_target(bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_difficulty_one_target() {
        let target = target_from_difficulty(1.0);
        assert_eq!(target[26], 0xff);
        assert_eq!(target[27], 0xff);
        assert!(target[..26].iter().all(|b| *b == 0));
        assert!(target[28..].iter().all(|b| *b == 0));
        assert_eq!(difficulty_from_target(&target), 1.0);
    }

    #[test]
    fn test_compact_bits() {
        assert_eq!(compact_to_target(0x1d00ffff), target_from_difficulty(1.0));
        assert_eq!(network_difficulty(0x1d00ffff), 1.0);
        // regtest style bits, trivially easy
        assert!(network_difficulty(0x207fffff) < 1e-9);
    }

    #[test]
    fn test_round_trip_is_stable() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let (lo, hi) = (1e-3f64.ln(), 1e12f64.ln());
        for _ in 0..1000 {
            let d = rng.gen_range(lo..hi).exp();
            let t1 = target_from_difficulty(d);
            let t2 = target_from_difficulty(difficulty_from_target(&t1));
            assert_eq!(t1, t2, "difficulty {d}");
            let back = difficulty_from_target(&t1);
            assert!((back - d).abs() / d < 1e-8, "difficulty {d} came back as {back}");
        }
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(target_from_difficulty(0.0), MAX_TARGET);
        assert_eq!(target_from_difficulty(f64::NAN), MAX_TARGET);
        assert_eq!(target_from_difficulty(1e80), MIN_TARGET);
        assert_eq!(sanitize([0u8; 32]), MIN_TARGET);
        assert_eq!(difficulty_from_target(&[0u8; 32]), DIFF1);
    }

    #[test]
    fn test_hash_meets_target() {
        let target = target_from_difficulty(1.0);
        let mut hash = [0u8; 32];
        assert!(hash_meets_target(&hash, &target));
        hash[31] = 1;
        assert!(!hash_meets_target(&hash, &target));
        assert!(hash_meets_target(&target, &target));
    }
}
