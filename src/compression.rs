//! Lossy compression of model deltas.
//!
//! A delta is reduced to its `top_k_fraction` largest-magnitude entries (ties broken by the
//! lowest index), and every retained value is quantized to a signed `bits`-wide integer code
//! against a single linear scale: the largest retained magnitude. All other entries are
//! implicitly zero.
//!
//! Reconstruction maps `(index, code)` back to `code * scale / (2^(bits-1) - 1)`. The error on a
//! retained value is at most half a quantization step. Retained values smaller than half a step
//! come back as zero.
//!
//! # Examples
//! ```
//! # use fedagg::compression::{compress, decompress};
//! let delta = vec![5.0, -0.1, 3.0, 0.0];
//! let sq = compress(&delta, 0.5, 8).unwrap();
//! assert_eq!(sq.indices, vec![0, 2]);
//! let dense = decompress(&sq).unwrap();
//! assert_eq!(dense[1], 0.0);
//! assert!((dense[2] - 3.0).abs() <= 5.0 / 128.0);
//! ```

use std::{cmp::Ordering, convert::TryFrom};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

/// The smallest supported code width.
pub const MIN_BITS: u8 = 2;
/// The largest supported code width.
pub const MAX_BITS: u8 = 32;

#[derive(Debug, Error)]
/// Errors of the compression codec.
pub enum CompressionError {
    #[error("invalid top-k fraction {0}: must be in (0, 1]")]
    InvalidFraction(f64),
    #[error("invalid code width {0}: must be between 2 and 32")]
    InvalidBits(u8),
    #[error("non-finite value at index {index}")]
    NonFinite { index: usize },
    #[error("vector of length {0} is too large to be compressed")]
    TooLarge(usize),
    #[error("malformed sparse vector: {0}")]
    Malformed(&'static str),
    #[error("failed to decode sparse vector: {0}")]
    Decode(#[from] bincode::Error),
}

/// A sparsified and quantized vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseQuantized {
    /// The retained indices, in ascending order.
    pub indices: Vec<u32>,
    /// The quantization code of each retained index.
    pub codes: Vec<i32>,
    /// The largest retained magnitude.
    pub scale: f32,
    /// The width of the codes.
    pub bits: u8,
    /// The length of the original vector.
    pub dim: u32,
}

impl SparseQuantized {
    /// The number of retained entries.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Serializes the sparse vector. This is the plaintext that clients encrypt.
    pub fn to_bytes(&self) -> Vec<u8> {
        // safe unwrap: the struct only contains sequences of known length
        bincode::serialize(self).unwrap()
    }

    /// Deserializes and validates a sparse vector.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CompressionError> {
        let sq: Self = bincode::deserialize(bytes)?;
        sq.validate()?;
        Ok(sq)
    }

    /// Checks the structural invariants of the sparse vector.
    pub fn validate(&self) -> Result<(), CompressionError> {
        check_bits(self.bits)?;
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(CompressionError::Malformed("scale must be finite and positive"));
        }
        if self.indices.len() != self.codes.len() {
            return Err(CompressionError::Malformed("indices and codes differ in length"));
        }
        if self.indices.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CompressionError::Malformed("indices are not strictly ascending"));
        }
        if self.indices.last().map_or(false, |&last| last >= self.dim) {
            return Err(CompressionError::Malformed("index out of range"));
        }
        let max = max_code(self.bits);
        if self.codes.iter().any(|&c| i64::from(c).abs() > max) {
            return Err(CompressionError::Malformed("code out of range"));
        }
        Ok(())
    }
}

impl Zeroize for SparseQuantized {
    fn zeroize(&mut self) {
        self.indices.zeroize();
        self.codes.zeroize();
        self.scale.zeroize();
    }
}

/// The largest code magnitude for the given width, `2^(bits-1) - 1`.
fn max_code(bits: u8) -> i64 {
    (1_i64 << (bits - 1)) - 1
}

fn check_bits(bits: u8) -> Result<(), CompressionError> {
    if (MIN_BITS..=MAX_BITS).contains(&bits) {
        Ok(())
    } else {
        Err(CompressionError::InvalidBits(bits))
    }
}

/// Number of entries kept out of `dim` for the given fraction.
fn retained_count(dim: usize, top_k_fraction: f64) -> usize {
    if dim == 0 {
        return 0;
    }
    ((dim as f64 * top_k_fraction).floor() as usize).max(1).min(dim)
}

fn quantize(value: f32, scale: f32, max: f64) -> i32 {
    let scaled = (f64::from(value) / f64::from(scale) * max).round();
    scaled.max(-max).min(max) as i32
}

/// Sparsifies and quantizes `vector`.
///
/// # Errors
/// Fails if the parameters are out of range or the vector contains non-finite values.
pub fn compress(
    vector: &[f32],
    top_k_fraction: f64,
    bits: u8,
) -> Result<SparseQuantized, CompressionError> {
    if !(top_k_fraction > 0.0 && top_k_fraction <= 1.0) {
        return Err(CompressionError::InvalidFraction(top_k_fraction));
    }
    check_bits(bits)?;
    if let Some(index) = vector.iter().position(|v| !v.is_finite()) {
        return Err(CompressionError::NonFinite { index });
    }
    let dim = u32::try_from(vector.len()).map_err(|_| CompressionError::TooLarge(vector.len()))?;

    // larger magnitude first, lower index first on ties
    let by_magnitude = |a: &usize, b: &usize| -> Ordering {
        vector[*b]
            .abs()
            .total_cmp(&vector[*a].abs())
            .then_with(|| a.cmp(b))
    };
    let k = retained_count(vector.len(), top_k_fraction);
    let mut retained: Vec<usize> = (0..vector.len()).collect();
    if k < retained.len() {
        retained.select_nth_unstable_by(k, by_magnitude);
        retained.truncate(k);
    }
    retained.sort_unstable();

    let scale = retained
        .iter()
        .map(|&i| vector[i].abs())
        .fold(0_f32, f32::max);
    let scale = if scale > 0.0 { scale } else { 1.0 };
    let max = max_code(bits) as f64;

    let codes = retained
        .iter()
        .map(|&i| quantize(vector[i], scale, max))
        .collect();
    let indices = retained.into_iter().map(|i| i as u32).collect();

    Ok(SparseQuantized {
        indices,
        codes,
        scale,
        bits,
        dim,
    })
}

/// Reconstructs the dense vector of length `sq.dim`.
///
/// # Errors
/// Fails if the sparse vector is malformed.
pub fn decompress(sq: &SparseQuantized) -> Result<Vec<f32>, CompressionError> {
    sq.validate()?;
    let max = max_code(sq.bits) as f64;
    let scale = f64::from(sq.scale);
    let mut dense = vec![0_f32; sq.dim as usize];
    for (&index, &code) in sq.indices.iter().zip(sq.codes.iter()) {
        dense[index as usize] = (f64::from(code) * scale / max) as f32;
    }
    Ok(dense)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_and_quantization_error() {
        let v = vec![5.0, -0.1, 3.0, 0.0];
        let sq = compress(&v, 0.5, 8).unwrap();
        assert_eq!(sq.indices, vec![0, 2]);
        assert_eq!(sq.dim, 4);
        assert_eq!(sq.scale, 5.0);
        assert_eq!(sq.codes, vec![127, 76]);

        let dense = decompress(&sq).unwrap();
        assert_eq!(dense.len(), 4);
        assert_eq!(dense[1], 0.0);
        assert_eq!(dense[3], 0.0);
        let bound = sq.scale * 2_f32.powi(-7);
        assert!((dense[0] - 5.0).abs() <= bound);
        assert!((dense[2] - 3.0).abs() <= bound);
    }

    #[test]
    fn test_ties_broken_by_lowest_index() {
        let v = vec![1.0, -2.0, 2.0, 2.0, 0.5];
        let sq = compress(&v, 0.4, 8).unwrap();
        assert_eq!(sq.indices, vec![1, 2]);
        assert_eq!(compress(&v, 0.4, 8).unwrap(), sq);
    }

    #[test]
    fn test_error_bound_for_small_values() {
        for &(bits, ref v) in &[
            (2_u8, vec![5.0_f32, 0.01]),
            (4, vec![100.0, -0.001, 0.002, 0.0, -50.0]),
            (8, vec![10.0, 0.0001, -0.039, 0.04]),
        ] {
            let sq = compress(v, 1.0, bits).unwrap();
            let dense = decompress(&sq).unwrap();
            let bound = sq.scale * 2_f32.powi(-(i32::from(bits) - 1));
            for (orig, rec) in v.iter().zip(dense.iter()) {
                assert!(
                    (orig - rec).abs() <= bound,
                    "{} reconstructed as {} with {} bits",
                    orig,
                    rec,
                    bits
                );
            }
        }
        // below half a step a value is dropped
        let sq = compress(&[5.0, 0.01], 1.0, 2).unwrap();
        assert_eq!(sq.codes, vec![1, 0]);
        assert_eq!(decompress(&sq).unwrap(), vec![5.0, 0.0]);
    }

    #[test]
    fn test_zeroize() {
        let mut sq = compress(&[3.0, -1.0, 2.0], 1.0, 8).unwrap();
        sq.zeroize();
        assert!(sq.indices.iter().all(|&i| i == 0));
        assert!(sq.codes.iter().all(|&c| c == 0));
        assert_eq!(sq.scale, 0.0);
    }

    #[test]
    fn test_lossless_degenerate_case() {
        let v = vec![1.0, 0.0, -1.0, 3.0, 2.0, 0.25, -7.5];
        let sq = compress(&v, 1.0, 32).unwrap();
        assert_eq!(sq.len(), v.len());
        assert_eq!(decompress(&sq).unwrap(), v);
    }

    #[test]
    fn test_at_least_one_entry_is_kept() {
        let sq = compress(&[0.0, 0.0, 4.0], 0.01, 8).unwrap();
        assert_eq!(sq.indices, vec![2]);
        let sq = compress(&[], 0.5, 8).unwrap();
        assert!(sq.is_empty());
        assert!(decompress(&sq).unwrap().is_empty());
    }

    #[test]
    fn test_all_zero_vector() {
        let sq = compress(&[0.0, 0.0], 1.0, 8).unwrap();
        assert_eq!(sq.scale, 1.0);
        assert_eq!(decompress(&sq).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            compress(&[1.0], 0.0, 8),
            Err(CompressionError::InvalidFraction(_))
        ));
        assert!(matches!(
            compress(&[1.0], 1.5, 8),
            Err(CompressionError::InvalidFraction(_))
        ));
        assert!(matches!(
            compress(&[1.0], f64::NAN, 8),
            Err(CompressionError::InvalidFraction(_))
        ));
        assert!(matches!(
            compress(&[1.0], 1.0, 1),
            Err(CompressionError::InvalidBits(1))
        ));
        assert!(matches!(
            compress(&[1.0], 1.0, 33),
            Err(CompressionError::InvalidBits(33))
        ));
        assert!(matches!(
            compress(&[1.0, f32::INFINITY], 1.0, 8),
            Err(CompressionError::NonFinite { index: 1 })
        ));
    }

    #[test]
    fn test_malformed_inputs_are_rejected() {
        let good = compress(&[1.0, 2.0, 3.0], 1.0, 8).unwrap();

        let mut unsorted = good.clone();
        unsorted.indices.swap(0, 1);
        assert!(decompress(&unsorted).is_err());

        let mut out_of_range = good.clone();
        out_of_range.dim = 2;
        assert!(decompress(&out_of_range).is_err());

        let mut bad_code = good.clone();
        bad_code.codes[0] = 128;
        assert!(decompress(&bad_code).is_err());

        let mut bad_scale = good.clone();
        bad_scale.scale = f32::NAN;
        assert!(decompress(&bad_scale).is_err());

        let mut short = good;
        short.codes.pop();
        assert!(decompress(&short).is_err());
    }

    #[test]
    fn test_bytes() {
        let sq = compress(&[0.5, -1.5, 0.0, 2.5], 0.75, 16).unwrap();
        assert_eq!(SparseQuantized::from_bytes(&sq.to_bytes()).unwrap(), sq);
        assert!(matches!(
            SparseQuantized::from_bytes(&[1, 2, 3]),
            Err(CompressionError::Decode(_))
        ));
    }
}
