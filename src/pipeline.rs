//! Denoising drivers: configuration, validation and the per-pixel loop.
//!
//! Both drivers follow the same shape: reflect-pad once, then for every
//! output pixel in row-major order run search -> fusion -> aggregation, and
//! finally crop back to the input shape. All pixel work is data-parallel over
//! a read-only padded grid; the WNNM overlap-add goes through per-worker
//! accumulator pairs merged by reduction, never through unsynchronized
//! shared writes.

use log::debug;
use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;
use thiserror::Error;

use crate::block_matching::{find_similar_patches, patch_distance, MatchPolicy};
use crate::filtering::{fuse_weighted_average, fuse_wnnm, stack_patches};
use crate::float_trait::DenoiseFloat;
use crate::padding::{extract_patch, pad_reflect};

/// Neighbor cap used by the convenience entry points, reference patch not
/// counted.
pub const DEFAULT_MAX_NEIGHBORS: usize = 10;

/// Aggregation weight bandwidth used by [`denoise_wnnm`].
pub const DEFAULT_AGGREGATION_H: f64 = 0.1;

/// Accumulated weights at or below this are treated as untouched cells and
/// fall back to the noisy input pixel instead of dividing.
const AGGREGATION_EPSILON: f64 = 1e-12;

/// Invalid configuration, reported before any pixel work begins.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("patch_size must be odd and positive, got {0}")]
    InvalidPatchSize(usize),
    #[error("patch_size {patch_size} exceeds image dimensions {rows}x{cols}")]
    PatchLargerThanImage {
        patch_size: usize,
        rows: usize,
        cols: usize,
    },
    #[error("filtering bandwidth h must be positive and finite, got {0}")]
    InvalidBandwidth(f64),
    #[error("noise_variance must be non-negative and finite, got {0}")]
    InvalidNoiseVariance(f64),
    #[error("distance tolerance must be non-negative and finite, got {0}")]
    InvalidTolerance(f64),
    #[error("image contains non-finite values")]
    NonFiniteImage,
}

fn check_patch_size(patch_size: usize, dim: (usize, usize)) -> Result<(), ConfigError> {
    // Even sizes make "center" ambiguous; they are rejected, not rounded.
    if patch_size == 0 || patch_size % 2 == 0 {
        return Err(ConfigError::InvalidPatchSize(patch_size));
    }
    let (rows, cols) = dim;
    if patch_size > rows.min(cols) {
        return Err(ConfigError::PatchLargerThanImage {
            patch_size,
            rows,
            cols,
        });
    }
    Ok(())
}

fn check_policy<F: DenoiseFloat>(policy: &MatchPolicy<F>) -> Result<(), ConfigError> {
    if let MatchPolicy::DistanceTolerance(tol) = policy {
        if !tol.is_finite() || *tol < F::zero() {
            return Err(ConfigError::InvalidTolerance(tol.as_f64()));
        }
    }
    Ok(())
}

fn check_finite<F: DenoiseFloat>(image: ArrayView2<F>) -> Result<(), ConfigError> {
    if image.iter().any(|v| !v.is_finite()) {
        return Err(ConfigError::NonFiniteImage);
    }
    Ok(())
}

/// Parameters for the averaging (NLM) driver.
#[derive(Debug, Clone, Copy)]
pub struct NlmConfig<F: DenoiseFloat> {
    pub patch_size: usize,
    pub search_dist: usize,
    /// Similarity bandwidth: candidate weight is `exp(-distance / h)`.
    pub h: F,
    pub policy: MatchPolicy<F>,
}

impl<F: DenoiseFloat> NlmConfig<F> {
    /// Reference NLM behavior: every candidate in the window contributes.
    pub fn new(patch_size: usize, search_dist: usize, h: F) -> Self {
        Self {
            patch_size,
            search_dist,
            h,
            policy: MatchPolicy::All,
        }
    }

    pub fn validate(&self, dim: (usize, usize)) -> Result<(), ConfigError> {
        check_patch_size(self.patch_size, dim)?;
        if !self.h.is_finite() || self.h <= F::zero() {
            return Err(ConfigError::InvalidBandwidth(self.h.as_f64()));
        }
        check_policy(&self.policy)
    }
}

/// Parameters for the shrinkage (WNNM) driver.
#[derive(Debug, Clone, Copy)]
pub struct WnnmConfig<F: DenoiseFloat> {
    pub patch_size: usize,
    pub search_dist: usize,
    /// Variance of the additive noise the shrinkage compensates for.
    pub noise_variance: F,
    /// Bandwidth for the overlap-add re-weighting of cleaned patches.
    pub aggregation_h: F,
    pub policy: MatchPolicy<F>,
}

impl<F: DenoiseFloat> WnnmConfig<F> {
    /// Reference WNNM behavior: ten nearest neighbors besides the reference.
    pub fn new(patch_size: usize, search_dist: usize, noise_variance: F) -> Self {
        Self {
            patch_size,
            search_dist,
            noise_variance,
            aggregation_h: F::from_f64_c(DEFAULT_AGGREGATION_H),
            policy: MatchPolicy::KNearest(DEFAULT_MAX_NEIGHBORS),
        }
    }

    pub fn validate(&self, dim: (usize, usize)) -> Result<(), ConfigError> {
        check_patch_size(self.patch_size, dim)?;
        if !self.noise_variance.is_finite() || self.noise_variance < F::zero() {
            return Err(ConfigError::InvalidNoiseVariance(
                self.noise_variance.as_f64(),
            ));
        }
        if !self.aggregation_h.is_finite() || self.aggregation_h <= F::zero() {
            return Err(ConfigError::InvalidBandwidth(self.aggregation_h.as_f64()));
        }
        check_policy(&self.policy)
    }
}

/// Non-Local Means denoising with the reference keep-all policy.
///
/// Complexity per pixel is `O((2*search_dist+1)^2 * patch_size^2)`; a full
/// pass is quadratic in the neighborhood size and quartic in the patch size.
pub fn denoise_nlm<F: DenoiseFloat>(
    image: ArrayView2<F>,
    patch_size: usize,
    search_dist: usize,
    h: F,
) -> Result<Array2<F>, ConfigError> {
    denoise_nlm_with_config(image, &NlmConfig::new(patch_size, search_dist, h))
}

/// Non-Local Means denoising with an explicit configuration.
pub fn denoise_nlm_with_config<F: DenoiseFloat>(
    image: ArrayView2<F>,
    config: &NlmConfig<F>,
) -> Result<Array2<F>, ConfigError> {
    config.validate(image.dim())?;
    check_finite(image)?;

    let (rows, cols) = image.dim();
    let half = config.patch_size / 2;
    let padded = pad_reflect(image, half);
    debug!(
        "nlm: {}x{} image, patch_size={}, search_dist={}",
        rows, cols, config.patch_size, config.search_dist
    );

    // Every output pixel is independent: one direct write each, so rows can
    // run on the Rayon pool without any shared mutable state.
    let flat: Vec<F> = (0..rows)
        .into_par_iter()
        .flat_map_iter(|row| {
            let padded = padded.view();
            let pr = row + half;
            (0..cols).map(move |col| {
                let pc = col + half;
                let matches = find_similar_patches(
                    padded,
                    (pr, pc),
                    config.patch_size,
                    config.search_dist,
                    config.policy,
                );
                match fuse_weighted_average(padded, &matches, config.patch_size, config.h) {
                    Some(fused) => fused[[half, half]],
                    // Degenerate total weight: keep the noisy pixel.
                    None => padded[[pr, pc]],
                }
            })
        })
        .collect();

    Ok(Array2::from_shape_vec((rows, cols), flat)
        .expect("row-major pixel buffer matches image shape"))
}

/// Weighted nuclear-norm (WNNM) denoising with the reference ten-neighbor
/// cap and the default aggregation bandwidth.
pub fn denoise_wnnm<F: DenoiseFloat>(
    image: ArrayView2<F>,
    patch_size: usize,
    search_dist: usize,
    noise_variance: F,
) -> Result<Array2<F>, ConfigError> {
    denoise_wnnm_with_config(
        image,
        &WnnmConfig::new(patch_size, search_dist, noise_variance),
    )
}

/// WNNM denoising with an explicit configuration.
///
/// Every cleaned patch is overlap-added at its own candidate location with
/// weight `exp(-distance(clean, noisy reference) / aggregation_h)`, alongside
/// a parallel weight-sum buffer. The final image is the interior crop of
/// `value_sum / weight_sum`; cells with no accumulated weight keep the noisy
/// input value.
pub fn denoise_wnnm_with_config<F: DenoiseFloat>(
    image: ArrayView2<F>,
    config: &WnnmConfig<F>,
) -> Result<Array2<F>, ConfigError> {
    config.validate(image.dim())?;
    check_finite(image)?;

    let (rows, cols) = image.dim();
    let patch_size = config.patch_size;
    let half = patch_size / 2;
    let padded = pad_reflect(image, half);
    debug!(
        "wnnm: {}x{} image, patch_size={}, search_dist={}, noise_variance={:?}",
        rows, cols, patch_size, config.search_dist, config.noise_variance
    );

    // Overlapping patch contributions from different pixels land on the same
    // accumulator cells, so each worker chunk owns a private accumulator
    // pair; the partial sums are merged once all chunks are done.
    let threads = rayon::current_num_threads().max(1);
    let chunk_len = rows.div_ceil(threads).max(1);
    let chunk_count = rows.div_ceil(chunk_len);

    let accumulators = (0..chunk_count)
        .into_par_iter()
        .map(|chunk_idx| {
            let row_start = chunk_idx * chunk_len;
            let row_end = (row_start + chunk_len).min(rows);
            let padded = padded.view();
            let mut value_sum = Array2::<F>::zeros(padded.dim());
            let mut weight_sum = Array2::<F>::zeros(padded.dim());

            for row in row_start..row_end {
                let pr = row + half;
                for col in 0..cols {
                    let pc = col + half;
                    let matches = find_similar_patches(
                        padded,
                        (pr, pc),
                        patch_size,
                        config.search_dist,
                        config.policy,
                    );
                    let stack = stack_patches(padded, &matches, patch_size);
                    let clean = fuse_wnnm(&stack, config.noise_variance);
                    let reference = extract_patch(padded, (pr, pc), patch_size);

                    for (i, m) in matches.iter().enumerate() {
                        let clean_patch =
                            clean.slice(s![i * patch_size..(i + 1) * patch_size, ..]);
                        let dist = patch_distance(reference, clean_patch);
                        let weight = (-dist / config.aggregation_h).exp();

                        // Overlap-add at the candidate's own location.
                        let r0 = m.row - half;
                        let c0 = m.col - half;
                        for pr2 in 0..patch_size {
                            for pc2 in 0..patch_size {
                                value_sum[[r0 + pr2, c0 + pc2]] +=
                                    weight * clean_patch[[pr2, pc2]];
                                weight_sum[[r0 + pr2, c0 + pc2]] += weight;
                            }
                        }
                    }
                }
                debug!("wnnm: row {}/{} done", row + 1, rows);
            }
            (value_sum, weight_sum)
        })
        .reduce_with(|(mut a_val, mut a_wgt), (b_val, b_wgt)| {
            a_val += &b_val;
            a_wgt += &b_wgt;
            (a_val, a_wgt)
        });

    let mut output = image.to_owned();
    if let Some((value_sum, weight_sum)) = accumulators {
        let eps = F::from_f64_c(AGGREGATION_EPSILON);
        for row in 0..rows {
            for col in 0..cols {
                let wgt = weight_sum[[row + half, col + half]];
                if wgt > eps {
                    output[[row, col]] = value_sum[[row + half, col + half]] / wgt;
                }
            }
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SimpleLcg {
        state: u64,
    }

    impl SimpleLcg {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_f64(&mut self) -> f64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (self.state >> 11) as f64 / (1u64 << 53) as f64
        }
    }

    fn random_matrix_f64(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = SimpleLcg::new(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.next_f64())
    }

    // ==================== Validation ====================

    #[test]
    fn test_rejects_even_patch_size() {
        let image = random_matrix_f64(8, 8, 1);
        let err = denoise_nlm(image.view(), 4, 2, 0.1).unwrap_err();
        assert_eq!(err, ConfigError::InvalidPatchSize(4));
    }

    #[test]
    fn test_rejects_zero_patch_size() {
        let image = random_matrix_f64(8, 8, 1);
        let err = denoise_nlm(image.view(), 0, 2, 0.1).unwrap_err();
        assert_eq!(err, ConfigError::InvalidPatchSize(0));
    }

    #[test]
    fn test_rejects_patch_larger_than_image() {
        let image = random_matrix_f64(5, 8, 1);
        let err = denoise_nlm(image.view(), 7, 2, 0.1).unwrap_err();
        assert_eq!(
            err,
            ConfigError::PatchLargerThanImage {
                patch_size: 7,
                rows: 5,
                cols: 8
            }
        );
    }

    #[test]
    fn test_rejects_non_positive_h() {
        let image = random_matrix_f64(8, 8, 1);
        assert!(matches!(
            denoise_nlm(image.view(), 3, 2, 0.0).unwrap_err(),
            ConfigError::InvalidBandwidth(_)
        ));
        assert!(matches!(
            denoise_nlm(image.view(), 3, 2, -1.0).unwrap_err(),
            ConfigError::InvalidBandwidth(_)
        ));
    }

    #[test]
    fn test_rejects_negative_noise_variance() {
        let image = random_matrix_f64(8, 8, 1);
        assert!(matches!(
            denoise_wnnm(image.view(), 3, 2, -0.01).unwrap_err(),
            ConfigError::InvalidNoiseVariance(_)
        ));
    }

    #[test]
    fn test_rejects_negative_tolerance() {
        let image = random_matrix_f64(8, 8, 1);
        let mut config = NlmConfig::new(3, 2, 0.1);
        config.policy = MatchPolicy::DistanceTolerance(-0.5);
        assert!(matches!(
            denoise_nlm_with_config(image.view(), &config).unwrap_err(),
            ConfigError::InvalidTolerance(_)
        ));
    }

    #[test]
    fn test_rejects_non_finite_image() {
        let mut image = random_matrix_f64(8, 8, 1);
        image[[3, 3]] = f64::NAN;
        assert_eq!(
            denoise_nlm(image.view(), 3, 2, 0.1).unwrap_err(),
            ConfigError::NonFiniteImage
        );
        assert_eq!(
            denoise_wnnm(image.view(), 3, 2, 0.01).unwrap_err(),
            ConfigError::NonFiniteImage
        );
    }

    // ==================== Shape invariance ====================

    #[test]
    fn test_nlm_preserves_shape() {
        let image = random_matrix_f64(9, 13, 77);
        let out = denoise_nlm(image.view(), 3, 2, 0.2).unwrap();
        assert_eq!(out.dim(), image.dim());
    }

    #[test]
    fn test_wnnm_preserves_shape() {
        let image = random_matrix_f64(9, 13, 78);
        let out = denoise_wnnm(image.view(), 3, 2, 0.01).unwrap();
        assert_eq!(out.dim(), image.dim());
    }

    // ==================== NLM behavior ====================

    #[test]
    fn test_nlm_constant_image_is_fixed_point() {
        let image = Array2::<f64>::from_elem((8, 8), 0.5);
        let out = denoise_nlm(image.view(), 3, 3, 0.1).unwrap();
        for &v in out.iter() {
            assert!((v - 0.5).abs() < 1e-12, "got {v}");
        }
    }

    #[test]
    fn test_nlm_higher_h_flattens_outlier_more() {
        // 5x5 flat image with one outlier pixel: a high-h run must pull the
        // outlier further toward the background than a low-h run.
        let mut image = Array2::<f64>::from_elem((5, 5), 0.5);
        image[[2, 2]] = 1.0;

        let low = denoise_nlm(image.view(), 3, 2, 0.05).unwrap();
        let high = denoise_nlm(image.view(), 3, 2, 2.0).unwrap();

        let low_dev = (low[[2, 2]] - 0.5).abs();
        let high_dev = (high[[2, 2]] - 0.5).abs();
        assert!(
            high_dev < low_dev,
            "high-h deviation {high_dev} must be below low-h deviation {low_dev}"
        );
    }

    #[test]
    fn test_nlm_output_finite_on_random_input() {
        let image = random_matrix_f64(10, 10, 4711);
        let out = denoise_nlm(image.view(), 3, 2, 0.1).unwrap();
        for &v in out.iter() {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn test_nlm_f32_precision_supported() {
        let image = Array2::<f32>::from_elem((6, 6), 0.25);
        let out = denoise_nlm(image.view(), 3, 2, 0.1f32).unwrap();
        for &v in out.iter() {
            assert!((v - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_nlm_tolerance_policy_runs() {
        let image = random_matrix_f64(8, 8, 31);
        let mut config = NlmConfig::new(3, 3, 0.1);
        config.policy = MatchPolicy::DistanceTolerance(1.75);
        let out = denoise_nlm_with_config(image.view(), &config).unwrap();
        assert_eq!(out.dim(), image.dim());
        for &v in out.iter() {
            assert!(v.is_finite());
        }
    }

    // ==================== WNNM behavior ====================

    #[test]
    fn test_wnnm_output_finite_everywhere() {
        let image = random_matrix_f64(10, 10, 2021);
        let out = denoise_wnnm(image.view(), 3, 2, 0.01).unwrap();
        for &v in out.iter() {
            assert!(v.is_finite(), "aggregation must never produce NaN/Inf");
        }
    }

    #[test]
    fn test_wnnm_attenuates_outlier() {
        let mut image = Array2::<f64>::from_elem((8, 8), 0.5);
        image[[4, 4]] = 1.0;
        let out = denoise_wnnm(image.view(), 3, 3, 0.01).unwrap();
        assert!(out[[4, 4]] < 1.0, "outlier must be attenuated");
        for &v in out.iter() {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn test_wnnm_zero_variance_runs() {
        let image = random_matrix_f64(8, 8, 17);
        let out = denoise_wnnm(image.view(), 3, 2, 0.0).unwrap();
        assert_eq!(out.dim(), image.dim());
        for &v in out.iter() {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn test_wnnm_custom_aggregation_bandwidth() {
        let image = random_matrix_f64(8, 8, 18);
        let mut config = WnnmConfig::new(3, 2, 0.01);
        config.aggregation_h = 0.5;
        let out = denoise_wnnm_with_config(image.view(), &config).unwrap();
        assert_eq!(out.dim(), image.dim());
    }

    #[test]
    fn test_wnnm_deterministic_across_runs() {
        // Chunk boundaries are fixed by the thread count; merge order of the
        // partial accumulators may vary, so agreement is up to rounding.
        let image = random_matrix_f64(9, 9, 909);
        let a = denoise_wnnm(image.view(), 3, 2, 0.01).unwrap();
        let b = denoise_wnnm(image.view(), 3, 2, 0.01).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-10);
        }
    }
}
