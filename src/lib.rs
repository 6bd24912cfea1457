//! Non-Local Patch-Based Denoising
//!
//! Removes additive noise from a grayscale image by exploiting redundancy
//! between small, spatially displaced patches that look alike. Two fusion
//! strategies are provided on top of a shared windowed similarity search:
//!
//! - **NLM** ([`denoise_nlm`]): similarity-weighted averaging of matched
//!   patches.
//! - **WNNM** ([`denoise_wnnm`]): weighted singular-value shrinkage of the
//!   stacked patch matrix with overlap-add aggregation.
//!
//! Inputs are `ndarray` 2D grids, conceptually normalized to `[0, 1]`;
//! outputs keep the input shape but are not clamped to that range.

pub mod block_matching;
pub mod filtering;
pub mod float_trait;
pub mod padding;
pub mod pipeline;

// Re-export commonly used types at the crate root
pub use block_matching::{find_similar_patches, patch_distance, MatchPolicy, PatchMatch};
pub use filtering::{fuse_weighted_average, fuse_wnnm, shrink_singular_values, stack_patches};
pub use float_trait::DenoiseFloat;
pub use padding::{extract_patch, pad_reflect};
pub use pipeline::{
    denoise_nlm, denoise_nlm_with_config, denoise_wnnm, denoise_wnnm_with_config, ConfigError,
    NlmConfig, WnnmConfig, DEFAULT_AGGREGATION_H, DEFAULT_MAX_NEIGHBORS,
};
