//! Reflect padding and patch extraction.
//!
//! Every pixel of the original grid, border pixels included, must have a full
//! `patch_size x patch_size` neighborhood. The grid is therefore extended by
//! `patch_size / 2` on each side with mirror (reflect) padding before any
//! patch work starts. The padded grid is built once per denoising pass and is
//! read-only afterwards; patches are zero-copy views into it.

use ndarray::{s, Array2, ArrayView2};

use crate::float_trait::DenoiseFloat;

/// Map a possibly out-of-range index onto the interior by mirror reflection.
///
/// Reflection does not repeat the edge pixel: for `len = 3` the extended
/// sequence reads `.., 2, 1, 0, 1, 2, 1, 0, ..` (numpy `mode='reflect'`,
/// not `symmetric`). Valid for any margin because the mapping is periodic
/// with period `2 * (len - 1)`.
#[inline]
fn reflect_index(index: isize, len: usize) -> usize {
    debug_assert!(len > 0);
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let mut k = index % period;
    if k < 0 {
        k += period;
    }
    if k >= len as isize {
        (period - k) as usize
    } else {
        k as usize
    }
}

/// Extend `image` by `margin` pixels on every side with reflect padding.
pub fn pad_reflect<F: DenoiseFloat>(image: ArrayView2<F>, margin: usize) -> Array2<F> {
    let (h, w) = image.dim();
    let m = margin as isize;
    Array2::from_shape_fn((h + 2 * margin, w + 2 * margin), |(r, c)| {
        let src_r = reflect_index(r as isize - m, h);
        let src_c = reflect_index(c as isize - m, w);
        image[[src_r, src_c]]
    })
}

/// View of the `patch_size x patch_size` window centered at `center`.
///
/// `center` is in padded-grid coordinates and must lie at least
/// `patch_size / 2` away from every border of `padded`.
pub fn extract_patch<F: DenoiseFloat>(
    padded: ArrayView2<'_, F>,
    center: (usize, usize),
    patch_size: usize,
) -> ArrayView2<'_, F> {
    let half = patch_size / 2;
    let (r, c) = center;
    padded.slice_move(s![r - half..=r + half, c - half..=c + half])
}
