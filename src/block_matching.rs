//! Windowed patch similarity search.
//!
//! For a reference patch centered at a padded-grid coordinate, scan the
//! square neighborhood of radius `search_dist` and collect candidate patches
//! ordered by Euclidean distance. The reference location itself is never
//! discovered by the scan; it is injected up front with distance zero so the
//! self patch is always the first candidate.

use ndarray::ArrayView2;
use std::cmp::Ordering;

use crate::float_trait::DenoiseFloat;
use crate::padding::extract_patch;

/// A matched patch location with its distance to the reference patch.
///
/// Coordinates are patch centers in padded-grid space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchMatch<F: DenoiseFloat> {
    pub row: usize,
    pub col: usize,
    pub distance: F,
}

/// Candidate retention policy applied after the distance-sorted scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchPolicy<F: DenoiseFloat> {
    /// Keep every candidate in the search window.
    All,
    /// Keep the `n` nearest neighbors; the reference patch is kept on top of
    /// that, so the result holds at most `n + 1` entries.
    KNearest(usize),
    /// Keep every candidate whose distance is at most the tolerance.
    /// The reference patch (distance 0) always qualifies.
    DistanceTolerance(F),
}

/// Euclidean (root-sum-square) distance between two equally shaped patches.
pub fn patch_distance<F: DenoiseFloat>(a: ArrayView2<F>, b: ArrayView2<F>) -> F {
    debug_assert_eq!(a.dim(), b.dim());
    let mut sum_sq = F::zero();
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = *x - *y;
        sum_sq += diff * diff;
    }
    sum_sq.sqrt()
}

/// Find patches similar to the one centered at `center`.
///
/// The scan covers `[center - search_dist, center + search_dist]` on both
/// axes. Candidate centers whose patch would leave the padded grid are
/// skipped on the low side; on the high side the axis is abandoned with a
/// `break`, which is sound because coordinates are scanned in increasing
/// order and out-of-range is monotonic past the first violation.
///
/// The result is sorted ascending by distance with a stable sort, so equal
/// distances keep row-major discovery order and the injected reference entry
/// stays first. `policy` is applied after sorting.
pub fn find_similar_patches<F: DenoiseFloat>(
    padded: ArrayView2<F>,
    center: (usize, usize),
    patch_size: usize,
    search_dist: usize,
    policy: MatchPolicy<F>,
) -> Vec<PatchMatch<F>> {
    let half = patch_size / 2;
    let (n, m) = padded.dim();
    let (r, c) = center;
    debug_assert!(r >= half && r + half < n && c >= half && c + half < m);

    let ref_patch = extract_patch(padded, center, patch_size);

    let mut matches = vec![PatchMatch {
        row: r,
        col: c,
        distance: F::zero(),
    }];

    let dist = search_dist as isize;
    let half_i = half as isize;
    for s_row in (r as isize - dist)..=(r as isize + dist) {
        if s_row < half_i {
            continue;
        }
        let s_row = s_row as usize;
        if s_row + half >= n {
            break;
        }

        for s_col in (c as isize - dist)..=(c as isize + dist) {
            if s_col < half_i || (s_row == r && s_col == c as isize) {
                continue;
            }
            let s_col = s_col as usize;
            if s_col + half >= m {
                break;
            }

            let candidate = extract_patch(padded, (s_row, s_col), patch_size);
            matches.push(PatchMatch {
                row: s_row,
                col: s_col,
                distance: patch_distance(ref_patch, candidate),
            });
        }
    }

    // Stable sort: ties keep discovery order, deterministic across runs.
    matches.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
    });

    match policy {
        MatchPolicy::All => {}
        MatchPolicy::KNearest(n_keep) => matches.truncate(n_keep + 1),
        MatchPolicy::DistanceTolerance(tol) => matches.retain(|m| m.distance <= tol),
    }

    matches
}
