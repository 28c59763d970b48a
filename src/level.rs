//! Progressive level sampling.
//!
//! A level is a resolution hint. Level 1 is a single sample, level 2 the two
//! bounds, and each further level inserts a midpoint between every adjacent
//! pair of the previous level. Samples at level `L` are therefore always a
//! subset of the samples at level `L + 1`, so a sweep re-run at a higher
//! level reuses every previously cached cell.
//!
//! The functions here are pure and know nothing about caching.

use crate::error::ConfigError;

/// Highest level honoured for continuous domains; higher requests are
/// clamped to it.
pub const MAX_LEVEL: u32 = 12;

/// Level at which any domain indexable by `usize` is fully resolved.
pub const MAX_INDEX_LEVEL: u32 = usize::BITS + 2;

/// Number of subdivisions of the unit interval at `level`.
///
/// Level 2 has one interval, level 3 two, level 4 four, and so on.
fn subdivisions(level: u32) -> u64 {
    1u64 << (level.clamp(2, MAX_LEVEL) - 2)
}

/// Validates a requested level.
///
/// Levels are kept up to [`MAX_INDEX_LEVEL`]; continuous domains clamp
/// further to [`MAX_LEVEL`] when sampled.
pub fn checked_level(level: u32) -> Result<u32, ConfigError> {
    if level == 0 {
        return Err(ConfigError::InvalidLevel { level });
    }
    Ok(level.min(MAX_INDEX_LEVEL))
}

/// Lowest level at which a domain of `n` ordered values is returned whole:
/// `ceil(log2(n - 1)) + 2`.
#[must_use]
pub fn natural_level(n: usize) -> u32 {
    match n {
        0 | 1 => 1,
        n => {
            let gaps = n - 1;
            let ceil_log2 = if gaps == 1 {
                0
            } else {
                usize::BITS - (gaps - 1).leading_zeros()
            };
            ceil_log2 + 2
        }
    }
}

/// Number of samples a continuous domain yields at `level`.
#[must_use]
pub fn sample_count(level: u32) -> usize {
    match level {
        0 => 0,
        1 => 1,
        l => usize::try_from(subdivisions(l)).map_or(usize::MAX, |n| n + 1),
    }
}

/// Samples of the closed interval `[lo, hi]` at `level`.
///
/// The sample at position `k` of level `L` equals the sample at position
/// `2k` of level `L + 1` bit for bit: doubling numerator and denominator is
/// exact in IEEE arithmetic. The last sample is always exactly `hi`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn float_values(lo: f64, hi: f64, level: u32) -> Vec<f64> {
    if level <= 1 {
        return vec![lo];
    }
    let m = subdivisions(level);
    let mut out = Vec::with_capacity(sample_count(level));
    for k in 0..=m {
        let v = if k == 0 {
            lo
        } else if k == m {
            hi
        } else {
            lo + (hi - lo) * (k as f64) / (m as f64)
        };
        if out.last() != Some(&v) {
            out.push(v);
        }
    }
    out
}

/// Index positions into a domain of `n` ordered values at `level`.
///
/// Positions are the same dyadic fractions as [`float_values`], rounded half
/// up onto `0..n`. Rounding a fixed fraction is deterministic, so the
/// superset property carries over. Levels are clamped at
/// [`natural_level`], where the spacing drops to one and every index
/// appears.
#[must_use]
pub fn index_values(n: usize, level: u32) -> Vec<usize> {
    if n == 0 || level == 0 {
        return Vec::new();
    }
    if level == 1 || n == 1 {
        return vec![0];
    }
    let level = level.min(natural_level(n));
    let span = (n - 1) as u128;
    let m = 1u128 << (level.max(2) - 2);
    let mut out: Vec<usize> = Vec::new();
    for k in 0..=m {
        // round(k * span / m) with halves rounded up
        let idx = (2 * k * span + m) / (2 * m);
        #[allow(clippy::cast_possible_truncation)]
        let idx = idx as usize;
        if out.last() != Some(&idx) {
            out.push(idx);
        }
    }
    out
}

/// Picks the elements of `items` at `level`.
#[must_use]
pub fn select<T: Clone>(items: &[T], level: u32) -> Vec<T> {
    index_values(items.len(), level)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}

/// Integers of `[lo, hi]` at `level`.
#[must_use]
pub fn int_values(lo: i64, hi: i64, level: u32) -> Vec<i64> {
    if hi < lo {
        return vec![lo];
    }
    let n = usize::try_from(hi.abs_diff(lo)).map_or(usize::MAX, |d| d.saturating_add(1));
    index_values(n, level)
        .into_iter()
        .map(|i| lo.saturating_add_unsigned(i as u64))
        .collect()
}

/// Evenly spaced samples of `[lo, hi]` (no level; explicit count).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn linspace(lo: f64, hi: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![lo],
        n => {
            let step = (hi - lo) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { hi } else { lo + step * i as f64 })
                .collect()
        }
    }
}

/// Integers of `[lo, hi]` with an explicit sample count.
///
/// Every integer is returned when `count` covers the range.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn int_linspace(lo: i64, hi: i64, count: usize) -> Vec<i64> {
    let range = usize::try_from(hi.abs_diff(lo)).map_or(usize::MAX, |d| d.saturating_add(1));
    if count >= range {
        return (lo..=hi).collect();
    }
    let mut out: Vec<i64> = linspace(lo as f64, hi as f64, count)
        .into_iter()
        .map(|v| v.round() as i64)
        .collect();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn float_levels_match_documented_samples() {
        assert_eq!(float_values(0.0, 1.0, 1), vec![0.0]);
        assert_eq!(float_values(0.0, 1.0, 2), vec![0.0, 1.0]);
        assert_eq!(float_values(0.0, 1.0, 3), vec![0.0, 0.5, 1.0]);
        assert_eq!(float_values(0.0, 1.0, 4), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(sample_count(5), 9);
    }

    #[test]
    fn zero_width_domain_has_one_sample() {
        assert_eq!(float_values(2.0, 2.0, 1), vec![2.0]);
        assert_eq!(float_values(2.0, 2.0, 4), vec![2.0]);
        assert_eq!(int_values(3, 3, 5), vec![3]);
    }

    #[test]
    fn index_levels_cover_domain_when_exhausted() {
        assert_eq!(index_values(5, 1), vec![0]);
        assert_eq!(index_values(5, 2), vec![0, 4]);
        assert_eq!(index_values(5, 3), vec![0, 2, 4]);
        assert_eq!(index_values(5, 4), vec![0, 1, 2, 3, 4]);
        assert_eq!(index_values(5, 9), vec![0, 1, 2, 3, 4]);
        assert_eq!(index_values(4, 3), vec![0, 2, 3]);
    }

    #[test]
    fn select_picks_categorical_values() {
        let items = ["a", "b", "c"];
        assert_eq!(select(&items, 1), vec!["a"]);
        assert_eq!(select(&items, 2), vec!["a", "c"]);
        assert_eq!(select(&items, 3), vec!["a", "b", "c"]);
    }

    #[test]
    fn level_zero_is_rejected_and_high_levels_clamp() {
        assert_eq!(checked_level(0), Err(ConfigError::InvalidLevel { level: 0 }));
        assert_eq!(checked_level(40), Ok(40));
        assert_eq!(checked_level(u32::MAX), Ok(MAX_INDEX_LEVEL));
        assert_eq!(float_values(0.0, 1.0, 40).len(), sample_count(MAX_LEVEL));
    }

    #[test]
    fn natural_level_resolves_domain() {
        assert_eq!(natural_level(1), 1);
        assert_eq!(natural_level(2), 2);
        assert_eq!(natural_level(3), 3);
        assert_eq!(natural_level(5), 4);
        assert_eq!(natural_level(6), 5);
        assert_eq!(natural_level(1025), 12);
        assert_eq!(natural_level(1026), 13);
        assert_eq!(index_values(5000, 30).len(), 5000);
        assert_eq!(index_values(5000, 14).len(), 4097);
    }

    #[test]
    fn int_linspace_returns_full_range_when_covered() {
        assert_eq!(int_linspace(0, 3, 10), vec![0, 1, 2, 3]);
        assert_eq!(int_linspace(0, 10, 3), vec![0, 5, 10]);
    }

    #[test]
    fn linspace_ends_on_bounds() {
        let v = linspace(0.0, 0.3, 4);
        assert_eq!(v.len(), 4);
        assert_eq!(v[0], 0.0);
        assert_eq!(v[3], 0.3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_float_levels_refine(lo in -1.0e6f64..1.0e6, width in 0.0f64..1.0e6, level in 1u32..MAX_LEVEL) {
            let hi = lo + width;
            let coarse = float_values(lo, hi, level);
            let fine: Vec<u64> = float_values(lo, hi, level + 1).iter().map(|v| v.to_bits()).collect();
            let fine: HashSet<u64> = fine.into_iter().collect();
            for v in coarse {
                prop_assert!(fine.contains(&v.to_bits()));
            }
        }

        #[test]
        fn prop_high_levels_return_whole_index_domain(n in 1usize..6000, level in 16u32..=MAX_INDEX_LEVEL) {
            let values = index_values(n, level);
            prop_assert_eq!(values.len(), n);
            prop_assert_eq!(index_values(n, natural_level(n)), values);
        }

        #[test]
        fn prop_index_levels_refine(n in 1usize..200, level in 1u32..MAX_LEVEL) {
            let coarse = index_values(n, level);
            let fine: HashSet<usize> = index_values(n, level + 1).into_iter().collect();
            for i in &coarse {
                prop_assert!(fine.contains(i));
                prop_assert!(*i < n);
            }
        }
    }
}
