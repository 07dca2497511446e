//! Nearest-year phenology fallback.
//!
//! When a year's flight curve cannot be estimated, a substitute curve is
//! borrowed from the closest neighboring year that has a fully complete
//! curve. The search is bounded and deterministic: offsets of increasing
//! magnitude, earlier year before later year at equal magnitude.

use rustc_hash::FxHashMap;

/// Search horizon in years on either side of the target.
pub const MAX_OFFSET: i32 = 5;

/// Find the closest donor year with a complete curve.
///
/// `completeness` maps every year for which any curve row exists to
/// whether that year's curve is complete (no missing NM). Candidates are
/// clamped to the range of years present. Returns `None` when no complete
/// curve lies within the horizon.
pub fn nearest_complete_year(target: i32, completeness: &FxHashMap<i32, bool>) -> Option<i32> {
    let min_year = *completeness.keys().min()?;
    let max_year = *completeness.keys().max()?;

    for step in 1..=MAX_OFFSET {
        for candidate in [target - step, target + step] {
            if candidate < min_year || candidate > max_year {
                continue;
            }
            if completeness.get(&candidate).copied().unwrap_or(false) {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completeness(entries: &[(i32, bool)]) -> FxHashMap<i32, bool> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_prefers_earlier_year_at_equal_offset() {
        let map = completeness(&[(2014, true), (2015, false), (2016, true)]);
        assert_eq!(nearest_complete_year(2015, &map), Some(2014));
    }

    #[test]
    fn test_prefers_smaller_offset() {
        let map = completeness(&[(2011, true), (2014, true), (2015, false)]);
        assert_eq!(nearest_complete_year(2015, &map), Some(2014));
    }

    #[test]
    fn test_falls_forward_when_no_earlier_donor() {
        let map = completeness(&[(2015, false), (2016, true)]);
        assert_eq!(nearest_complete_year(2015, &map), Some(2016));
    }

    #[test]
    fn test_never_beyond_horizon() {
        // Complete curve exists 6 years away: out of reach.
        let map = completeness(&[(2009, true), (2015, false)]);
        assert_eq!(nearest_complete_year(2015, &map), None);
    }

    #[test]
    fn test_incomplete_donors_skipped() {
        let map = completeness(&[(2013, true), (2014, false), (2015, false), (2016, false)]);
        assert_eq!(nearest_complete_year(2015, &map), Some(2013));
    }

    #[test]
    fn test_empty_map() {
        assert_eq!(nearest_complete_year(2015, &FxHashMap::default()), None);
    }
}
