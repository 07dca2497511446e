//! Yearly abundance index per site.
//!
//! Reduces the imputed series to one scalar per (site, year), either from
//! the canonical mid-week day of each ISO week or from every in-season
//! day, always restricted to complete seasons.

use crate::error::ContractError;
use anyhow::Result;
use polars::prelude::*;
use rustc_hash::FxHashMap;

/// Canonical weekday used by the week-representative mode; weekly tables
/// are anchored mid-week upstream.
pub const WEEK_REPRESENTATIVE_DAY: i32 = 3;

/// Aggregate an imputed table into one abundance index per (site, year).
///
/// `by_week` selects the week-representative mode; otherwise every
/// in-season day of a complete season contributes. A site-year whose
/// fitted values are entirely missing yields a null index.
pub fn aggregate(imputed: &DataFrame, by_week: bool) -> Result<DataFrame> {
    for name in ["SITE_ID", "M_YEAR", "WEEK_DAY", "M_SEASON", "COMPLT_SEASON", "FITTED"] {
        if imputed.column(name).is_err() {
            return Err(ContractError::MissingColumn(name.to_string()).into());
        }
    }

    let site = imputed.column("SITE_ID")?.str()?;
    let m_year = imputed.column("M_YEAR")?.i32()?;
    let week_day = imputed.column("WEEK_DAY")?.i32()?;
    let m_season = imputed.column("M_SEASON")?.i32()?;
    let complt = imputed.column("COMPLT_SEASON")?.i32()?;
    let fitted = imputed.column("FITTED")?.f64()?;

    // (site, year) -> (sum of fitted, any non-missing contribution)
    let mut totals: FxHashMap<(String, i32), (f64, bool)> = FxHashMap::default();
    for k in 0..imputed.height() {
        if m_season.get(k).unwrap_or(0) == 0 || complt.get(k).unwrap_or(0) != 1 {
            continue;
        }
        if by_week && week_day.get(k).unwrap_or(0) != WEEK_REPRESENTATIVE_DAY {
            continue;
        }
        let key = (
            site.get(k).unwrap_or("").to_string(),
            m_year.get(k).unwrap_or(0),
        );
        let entry = totals.entry(key).or_insert((0.0, false));
        if let Some(f) = fitted.get(k) {
            entry.0 += f;
            entry.1 = true;
        }
    }

    let mut keys: Vec<(String, i32)> = totals.keys().cloned().collect();
    keys.sort();

    let mut site_col = Vec::with_capacity(keys.len());
    let mut year_col = Vec::with_capacity(keys.len());
    let mut index_col: Vec<Option<f64>> = Vec::with_capacity(keys.len());
    for key in keys {
        let (sum, any) = totals[&key];
        site_col.push(key.0);
        year_col.push(key.1);
        index_col.push(any.then_some(sum));
    }

    Ok(df!(
        "SITE_ID" => site_col,
        "M_YEAR" => year_col,
        "ABUNDANCE_INDEX" => index_col,
    )?)
}
