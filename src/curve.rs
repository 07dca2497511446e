//! Regional flight-curve estimation.
//!
//! For each requested year, pooled per-site counts are fitted with a
//! smooth-in-day B-spline term plus a fixed site effect, after filtering
//! sites on visit and occurrence thresholds. Large site pools are randomly
//! subsampled (seedable) and failed fits are retried with a fresh draw.
//! The fitted values are normalized per site into the NM column, which
//! sums to 1 over the year, and reduced to one curve row per day.
//!
//! Years are independent at this stage and run in parallel; every year
//! derives its own seed so the result is reproducible regardless of
//! scheduling.

use crate::data::{self, SeasonRows};
use crate::solver::basis::bspline_design;
use crate::solver::{fit_glm, FitOutcome, FittedGlm, GlmFamily, SolverOptions};
use anyhow::Result;
use nalgebra::DMatrix;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Above this many qualifying sites the faster fitting profile kicks in
/// automatically.
pub const FAST_MODE_SITE_THRESHOLD: usize = 100;

/// Configuration for [`estimate_curves`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveConfig {
    /// Random subsample cap on sites entering one fit.
    pub max_sites_per_fit: usize,
    /// Minimum non-missing visits for a site to qualify in a year.
    pub min_visits: u32,
    /// Minimum positive counts for a site to qualify in a year.
    pub min_occurrences: u32,
    /// Minimum qualifying sites, below which no fit is attempted.
    pub min_sites: usize,
    /// Fit attempts per year; each retry re-draws the site subsample.
    pub max_retries: u32,
    pub model_family: GlmFamily,
    /// Fit on complete-season rows only.
    pub restrict_to_complete_seasons: bool,
    /// Years to estimate; defaults to every year present.
    pub years: Option<Vec<i32>>,
    /// Faster fitting profile (smaller basis, tighter iteration budget).
    pub fast_mode: bool,
    /// Engage `fast_mode` only above [`FAST_MODE_SITE_THRESHOLD`] sites.
    pub auto_fast_mode_threshold: bool,
    pub retain_models: bool,
    pub retain_working_data: bool,
    /// Seed for the site subsample; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for CurveConfig {
    fn default() -> Self {
        CurveConfig {
            max_sites_per_fit: 100,
            min_visits: 3,
            min_occurrences: 2,
            min_sites: 1,
            max_retries: 3,
            model_family: GlmFamily::Poisson,
            restrict_to_complete_seasons: true,
            years: None,
            fast_mode: true,
            auto_fast_mode_threshold: true,
            retain_models: true,
            retain_working_data: true,
            seed: None,
        }
    }
}

/// Output of [`estimate_curves`]: the multi-year curve table plus
/// optionally retained per-year models and working datasets, keyed
/// `"{species}_{year}"`.
pub struct CurveSet {
    pub curves: DataFrame,
    pub models: Option<FxHashMap<String, FitOutcome>>,
    pub data: Option<FxHashMap<String, DataFrame>>,
}

/// One year's estimated curve, before assembly into the final table.
struct YearCurve {
    year: i32,
    dates: Vec<String>,
    days: Vec<i32>,
    nm: Vec<Option<f64>>,
    model: Option<FitOutcome>,
    working: Option<DataFrame>,
}

struct DayInfo {
    date: String,
    in_season: bool,
}

/// Estimate flight curves for every requested year of a one-species
/// season table.
pub fn estimate_curves(season: &DataFrame, config: &CurveConfig) -> Result<CurveSet> {
    let df = data::check_season_table(season)?;
    let rows = SeasonRows::from_frame(&df)?;
    let species = rows.single_species()?;

    let mut years = config
        .years
        .clone()
        .unwrap_or_else(|| rows.distinct_years());
    years.sort_unstable();
    years.dedup();

    debug!(species = %species, n_years = years.len(), "estimating flight curves");

    let results: Vec<YearCurve> = years
        .par_iter()
        .map(|&year| estimate_year(&rows, &species, year, config))
        .collect::<Result<Vec<_>>>()?;

    let n_rows: usize = results.iter().map(|yc| yc.days.len()).sum();
    let mut species_col = Vec::with_capacity(n_rows);
    let mut year_col = Vec::with_capacity(n_rows);
    let mut date_col = Vec::with_capacity(n_rows);
    let mut day_col = Vec::with_capacity(n_rows);
    let mut nm_col = Vec::with_capacity(n_rows);
    for yc in &results {
        for k in 0..yc.days.len() {
            species_col.push(species.clone());
            year_col.push(yc.year);
            date_col.push(yc.dates[k].clone());
            day_col.push(yc.days[k]);
            nm_col.push(yc.nm[k]);
        }
    }
    let curves = df!(
        "SPECIES" => species_col,
        "M_YEAR" => year_col,
        "DATE" => date_col,
        "TRIMDAYNO" => day_col,
        "NM" => nm_col,
    )?;

    let mut models: Option<FxHashMap<String, FitOutcome>> =
        config.retain_models.then(FxHashMap::default);
    let mut working: Option<FxHashMap<String, DataFrame>> =
        config.retain_working_data.then(FxHashMap::default);
    for yc in results {
        let key = format!("{}_{}", species, yc.year);
        if let (Some(m), Some(map)) = (yc.model, models.as_mut()) {
            map.insert(key.clone(), m);
        }
        if let (Some(w), Some(map)) = (yc.working, working.as_mut()) {
            map.insert(key, w);
        }
    }

    Ok(CurveSet {
        curves,
        models,
        data: working,
    })
}

fn estimate_year(
    rows: &SeasonRows,
    species: &str,
    year: i32,
    config: &CurveConfig,
) -> Result<YearCurve> {
    let idx: Vec<usize> = (0..rows.len())
        .filter(|&i| {
            rows.m_year[i] == year
                && (!config.restrict_to_complete_seasons || rows.complt_season[i] == 1)
        })
        .collect();

    if idx.is_empty() {
        warn!(species, year, "no season rows for year");
        return Ok(YearCurve {
            year,
            dates: vec![],
            days: vec![],
            nm: vec![],
            model: None,
            working: None,
        });
    }

    // Re-base DAY_SINCE to the trimmed day number starting at 1.
    let min_ds = idx.iter().map(|&i| rows.day_since[i]).min().unwrap_or(0);
    let mut day_grid: BTreeMap<i32, DayInfo> = BTreeMap::new();
    for &i in &idx {
        let td = rows.day_since[i] - min_ds + 1;
        let entry = day_grid.entry(td).or_insert_with(|| DayInfo {
            date: rows.date[i].clone(),
            in_season: false,
        });
        if rows.m_season[i] != 0 {
            entry.in_season = true;
        }
    }

    // Visit and occurrence thresholds; anchors are synthetic, not visits.
    let mut stats: FxHashMap<&str, (u32, u32)> = FxHashMap::default();
    for &i in &idx {
        let entry = stats.entry(rows.site_id[i].as_str()).or_insert((0, 0));
        if rows.anchor[i] == 0 {
            if let Some(c) = rows.count[i] {
                entry.0 += 1;
                if c > 0.0 {
                    entry.1 += 1;
                }
            }
        }
    }
    let mut sites: Vec<String> = stats
        .iter()
        .filter(|(_, &(visits, occur))| {
            visits >= config.min_visits && occur >= config.min_occurrences
        })
        .map(|(site, _)| site.to_string())
        .collect();
    sites.sort_unstable();

    let mut out = all_missing_year(year, &day_grid);

    if sites.len() < config.min_sites {
        warn!(
            species,
            year,
            n_sites = sites.len(),
            min_sites = config.min_sites,
            "not enough qualifying sites; flight curve left missing"
        );
        return Ok(out);
    }

    let fast = if config.auto_fast_mode_threshold {
        config.fast_mode && sites.len() > FAST_MODE_SITE_THRESHOLD
    } else {
        config.fast_mode
    };
    let n_days = day_grid.len();
    let cap = if fast { 10 } else { 17 };
    let n_basis = (n_days / 4).clamp(4, cap).min(n_days.max(4));
    let max_td = day_grid.keys().next_back().copied().unwrap_or(1);
    let domain = (1.0, max_td as f64);
    let opts = SolverOptions {
        max_iter: if fast { 25 } else { 50 },
        ..Default::default()
    };

    let mut rng = match config.seed {
        Some(s) => StdRng::seed_from_u64(s ^ (year as i64 as u64).wrapping_mul(0x9E3779B97F4A7C15)),
        None => StdRng::from_entropy(),
    };

    let mut model: Option<FittedGlm> = None;
    let mut sample: Vec<String> = Vec::new();
    let trials = config.max_retries.max(1);
    for trial in 1..=trials {
        sample = if sites.len() > config.max_sites_per_fit {
            let mut drawn: Vec<String> = sites
                .choose_multiple(&mut rng, config.max_sites_per_fit)
                .cloned()
                .collect();
            drawn.sort_unstable();
            drawn
        } else {
            sites.clone()
        };

        let fit = build_fit_data(rows, &idx, &sample, min_ds, n_basis, domain);
        if config.retain_working_data {
            out.working = Some(df!(
                "SITE_ID" => fit.row_sites.clone(),
                "TRIMDAYNO" => fit.row_days.clone(),
                "COUNT" => fit.response.clone(),
            )?);
        }

        match fit_glm(&fit.design, &fit.response, None, config.model_family, &opts) {
            FitOutcome::Fitted(m) => {
                out.model = Some(FitOutcome::Fitted(m.clone()));
                model = Some(m);
                break;
            }
            FitOutcome::Failed(f) => {
                warn!(
                    species,
                    year,
                    trial,
                    kind = ?f.kind,
                    "flight curve fit attempt failed: {}",
                    f.message
                );
                let give_up = !f.retryable() || trial == trials;
                out.model = Some(FitOutcome::Failed(f));
                if give_up {
                    break;
                }
            }
        }
    }

    let Some(model) = model else {
        warn!(species, year, "all fit attempts failed; flight curve left missing");
        return Ok(out);
    };

    // Predict every (site, day), zero the off-season days, then normalize
    // each site's fitted series so NM sums to 1.
    let days: Vec<i32> = day_grid.keys().copied().collect();
    let day_x: Vec<f64> = days.iter().map(|&d| d as f64).collect();
    let spline = bspline_design(&day_x, n_basis, domain);
    let p = n_basis + sample.len().saturating_sub(1);

    let mut fitted: Vec<Vec<f64>> = Vec::with_capacity(sample.len());
    for j in 0..sample.len() {
        let mut design = DMatrix::zeros(days.len(), p);
        for r in 0..days.len() {
            for c in 0..n_basis {
                design[(r, c)] = spline[(r, c)];
            }
            if j > 0 {
                design[(r, n_basis + j - 1)] = 1.0;
            }
        }
        let mut f = model.predict(&design, None);
        for (r, &d) in days.iter().enumerate() {
            if !day_grid[&d].in_season {
                f[r] = 0.0;
            }
        }
        fitted.push(f);
    }

    if fitted.iter().flatten().any(|v| !v.is_finite()) {
        warn!(species, year, "non-finite fitted values; flight curve left missing");
        return Ok(out);
    }
    if fitted.iter().any(|f| !(f.iter().sum::<f64>() > 0.0)) {
        warn!(species, year, "degenerate fitted series; flight curve left missing");
        return Ok(out);
    }

    // The site effect is additive on the log scale, so the normalized
    // shape is identical across sites; de-duplicate to the first one.
    let site_sum: f64 = fitted[0].iter().sum();
    out.nm = fitted[0]
        .iter()
        .map(|&v| Some(round5(v / site_sum)))
        .collect();

    Ok(out)
}

fn all_missing_year(year: i32, day_grid: &BTreeMap<i32, DayInfo>) -> YearCurve {
    YearCurve {
        year,
        dates: day_grid.values().map(|d| d.date.clone()).collect(),
        days: day_grid.keys().copied().collect(),
        nm: vec![None; day_grid.len()],
        model: None,
        working: None,
    }
}

struct FitData {
    design: DMatrix<f64>,
    response: Vec<f64>,
    row_sites: Vec<String>,
    row_days: Vec<i32>,
}

/// Assemble the working dataset and design matrix for one fit attempt:
/// B-spline columns in the trimmed day, plus a dummy per non-reference
/// site when more than one site remains.
fn build_fit_data(
    rows: &SeasonRows,
    idx: &[usize],
    sample: &[String],
    min_ds: i32,
    n_basis: usize,
    domain: (f64, f64),
) -> FitData {
    let site_index: FxHashMap<&str, usize> = sample
        .iter()
        .enumerate()
        .map(|(j, s)| (s.as_str(), j))
        .collect();

    let mut xs: Vec<f64> = Vec::new();
    let mut response: Vec<f64> = Vec::new();
    let mut row_sites: Vec<String> = Vec::new();
    let mut row_days: Vec<i32> = Vec::new();
    let mut site_of: Vec<usize> = Vec::new();
    for &i in idx {
        let Some(&j) = site_index.get(rows.site_id[i].as_str()) else {
            continue;
        };
        let Some(c) = rows.count[i] else { continue };
        let td = rows.day_since[i] - min_ds + 1;
        xs.push(td as f64);
        response.push(c);
        row_sites.push(rows.site_id[i].clone());
        row_days.push(td);
        site_of.push(j);
    }

    let spline = bspline_design(&xs, n_basis, domain);
    let p = n_basis + sample.len().saturating_sub(1);
    let mut design = DMatrix::zeros(xs.len(), p);
    for r in 0..xs.len() {
        for c in 0..n_basis {
            design[(r, c)] = spline[(r, c)];
        }
        if site_of[r] > 0 {
            design[(r, n_basis + site_of[r] - 1)] = 1.0;
        }
    }

    FitData {
        design,
        response,
        row_sites,
        row_days,
    }
}

fn round5(v: f64) -> f64 {
    (v * 1e5).round() / 1e5
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Weekly season table: one monitoring year, gaussian-shaped counts
    /// per site, two off-season anchor weeks at each end.
    fn season_df(n_sites: usize, year: i32) -> DataFrame {
        let mut species = Vec::new();
        let mut site_id = Vec::new();
        let mut date = Vec::new();
        let mut week = Vec::new();
        let mut week_day = Vec::new();
        let mut day_since = Vec::new();
        let mut m_year = Vec::new();
        let mut m_season = Vec::new();
        let mut count: Vec<Option<f64>> = Vec::new();
        let mut anchor = Vec::new();
        let mut complt = Vec::new();

        let base = 100 + (year - 2015) * 364;
        for s in 0..n_sites {
            for w in 0..24i32 {
                let in_season = (2..22).contains(&w);
                let is_anchor = !in_season;
                species.push("sp1".to_string());
                site_id.push(format!("S{}", s + 1));
                date.push(format!("{}-w{:02}", year, w));
                week.push(10 + w);
                week_day.push(3);
                day_since.push(base + w * 7);
                m_year.push(year);
                m_season.push(if in_season { 1 } else { 0 });
                let c = if is_anchor {
                    0.0
                } else {
                    let peak = 8.0 + s as f64 * 4.0;
                    (peak * (-((w - 12) as f64).powi(2) / 32.0).exp()).round()
                };
                count.push(Some(c));
                anchor.push(if is_anchor { 1 } else { 0 });
                complt.push(1);
            }
        }

        df!(
            "SPECIES" => species,
            "SITE_ID" => site_id,
            "DATE" => date,
            "WEEK" => week,
            "WEEK_DAY" => week_day,
            "DAY_SINCE" => day_since,
            "M_YEAR" => m_year,
            "M_SEASON" => m_season,
            "COUNT" => count,
            "ANCHOR" => anchor,
            "COMPLT_SEASON" => complt,
        )
        .unwrap()
    }

    #[test]
    fn test_nm_sums_to_one() {
        let season = season_df(3, 2015);
        let config = CurveConfig {
            seed: Some(7),
            ..Default::default()
        };
        let set = estimate_curves(&season, &config).unwrap();
        let nm = set.curves.column("NM").unwrap().f64().unwrap();
        assert_eq!(nm.null_count(), 0, "curve should be complete");
        let total: f64 = nm.into_iter().flatten().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-4);
        // Model retained under the species_year key.
        let models = set.models.unwrap();
        assert!(models.get("sp1_2015").unwrap().is_fitted());
    }

    #[test]
    fn test_min_sites_shortfall_leaves_curve_missing() {
        let season = season_df(1, 2015);
        let config = CurveConfig {
            min_sites: 2,
            seed: Some(7),
            ..Default::default()
        };
        let set = estimate_curves(&season, &config).unwrap();
        let nm = set.curves.column("NM").unwrap();
        assert_eq!(nm.null_count(), set.curves.height());
        assert!(set.curves.height() > 0);
        // No fit was attempted, so nothing is retained.
        assert!(set.models.unwrap().is_empty());
    }

    #[test]
    fn test_identical_seed_reproduces_curve() {
        let season = season_df(6, 2015);
        let config = CurveConfig {
            max_sites_per_fit: 3,
            seed: Some(42),
            ..Default::default()
        };
        let a = estimate_curves(&season, &config).unwrap();
        let b = estimate_curves(&season, &config).unwrap();
        assert!(a.curves.equals_missing(&b.curves));
    }

    #[test]
    fn test_off_season_days_have_zero_nm() {
        let season = season_df(2, 2015);
        let config = CurveConfig {
            seed: Some(7),
            ..Default::default()
        };
        let set = estimate_curves(&season, &config).unwrap();
        let day = set.curves.column("TRIMDAYNO").unwrap().i32().unwrap();
        let nm = set.curves.column("NM").unwrap().f64().unwrap();
        // First two weeks are anchors outside the season.
        for k in 0..set.curves.height() {
            if day.get(k).unwrap() <= 8 {
                assert_eq!(nm.get(k).unwrap(), 0.0);
            }
        }
    }
}
