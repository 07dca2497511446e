//! Count imputation against the flight-curve offset.
//!
//! Per year, the season table is joined to the curve table on date. A
//! year whose curve is missing borrows the nearest complete neighboring
//! curve first. Sites with any positive observed count are fitted with a
//! GLM of count on a log(NM) offset plus a fixed site effect; all-zero
//! sites bypass the solver with fitted values forced to 0. The imputed
//! count is the observed count when present, the fitted value otherwise,
//! and exactly 0 outside the active season.

use crate::data::{self, CurveRows, SeasonRows};
use crate::error::ContractError;
use crate::phenology;
use crate::solver::{fit_glm, FitOutcome, GlmFamily, SolverOptions};
use anyhow::Result;
use nalgebra::DMatrix;
use polars::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Floor applied to NM == 0 on in-season rows before the log offset.
pub const NM_FLOOR: f64 = 1e-6;

/// Configuration for [`impute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImputeConfig {
    /// Only quasi-Poisson is supported; anything else fails fast.
    pub model_family: GlmFamily,
    /// Restrict the site-regression fit to complete-season rows.
    pub restrict_to_complete_seasons: bool,
    /// Years to impute; defaults to every year present.
    pub years: Option<Vec<i32>>,
    /// Borrow the nearest complete curve when a year's curve is missing.
    pub use_nearest_phenology: bool,
    pub retain_models: bool,
}

impl Default for ImputeConfig {
    fn default() -> Self {
        ImputeConfig {
            model_family: GlmFamily::QuasiPoisson,
            restrict_to_complete_seasons: true,
            years: None,
            use_nearest_phenology: true,
            retain_models: true,
        }
    }
}

/// Output of [`impute`]: the season table extended with TRIMDAYNO, NM,
/// FITTED and IMPUTED_COUNT, plus optionally retained per-year models.
#[derive(Debug)]
pub struct ImputeOutput {
    pub imputed: DataFrame,
    pub models: Option<FxHashMap<String, FitOutcome>>,
}

/// Impute site-level counts for every requested year.
pub fn impute(season: &DataFrame, curves: &DataFrame, config: &ImputeConfig) -> Result<ImputeOutput> {
    if config.model_family != GlmFamily::QuasiPoisson {
        return Err(
            ContractError::UnsupportedFamily(config.model_family, "count imputation").into(),
        );
    }

    let df = data::check_season_table(season)?;
    let rows = SeasonRows::from_frame(&df)?;
    let species = rows.single_species()?;
    let curve = CurveRows::from_frame(curves)?;
    if let Some(curve_species) = curve.species()? {
        if curve_species != species {
            return Err(ContractError::SpeciesMismatch {
                season: species,
                curve: curve_species,
            }
            .into());
        }
    }

    // Curve lookups: (year, date) -> (trimmed day, NM), per-year
    // completeness, and per-year day -> NM for phenology donors.
    let mut by_date: FxHashMap<i32, FxHashMap<&str, (i32, Option<f64>)>> = FxHashMap::default();
    let mut by_day: FxHashMap<i32, FxHashMap<i32, f64>> = FxHashMap::default();
    let mut completeness: FxHashMap<i32, bool> = FxHashMap::default();
    for k in 0..curve.len() {
        let y = curve.m_year[k];
        by_date
            .entry(y)
            .or_default()
            .insert(curve.date[k].as_str(), (curve.trimdayno[k], curve.nm[k]));
        let complete = completeness.entry(y).or_insert(true);
        match curve.nm[k] {
            Some(v) => {
                by_day.entry(y).or_default().insert(curve.trimdayno[k], v);
            }
            None => *complete = false,
        }
    }

    let mut years = config
        .years
        .clone()
        .unwrap_or_else(|| rows.distinct_years());
    years.sort_unstable();
    years.dedup();

    let mut out = OutputColumns::default();
    let mut models: Option<FxHashMap<String, FitOutcome>> =
        config.retain_models.then(FxHashMap::default);

    for &year in &years {
        let idx: Vec<usize> = (0..rows.len()).filter(|&i| rows.m_year[i] == year).collect();
        if idx.is_empty() {
            continue;
        }
        debug!(species = %species, year, n_rows = idx.len(), "imputing counts");

        let min_ds = idx.iter().map(|&i| rows.day_since[i]).min().unwrap_or(0);
        let year_curve = by_date.get(&year);

        // Attach the curve by date; fall back to the re-based day number
        // for rows the curve table does not cover.
        let mut trim: Vec<i32> = Vec::with_capacity(idx.len());
        let mut nm: Vec<Option<f64>> = Vec::with_capacity(idx.len());
        for &i in &idx {
            match year_curve.and_then(|m| m.get(rows.date[i].as_str())) {
                Some(&(td, v)) => {
                    trim.push(td);
                    nm.push(v);
                }
                None => {
                    trim.push(rows.day_since[i] - min_ds + 1);
                    nm.push(None);
                }
            }
        }

        let missing_in_season = idx
            .iter()
            .enumerate()
            .any(|(k, &i)| rows.m_season[i] != 0 && nm[k].is_none());
        if missing_in_season {
            if config.use_nearest_phenology {
                match phenology::nearest_complete_year(year, &completeness) {
                    Some(donor) => {
                        warn!(
                            species = %species,
                            year,
                            donor,
                            "flight curve missing; substituting nearest year's phenology"
                        );
                        let donor_map = by_day.get(&donor);
                        for (k, v) in nm.iter_mut().enumerate() {
                            *v = donor_map.and_then(|m| m.get(&trim[k]).copied());
                        }
                    }
                    None => warn!(
                        species = %species,
                        year,
                        "no complete flight curve within {} years; imputation degraded",
                        phenology::MAX_OFFSET
                    ),
                }
            } else {
                warn!(species = %species, year, "flight curve missing; imputation degraded");
            }
        }

        // A zero NM is unsafe under a log offset.
        for (k, &i) in idx.iter().enumerate() {
            if rows.m_season[i] != 0 {
                if let Some(v) = nm[k] {
                    if v == 0.0 {
                        nm[k] = Some(NM_FLOOR);
                    }
                }
            }
        }

        // Split sites on their observed year totals.
        let mut site_totals: FxHashMap<&str, f64> = FxHashMap::default();
        for &i in &idx {
            let total = site_totals.entry(rows.site_id[i].as_str()).or_insert(0.0);
            if let Some(c) = rows.count[i] {
                *total += c;
            }
        }
        let mut nonzero: Vec<String> = site_totals
            .iter()
            .filter(|(_, &t)| t > 0.0)
            .map(|(s, _)| s.to_string())
            .collect();
        nonzero.sort_unstable();

        let outcome = if nonzero.is_empty() {
            None
        } else {
            Some(fit_site_regression(&rows, &idx, &nm, &nonzero, config))
        };
        if let Some(FitOutcome::Failed(f)) = &outcome {
            warn!(
                species = %species,
                year,
                kind = ?f.kind,
                "site regression failed; fitted values left missing: {}",
                f.message
            );
        }

        // Predictions for nonzero sites; zero sites bypass the model.
        let site_index: FxHashMap<&str, usize> = nonzero
            .iter()
            .enumerate()
            .map(|(j, s)| (s.as_str(), j))
            .collect();
        let fitted_model = outcome.as_ref().and_then(|o| o.as_fitted());

        for (k, &i) in idx.iter().enumerate() {
            let site = rows.site_id[i].as_str();
            let fitted: Option<f64> = if rows.m_season[i] == 0 {
                Some(0.0)
            } else if let Some(&j) = site_index.get(site) {
                match (fitted_model, nm[k]) {
                    (Some(model), Some(nm_v)) => {
                        let design = site_design_row(j, nonzero.len());
                        let offset = [nm_v.ln()];
                        Some(model.predict(&design, Some(&offset))[0])
                    }
                    _ => None,
                }
            } else {
                // All observed counts zero: no model involvement.
                Some(0.0)
            };

            let imputed = if rows.m_season[i] == 0 {
                Some(0.0)
            } else if let Some(c) = rows.count[i] {
                Some(c)
            } else {
                fitted
            };

            out.push(&rows, i, trim[k], nm[k], fitted, imputed);
        }

        if let (Some(o), Some(map)) = (outcome, models.as_mut()) {
            map.insert(format!("{}_{}", species, year), o);
        }
    }

    Ok(ImputeOutput {
        imputed: out.into_frame()?,
        models,
    })
}

/// Fit the nonzero-site regression: count on a log(NM) offset with an
/// intercept, plus a fixed site effect when more than one site remains.
fn fit_site_regression(
    rows: &SeasonRows,
    idx: &[usize],
    nm: &[Option<f64>],
    nonzero: &[String],
    config: &ImputeConfig,
) -> FitOutcome {
    let site_index: FxHashMap<&str, usize> = nonzero
        .iter()
        .enumerate()
        .map(|(j, s)| (s.as_str(), j))
        .collect();

    let p = 1 + nonzero.len().saturating_sub(1);
    let mut design_rows: Vec<usize> = Vec::new();
    let mut response: Vec<f64> = Vec::new();
    let mut offset: Vec<f64> = Vec::new();
    for (k, &i) in idx.iter().enumerate() {
        if rows.m_season[i] == 0 {
            continue;
        }
        if config.restrict_to_complete_seasons && rows.complt_season[i] != 1 {
            continue;
        }
        let Some(&j) = site_index.get(rows.site_id[i].as_str()) else {
            continue;
        };
        let (Some(c), Some(nm_v)) = (rows.count[i], nm[k]) else {
            continue;
        };
        design_rows.push(j);
        response.push(c);
        offset.push(nm_v.ln());
    }

    let mut design = DMatrix::zeros(response.len(), p);
    for (r, &j) in design_rows.iter().enumerate() {
        design[(r, 0)] = 1.0;
        if j > 0 {
            design[(r, j)] = 1.0;
        }
    }

    fit_glm(
        &design,
        &response,
        Some(&offset),
        config.model_family,
        &SolverOptions::default(),
    )
}

/// One prediction row for the site regression design.
fn site_design_row(site_idx: usize, n_sites: usize) -> DMatrix<f64> {
    let p = 1 + n_sites.saturating_sub(1);
    let mut design = DMatrix::zeros(1, p);
    design[(0, 0)] = 1.0;
    if site_idx > 0 {
        design[(0, site_idx)] = 1.0;
    }
    design
}

#[derive(Default)]
struct OutputColumns {
    species: Vec<String>,
    site_id: Vec<String>,
    date: Vec<String>,
    week: Vec<i32>,
    week_day: Vec<i32>,
    day_since: Vec<i32>,
    m_year: Vec<i32>,
    m_season: Vec<i32>,
    count: Vec<Option<f64>>,
    anchor: Vec<i32>,
    complt_season: Vec<i32>,
    trimdayno: Vec<i32>,
    nm: Vec<Option<f64>>,
    fitted: Vec<Option<f64>>,
    imputed: Vec<Option<f64>>,
}

impl OutputColumns {
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        rows: &SeasonRows,
        i: usize,
        trim: i32,
        nm: Option<f64>,
        fitted: Option<f64>,
        imputed: Option<f64>,
    ) {
        self.species.push(rows.species[i].clone());
        self.site_id.push(rows.site_id[i].clone());
        self.date.push(rows.date[i].clone());
        self.week.push(rows.week[i]);
        self.week_day.push(rows.week_day[i]);
        self.day_since.push(rows.day_since[i]);
        self.m_year.push(rows.m_year[i]);
        self.m_season.push(rows.m_season[i]);
        self.count.push(rows.count[i]);
        self.anchor.push(rows.anchor[i]);
        self.complt_season.push(rows.complt_season[i]);
        self.trimdayno.push(trim);
        self.nm.push(nm);
        self.fitted.push(fitted);
        self.imputed.push(imputed);
    }

    fn into_frame(self) -> Result<DataFrame> {
        Ok(df!(
            "SPECIES" => self.species,
            "SITE_ID" => self.site_id,
            "DATE" => self.date,
            "WEEK" => self.week,
            "WEEK_DAY" => self.week_day,
            "DAY_SINCE" => self.day_since,
            "M_YEAR" => self.m_year,
            "M_SEASON" => self.m_season,
            "COUNT" => self.count,
            "ANCHOR" => self.anchor,
            "COMPLT_SEASON" => self.complt_season,
            "TRIMDAYNO" => self.trimdayno,
            "NM" => self.nm,
            "FITTED" => self.fitted,
            "IMPUTED_COUNT" => self.imputed,
        )?)
    }
}
