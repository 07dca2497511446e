//! Season-table and curve-table contracts.
//!
//! The per-site count table (season table) is produced externally. This
//! module validates its column contract at entry (case-insensitive names,
//! normalized to uppercase), coerces dtypes, and extracts rows into plain
//! vectors for the estimation loops.

use crate::error::ContractError;
use anyhow::{Context, Result};
use polars::prelude::*;

/// Required season-table columns, after uppercase normalization.
pub const SEASON_COLUMNS: [&str; 11] = [
    "SPECIES",
    "SITE_ID",
    "DATE",
    "WEEK",
    "WEEK_DAY",
    "DAY_SINCE",
    "M_YEAR",
    "M_SEASON",
    "COUNT",
    "ANCHOR",
    "COMPLT_SEASON",
];

/// Flight-curve table columns.
pub const CURVE_COLUMNS: [&str; 5] = ["SPECIES", "M_YEAR", "DATE", "TRIMDAYNO", "NM"];

const SEASON_INT_COLUMNS: [&str; 7] = [
    "WEEK",
    "WEEK_DAY",
    "DAY_SINCE",
    "M_YEAR",
    "M_SEASON",
    "ANCHOR",
    "COMPLT_SEASON",
];

/// Validate and normalize a season table.
///
/// Column names are matched case-insensitively and renamed to uppercase.
/// Integer flag columns are coerced to Int32, COUNT to Float64 (nullable),
/// identifiers and dates to String. Every column except COUNT must be
/// fully populated. Absence of any required column is fatal.
pub fn check_season_table(df: &DataFrame) -> Result<DataFrame> {
    let mut df = df.clone();
    normalize_names(&mut df)?;

    for name in SEASON_COLUMNS {
        if df.column(name).is_err() {
            return Err(ContractError::MissingColumn(name.to_string()).into());
        }
    }

    for name in ["SPECIES", "SITE_ID", "DATE"] {
        let casted = df
            .column(name)?
            .cast(&DataType::String)
            .with_context(|| format!("Failed to cast column '{}' to String", name))?;
        df.with_column(casted)?;
    }
    for name in SEASON_INT_COLUMNS {
        let casted = df
            .column(name)?
            .cast(&DataType::Int32)
            .with_context(|| format!("Failed to cast column '{}' to Int32", name))?;
        df.with_column(casted)?;
    }
    let counts = df
        .column("COUNT")?
        .cast(&DataType::Float64)
        .with_context(|| "Failed to cast column 'COUNT' to Float64")?;
    df.with_column(counts)?;

    for name in SEASON_COLUMNS {
        if name == "COUNT" {
            continue;
        }
        if df.column(name)?.null_count() > 0 {
            return Err(ContractError::NullsInRequired(name.to_string()).into());
        }
    }

    Ok(df)
}

/// Rename every column whose uppercase form differs from its current name.
fn normalize_names(df: &mut DataFrame) -> Result<()> {
    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    for name in names {
        let upper = name.to_uppercase();
        if upper != name {
            df.rename(&name, upper.into())
                .with_context(|| format!("Failed to rename column '{}'", name))?;
        }
    }
    Ok(())
}

/// Season-table rows extracted into plain vectors.
///
/// All vectors share one index; COUNT is the only nullable field.
pub struct SeasonRows {
    pub species: Vec<String>,
    pub site_id: Vec<String>,
    pub date: Vec<String>,
    pub week: Vec<i32>,
    pub week_day: Vec<i32>,
    pub day_since: Vec<i32>,
    pub m_year: Vec<i32>,
    pub m_season: Vec<i32>,
    pub count: Vec<Option<f64>>,
    pub anchor: Vec<i32>,
    pub complt_season: Vec<i32>,
}

impl SeasonRows {
    /// Extract from a table already validated by [`check_season_table`].
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        Ok(SeasonRows {
            species: str_vec(df, "SPECIES")?,
            site_id: str_vec(df, "SITE_ID")?,
            date: str_vec(df, "DATE")?,
            week: i32_vec(df, "WEEK")?,
            week_day: i32_vec(df, "WEEK_DAY")?,
            day_since: i32_vec(df, "DAY_SINCE")?,
            m_year: i32_vec(df, "M_YEAR")?,
            m_season: i32_vec(df, "M_SEASON")?,
            count: opt_f64_vec(df, "COUNT")?,
            anchor: i32_vec(df, "ANCHOR")?,
            complt_season: i32_vec(df, "COMPLT_SEASON")?,
        })
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    /// The single species of this table; more than one is a contract error.
    pub fn single_species(&self) -> Result<String> {
        let mut distinct: Vec<&str> = self.species.iter().map(|s| s.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        match distinct.len() {
            0 => Err(ContractError::EmptyTable("season table").into()),
            1 => Ok(distinct[0].to_string()),
            n => Err(ContractError::MultipleSpecies(n).into()),
        }
    }

    /// Monitoring years present, ascending.
    pub fn distinct_years(&self) -> Vec<i32> {
        let mut years = self.m_year.clone();
        years.sort_unstable();
        years.dedup();
        years
    }
}

/// Flight-curve rows extracted into plain vectors.
pub struct CurveRows {
    pub species: Vec<String>,
    pub m_year: Vec<i32>,
    pub date: Vec<String>,
    pub trimdayno: Vec<i32>,
    pub nm: Vec<Option<f64>>,
}

impl CurveRows {
    /// Validate column contract and extract a curve table.
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        let mut df = df.clone();
        normalize_names(&mut df)?;

        for name in CURVE_COLUMNS {
            if df.column(name).is_err() {
                return Err(ContractError::MissingColumn(name.to_string()).into());
            }
        }
        for name in ["SPECIES", "DATE"] {
            let casted = df.column(name)?.cast(&DataType::String)?;
            df.with_column(casted)?;
        }
        for name in ["M_YEAR", "TRIMDAYNO"] {
            let casted = df.column(name)?.cast(&DataType::Int32)?;
            df.with_column(casted)?;
        }
        let nm = df.column("NM")?.cast(&DataType::Float64)?;
        df.with_column(nm)?;

        Ok(CurveRows {
            species: str_vec(&df, "SPECIES")?,
            m_year: i32_vec(&df, "M_YEAR")?,
            date: str_vec(&df, "DATE")?,
            trimdayno: i32_vec(&df, "TRIMDAYNO")?,
            nm: opt_f64_vec(&df, "NM")?,
        })
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    /// Species of the curve table, if any rows exist; mixed species is fatal.
    pub fn species(&self) -> Result<Option<String>> {
        let mut distinct: Vec<&str> = self.species.iter().map(|s| s.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        match distinct.len() {
            0 => Ok(None),
            1 => Ok(Some(distinct[0].to_string())),
            n => Err(ContractError::MultipleSpecies(n).into()),
        }
    }
}

fn str_vec(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    Ok(df
        .column(name)?
        .str()?
        .into_iter()
        .map(|opt| opt.unwrap_or("").to_string())
        .collect())
}

fn i32_vec(df: &DataFrame, name: &str) -> Result<Vec<i32>> {
    Ok(df
        .column(name)?
        .i32()?
        .into_iter()
        .map(|opt| opt.unwrap_or(0))
        .collect())
}

fn opt_f64_vec(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    Ok(df.column(name)?.f64()?.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_table() -> DataFrame {
        df![
            "species" => &["sp1", "sp1"],
            "site_id" => &["S1", "S1"],
            "date" => &["2015-04-01", "2015-04-08"],
            "week" => &[14i32, 15],
            "week_day" => &[3i32, 3],
            "day_since" => &[91i32, 98],
            "m_year" => &[2015i32, 2015],
            "m_season" => &[1i32, 1],
            "count" => &[Some(2.0f64), None],
            "anchor" => &[0i32, 0],
            "complt_season" => &[1i32, 1],
        ]
        .unwrap()
    }

    #[test]
    fn test_lowercase_names_normalized() {
        let df = check_season_table(&minimal_table()).unwrap();
        for name in SEASON_COLUMNS {
            assert!(df.column(name).is_ok(), "missing {}", name);
        }
    }

    #[test]
    fn test_missing_column_is_fatal() {
        let df = minimal_table().drop("count").unwrap();
        let err = check_season_table(&df).unwrap_err();
        assert!(err.to_string().contains("COUNT"));
    }

    #[test]
    fn test_nullable_count_survives() {
        let df = check_season_table(&minimal_table()).unwrap();
        let rows = SeasonRows::from_frame(&df).unwrap();
        assert_eq!(rows.count, vec![Some(2.0), None]);
        assert_eq!(rows.single_species().unwrap(), "sp1");
        assert_eq!(rows.distinct_years(), vec![2015]);
    }

    #[test]
    fn test_multiple_species_rejected() {
        let mut df = minimal_table();
        df.with_column(Column::new("species".into(), ["sp1", "sp2"]))
            .unwrap();
        let df = check_season_table(&df).unwrap();
        let rows = SeasonRows::from_frame(&df).unwrap();
        assert!(rows.single_species().is_err());
    }
}
