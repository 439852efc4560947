//! Study configuration.
//!
//! Dates are written as quoted ISO-8601 strings, e.g.
//!
//! ```toml
//! start_date = "2019-04-01"
//! end_date = "2020-03-31"
//!
//! [measure_start_dates]
//! during2020 = "2020-02-05"
//! ```
use crate::{ArcStr, Result};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

/// Maximum IMD rank (the number of LSOAs in England), used to split ranks into quintiles.
pub const IMD_SCALE: i64 = 32844;

/// Latest date an ethnicity code may be recorded, unless configured otherwise.
pub const DEFAULT_ETHNICITY_RECORDED_BY: &str = "2023-01-01";

/// Default number of weekly intervals in a measure.
pub const DEFAULT_INTERVAL_WEEKS: u32 = 12;

/// The label used for values that don't map to a category.
///
/// Downstream consumers match these as string constants, so the casing is part of each
/// variable's definition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingLabel {
    /// `"missing"`
    Lower,
    /// `"Missing"`
    Title,
}

impl MissingLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            MissingLabel::Lower => "missing",
            MissingLabel::Title => "Missing",
        }
    }
}

impl From<MissingLabel> for ArcStr {
    fn from(label: MissingLabel) -> Self {
        ArcStr::from(label.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Named start dates for measure interval sequences, e.g. `during2020 = "2020-02-05"`.
    #[serde(default)]
    pub measure_start_dates: BTreeMap<String, NaiveDate>,
    #[serde(default = "default_imd_scale")]
    pub imd_scale: i64,
    #[serde(default = "default_interval_weeks")]
    pub interval_weeks: u32,
    /// Latest date an ethnicity code may be recorded, for datasets that don't tie it to the
    /// study period. Defaults to [`DEFAULT_ETHNICITY_RECORDED_BY`].
    #[serde(default)]
    pub ethnicity_recorded_by: Option<NaiveDate>,
}

fn default_imd_scale() -> i64 {
    IMD_SCALE
}

fn default_interval_weeks() -> u32 {
    DEFAULT_INTERVAL_WEEKS
}

impl StudyConfig {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Result<Self> {
        let this = Self {
            start_date,
            end_date,
            measure_start_dates: BTreeMap::new(),
            imd_scale: IMD_SCALE,
            interval_weeks: DEFAULT_INTERVAL_WEEKS,
            ethnicity_recorded_by: None,
        };
        this.validate()?;
        Ok(this)
    }

    pub fn with_measure_start(mut self, name: impl Into<String>, date: NaiveDate) -> Self {
        self.measure_start_dates.insert(name.into(), date);
        self
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let this: Self = toml::from_str(input).context("parsing study configuration")?;
        this.validate()?;
        Ok(this)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = fs::read_to_string(path)
            .with_context(|| format!("reading study configuration \"{}\"", path.display()))?;
        Self::from_toml_str(&input)
            .with_context(|| format!("loading study configuration \"{}\"", path.display()))
    }

    pub fn ethnicity_cutoff(&self) -> Result<NaiveDate> {
        match self.ethnicity_recorded_by {
            Some(date) => Ok(date),
            None => DEFAULT_ETHNICITY_RECORDED_BY
                .parse()
                .context("parsing default ethnicity cutoff"),
        }
    }

    fn validate(&self) -> Result {
        ensure!(
            self.start_date <= self.end_date,
            "study start date {} is after end date {}",
            self.start_date,
            self.end_date
        );
        ensure!(self.imd_scale >= 5, "IMD scale must be at least 5");
        ensure!(self.interval_weeks > 0, "measures need at least one interval");
        for name in self.measure_start_dates.keys() {
            ensure!(
                !name.is_empty() && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'),
                "measure start date names must be non-empty and contain only [a-zA-Z0-9_], found \"{}\"",
                name
            );
        }
        Ok(())
    }
}
