//! Turning numbers and codes into category labels.
use crate::{config::MissingLabel, ArcStr, Result, Value};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Range where lower bound is inclusive, upper bound is exclusive or unbounded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range<T>(T, Option<T>);

impl<T> Range<T>
where
    T: Ord + fmt::Display,
{
    pub fn new(from: T, to: Option<T>) -> Result<Self> {
        if let Some(ref to) = to {
            ensure!(from < *to, "ranges must go from low to high ({} - {})", from, to);
        }
        Ok(Range(from, to))
    }

    pub fn contains(&self, val: &T) -> bool {
        if let Some(end) = &self.1 {
            val >= &self.0 && val < end
        } else {
            val >= &self.0
        }
    }
}

impl<T> fmt::Display for Range<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(end) = &self.1 {
            write!(f, "{} - {}", self.0, end)
        } else {
            write!(f, "{}+", self.0)
        }
    }
}

/// An ordered list of ranges. They are tested in order, so with overlapping ranges the first
/// match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet<T> {
    ranges: Vec<Range<T>>,
}

impl<T> RangeSet<T> {
    pub fn new(ranges: Vec<Range<T>>) -> Self {
        Self { ranges }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<T>> + '_ {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl<T> RangeSet<T>
where
    T: Ord + fmt::Display,
{
    /// Index of the first range containing `value`.
    pub fn position(&self, value: &T) -> Option<usize> {
        self.ranges.iter().position(|range| range.contains(value))
    }
}

/// Labelled integer buckets, e.g. IMD quintiles or age bands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buckets {
    ranges: RangeSet<i64>,
    labels: Vec<ArcStr>,
    missing: ArcStr,
}

impl Buckets {
    pub fn new(
        buckets: impl IntoIterator<Item = (Range<i64>, ArcStr)>,
        missing: MissingLabel,
    ) -> Self {
        let (ranges, labels): (Vec<_>, Vec<_>) = buckets.into_iter().unzip();
        Self {
            ranges: RangeSet::new(ranges),
            labels,
            missing: missing.into(),
        }
    }

    /// Buckets labelled by their range, e.g. "18 - 65" and "65+".
    pub fn from_ranges(ranges: RangeSet<i64>, missing: MissingLabel) -> Self {
        let labels = ranges.iter().map(|r| ArcStr::from(r.to_string())).collect();
        Self {
            ranges,
            labels,
            missing: missing.into(),
        }
    }

    /// Five buckets labelled "1" (most deprived) to "5", with upper bounds `scale * k / 5`
    /// (rounded down) for k = 1..5.
    ///
    /// Only the first bucket has a lower bound (0). The others are tested in order by their
    /// upper bound alone, so negative values land in "2". Values at or above `scale` and
    /// missing values get the missing label.
    pub fn quintiles(scale: i64, missing: MissingLabel) -> Result<Self> {
        ensure!(scale >= 5, "quintile scale must be at least 5, got {}", scale);
        let buckets = (1..=5)
            .map(|k| {
                let from = if k == 1 { 0 } else { i64::MIN };
                let label = ArcStr::from(k.to_string());
                Ok((Range::new(from, Some(scale * k / 5))?, label))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(buckets, missing))
    }

    pub fn label_for(&self, value: Option<i64>) -> ArcStr {
        value
            .and_then(|v| self.ranges.position(&v))
            .and_then(|idx| self.labels.get(idx))
            .unwrap_or(&self.missing)
            .clone()
    }
}

/// Maps values to human-readable labels. Anything not in the table, including missing values,
/// gets the missing label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupTable {
    entries: Arc<BTreeMap<Value, ArcStr>>,
    missing: ArcStr,
}

/// Ethnicity group codes (the category column of the ethnicity codelist) and their labels.
pub const ETHNICITY_GROUPS: [(&str, &str); 5] = [
    ("1", "White"),
    ("2", "Mixed"),
    ("3", "Asian or Asian British"),
    ("4", "Black or Black British"),
    ("5", "Chinese or Other Ethnic Groups"),
];

pub const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

impl LookupTable {
    pub fn new<K, L>(entries: impl IntoIterator<Item = (K, L)>, missing: MissingLabel) -> Self
    where
        K: Into<Value>,
        L: Into<ArcStr>,
    {
        Self {
            entries: Arc::new(
                entries
                    .into_iter()
                    .map(|(k, l)| (k.into(), l.into()))
                    .collect(),
            ),
            missing: missing.into(),
        }
    }

    pub fn ethnicity(missing: MissingLabel) -> Self {
        Self::new(ETHNICITY_GROUPS, missing)
    }

    /// Month numbers 1-12 to English month names.
    pub fn month_names(missing: MissingLabel) -> Self {
        Self::new(
            MONTH_NAMES
                .iter()
                .enumerate()
                .map(|(idx, name)| (idx as i64 + 1, *name)),
            missing,
        )
    }

    pub fn get(&self, value: &Value) -> ArcStr {
        self.entries.get(value).unwrap_or(&self.missing).clone()
    }
}
