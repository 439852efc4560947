//! Numerator/denominator sums over a sequence of calendar intervals.
//!
//! A [`Measure`] is evaluated once per interval. Dates written as [`DateRef::IntervalStart`]
//! and [`DateRef::IntervalEnd`] are bound to the interval being computed, so every reduction
//! that refers to them is recomputed for each window.
//!
//! [`DateRef::IntervalStart`]: crate::DateRef::IntervalStart
//! [`DateRef::IntervalEnd`]: crate::DateRef::IntervalEnd
use crate::{eval::EvalContext, expr::Expr, ArcStr, Result, Tables, Value};
use chrono::{Days, Months, NaiveDate};
use itertools::Itertools;
use qu::ick_use::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// A closed range of days.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Interval {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        ensure!(start <= end, "interval starts ({}) after it ends ({})", start, end);
        Ok(Self { start, end })
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Period {
    Weeks,
    Months,
}

/// `count` intervals of one period each, not yet anchored to a date.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Repeat {
    period: Period,
    count: u32,
}

pub fn weeks(count: u32) -> Repeat {
    Repeat {
        period: Period::Weeks,
        count,
    }
}

pub fn months(count: u32) -> Repeat {
    Repeat {
        period: Period::Months,
        count,
    }
}

impl Repeat {
    pub fn starting_on(self, start: NaiveDate) -> Intervals {
        Intervals {
            period: self.period,
            count: self.count,
            start,
        }
    }
}

/// A sequence of contiguous, non-overlapping intervals of equal calendar length.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervals {
    period: Period,
    count: u32,
    start: NaiveDate,
}

impl Intervals {
    pub fn period(&self) -> Period {
        self.period
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// The intervals in order. Each one ends the day before the next one starts.
    ///
    /// Month steps are taken from the first start date, so a sequence starting on the 31st
    /// comes back to the 31st whenever the month has one.
    pub fn to_vec(&self) -> Result<Vec<Interval>> {
        let out_of_range =
            |n: u32| anyhow::format_err!("interval {} from {} is out of range", n, self.start);
        let step = |n: u32| {
            let date = match self.period {
                Period::Weeks => self.start.checked_add_days(Days::new(7 * u64::from(n))),
                Period::Months => self.start.checked_add_months(Months::new(n)),
            };
            date.ok_or_else(|| out_of_range(n))
        };
        (0..self.count)
            .map(|n| {
                let start = step(n)?;
                let end = step(n + 1)?.pred_opt().ok_or_else(|| out_of_range(n))?;
                Interval::new(start, end)
            })
            .collect()
    }
}

/// Where an interval is in its evaluation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IntervalState {
    Pending,
    Computing,
    Emitted,
}

/// A named numerator/denominator pair, optionally grouped.
#[derive(Debug, Clone)]
pub struct Measure {
    name: ArcStr,
    numerator: Expr,
    denominator: Expr,
    intervals: Intervals,
    group_by: Vec<(ArcStr, Expr)>,
}

/// Column names of a measure table that group-by names can't use.
const RESERVED_COLUMNS: [&str; 5] = [
    "measure",
    "interval_start",
    "interval_end",
    "numerator",
    "denominator",
];

impl Measure {
    pub fn new(name: &str, numerator: Expr, denominator: Expr, intervals: Intervals) -> Self {
        Self {
            name: name.into(),
            numerator,
            denominator,
            intervals,
            group_by: vec![],
        }
    }

    /// Add a group-by column. Rows are emitted per distinct tuple of group values.
    pub fn group_by(mut self, name: &str, expr: Expr) -> Self {
        self.group_by.push((name.into(), expr));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn intervals(&self) -> Intervals {
        self.intervals
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.group_by.iter().map(|(name, _)| &**name)
    }

    fn validate(&self) -> Result {
        ensure!(!self.name.trim().is_empty(), "measure names can't be empty");
        ensure!(
            self.intervals.count > 0,
            "measure `{}` has no intervals",
            self.name
        );
        let mut seen = BTreeSet::new();
        for (name, expr) in &self.group_by {
            ensure!(
                !name.trim().is_empty(),
                "measure `{}` has an unnamed group",
                self.name
            );
            ensure!(
                !RESERVED_COLUMNS.contains(&&**name),
                "measure `{}` can't group by `{}`: the name is reserved",
                self.name,
                name
            );
            ensure!(
                seen.insert(name.clone()),
                "measure `{}` groups by `{}` more than once",
                self.name,
                name
            );
            expr.validate()
                .with_context(|| format!("in group `{}` of measure `{}`", name, self.name))?;
        }
        self.numerator
            .validate()
            .with_context(|| format!("in numerator of measure `{}`", self.name))?;
        self.denominator
            .validate()
            .with_context(|| format!("in denominator of measure `{}`", self.name))?;
        Ok(())
    }

    /// Step through the intervals one at a time.
    pub fn run<'a>(&'a self, tables: &'a Tables) -> Result<MeasureRun<'a>> {
        let intervals = self
            .intervals
            .to_vec()
            .with_context(|| format!("building intervals for measure `{}`", self.name))?;
        Ok(MeasureRun {
            measure: self,
            tables,
            states: vec![IntervalState::Pending; intervals.len()],
            intervals,
            next: 0,
        })
    }

    /// All rows, in interval order then group order.
    pub fn evaluate(&self, tables: &Tables) -> Result<Vec<MeasureRow>> {
        let mut rows = vec![];
        for interval_rows in self.run(tables)? {
            rows.extend(interval_rows?);
        }
        event!(
            Level::INFO,
            "measure `{}`: {} rows over {} intervals",
            self.name,
            rows.len(),
            self.intervals.count
        );
        Ok(rows)
    }

    fn compute(&self, tables: &Tables, interval: Interval) -> Result<Vec<MeasureRow>> {
        let ctx = EvalContext::for_interval(tables, interval);
        let numerator = ctx
            .evaluate(&self.numerator)
            .with_context(|| format!("evaluating numerator of `{}` for {}", self.name, interval))?;
        let denominator = ctx.evaluate(&self.denominator).with_context(|| {
            format!("evaluating denominator of `{}` for {}", self.name, interval)
        })?;
        let groups = self
            .group_by
            .iter()
            .map(|(name, expr)| {
                ctx.evaluate(expr).with_context(|| {
                    format!("evaluating group `{}` of `{}` for {}", name, self.name, interval)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Patients only count towards a measure when their denominator is true (or non-zero).
        let mut partitions: BTreeMap<Vec<Value>, (i64, i64)> = BTreeMap::new();
        for (idx, (num, den)) in numerator.iter().zip_eq(&denominator).enumerate() {
            if den.truth()? != Some(true) {
                continue;
            }
            let key = groups.iter().map(|col| col[idx].clone()).collect();
            let sums = partitions.entry(key).or_insert((0, 0));
            sums.0 += num.contribution()?;
            sums.1 += den.contribution()?;
        }

        Ok(partitions
            .into_iter()
            .map(|(key, (numerator, denominator))| MeasureRow {
                measure: self.name.clone(),
                interval,
                group: self.group_by.iter().map(|(name, _)| name.clone()).zip_eq(key).collect(),
                numerator,
                denominator,
            })
            .collect())
    }
}

/// The interval-by-interval evaluation of one measure.
///
/// Each call to `next` moves one interval from `Pending` through `Computing` to `Emitted`.
pub struct MeasureRun<'a> {
    measure: &'a Measure,
    tables: &'a Tables,
    intervals: Vec<Interval>,
    states: Vec<IntervalState>,
    next: usize,
}

impl MeasureRun<'_> {
    pub fn states(&self) -> &[IntervalState] {
        &self.states
    }

    fn transition(&mut self, idx: usize, to: IntervalState) {
        event!(
            Level::DEBUG,
            "measure `{}` {}: {:?} -> {:?}",
            self.measure.name,
            self.intervals[idx],
            self.states[idx],
            to
        );
        self.states[idx] = to;
    }
}

impl Iterator for MeasureRun<'_> {
    type Item = Result<Vec<MeasureRow>>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next;
        let interval = *self.intervals.get(idx)?;
        self.next += 1;
        self.transition(idx, IntervalState::Computing);
        let rows = self.measure.compute(self.tables, interval);
        if rows.is_ok() {
            self.transition(idx, IntervalState::Emitted);
        }
        Some(rows)
    }
}

/// A set of measures with unique names.
#[derive(Debug, Clone, Default)]
pub struct Measures {
    measures: Vec<Measure>,
}

impl Measures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, measure: Measure) -> Result {
        ensure!(
            self.measures.iter().all(|m| m.name != measure.name),
            "measure `{}` is defined more than once",
            measure.name
        );
        measure.validate()?;
        self.measures.push(measure);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.measures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measure> + '_ {
        self.measures.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| &*m.name == name)
    }

    /// Evaluate every measure. Measures are computed in parallel; rows come back in
    /// definition order.
    pub fn evaluate(&self, tables: &Tables) -> Result<MeasureTable> {
        let rows = self
            .measures
            .par_iter()
            .map(|measure| measure.evaluate(tables))
            .collect::<Result<Vec<_>>>()?;
        Ok(MeasureTable::new(rows.into_iter().flatten().collect()))
    }
}

/// One output row: the sums for one group in one interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureRow {
    pub measure: ArcStr,
    pub interval: Interval,
    pub group: Vec<(ArcStr, Value)>,
    pub numerator: i64,
    pub denominator: i64,
}

impl MeasureRow {
    pub fn group_value(&self, name: &str) -> Option<&Value> {
        self.group
            .iter()
            .find(|(group, _)| &**group == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasureTable {
    rows: Vec<MeasureRow>,
}

impl MeasureTable {
    pub fn new(rows: Vec<MeasureRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[MeasureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows_for<'a>(&'a self, measure: &'a str) -> impl Iterator<Item = &'a MeasureRow> + 'a {
        self.rows.iter().filter(move |row| &*row.measure == measure)
    }

    /// Every group-by column used by any measure, in first-seen order.
    pub fn group_columns(&self) -> Vec<ArcStr> {
        self.rows
            .iter()
            .flat_map(|row| row.group.iter().map(|(name, _)| name.clone()))
            .unique()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::{months, weeks, IntervalState, Measure, Measures};
    use crate::{
        fixtures::{date, f2f_codes, three_patients},
        DateRef, Expr, Rows, Value,
    };

    fn f2f_count() -> Expr {
        Rows::clinical_events()
            .where_in("snomedct_code", &f2f_codes())
            .where_on_or_between("date", DateRef::IntervalStart, DateRef::IntervalEnd)
            .count_for_patient()
    }

    fn registered() -> Expr {
        Rows::practice_registrations()
            .active_on(DateRef::IntervalStart)
            .exists_for_patient()
    }

    #[test]
    fn weekly_intervals_are_contiguous() {
        let intervals = weeks(5).starting_on(date(2020, 1, 1)).to_vec().unwrap();
        assert_eq!(intervals.len(), 5);
        assert_eq!(intervals[0].start, date(2020, 1, 1));
        assert_eq!(intervals[0].end, date(2020, 1, 7));
        assert_eq!(intervals[4].end, date(2020, 2, 4));
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].end.succ_opt().unwrap(), pair[1].start);
            assert_eq!(
                pair[0].end - pair[0].start,
                pair[1].end - pair[1].start
            );
        }
    }

    #[test]
    fn monthly_intervals_from_end_of_month() {
        let intervals = months(3).starting_on(date(2020, 1, 31)).to_vec().unwrap();
        let bounds: Vec<_> = intervals.iter().map(|i| (i.start, i.end)).collect();
        assert_eq!(
            bounds,
            [
                (date(2020, 1, 31), date(2020, 2, 28)),
                (date(2020, 2, 29), date(2020, 3, 30)),
                (date(2020, 3, 31), date(2020, 4, 29)),
            ]
        );
    }

    #[test]
    fn partitions_sum_to_total() {
        let tables = three_patients();
        let intervals = weeks(5).starting_on(date(2020, 1, 1));
        let mut measures = Measures::new();
        measures
            .define(Measure::new("total", f2f_count(), registered(), intervals))
            .unwrap();
        measures
            .define(
                Measure::new("by_age", f2f_count(), registered(), intervals)
                    .group_by("age_ge65", Expr::age_on(DateRef::IntervalStart).ge(65)),
            )
            .unwrap();
        let table = measures.evaluate(&tables).unwrap();

        let totals: Vec<_> = table.rows_for("total").collect();
        assert_eq!(totals.len(), 5);
        assert_eq!(
            totals.iter().map(|r| (r.numerator, r.denominator)).collect::<Vec<_>>(),
            [(1, 2), (0, 2), (1, 3), (0, 3), (1, 3)]
        );
        for total in totals {
            let (num, den) = table
                .rows_for("by_age")
                .filter(|row| row.interval == total.interval)
                .fold((0, 0), |(n, d), row| (n + row.numerator, d + row.denominator));
            assert_eq!((num, den), (total.numerator, total.denominator));
        }
        let older = table
            .rows_for("by_age")
            .find(|row| row.group_value("age_ge65") == Some(&Value::Bool(true)))
            .unwrap();
        assert_eq!((older.numerator, older.denominator), (1, 1));
        assert_eq!(table.group_columns(), vec![crate::ArcStr::from("age_ge65")]);
    }

    #[test]
    fn groups_are_tuples_of_every_key() {
        let tables = three_patients();
        let intervals = weeks(5).starting_on(date(2020, 1, 1));
        let mut measures = Measures::new();
        measures
            .define(Measure::new("total", f2f_count(), registered(), intervals))
            .unwrap();
        measures
            .define(
                Measure::new("by_sex_age", f2f_count(), registered(), intervals)
                    .group_by("sex", Expr::sex())
                    .group_by("age_ge65", Expr::age_on(DateRef::IntervalStart).ge(65)),
            )
            .unwrap();
        let table = measures.evaluate(&tables).unwrap();

        let rows = |start| {
            table
                .rows_for("by_sex_age")
                .filter(|row| row.interval.start == start)
                .map(|row| {
                    (
                        row.group_value("sex").unwrap().to_string(),
                        row.group_value("age_ge65").unwrap().to_string(),
                        row.numerator,
                        row.denominator,
                    )
                })
                .collect::<Vec<_>>()
        };
        let row = |sex: &str, old: &str, num: i64, den: i64| {
            (sex.to_string(), old.to_string(), num, den)
        };
        // patient 3 isn't registered until the third week
        assert_eq!(
            rows(date(2020, 1, 1)),
            [row("female", "F", 0, 1), row("male", "T", 1, 1)]
        );
        assert_eq!(
            rows(date(2020, 1, 15)),
            [
                row("female", "F", 0, 1),
                row("male", "F", 0, 1),
                row("male", "T", 1, 1),
            ]
        );
        assert_eq!(
            rows(date(2020, 1, 29)),
            [
                row("female", "F", 0, 1),
                row("male", "F", 1, 1),
                row("male", "T", 0, 1),
            ]
        );

        for total in table.rows_for("total") {
            let (num, den) = table
                .rows_for("by_sex_age")
                .filter(|row| row.interval == total.interval)
                .fold((0, 0), |(n, d), row| (n + row.numerator, d + row.denominator));
            assert_eq!((num, den), (total.numerator, total.denominator));
        }
        assert_eq!(
            table.group_columns(),
            vec![crate::ArcStr::from("sex"), crate::ArcStr::from("age_ge65")]
        );
    }

    #[test]
    fn zero_denominators_emit_nothing() {
        let tables = three_patients();
        let intervals = weeks(2).starting_on(date(2021, 1, 1));
        let measure = Measure::new("none", f2f_count(), f2f_count(), intervals);
        let mut run = measure.run(&tables).unwrap();
        assert_eq!(run.states(), [IntervalState::Pending; 2]);
        assert!(run.next().unwrap().unwrap().is_empty());
        assert_eq!(run.states(), [IntervalState::Emitted, IntervalState::Pending]);
        assert!(run.next().unwrap().unwrap().is_empty());
        assert!(run.next().is_none());
    }

    #[test]
    fn definition_errors() {
        let intervals = weeks(2).starting_on(date(2020, 1, 1));
        let mut measures = Measures::new();
        measures
            .define(Measure::new("m", f2f_count(), registered(), intervals))
            .unwrap();
        assert!(measures
            .define(Measure::new("m", f2f_count(), registered(), intervals))
            .is_err());
        assert!(measures
            .define(Measure::new(
                "no_intervals",
                f2f_count(),
                registered(),
                weeks(0).starting_on(date(2020, 1, 1))
            ))
            .is_err());
        assert!(measures
            .define(
                Measure::new("dup_group", f2f_count(), registered(), intervals)
                    .group_by("sex", Expr::sex())
                    .group_by("sex", Expr::sex())
            )
            .is_err());
        assert!(measures
            .define(
                Measure::new("reserved", f2f_count(), registered(), intervals)
                    .group_by("numerator", Expr::sex())
            )
            .is_err());
        assert_eq!(measures.len(), 1);
    }
}
