//! A small declarative language for per-patient variables.
//!
//! Expressions describe *what* to compute; [`crate::Dataset`] and [`crate::Measures`] evaluate
//! them against a set of [`crate::Tables`]. Because dates can refer to the bounds of a measure
//! interval, the same expression can be re-evaluated for every interval.
//!
//! ```
//! use consultation_measures::{case, Codelist, DateRef, Expr, Rows};
//! use chrono::NaiveDate;
//!
//! let f2f = Codelist::from_codes(["185317003"]);
//! let has_f2f = Rows::clinical_events()
//!     .where_on_or_between("date", DateRef::IntervalStart, DateRef::IntervalEnd)
//!     .where_in("snomedct_code", &f2f)
//!     .exists_for_patient();
//! let age = Expr::age_on(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
//! let band = case()
//!     .when(age.clone().lt(18), "child")
//!     .when(age.ge(18), "adult")
//!     .otherwise("missing")
//!     .build()
//!     .unwrap();
//! # let _ = (has_f2f, band);
//! ```
use crate::{
    bucket::{Buckets, LookupTable},
    codelist::Codelist,
    frame::Record,
    Address, Appointment, ArcStr, ClinicalEvent, Patient, Registration, Result, Value,
};
use chrono::NaiveDate;
use qu::ick_use::*;
use std::{fmt, ops};

/// A date in a variable definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRef {
    Fixed(NaiveDate),
    /// First day of the interval being computed (inclusive).
    IntervalStart,
    /// Last day of the interval being computed (inclusive).
    IntervalEnd,
}

impl DateRef {
    pub fn is_interval(self) -> bool {
        !matches!(self, DateRef::Fixed(_))
    }
}

impl From<NaiveDate> for DateRef {
    fn from(date: NaiveDate) -> Self {
        DateRef::Fixed(date)
    }
}

impl fmt::Display for DateRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DateRef::Fixed(date) => write!(f, "{}", date),
            DateRef::IntervalStart => f.write_str("INTERVAL.start_date"),
            DateRef::IntervalEnd => f.write_str("INTERVAL.end_date"),
        }
    }
}

/// The record tables a row query can select from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    ClinicalEvents,
    Appointments,
    Addresses,
    PracticeRegistrations,
}

impl Source {
    pub fn name(self) -> &'static str {
        match self {
            Source::ClinicalEvents => ClinicalEvent::TABLE,
            Source::Appointments => Appointment::TABLE,
            Source::Addresses => Address::TABLE,
            Source::PracticeRegistrations => Registration::TABLE,
        }
    }

    pub fn has_field(self, name: &str) -> bool {
        match self {
            Source::ClinicalEvents => ClinicalEvent::has_field(name),
            Source::Appointments => Appointment::has_field(name),
            Source::Addresses => Address::has_field(name),
            Source::PracticeRegistrations => Registration::has_field(name),
        }
    }
}

/// A condition on a single record. All dates are inclusive.
#[derive(Debug, Clone)]
pub enum RowFilter {
    InCodelist { field: ArcStr, codelist: Codelist },
    AnyOf { field: ArcStr, values: Vec<Value> },
    OnOrBetween { field: ArcStr, start: DateRef, end: DateRef },
    OnOrBefore { field: ArcStr, date: DateRef },
    OnOrAfter { field: ArcStr, date: DateRef },
    /// `start_date <= date` and `end_date` missing or `>= date`.
    ActiveOn(DateRef),
}

impl RowFilter {
    fn fields(&self) -> Vec<&str> {
        match self {
            RowFilter::InCodelist { field, .. }
            | RowFilter::AnyOf { field, .. }
            | RowFilter::OnOrBetween { field, .. }
            | RowFilter::OnOrBefore { field, .. }
            | RowFilter::OnOrAfter { field, .. } => vec![&**field],
            RowFilter::ActiveOn(_) => vec!["start_date", "end_date"],
        }
    }

    fn dates(&self) -> Vec<DateRef> {
        match self {
            RowFilter::InCodelist { .. } | RowFilter::AnyOf { .. } => vec![],
            RowFilter::OnOrBetween { start, end, .. } => vec![*start, *end],
            RowFilter::OnOrBefore { date, .. }
            | RowFilter::OnOrAfter { date, .. }
            | RowFilter::ActiveOn(date) => vec![*date],
        }
    }
}

/// A query over one record table: a source, filters (combined with AND), and an optional sort
/// key. Turned into a per-patient expression by one of the `*_for_patient` reductions.
#[derive(Debug, Clone)]
pub struct Rows {
    source: Source,
    filters: Vec<RowFilter>,
    sort_key: Option<ArcStr>,
}

impl Rows {
    pub fn from_source(source: Source) -> Self {
        Self {
            source,
            filters: vec![],
            sort_key: None,
        }
    }

    pub fn clinical_events() -> Self {
        Self::from_source(Source::ClinicalEvents)
    }

    pub fn appointments() -> Self {
        Self::from_source(Source::Appointments)
    }

    pub fn addresses() -> Self {
        Self::from_source(Source::Addresses)
    }

    pub fn practice_registrations() -> Self {
        Self::from_source(Source::PracticeRegistrations)
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn filters(&self) -> &[RowFilter] {
        &self.filters
    }

    pub fn sort_key(&self) -> Option<&str> {
        self.sort_key.as_deref()
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Keep records whose `field` is a code in `codelist`.
    pub fn where_in(self, field: &str, codelist: &Codelist) -> Self {
        self.filter(RowFilter::InCodelist {
            field: field.into(),
            codelist: codelist.clone(),
        })
    }

    /// Keep records whose `field` equals one of `values`.
    pub fn where_any_of<V: Into<Value>>(
        self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filter(RowFilter::AnyOf {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn where_on_or_between(
        self,
        field: &str,
        start: impl Into<DateRef>,
        end: impl Into<DateRef>,
    ) -> Self {
        self.filter(RowFilter::OnOrBetween {
            field: field.into(),
            start: start.into(),
            end: end.into(),
        })
    }

    pub fn where_on_or_before(self, field: &str, date: impl Into<DateRef>) -> Self {
        self.filter(RowFilter::OnOrBefore {
            field: field.into(),
            date: date.into(),
        })
    }

    pub fn where_on_or_after(self, field: &str, date: impl Into<DateRef>) -> Self {
        self.filter(RowFilter::OnOrAfter {
            field: field.into(),
            date: date.into(),
        })
    }

    /// Keep records spanning `date`. The table must have `start_date` and `end_date`.
    pub fn active_on(self, date: impl Into<DateRef>) -> Self {
        self.filter(RowFilter::ActiveOn(date.into()))
    }

    pub fn sort_by(mut self, field: &str) -> Self {
        self.sort_key = Some(field.into());
        self
    }

    pub fn exists_for_patient(self) -> Expr {
        Expr::Reduce(Box::new(self), Reduction::Exists)
    }

    pub fn count_for_patient(self) -> Expr {
        Expr::Reduce(Box::new(self), Reduction::Count)
    }

    /// `field` of the first record per patient. Needs a sort key.
    pub fn first_for_patient(self, field: &str) -> Expr {
        Expr::Reduce(Box::new(self), Reduction::First(field.into()))
    }

    /// `field` of the last record per patient. Needs a sort key.
    pub fn last_for_patient(self, field: &str) -> Expr {
        Expr::Reduce(Box::new(self), Reduction::Last(field.into()))
    }

    fn date_refs(&self) -> impl Iterator<Item = DateRef> + '_ {
        self.filters.iter().flat_map(RowFilter::dates)
    }

    fn validate(&self, reduction: &Reduction) -> Result {
        let table = self.source.name();
        let check = |field: &str| -> Result {
            ensure!(
                self.source.has_field(field),
                "table `{}` has no field `{}`",
                table,
                field
            );
            Ok(())
        };
        for filter in &self.filters {
            for field in filter.fields() {
                check(field)?;
            }
        }
        if let Some(key) = &self.sort_key {
            check(key)?;
        }
        match reduction {
            Reduction::Exists | Reduction::Count => (),
            Reduction::First(field) | Reduction::Last(field) => {
                check(field)?;
                ensure!(
                    self.sort_key.is_some(),
                    "picking one `{}` row per patient needs a sort key",
                    table
                );
            }
        }
        Ok(())
    }
}

/// How a row query becomes one value per patient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduction {
    Exists,
    Count,
    First(ArcStr),
    Last(ArcStr),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PatientField {
    Sex,
    DateOfBirth,
    DateOfDeath,
}

impl PatientField {
    pub(crate) fn get(self, patient: &Patient) -> Value {
        match self {
            PatientField::Sex => Value::from(patient.sex.code()),
            PatientField::DateOfBirth => Value::Date(patient.date_of_birth),
            PatientField::DateOfDeath => patient.date_of_death.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Ordered `when` branches with a mandatory default. Build with [`case`].
#[derive(Debug, Clone)]
pub struct Case {
    branches: Vec<(Expr, Expr)>,
    default: Box<Expr>,
}

impl Case {
    pub fn branches(&self) -> &[(Expr, Expr)] {
        &self.branches
    }

    pub fn default_value(&self) -> &Expr {
        &self.default
    }
}

/// Start a `case` expression.
pub fn case() -> CaseBuilder {
    CaseBuilder {
        branches: vec![],
        default: None,
    }
}

#[derive(Debug, Clone)]
pub struct CaseBuilder {
    branches: Vec<(Expr, Expr)>,
    default: Option<Expr>,
}

impl CaseBuilder {
    /// Add a branch. Branches are tested in the order they are added and the first true
    /// condition wins.
    pub fn when(mut self, condition: Expr, then: impl Into<Expr>) -> Self {
        self.branches.push((condition, then.into()));
        self
    }

    /// The value used when no condition is true.
    pub fn otherwise(mut self, default: impl Into<Expr>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Fails if there are no branches or no default.
    pub fn build(self) -> Result<Expr> {
        ensure!(
            !self.branches.is_empty(),
            "case expression has no `when` branches"
        );
        let default = self
            .default
            .ok_or_else(|| anyhow::format_err!("case expression has no default value"))?;
        Ok(Expr::Case(Case {
            branches: self.branches,
            default: Box::new(default),
        }))
    }
}

/// A per-patient expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Patient(PatientField),
    AgeOn(DateRef),
    Reduce(Box<Rows>, Reduction),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    /// Month number (1-12) of a date.
    Month(Box<Expr>),
    /// The codelist category of a code.
    ToCategory(Box<Expr>, Codelist),
    Case(Case),
    Bucket(Box<Expr>, Buckets),
    Lookup(Box<Expr>, LookupTable),
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn sex() -> Self {
        Expr::Patient(PatientField::Sex)
    }

    pub fn date_of_birth() -> Self {
        Expr::Patient(PatientField::DateOfBirth)
    }

    pub fn date_of_death() -> Self {
        Expr::Patient(PatientField::DateOfDeath)
    }

    /// Age in whole years on `date`.
    pub fn age_on(date: impl Into<DateRef>) -> Self {
        Expr::AgeOn(date.into())
    }

    pub fn equals(self, rhs: impl Into<Expr>) -> Self {
        self.compare(CmpOp::Eq, rhs)
    }

    pub fn not_equals(self, rhs: impl Into<Expr>) -> Self {
        self.compare(CmpOp::Ne, rhs)
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Self {
        self.compare(CmpOp::Lt, rhs)
    }

    pub fn le(self, rhs: impl Into<Expr>) -> Self {
        self.compare(CmpOp::Le, rhs)
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Self {
        self.compare(CmpOp::Gt, rhs)
    }

    pub fn ge(self, rhs: impl Into<Expr>) -> Self {
        self.compare(CmpOp::Ge, rhs)
    }

    pub fn compare(self, op: CmpOp, rhs: impl Into<Expr>) -> Self {
        Expr::Compare(op, Box::new(self), Box::new(rhs.into()))
    }

    pub fn month(self) -> Self {
        Expr::Month(Box::new(self))
    }

    pub fn to_category(self, codelist: &Codelist) -> Self {
        Expr::ToCategory(Box::new(self), codelist.clone())
    }

    pub fn bucket(self, buckets: Buckets) -> Self {
        Expr::Bucket(Box::new(self), buckets)
    }

    pub fn map_labels(self, table: &LookupTable) -> Self {
        Expr::Lookup(Box::new(self), table.clone())
    }

    /// Whether any date in the expression refers to a measure interval.
    pub fn uses_interval(&self) -> bool {
        let own = match self {
            Expr::AgeOn(date) => date.is_interval(),
            Expr::Reduce(rows, _) => rows.date_refs().any(DateRef::is_interval),
            _ => false,
        };
        own || self.children().into_iter().any(Expr::uses_interval)
    }

    /// Check field names and sort keys against the table definitions.
    pub fn validate(&self) -> Result {
        if let Expr::Reduce(rows, reduction) = self {
            rows.validate(reduction)?;
        }
        for child in self.children() {
            child.validate()?;
        }
        Ok(())
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_) | Expr::Patient(_) | Expr::AgeOn(_) | Expr::Reduce(..) => vec![],
            Expr::Not(e)
            | Expr::Month(e)
            | Expr::ToCategory(e, _)
            | Expr::Bucket(e, _)
            | Expr::Lookup(e, _) => vec![&**e],
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) => vec![&**a, &**b],
            Expr::Case(case) => case
                .branches
                .iter()
                .flat_map(|(cond, then)| [cond, then])
                .chain(Some(&*case.default))
                .collect(),
        }
    }
}

impl ops::BitAnd for Expr {
    type Output = Expr;
    fn bitand(self, rhs: Self) -> Self::Output {
        Expr::And(Box::new(self), Box::new(rhs))
    }
}

impl ops::BitOr for Expr {
    type Output = Expr;
    fn bitor(self, rhs: Self) -> Self::Output {
        Expr::Or(Box::new(self), Box::new(rhs))
    }
}

impl ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Self::Output {
        Expr::Not(Box::new(self))
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Expr {
                fn from(v: $ty) -> Self {
                    Expr::Literal(Value::from(v))
                }
            }
        )*
    };
}

literal_from!(bool, i32, i64, u32, &str, String, ArcStr, NaiveDate);

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}
