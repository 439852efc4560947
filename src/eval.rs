//! Evaluating expressions to one value per patient.
use crate::{
    codelist::Codelist,
    expr::{CmpOp, DateRef, Expr, Reduction, RowFilter, Rows, Source},
    frame::{EventFrame, Record},
    measures::Interval,
    Result, Tables, Value,
};
use chrono::{Datelike, NaiveDate};
use itertools::Itertools;
use qu::ick_use::*;
use std::cmp::Ordering;

/// What an expression is evaluated against.
///
/// Every column returned by [`EvalContext::evaluate`] has one entry per patient, in the order
/// of `tables.patients`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvalContext<'a> {
    tables: &'a Tables,
    interval: Option<Interval>,
}

impl<'a> EvalContext<'a> {
    /// A context without an interval, as used for datasets.
    pub fn new(tables: &'a Tables) -> Self {
        Self {
            tables,
            interval: None,
        }
    }

    pub fn for_interval(tables: &'a Tables, interval: Interval) -> Self {
        Self {
            tables,
            interval: Some(interval),
        }
    }

    pub fn resolve(&self, date: DateRef) -> Result<NaiveDate> {
        match date {
            DateRef::Fixed(date) => Ok(date),
            DateRef::IntervalStart => self
                .interval
                .map(|i| i.start)
                .context("INTERVAL.start_date used outside of a measure"),
            DateRef::IntervalEnd => self
                .interval
                .map(|i| i.end)
                .context("INTERVAL.end_date used outside of a measure"),
        }
    }

    /// Evaluate `expr` as a boolean column, counting missing as false.
    pub fn mask(&self, expr: &Expr) -> Result<Vec<bool>> {
        self.evaluate(expr)?
            .iter()
            .map(|v| Ok(v.truth()? == Some(true)))
            .collect()
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Vec<Value>> {
        let patients = &self.tables.patients;
        match expr {
            Expr::Literal(v) => Ok(vec![v.clone(); patients.len()]),
            Expr::Patient(field) => Ok(patients.iter().map(|p| field.get(p)).collect()),
            Expr::AgeOn(date) => {
                let date = self.resolve(*date)?;
                Ok(patients.iter().map(|p| Value::Int(p.age_on(date))).collect())
            }
            Expr::Reduce(rows, reduction) => self.reduce(rows, reduction),
            Expr::Not(e) => self.map(e, |v| Ok(v.truth()?.map(|b| !b).into())),
            Expr::And(a, b) => self.zip(a, b, and),
            Expr::Or(a, b) => self.zip(a, b, or),
            Expr::Compare(op, a, b) => self.zip(a, b, |l, r| compare(*op, l, r)),
            Expr::Month(e) => self.map(e, |v| match v {
                Value::Missing => Ok(Value::Missing),
                Value::Date(d) => Ok(Value::Int(d.month().into())),
                other => bail!("expected a date, found {} `{}`", other.type_name(), other),
            }),
            Expr::ToCategory(e, codelist) => self.map(e, |v| category(codelist, v)),
            Expr::Case(case) => {
                let branches = case
                    .branches()
                    .iter()
                    .map(|(cond, then)| Ok((self.evaluate(cond)?, self.evaluate(then)?)))
                    .collect::<Result<Vec<_>>>()?;
                let default = self.evaluate(case.default_value())?;
                default
                    .into_iter()
                    .enumerate()
                    .map(|(idx, default)| {
                        for (conds, thens) in &branches {
                            if conds[idx].truth()? == Some(true) {
                                return Ok(thens[idx].clone());
                            }
                        }
                        Ok(default)
                    })
                    .collect()
            }
            Expr::Bucket(e, buckets) => {
                self.map(e, |v| Ok(Value::Str(buckets.label_for(v.as_int()?))))
            }
            Expr::Lookup(e, table) => self.map(e, |v| Ok(Value::Str(table.get(&v)))),
        }
    }

    fn map(&self, e: &Expr, f: impl Fn(Value) -> Result<Value>) -> Result<Vec<Value>> {
        self.evaluate(e)?.into_iter().map(f).collect()
    }

    fn zip(
        &self,
        a: &Expr,
        b: &Expr,
        f: impl Fn(Value, Value) -> Result<Value>,
    ) -> Result<Vec<Value>> {
        let lhs = self.evaluate(a)?;
        let rhs = self.evaluate(b)?;
        lhs.into_iter()
            .zip_eq(rhs)
            .map(|(l, r)| f(l, r))
            .collect()
    }

    fn reduce(&self, rows: &Rows, reduction: &Reduction) -> Result<Vec<Value>> {
        let tables = self.tables;
        match rows.source() {
            Source::ClinicalEvents => self.reduce_frame(&tables.clinical_events, rows, reduction),
            Source::Appointments => self.reduce_frame(&tables.appointments, rows, reduction),
            Source::Addresses => self.reduce_frame(&tables.addresses, rows, reduction),
            Source::PracticeRegistrations => {
                self.reduce_frame(&tables.practice_registrations, rows, reduction)
            }
        }
    }

    fn reduce_frame<R: Record>(
        &self,
        frame: &EventFrame<R>,
        rows: &Rows,
        reduction: &Reduction,
    ) -> Result<Vec<Value>> {
        let filters = rows
            .filters()
            .iter()
            .map(|filter| self.resolve_filter(filter))
            .collect::<Result<Vec<_>>>()?;
        let mut frame = frame.filter(|r| filters.iter().all(|f| f.matches(r)));
        if let Some(key) = rows.sort_key() {
            frame = frame.sort_by(|r| r.field(key).unwrap_or(Value::Missing));
        }

        let ids = self.tables.patients.ids();
        let pick = |picked: crate::PatientRows<R>, field: &str| -> Vec<Value> {
            self.tables
                .patients
                .ids()
                .map(|id| {
                    picked
                        .get(&id)
                        .and_then(|r| r.field(field))
                        .unwrap_or(Value::Missing)
                })
                .collect()
        };
        Ok(match reduction {
            Reduction::Exists => ids.map(|id| Value::Bool(frame.exists_for(id))).collect(),
            Reduction::Count => ids
                .map(|id| Value::Int(frame.count_for(id) as i64))
                .collect(),
            Reduction::First(field) => pick(frame.first_for_patient(), field),
            Reduction::Last(field) => pick(frame.last_for_patient(), field),
        })
    }

    fn resolve_filter<'e>(&self, filter: &'e RowFilter) -> Result<Filter<'e>> {
        Ok(match filter {
            RowFilter::InCodelist { field, codelist } => Filter::InCodelist(field, codelist),
            RowFilter::AnyOf { field, values } => Filter::AnyOf(field, values),
            RowFilter::OnOrBetween { field, start, end } => {
                Filter::Between(field, self.resolve(*start)?, self.resolve(*end)?)
            }
            RowFilter::OnOrBefore { field, date } => {
                Filter::OnOrBefore(field, self.resolve(*date)?)
            }
            RowFilter::OnOrAfter { field, date } => {
                Filter::OnOrAfter(field, self.resolve(*date)?)
            }
            RowFilter::ActiveOn(date) => Filter::ActiveOn(self.resolve(*date)?),
        })
    }
}

/// A row filter with its dates resolved.
enum Filter<'e> {
    InCodelist(&'e str, &'e Codelist),
    AnyOf(&'e str, &'e [Value]),
    Between(&'e str, NaiveDate, NaiveDate),
    OnOrBefore(&'e str, NaiveDate),
    OnOrAfter(&'e str, NaiveDate),
    ActiveOn(NaiveDate),
}

impl Filter<'_> {
    /// Records with a missing value in the filtered field never match.
    fn matches<R: Record>(&self, r: &R) -> bool {
        let date = |field: &str| r.field(field).and_then(|v| v.as_date());
        match self {
            Filter::InCodelist(field, codelist) => match r.field(field) {
                Some(Value::Str(code)) => codelist.contains(&code),
                _ => false,
            },
            Filter::AnyOf(field, values) => match r.field(field) {
                Some(Value::Missing) | None => false,
                Some(v) => values.contains(&v),
            },
            Filter::Between(field, start, end) => {
                date(*field).map_or(false, |d| *start <= d && d <= *end)
            }
            Filter::OnOrBefore(field, on) => date(*field).map_or(false, |d| d <= *on),
            Filter::OnOrAfter(field, on) => date(*field).map_or(false, |d| d >= *on),
            Filter::ActiveOn(on) => {
                let started = date("start_date").map_or(false, |start| start <= *on);
                let not_ended = match r.field("end_date") {
                    Some(Value::Missing) => true,
                    Some(Value::Date(end)) => end >= *on,
                    _ => false,
                };
                started && not_ended
            }
        }
    }
}

fn and(l: Value, r: Value) -> Result<Value> {
    Ok(match (l.truth()?, r.truth()?) {
        (Some(false), _) | (_, Some(false)) => Value::Bool(false),
        (Some(true), Some(true)) => Value::Bool(true),
        _ => Value::Missing,
    })
}

fn or(l: Value, r: Value) -> Result<Value> {
    Ok(match (l.truth()?, r.truth()?) {
        (Some(true), _) | (_, Some(true)) => Value::Bool(true),
        (Some(false), Some(false)) => Value::Bool(false),
        _ => Value::Missing,
    })
}

fn compare(op: CmpOp, l: Value, r: Value) -> Result<Value> {
    if l.is_missing() || r.is_missing() {
        return Ok(Value::Missing);
    }
    ensure!(
        l.type_name() == r.type_name(),
        "cannot compare {} `{}` with {} `{}`",
        l.type_name(),
        l,
        r.type_name(),
        r
    );
    let ord = l.cmp(&r);
    Ok(Value::Bool(match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    }))
}

/// Codes outside the list, and codes without a category, map to missing.
fn category(codelist: &Codelist, v: Value) -> Result<Value> {
    match v {
        Value::Missing => Ok(Value::Missing),
        Value::Str(code) => Ok(codelist.category_of(&code).cloned().into()),
        other => bail!("expected a code, found {} `{}`", other.type_name(), other),
    }
}

#[cfg(test)]
mod test {
    use super::EvalContext;
    use crate::{
        case,
        fixtures::{date, ethnicity_codes, event, f2f_codes, patient, three_patients},
        measures::Interval,
        Address, DateRef, Expr, Rows, Tables, Value,
    };

    fn window() -> Interval {
        Interval::new(date(2020, 1, 1), date(2020, 1, 31)).unwrap()
    }

    fn f2f_in_window() -> Rows {
        Rows::clinical_events()
            .where_on_or_between("date", DateRef::IntervalStart, DateRef::IntervalEnd)
            .where_in("snomedct_code", &f2f_codes())
    }

    #[test]
    fn exists_and_count_in_window() {
        let tables = three_patients();
        let ctx = EvalContext::for_interval(&tables, window());
        let has = ctx.evaluate(&f2f_in_window().exists_for_patient()).unwrap();
        let count = ctx.evaluate(&f2f_in_window().count_for_patient()).unwrap();
        assert_eq!(has, [true, false, true].map(Value::Bool));
        assert_eq!(count, [2, 0, 1].map(Value::Int));
    }

    #[test]
    fn interval_dates_need_an_interval() {
        let tables = three_patients();
        let err = EvalContext::new(&tables)
            .evaluate(&f2f_in_window().exists_for_patient())
            .unwrap_err();
        assert!(err.to_string().contains("INTERVAL.start_date"));
    }

    #[test]
    fn three_valued_logic() {
        let tables = three_patients();
        let ctx = EvalContext::new(&tables);
        let t = || Expr::literal(true);
        let f = || Expr::literal(false);
        let m = || Expr::literal(Value::Missing);
        let one = |e: Expr| ctx.evaluate(&e).unwrap()[0].clone();
        assert_eq!(one(f() & m()), Value::Bool(false));
        assert_eq!(one(t() & m()), Value::Missing);
        assert_eq!(one(t() | m()), Value::Bool(true));
        assert_eq!(one(f() | m()), Value::Missing);
        assert_eq!(one(!m()), Value::Missing);
        assert_eq!(one(!f()), Value::Bool(true));
        // ints are truthy when non-zero
        assert_eq!(one(Expr::literal(2) & t()), Value::Bool(true));
        assert!(ctx.evaluate(&(Expr::literal("x") & t())).is_err());
    }

    #[test]
    fn comparisons() {
        let tables = three_patients();
        let ctx = EvalContext::new(&tables);
        let age = Expr::age_on(date(2020, 1, 1));
        assert_eq!(
            ctx.evaluate(&age.clone().ge(65)).unwrap(),
            [true, false, false].map(Value::Bool)
        );
        assert_eq!(
            ctx.evaluate(&age.clone().gt(18)).unwrap(),
            [true, true, false].map(Value::Bool)
        );
        assert_eq!(
            ctx.evaluate(&Expr::date_of_death().lt(date(2021, 1, 1))).unwrap(),
            vec![Value::Missing; 3]
        );
        assert!(ctx.evaluate(&age.equals("65")).is_err());
    }

    #[test]
    fn last_code_and_category() {
        let codes = ethnicity_codes();
        let tables = Tables::new([patient(1, date(1980, 1, 1)), patient(2, date(1980, 1, 1))])
            .with_clinical_events([
                event(1, "1234002", date(2010, 1, 1)),
                event(1, "1234004", date(2012, 1, 1)),
                event(1, "1234001", date(2021, 1, 1)),
                event(2, "1234009", date(2010, 1, 1)),
            ]);
        let latest = Rows::clinical_events()
            .where_in("snomedct_code", &codes)
            .where_on_or_before("date", date(2020, 12, 31))
            .sort_by("date")
            .last_for_patient("snomedct_code");
        let ctx = EvalContext::new(&tables);
        assert_eq!(
            ctx.evaluate(&latest).unwrap(),
            [Value::from("1234004"), Value::from("1234009")]
        );
        assert_eq!(
            ctx.evaluate(&latest.to_category(&codes)).unwrap(),
            [Value::from("4"), Value::Missing]
        );
    }

    #[test]
    fn first_month_and_current_address() {
        let tables = three_patients().with_addresses([
            Address::new(1, date(2010, 1, 1)).with_imd(100),
            Address::new(1, date(2015, 1, 1)).with_imd(20000),
            Address::new(2, date(2012, 1, 1)),
        ]);
        let ctx = EvalContext::new(&tables);
        let first_f2f = Rows::clinical_events()
            .where_in("snomedct_code", &f2f_codes())
            .sort_by("date")
            .first_for_patient("date");
        assert_eq!(
            ctx.evaluate(&first_f2f.month()).unwrap(),
            [Value::Int(12), Value::Missing, Value::Int(1)]
        );
        let imd = Rows::addresses()
            .sort_by("start_date")
            .last_for_patient("imd_rounded");
        assert_eq!(
            ctx.evaluate(&imd).unwrap(),
            [Value::Int(20000), Value::Missing, Value::Missing]
        );
    }

    #[test]
    fn case_first_true_branch_wins() {
        let tables = three_patients();
        let ctx = EvalContext::new(&tables);
        let age = Expr::age_on(date(2020, 1, 1));
        let band = case()
            .when(age.clone().ge(18), "adult")
            .when(age.ge(65), "older")
            .when(Expr::literal(Value::Missing), "never")
            .otherwise("child")
            .build()
            .unwrap();
        assert_eq!(
            ctx.evaluate(&band).unwrap(),
            ["adult", "adult", "child"].map(Value::from)
        );
    }

    #[test]
    fn registration_active_on() {
        let tables = three_patients();
        let ctx = EvalContext::new(&tables);
        let registered = |on| {
            Rows::practice_registrations()
                .active_on(on)
                .exists_for_patient()
        };
        assert_eq!(
            ctx.evaluate(&registered(date(2020, 1, 15))).unwrap(),
            [true, true, true].map(Value::Bool)
        );
        assert_eq!(
            ctx.evaluate(&registered(date(2020, 1, 14))).unwrap(),
            [true, true, false].map(Value::Bool)
        );
        assert_eq!(ctx.mask(&registered(date(1999, 1, 1))).unwrap(), [false; 3]);
    }
}
