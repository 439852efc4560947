//! The datasets and measures of the consultation study.
//!
//! Face-to-face and virtual consultations are identified from clinical event codes, and
//! attended appointments from the appointments table. Column names match the ones the
//! downstream analysis reads.
use crate::{
    bucket::{Buckets, LookupTable},
    config::{MissingLabel, StudyConfig},
    dataset::Dataset,
    expr::{DateRef, Expr, Rows},
    measures::{weeks, Intervals, Measure, Measures},
    population::{AgeThreshold, Population},
    Codelist, Result,
};
use chrono::NaiveDate;
use qu::ick_use::*;

/// The codelists the study definitions need.
#[derive(Debug, Clone)]
pub struct StudyCodelists {
    pub f2f_consultation: Codelist,
    pub virtual_consultation: Codelist,
    /// Categories are the ethnicity groups "1" to "5".
    pub ethnicity: Codelist,
}

/// Appointment statuses reported individually, with the suffix used in their column names.
pub const APPOINTMENT_STATUSES: [(&str, &str); 5] = [
    ("arrived", "Arrived"),
    ("finished", "Finished"),
    ("inprogress", "In Progress"),
    ("waiting", "Waiting"),
    ("walkedout", "Patient Walked Out"),
];

/// Status of an appointment that took place.
const FINISHED: &str = "Finished";

/// Start dates of the 10-week virtual consultation measures.
pub const WEEKLY_AGE_STARTS: [(&str, &str); 3] = [
    ("virtual_consultations_pre_weekly", "2019-04-01"),
    ("virtual_consultations_during_weekly_2020", "2020-04-01"),
    ("virtual_consultations_during_weekly_2021", "2021-04-01"),
];

pub const WEEKLY_AGE_INTERVALS: u32 = 10;

/// Adult population: registered on `date` and older than 18.
fn adults_on(date: impl Into<DateRef>) -> Population {
    Population::new(date, AgeThreshold::Over(18))
}

fn events_between(codelist: &Codelist, start: impl Into<DateRef>, end: impl Into<DateRef>) -> Rows {
    Rows::clinical_events()
        .where_on_or_between("date", start, end)
        .where_in("snomedct_code", codelist)
}

fn last_code(rows: Rows) -> Expr {
    rows.sort_by("date").last_for_patient("snomedct_code")
}

/// Month name of the first event with a code in `codelist`, at any date.
fn first_month(codelist: &Codelist) -> Expr {
    Rows::clinical_events()
        .where_in("snomedct_code", codelist)
        .sort_by("date")
        .first_for_patient("date")
        .month()
        .map_labels(&LookupTable::month_names(MissingLabel::Lower))
}

fn current_address(field: &str) -> Expr {
    Rows::addresses()
        .sort_by("start_date")
        .last_for_patient(field)
}

fn imd_quintile(scale: i64) -> Result<Expr> {
    Ok(current_address("imd_rounded").bucket(Buckets::quintiles(scale, MissingLabel::Title)?))
}

/// The group of the latest ethnicity code recorded on or before `cutoff`.
fn ethnicity(codelist: &Codelist, cutoff: impl Into<DateRef>) -> Expr {
    Rows::clinical_events()
        .where_in("snomedct_code", codelist)
        .where_on_or_before("date", cutoff)
        .sort_by("date")
        .last_for_patient("snomedct_code")
        .to_category(codelist)
        .map_labels(&LookupTable::ethnicity(MissingLabel::Lower))
}

/// Consultation counts over the study period, appointment statuses and demographics.
pub fn consultation_dataset(config: &StudyConfig, codelists: &StudyCodelists) -> Result<Dataset> {
    let (start, end) = (config.start_date, config.end_date);
    let f2f = events_between(&codelists.f2f_consultation, start, end);
    let virt = events_between(&codelists.virtual_consultation, start, end);
    let age = Expr::age_on(start);

    let mut dataset = Dataset::new();
    dataset.define("age", age.clone())?;
    dataset.define("age_greater_equal_65", age.ge(65))?;
    dataset.define("has_f2f_consultation", f2f.clone().exists_for_patient())?;
    dataset.define("count_f2f_consultation", f2f.clone().count_for_patient())?;
    dataset.define("last_f2f_consultation_code", last_code(f2f))?;
    dataset.define("has_virtual_consultation", virt.clone().exists_for_patient())?;
    dataset.define("count_virtual_consultation", virt.clone().count_for_patient())?;
    for (suffix, status) in APPOINTMENT_STATUSES {
        let appts = Rows::appointments().where_any_of("status", [status]);
        dataset.define(&format!("has_appt_{}", suffix), appts.exists_for_patient())?;
    }
    for (suffix, status) in APPOINTMENT_STATUSES {
        let appts = Rows::appointments().where_any_of("status", [status]);
        dataset.define(&format!("count_appt_{}", suffix), appts.count_for_patient())?;
    }
    dataset.define("last_virtual_consultation_code", last_code(virt))?;
    dataset.define_population(adults_on(start).to_expr())?;
    dataset.define("imd_quintile", imd_quintile(config.imd_scale)?)?;
    dataset.define("sex", Expr::sex())?;
    dataset.define("dod", Expr::date_of_death())?;
    dataset.define("ethnicity", ethnicity(&codelists.ethnicity, end))?;
    Ok(dataset)
}

/// Consultation combinations, month of the first consultation and raw address attributes.
pub fn consultation_month_dataset(
    config: &StudyConfig,
    codelists: &StudyCodelists,
) -> Result<Dataset> {
    let (start, end) = (config.start_date, config.end_date);
    let has_f2f = events_between(&codelists.f2f_consultation, start, end).exists_for_patient();
    let has_virtual =
        events_between(&codelists.virtual_consultation, start, end).exists_for_patient();
    let age = Expr::age_on(start);

    let mut dataset = Dataset::new();
    dataset.define("patient_age", age.clone())?;
    dataset.define("patient_age_ge65", age.ge(65))?;
    dataset.define("has_f2f_consultation", has_f2f.clone())?;
    dataset.define(
        "count_f2f_consultation",
        events_between(&codelists.f2f_consultation, start, end).count_for_patient(),
    )?;
    dataset.define("has_virtual_consultation", has_virtual.clone())?;
    dataset.define(
        "count_virtual_consultation",
        events_between(&codelists.virtual_consultation, start, end).count_for_patient(),
    )?;
    dataset.define(
        "has_f2f_and_virtual_consultation",
        has_virtual.clone() & has_f2f.clone(),
    )?;
    dataset.define("has_f2f_or_virtual_consultation", has_virtual | has_f2f)?;
    dataset.define("f2f_clinical_date", first_month(&codelists.f2f_consultation))?;
    dataset.define("virtual_clinical_date", first_month(&codelists.virtual_consultation))?;
    dataset.define_population(adults_on(start).to_expr())?;
    dataset.define("patient_msoa", current_address("msoa_code"))?;
    dataset.define("patient_rural_urban", current_address("rural_urban_classification"))?;
    dataset.define("patient_imd_rounded", current_address("imd_rounded"))?;
    dataset.define("patient_sex", Expr::sex())?;
    dataset.define("patient_dod", Expr::date_of_death())?;
    dataset.define(
        "ethnicity",
        ethnicity(&codelists.ethnicity, config.ethnicity_cutoff()?),
    )?;
    Ok(dataset)
}

/// Weekly appointment and consultation measures, by age 65 and over, for every named start
/// date in the configuration.
pub fn weekly_measures(config: &StudyConfig, codelists: &StudyCodelists) -> Result<Measures> {
    let (start, end) = (DateRef::IntervalStart, DateRef::IntervalEnd);
    let finished = Rows::appointments()
        .where_any_of("status", [FINISHED])
        .where_on_or_between("seen_date", start, end);
    let has_appointment = finished.clone().exists_for_patient();
    let count_appointment = finished.count_for_patient();
    let f2f = events_between(&codelists.f2f_consultation, start, end);
    let virt = events_between(&codelists.virtual_consultation, start, end);
    let adults = adults_on(start).to_expr();
    let age_ge65 = Expr::age_on(start).ge(65);

    if config.measure_start_dates.is_empty() {
        event!(
            Level::WARN,
            "no measure start dates configured, so no weekly measures are defined"
        );
    }
    let mut measures = Measures::new();
    for (period, start_date) in &config.measure_start_dates {
        let intervals = weeks(config.interval_weeks).starting_on(*start_date);
        let define = |measures: &mut Measures, kind: &str, num: Expr, den: Expr| {
            let name = format!("{}_{}_weekly_age", kind, period);
            measures.define(
                Measure::new(&name, num, den, intervals)
                    .group_by("age_greater_equal_65", age_ge65.clone()),
            )
        };
        define(
            &mut measures,
            "has_appointments",
            has_appointment.clone(),
            adults.clone(),
        )?;
        define(
            &mut measures,
            "has_virtual",
            virt.clone().exists_for_patient(),
            has_appointment.clone() & adults.clone(),
        )?;
        define(
            &mut measures,
            "has_f2f",
            f2f.clone().exists_for_patient(),
            has_appointment.clone() & adults.clone(),
        )?;
        define(
            &mut measures,
            "count_appointments",
            count_appointment.clone(),
            adults.clone(),
        )?;
        define(
            &mut measures,
            "count_virtual",
            virt.clone().count_for_patient(),
            count_appointment.clone() & adults.clone(),
        )?;
        define(
            &mut measures,
            "count_f2f",
            f2f.clone().count_for_patient(),
            count_appointment.clone() & adults.clone(),
        )?;
    }
    Ok(measures)
}

/// Weekly virtual consultations among adults with a finished appointment, by age 65 and over,
/// before and during the pandemic.
pub fn weekly_age_measures(codelists: &StudyCodelists) -> Result<Measures> {
    let (start, end) = (DateRef::IntervalStart, DateRef::IntervalEnd);
    let has_appointment = Rows::appointments()
        .where_on_or_before("seen_date", end)
        .where_any_of("status", [FINISHED])
        .exists_for_patient();
    let has_virtual = events_between(&codelists.virtual_consultation, start, end)
        .exists_for_patient();
    let denominator = adults_on(start).to_expr() & has_appointment;

    let mut measures = Measures::new();
    for (name, start_date) in WEEKLY_AGE_STARTS {
        let start_date: NaiveDate = start_date
            .parse()
            .with_context(|| format!("start date of measure `{}`", name))?;
        measures.define(
            Measure::new(
                name,
                has_virtual.clone(),
                denominator.clone(),
                intervals(start_date),
            )
            .group_by("age_greater_equal_65", Expr::age_on(start).ge(65)),
        )?;
    }
    Ok(measures)
}

fn intervals(start: NaiveDate) -> Intervals {
    weeks(WEEKLY_AGE_INTERVALS).starting_on(start)
}
