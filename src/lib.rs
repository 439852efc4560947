pub mod bucket;
pub mod codelist;
pub mod config;
pub mod dataset;
mod eval;
pub mod expr;
#[cfg(test)]
mod fixtures;
pub mod frame;
pub mod measures;
mod output;
pub mod population;
pub mod study;
mod util;
pub mod value;

pub use anyhow::{Context, Error};
use chrono::{Datelike, NaiveDate};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, ops::Deref, sync::Arc};

pub use crate::{
    bucket::{Buckets, LookupTable, Range, RangeSet},
    codelist::Codelist,
    config::{MissingLabel, StudyConfig, IMD_SCALE},
    dataset::{Dataset, DatasetRow, DatasetTable},
    expr::{case, DateRef, Expr, Rows, Source},
    frame::{EventFrame, PatientRows, Record},
    measures::{months, weeks, Interval, Intervals, Measure, MeasureRow, MeasureTable, Measures},
    population::{AgeThreshold, Population},
    value::Value,
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
pub type PatientId = u64;

/// A row in the patients table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_id: PatientId,
    /// Usually rounded to the first of the month in the source data.
    pub date_of_birth: NaiveDate,
    pub sex: Sex,
    pub date_of_death: Option<NaiveDate>,
}

impl Patient {
    pub fn new(patient_id: PatientId, date_of_birth: NaiveDate, sex: Sex) -> Self {
        Self {
            patient_id,
            date_of_birth,
            sex,
            date_of_death: None,
        }
    }

    pub fn with_date_of_death(mut self, date: NaiveDate) -> Self {
        self.date_of_death = Some(date);
        self
    }

    /// Age in whole years on `date`.
    ///
    /// Negative when `date` is before the date of birth.
    pub fn age_on(&self, date: NaiveDate) -> i64 {
        let dob = self.date_of_birth;
        let mut years = i64::from(date.year()) - i64::from(dob.year());
        if (date.month(), date.day()) < (dob.month(), dob.day()) {
            years -= 1;
        }
        years
    }
}

/// The list of patients, with a pre-built index for the `patient_id` field.
///
/// Patients are kept in ascending ID order. Every per-patient column produced by the evaluator
/// is aligned with this order.
#[derive(Debug, Clone, Default)]
pub struct Patients {
    els: Arc<Vec<Patient>>,
    id_idx: BTreeMap<PatientId, usize>,
}

impl Patients {
    pub fn new(mut els: Vec<Patient>) -> Self {
        els.sort_by_key(|pat| pat.patient_id);
        let before = els.len();
        els.dedup_by_key(|pat| pat.patient_id);
        if els.len() != before {
            event!(
                Level::WARN,
                "dropped {} patient rows with duplicate IDs",
                before - els.len()
            );
        }
        let mut this = Patients {
            els: Arc::new(els),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    pub fn find_by_id(&self, id: PatientId) -> Option<&Patient> {
        let idx = self.id_idx.get(&id)?;
        self.els.get(*idx)
    }

    /// Position of the patient in column order.
    pub fn position(&self, id: PatientId) -> Option<usize> {
        self.id_idx.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Patient> + '_ {
        self.els.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = PatientId> + '_ {
        self.els.iter().map(|pat| pat.patient_id)
    }

    fn rebuild_index(&mut self) {
        self.id_idx.clear();
        for (idx, el) in self.els.iter().enumerate() {
            self.id_idx.insert(el.patient_id, idx);
        }
    }
}

impl Deref for Patients {
    type Target = [Patient];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<Patient> for Patients {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Patient>,
    {
        Self::new(iter.into_iter().collect())
    }
}

/// Sex as recorded in the patients table.
///
/// Ordering is arbitrary.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
    Intersex,
    Unknown,
}

impl Sex {
    /// The code used in output tables.
    pub fn code(self) -> &'static str {
        match self {
            Sex::Female => "female",
            Sex::Male => "male",
            Sex::Intersex => "intersex",
            Sex::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A row in the clinical events table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalEvent {
    pub patient_id: PatientId,
    pub snomedct_code: ArcStr,
    pub date: NaiveDate,
}

impl ClinicalEvent {
    pub fn new(patient_id: PatientId, snomedct_code: impl Into<ArcStr>, date: NaiveDate) -> Self {
        Self {
            patient_id,
            snomedct_code: snomedct_code.into(),
            date,
        }
    }
}

impl Record for ClinicalEvent {
    const TABLE: &'static str = "clinical_events";
    const FIELDS: &'static [&'static str] = &["snomedct_code", "date"];

    fn patient_id(&self) -> PatientId {
        self.patient_id
    }

    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "snomedct_code" => Value::Str(self.snomedct_code.clone()),
            "date" => Value::Date(self.date),
            _ => return None,
        })
    }
}

/// A row in the appointments table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub patient_id: PatientId,
    /// e.g. "Finished", "Arrived" or "Patient Walked Out".
    pub status: ArcStr,
    pub seen_date: Option<NaiveDate>,
}

impl Appointment {
    pub fn new(
        patient_id: PatientId,
        status: impl Into<ArcStr>,
        seen_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            patient_id,
            status: status.into(),
            seen_date,
        }
    }
}

impl Record for Appointment {
    const TABLE: &'static str = "appointments";
    const FIELDS: &'static [&'static str] = &["status", "seen_date"];

    fn patient_id(&self) -> PatientId {
        self.patient_id
    }

    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "status" => Value::Str(self.status.clone()),
            "seen_date" => self.seen_date.into(),
            _ => return None,
        })
    }
}

/// A row in the addresses table. A patient's current address is the one with the latest
/// `start_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub patient_id: PatientId,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub msoa_code: Option<ArcStr>,
    pub rural_urban_classification: Option<i64>,
    /// Index of multiple deprivation rank, rounded to the nearest 100.
    pub imd_rounded: Option<i64>,
}

impl Address {
    pub fn new(patient_id: PatientId, start_date: NaiveDate) -> Self {
        Self {
            patient_id,
            start_date,
            end_date: None,
            msoa_code: None,
            rural_urban_classification: None,
            imd_rounded: None,
        }
    }

    pub fn with_imd(mut self, imd_rounded: i64) -> Self {
        self.imd_rounded = Some(imd_rounded);
        self
    }

    pub fn with_msoa(mut self, msoa_code: impl Into<ArcStr>) -> Self {
        self.msoa_code = Some(msoa_code.into());
        self
    }

    pub fn with_rural_urban(mut self, classification: i64) -> Self {
        self.rural_urban_classification = Some(classification);
        self
    }
}

impl Record for Address {
    const TABLE: &'static str = "addresses";
    const FIELDS: &'static [&'static str] = &[
        "start_date",
        "end_date",
        "msoa_code",
        "rural_urban_classification",
        "imd_rounded",
    ];

    fn patient_id(&self) -> PatientId {
        self.patient_id
    }

    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "start_date" => Value::Date(self.start_date),
            "end_date" => self.end_date.into(),
            "msoa_code" => self.msoa_code.clone().into(),
            "rural_urban_classification" => self.rural_urban_classification.into(),
            "imd_rounded" => self.imd_rounded.into(),
            _ => return None,
        })
    }
}

/// A row in the practice registrations table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub patient_id: PatientId,
    pub start_date: NaiveDate,
    /// `None` while the registration is ongoing.
    pub end_date: Option<NaiveDate>,
}

impl Registration {
    pub fn new(patient_id: PatientId, start_date: NaiveDate, end_date: Option<NaiveDate>) -> Self {
        Self {
            patient_id,
            start_date,
            end_date,
        }
    }

    /// Whether the registration spans `date`. Both ends are inclusive.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && self.end_date.map_or(true, |end| end >= date)
    }
}

impl Record for Registration {
    const TABLE: &'static str = "practice_registrations";
    const FIELDS: &'static [&'static str] = &["start_date", "end_date"];

    fn patient_id(&self) -> PatientId {
        self.patient_id
    }

    fn field(&self, name: &str) -> Option<Value> {
        Some(match name {
            "start_date" => Value::Date(self.start_date),
            "end_date" => self.end_date.into(),
            _ => return None,
        })
    }
}

/// All the record tables that variables are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub patients: Patients,
    pub clinical_events: EventFrame<ClinicalEvent>,
    pub appointments: EventFrame<Appointment>,
    pub addresses: EventFrame<Address>,
    pub practice_registrations: EventFrame<Registration>,
}

impl Tables {
    pub fn new(patients: impl IntoIterator<Item = Patient>) -> Self {
        Tables {
            patients: patients.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_clinical_events(mut self, els: impl IntoIterator<Item = ClinicalEvent>) -> Self {
        self.clinical_events = els.into_iter().collect();
        self
    }

    pub fn with_appointments(mut self, els: impl IntoIterator<Item = Appointment>) -> Self {
        self.appointments = els.into_iter().collect();
        self
    }

    pub fn with_addresses(mut self, els: impl IntoIterator<Item = Address>) -> Self {
        self.addresses = els.into_iter().collect();
        self
    }

    pub fn with_registrations(mut self, els: impl IntoIterator<Item = Registration>) -> Self {
        self.practice_registrations = els.into_iter().collect();
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures::date;

    #[test]
    fn age_counts_whole_years() {
        let pat = Patient::new(1, date(2000, 6, 15), Sex::Female);
        assert_eq!(pat.age_on(date(2018, 6, 14)), 17);
        assert_eq!(pat.age_on(date(2018, 6, 15)), 18);
        assert_eq!(pat.age_on(date(2019, 1, 1)), 18);
        assert_eq!(pat.age_on(date(1999, 1, 1)), -2);
    }

    #[test]
    fn patients_sorted_and_deduplicated() {
        let patients = Patients::from_iter([
            Patient::new(3, date(1950, 1, 1), Sex::Male),
            Patient::new(1, date(1960, 1, 1), Sex::Female),
            Patient::new(3, date(1970, 1, 1), Sex::Female),
        ]);
        assert_eq!(patients.ids().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(patients.position(3), Some(1));
        assert_eq!(patients.find_by_id(3).unwrap().sex, Sex::Male);
    }

    #[test]
    fn registration_bounds_inclusive() {
        let reg = Registration::new(1, date(2020, 1, 1), Some(date(2020, 6, 30)));
        assert!(reg.is_active_on(date(2020, 1, 1)));
        assert!(reg.is_active_on(date(2020, 6, 30)));
        assert!(!reg.is_active_on(date(2020, 7, 1)));
        assert!(!reg.is_active_on(date(2019, 12, 31)));
        assert!(Registration::new(1, date(2020, 1, 1), None).is_active_on(date(2030, 1, 1)));
    }
}
