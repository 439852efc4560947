//! Small record builders shared by the unit tests.
use crate::{
    Appointment, ClinicalEvent, Codelist, Patient, PatientId, Registration, Sex, Tables,
};
use chrono::NaiveDate;

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn patient(id: PatientId, born: NaiveDate) -> Patient {
    let sex = if id % 2 == 0 { Sex::Female } else { Sex::Male };
    Patient::new(id, born, sex)
}

pub fn event(id: PatientId, code: &str, on: NaiveDate) -> ClinicalEvent {
    ClinicalEvent::new(id, code, on)
}

pub fn appointment(id: PatientId, status: &str, seen: NaiveDate) -> Appointment {
    Appointment::new(id, status, Some(seen))
}

pub fn registered(id: PatientId, from: NaiveDate) -> Registration {
    Registration::new(id, from, None)
}

pub fn f2f_codes() -> Codelist {
    Codelist::from_codes(["185317003", "390906007"])
}

pub fn virtual_codes() -> Codelist {
    Codelist::from_codes(["185316007", "386472008"])
}

pub fn ethnicity_codes() -> Codelist {
    Codelist::from_pairs([
        ("1234001", Some("1")),
        ("1234002", Some("2")),
        ("1234003", Some("3")),
        ("1234004", Some("4")),
        ("1234005", Some("5")),
        ("1234009", None),
    ])
}

/// Three patients around a window of 2020-01-01 to 2020-01-31:
///
/// - 1: two f2f events inside the window and one outside
/// - 2: no matching events
/// - 3: one f2f event exactly on the end of the window
pub fn three_patients() -> Tables {
    Tables::new([
        patient(1, date(1950, 3, 1)),
        patient(2, date(1990, 7, 1)),
        patient(3, date(2005, 1, 1)),
    ])
    .with_clinical_events([
        event(1, "185317003", date(2020, 1, 5)),
        event(1, "390906007", date(2020, 1, 20)),
        event(1, "185317003", date(2019, 12, 31)),
        event(2, "999999999", date(2020, 1, 10)),
        event(3, "185317003", date(2020, 1, 31)),
    ])
    .with_registrations([
        registered(1, date(2000, 1, 1)),
        registered(2, date(2000, 1, 1)),
        registered(3, date(2020, 1, 15)),
    ])
}
