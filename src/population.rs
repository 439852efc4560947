//! Selecting the patients a dataset or measure is about.
use crate::{
    eval::EvalContext,
    expr::{DateRef, Expr, Rows},
    Patient, PatientId, Result, Tables,
};
use qu::ick_use::*;

/// The age condition for a population.
///
/// Study scripts differ on whether the limit itself is included, so both forms are kept as
/// separate variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AgeThreshold {
    /// `age > n`
    Over(i64),
    /// `age >= n`
    AtLeast(i64),
}

impl AgeThreshold {
    pub fn admits(self, age: i64) -> bool {
        match self {
            AgeThreshold::Over(n) => age > n,
            AgeThreshold::AtLeast(n) => age >= n,
        }
    }

    /// The threshold applied to the patient's age on `date`.
    pub fn to_expr(self, date: DateRef) -> Expr {
        let age = Expr::age_on(date);
        match self {
            AgeThreshold::Over(n) => age.gt(n),
            AgeThreshold::AtLeast(n) => age.ge(n),
        }
    }
}

/// Patients registered with a practice on `date` whose age on `date` passes the threshold.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Population {
    date: DateRef,
    threshold: AgeThreshold,
}

impl Population {
    pub fn new(date: impl Into<DateRef>, threshold: AgeThreshold) -> Self {
        Self {
            date: date.into(),
            threshold,
        }
    }

    pub fn date(&self) -> DateRef {
        self.date
    }

    pub fn threshold(&self) -> AgeThreshold {
        self.threshold
    }

    /// Whether the patient has a practice registration spanning the population date.
    pub fn has_registration(&self) -> Expr {
        Rows::practice_registrations()
            .active_on(self.date)
            .exists_for_patient()
    }

    pub fn to_expr(&self) -> Expr {
        self.has_registration() & self.threshold.to_expr(self.date)
    }

    /// Check a single patient. Only valid for populations on a fixed date.
    pub fn is_member(&self, tables: &Tables, patient: &Patient) -> Result<bool> {
        let date = match self.date {
            DateRef::Fixed(date) => date,
            other => bail!("population on {} can only be checked inside a measure", other),
        };
        let registered = tables
            .practice_registrations
            .records_for_patient(patient.patient_id)
            .any(|reg| reg.is_active_on(date));
        Ok(registered && self.threshold.admits(patient.age_on(date)))
    }

    /// IDs of all members, in patient order.
    pub fn members(&self, tables: &Tables) -> Result<Vec<PatientId>> {
        let mask = EvalContext::new(tables).mask(&self.to_expr())?;
        Ok(tables
            .patients
            .ids()
            .zip(mask)
            .filter_map(|(id, member)| member.then(|| id))
            .collect())
    }
}
