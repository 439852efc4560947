//! Per-patient record collections and the reductions defined over them.
use crate::{PatientId, Value};
use itertools::Either;
use std::{
    collections::{BTreeMap, BTreeSet},
    iter,
    ops::Deref,
    sync::Arc,
};

/// A row of one of the record tables.
pub trait Record: Clone + Send + Sync {
    /// Table name, for error messages.
    const TABLE: &'static str;
    /// Names accepted by [`Record::field`].
    const FIELDS: &'static [&'static str];

    fn patient_id(&self) -> PatientId;

    /// Look up a field by name. `None` if the table has no such field; a field that exists but
    /// has no value for this row is `Some(Value::Missing)`.
    fn field(&self, name: &str) -> Option<Value>;

    fn has_field(name: &str) -> bool {
        Self::FIELDS.contains(&name)
    }
}

/// At most one record per patient, as returned by `first_for_patient`/`last_for_patient`.
///
/// Patients without a record are absent rather than null-filled.
pub type PatientRows<R> = BTreeMap<PatientId, R>;

/// An ordered collection of records, with a pre-built index on `patient_id`.
///
/// All the operations are non-mutating: filtering or sorting builds a new frame.
#[derive(Debug, Clone)]
pub struct EventFrame<R> {
    els: Arc<Vec<R>>,
    id_idx: BTreeMap<PatientId, Vec<usize>>,
}

impl<R> Default for EventFrame<R> {
    fn default() -> Self {
        Self {
            els: Arc::new(vec![]),
            id_idx: BTreeMap::new(),
        }
    }
}

impl<R: Record> EventFrame<R> {
    pub fn new(els: Vec<R>) -> Self {
        let mut this = EventFrame {
            els: Arc::new(els),
            id_idx: BTreeMap::new(),
        };
        this.rebuild_id_map();
        this
    }

    /// Records for one patient, in frame order.
    pub fn records_for_patient(
        &self,
        patient_id: PatientId,
    ) -> impl Iterator<Item = &R> + Clone + '_ {
        let idxs = match self.id_idx.get(&patient_id) {
            Some(idxs) => idxs,
            None => return Either::Left(iter::empty()),
        };
        Either::Right(idxs.iter().filter_map(|idx| self.els.get(*idx)))
    }

    /// Keep only records matching the predicate.
    pub fn filter(&self, f: impl Fn(&R) -> bool) -> Self {
        Self::new(self.els.iter().filter(|r| f(r)).cloned().collect())
    }

    /// Stable sort, ascending by `key`.
    pub fn sort_by<K: Ord>(&self, key: impl Fn(&R) -> K) -> Self {
        let mut els = (*self.els).clone();
        els.sort_by_key(|r| key(r));
        Self::new(els)
    }

    pub fn first_for_patient(&self) -> PatientRows<R> {
        self.pick(|idxs| idxs.first())
    }

    pub fn last_for_patient(&self) -> PatientRows<R> {
        self.pick(|idxs| idxs.last())
    }

    /// IDs of the patients with at least one record.
    pub fn exists_for_patient(&self) -> BTreeSet<PatientId> {
        self.id_idx.keys().copied().collect()
    }

    /// Number of records per patient. Patients without records are absent (count 0).
    pub fn count_for_patient(&self) -> BTreeMap<PatientId, usize> {
        self.id_idx
            .iter()
            .map(|(id, idxs)| (*id, idxs.len()))
            .collect()
    }

    pub fn exists_for(&self, patient_id: PatientId) -> bool {
        self.id_idx.contains_key(&patient_id)
    }

    pub fn count_for(&self, patient_id: PatientId) -> usize {
        self.id_idx.get(&patient_id).map_or(0, Vec::len)
    }

    fn pick(&self, f: impl Fn(&[usize]) -> Option<&usize>) -> PatientRows<R> {
        self.id_idx
            .iter()
            .filter_map(|(id, idxs)| {
                let el = self.els.get(*f(idxs)?)?;
                Some((*id, el.clone()))
            })
            .collect()
    }

    fn rebuild_id_map(&mut self) {
        self.id_idx.clear();
        for (idx, el) in self.els.iter().enumerate() {
            self.id_idx.entry(el.patient_id()).or_default().push(idx);
        }
    }
}

impl<R> Deref for EventFrame<R> {
    type Target = [R];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl<'a, R> IntoIterator for &'a EventFrame<R> {
    type IntoIter = <&'a [R] as IntoIterator>::IntoIter;
    type Item = &'a R;
    fn into_iter(self) -> Self::IntoIter {
        self.els.iter()
    }
}

impl<R: Record> FromIterator<R> for EventFrame<R> {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = R>,
    {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        fixtures::{date, three_patients},
        ClinicalEvent, EventFrame,
    };

    fn in_january(tables: &crate::Tables) -> EventFrame<ClinicalEvent> {
        let f2f = crate::fixtures::f2f_codes();
        tables
            .clinical_events
            .filter(|evt| evt.date >= date(2020, 1, 1) && evt.date <= date(2020, 1, 31))
            .filter(|evt| f2f.contains(&evt.snomedct_code))
    }

    #[test]
    fn count_and_exists_agree() {
        let tables = three_patients();
        let frame = in_january(&tables);
        assert_eq!(frame.count_for(1), 2);
        assert!(frame.exists_for(1));
        assert_eq!(frame.count_for(2), 0);
        assert!(!frame.exists_for(2));
        // boundary date included
        assert_eq!(frame.count_for(3), 1);
        for id in tables.patients.ids() {
            assert_eq!(frame.count_for(id) == 0, !frame.exists_for(id));
        }
        let exists = frame.exists_for_patient();
        let counts = frame.count_for_patient();
        assert_eq!(exists.len(), counts.len());
        assert!(counts.values().all(|n| *n > 0));
    }

    #[test]
    fn first_and_last_after_sort() {
        let tables = three_patients();
        let sorted = tables.clinical_events.sort_by(|evt| evt.date);
        let first = sorted.first_for_patient();
        let last = sorted.last_for_patient();
        assert_eq!(first[&1].date, date(2019, 12, 31));
        assert_eq!(last[&1].date, date(2020, 1, 20));
        assert_eq!(&*last[&1].snomedct_code, "390906007");
        // frame without records for patient 2 after filtering
        let frame = in_january(&tables).sort_by(|evt| evt.date);
        assert!(!frame.last_for_patient().contains_key(&2));
    }

    #[test]
    fn sort_is_stable() {
        let frame: EventFrame<ClinicalEvent> = [
            ClinicalEvent::new(1, "b", date(2020, 1, 1)),
            ClinicalEvent::new(1, "a", date(2020, 1, 1)),
            ClinicalEvent::new(1, "c", date(2019, 1, 1)),
        ]
        .into_iter()
        .collect();
        let sorted = frame.sort_by(|evt| evt.date);
        let codes: Vec<&str> = sorted.iter().map(|evt| &*evt.snomedct_code).collect();
        assert_eq!(codes, ["c", "b", "a"]);
        assert_eq!(&*sorted.last_for_patient()[&1].snomedct_code, "a");
        // the original is untouched
        assert_eq!(&*frame[0].snomedct_code, "b");
    }
}
