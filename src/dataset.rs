//! One row per patient in a population, one column per named variable.
use crate::{eval::EvalContext, expr::Expr, ArcStr, PatientId, Result, Tables, Value};
use qu::ick_use::*;

/// A set of named variables and the population they are reported for.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    population: Option<Expr>,
    variables: Vec<(ArcStr, Expr)>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the population. Only patients for which `expr` is true are output.
    pub fn define_population(&mut self, expr: Expr) -> Result {
        ensure!(self.population.is_none(), "population is defined more than once");
        check_expr(&expr).context("in population")?;
        self.population = Some(expr);
        Ok(())
    }

    /// Add a variable. Columns are output in the order they are defined.
    pub fn define(&mut self, name: &str, expr: Expr) -> Result {
        ensure!(
            !name.trim().is_empty(),
            "variable names can't be empty"
        );
        ensure!(
            name != "patient_id",
            "`patient_id` is always output and can't be redefined"
        );
        ensure!(
            self.variables.iter().all(|(n, _)| &**n != name),
            "variable `{}` is defined more than once",
            name
        );
        check_expr(&expr).with_context(|| format!("in variable `{}`", name))?;
        self.variables.push((name.into(), expr));
        Ok(())
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.variables.iter().map(|(name, _)| &**name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn build(&self, tables: &Tables) -> Result<DatasetTable> {
        let population = self
            .population
            .as_ref()
            .context("a dataset needs a population")?;
        let ctx = EvalContext::new(tables);
        let members = ctx.mask(population).context("evaluating population")?;
        let columns = self
            .variables
            .iter()
            .map(|(name, expr)| {
                ctx.evaluate(expr)
                    .with_context(|| format!("evaluating variable `{}`", name))
            })
            .collect::<Result<Vec<_>>>()?;

        let rows: Vec<DatasetRow> = tables
            .patients
            .ids()
            .enumerate()
            .filter(|(idx, _)| members[*idx])
            .map(|(idx, patient_id)| DatasetRow {
                patient_id,
                values: columns.iter().map(|col| col[idx].clone()).collect(),
            })
            .collect();
        event!(
            Level::INFO,
            "built dataset with {} variables: {} of {} patients in population",
            self.variables.len(),
            rows.len(),
            tables.patients.len()
        );
        Ok(DatasetTable {
            columns: self.variables.iter().map(|(name, _)| name.clone()).collect(),
            rows,
        })
    }
}

/// Dataset expressions are evaluated once, so they can't refer to a measure interval.
fn check_expr(expr: &Expr) -> Result {
    ensure!(
        !expr.uses_interval(),
        "interval dates can only be used in measures"
    );
    expr.validate()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRow {
    pub patient_id: PatientId,
    /// In the order of [`DatasetTable::columns`].
    pub values: Vec<Value>,
}

/// The output of [`Dataset::build`], in patient ID order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetTable {
    columns: Vec<ArcStr>,
    rows: Vec<DatasetRow>,
}

impl DatasetTable {
    /// Variable names, not including `patient_id`.
    pub fn columns(&self) -> &[ArcStr] {
        &self.columns
    }

    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, patient_id: PatientId) -> Option<&DatasetRow> {
        self.rows
            .binary_search_by_key(&patient_id, |row| row.patient_id)
            .ok()
            .and_then(|idx| self.rows.get(idx))
    }

    pub fn get(&self, patient_id: PatientId, column: &str) -> Option<&Value> {
        let col = self.columns.iter().position(|name| &**name == column)?;
        self.row(patient_id)?.values.get(col)
    }
}

#[cfg(test)]
mod test {
    use super::Dataset;
    use crate::{
        fixtures::{date, f2f_codes, three_patients},
        AgeThreshold, DateRef, Expr, Population, Rows, Value,
    };

    fn f2f_in_january() -> Rows {
        Rows::clinical_events()
            .where_in("snomedct_code", &f2f_codes())
            .where_on_or_between("date", date(2020, 1, 1), date(2020, 1, 31))
    }

    #[test]
    fn three_patient_window() {
        let tables = three_patients();
        let mut dataset = Dataset::new();
        dataset
            .define_population(
                Population::new(date(2020, 1, 31), AgeThreshold::AtLeast(0)).to_expr(),
            )
            .unwrap();
        dataset
            .define("has_f2f", f2f_in_january().exists_for_patient())
            .unwrap();
        dataset
            .define("count_f2f", f2f_in_january().count_for_patient())
            .unwrap();
        let table = dataset.build(&tables).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(1, "count_f2f"), Some(&Value::Int(2)));
        assert_eq!(table.get(1, "has_f2f"), Some(&Value::Bool(true)));
        assert_eq!(table.get(2, "count_f2f"), Some(&Value::Int(0)));
        assert_eq!(table.get(2, "has_f2f"), Some(&Value::Bool(false)));
        // event on the last day of the window
        assert_eq!(table.get(3, "count_f2f"), Some(&Value::Int(1)));
        assert_eq!(table.get(3, "has_f2f"), Some(&Value::Bool(true)));
        assert_eq!(table.get(3, "nope"), None);
    }

    #[test]
    fn only_members_are_output() {
        let tables = three_patients();
        let mut dataset = Dataset::new();
        dataset
            .define_population(
                Population::new(date(2020, 1, 31), AgeThreshold::Over(18)).to_expr(),
            )
            .unwrap();
        dataset.define("sex", Expr::sex()).unwrap();
        let table = dataset.build(&tables).unwrap();
        let ids: Vec<_> = table.rows().iter().map(|row| row.patient_id).collect();
        assert_eq!(ids, [1, 2]);
        assert_eq!(table.get(2, "sex"), Some(&Value::from("female")));
        assert!(table.row(3).is_none());
    }

    #[test]
    fn definition_errors() {
        let mut dataset = Dataset::new();
        dataset.define("sex", Expr::sex()).unwrap();
        assert!(dataset.define("sex", Expr::sex()).is_err());
        assert!(dataset.define("patient_id", Expr::sex()).is_err());
        assert!(dataset.define("", Expr::sex()).is_err());
        assert!(dataset
            .define("age", Expr::age_on(DateRef::IntervalEnd))
            .is_err());
        // no population yet
        assert!(dataset.build(&three_patients()).is_err());
        dataset.define_population(Expr::literal(true)).unwrap();
        assert!(dataset.define_population(Expr::literal(true)).is_err());
        assert_eq!(dataset.variable_names().collect::<Vec<_>>(), ["sex"]);
    }

    #[test]
    fn evaluation_errors_name_the_variable() {
        let mut dataset = Dataset::new();
        dataset.define_population(Expr::literal(true)).unwrap();
        dataset
            .define("broken", Expr::sex().gt(Expr::age_on(date(2020, 1, 1))))
            .unwrap();
        let err = dataset.build(&three_patients()).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
