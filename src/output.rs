//! Writing dataset and measure tables as CSV.
//!
//! Values are written the way the downstream analysis scripts read them: booleans as `T`/`F`,
//! missing values as empty cells and dates as `YYYY-MM-DD`.
use crate::{util, DatasetTable, MeasureTable, Result, Value};
use qu::ick_use::*;
use std::{fs, io, iter, path::Path};

impl DatasetTable {
    /// Columns are `patient_id` followed by the variables in definition order.
    pub fn write_csv(&self, out: impl io::Write) -> Result {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(
            iter::once("patient_id").chain(self.columns().iter().map(|col| &**col)),
        )?;
        for row in self.rows() {
            writer.write_record(
                iter::once(row.patient_id.to_string())
                    .chain(row.values.iter().map(Value::to_string)),
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(path.as_ref(), |out| self.write_csv(out))
    }
}

impl MeasureTable {
    /// Fixed columns first, then every group-by column used by any measure. Cells for groups a
    /// measure doesn't use are left empty.
    pub fn write_csv(&self, out: impl io::Write) -> Result {
        let groups = self.group_columns();
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(
            [
                "measure",
                "interval_start",
                "interval_end",
                "numerator",
                "denominator",
            ]
            .into_iter()
            .chain(groups.iter().map(|name| &**name)),
        )?;
        for row in self.rows() {
            let fixed = [
                row.measure.to_string(),
                row.interval.start.format("%Y-%m-%d").to_string(),
                row.interval.end.format("%Y-%m-%d").to_string(),
                row.numerator.to_string(),
                row.denominator.to_string(),
            ];
            let group_values = groups.iter().map(|name| {
                row.group_value(name)
                    .map(Value::to_string)
                    .unwrap_or_default()
            });
            writer.write_record(fixed.into_iter().chain(group_values))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        save(path.as_ref(), |out| self.write_csv(out))
    }
}

fn save(path: &Path, write: impl FnOnce(&mut io::BufWriter<fs::File>) -> Result) -> Result {
    fn inner(path: &Path, write: impl FnOnce(&mut io::BufWriter<fs::File>) -> Result) -> Result {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("could not create parent")?;
        }
        if util::path_exists(path)? {
            event!(
                Level::WARN,
                "overwriting existing file at \"{}\"",
                path.display()
            );
        }
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        write(&mut out)
    }
    util::check_extension(path, "csv")?;

    inner(path, write).with_context(|| format!("unable to save table to \"{}\"", path.display()))
}
