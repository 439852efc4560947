//! Per-patient scalar values.
use crate::{ArcStr, Result};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The value of a variable for one patient.
///
/// `Missing` plays the part of a database null. The derived ordering puts `Missing` before
/// everything else, which is the order used when sorting records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Missing,
    Bool(bool),
    Int(i64),
    Str(ArcStr),
    Date(NaiveDate),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Date(_) => "date",
        }
    }

    /// Interpret the value in a boolean position.
    ///
    /// Integers are true when non-zero. `None` means missing.
    pub fn truth(&self) -> Result<Option<bool>> {
        match self {
            Value::Missing => Ok(None),
            Value::Bool(b) => Ok(Some(*b)),
            Value::Int(i) => Ok(Some(*i != 0)),
            other => bail!("expected a bool, found {} `{}`", other.type_name(), other),
        }
    }

    /// The amount this value adds to a measure sum.
    pub fn contribution(&self) -> Result<i64> {
        match self {
            Value::Missing => Ok(0),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::Int(i) => Ok(*i),
            other => bail!(
                "measure values must be bool or int, found {} `{}`",
                other.type_name(),
                other
            ),
        }
    }

    pub fn as_int(&self) -> Result<Option<i64>> {
        match self {
            Value::Missing => Ok(None),
            Value::Int(i) => Ok(Some(*i)),
            other => bail!("expected an int, found {} `{}`", other.type_name(), other),
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Missing => Ok(()),
            Value::Bool(true) => f.write_str("T"),
            Value::Bool(false) => f.write_str("F"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v.into())
    }
}

impl From<ArcStr> for Value {
    fn from(v: ArcStr) -> Self {
        Value::Str(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Missing, Into::into)
    }
}

#[cfg(test)]
mod test {
    use super::Value;
    use crate::fixtures::date;

    #[test]
    fn display() {
        assert_eq!(Value::Missing.to_string(), "");
        assert_eq!(Value::Bool(true).to_string(), "T");
        assert_eq!(Value::Bool(false).to_string(), "F");
        assert_eq!(Value::from(date(2020, 2, 5)).to_string(), "2020-02-05");
        assert_eq!(Value::from("Mixed").to_string(), "Mixed");
    }

    #[test]
    fn missing_sorts_first() {
        let mut vals = vec![
            Value::from(date(2020, 1, 2)),
            Value::Missing,
            Value::from(date(2019, 1, 2)),
        ];
        vals.sort();
        assert_eq!(vals[0], Value::Missing);
        assert_eq!(vals[1], Value::from(date(2019, 1, 2)));
    }

    #[test]
    fn truth_and_contribution() {
        assert_eq!(Value::Int(3).truth().unwrap(), Some(true));
        assert_eq!(Value::Int(0).truth().unwrap(), Some(false));
        assert_eq!(Value::Missing.truth().unwrap(), None);
        assert!(Value::from("x").truth().is_err());
        assert_eq!(Value::Bool(true).contribution().unwrap(), 1);
        assert_eq!(Value::Missing.contribution().unwrap(), 0);
        assert!(Value::from(date(2020, 1, 1)).contribution().is_err());
    }
}
