//! Column values and rows.
//!
//! `Datum` is the tagged variant stored in columnar pages. It carries a total
//! order (`Null` first, numerics unified, floats via `total_cmp`) so the same
//! comparison drives sorting, grouping, footer min/max, and index keys.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Column types supported by the table store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    Float,
    Str,
    Bool,
    Timestamp,
    Binary,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Str => "string",
            DataType::Bool => "bool",
            DataType::Timestamp => "timestamp",
            DataType::Binary => "binary",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => Some(DataType::Int),
            "float" | "double" => Some(DataType::Float),
            "string" | "str" | "text" => Some(DataType::Str),
            "bool" | "boolean" => Some(DataType::Bool),
            "timestamp" => Some(DataType::Timestamp),
            "binary" | "bytes" => Some(DataType::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single column value. Timestamps are microseconds since epoch, UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datum {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Timestamp(i64),
    Binary(Vec<u8>),
}

/// A row in physical column order.
pub type Row = Vec<Datum>;

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Int(_) => Some(DataType::Int),
            Datum::Float(_) => Some(DataType::Float),
            Datum::Bool(_) => Some(DataType::Bool),
            Datum::Str(_) => Some(DataType::Str),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Binary(_) => Some(DataType::Binary),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.data_type().map_or("null", |t| t.name())
    }

    /// Coerce into the declared column type. `Null` always passes; nullability
    /// is enforced by the writer against the column definition.
    pub fn coerce(self, ty: DataType, column: &str) -> Result<Datum> {
        let mismatch = |actual: &Datum| StorageError::TypeMismatch {
            column: column.to_string(),
            expected: ty.name().to_string(),
            actual: actual.type_name().to_string(),
        };
        match (self, ty) {
            (Datum::Null, _) => Ok(Datum::Null),
            (d @ Datum::Int(_), DataType::Int)
            | (d @ Datum::Float(_), DataType::Float)
            | (d @ Datum::Bool(_), DataType::Bool)
            | (d @ Datum::Str(_), DataType::Str)
            | (d @ Datum::Timestamp(_), DataType::Timestamp)
            | (d @ Datum::Binary(_), DataType::Binary) => Ok(d),
            (Datum::Int(v), DataType::Float) => Ok(Datum::Float(v as f64)),
            (Datum::Int(v), DataType::Timestamp) => Ok(Datum::Timestamp(v)),
            (Datum::Float(v), DataType::Int) if v.fract() == 0.0 => Ok(Datum::Int(v as i64)),
            (Datum::Str(s), DataType::Timestamp) => match DateTime::parse_from_rfc3339(&s) {
                Ok(dt) => Ok(Datum::Timestamp(dt.timestamp_micros())),
                Err(_) => Err(mismatch(&Datum::Str(s))),
            },
            (d, _) => Err(mismatch(&d)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) => 2,
            Datum::Str(_) => 3,
            Datum::Timestamp(_) => 4,
            Datum::Binary(_) => 5,
        }
    }

    /// Total order: `Null` sorts first; `Int` and `Float` compare numerically;
    /// floats use `f64::total_cmp`; distinct variants order by rank.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Float(a), Datum::Float(b)) => a.total_cmp(b),
            (Datum::Int(a), Datum::Float(b)) => (*a as f64).total_cmp(b),
            (Datum::Float(a), Datum::Int(b)) => a.total_cmp(&(*b as f64)),
            (Datum::Str(a), Datum::Str(b)) => a.cmp(b),
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a.cmp(b),
            (Datum::Binary(a), Datum::Binary(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Datum::Null => state.write_u8(0),
            Datum::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            // Int and integral Float must hash alike because they compare equal.
            Datum::Int(v) => {
                state.write_u8(2);
                v.hash(state);
            }
            Datum::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    state.write_u8(2);
                    (*f as i64).hash(state);
                } else {
                    state.write_u8(3);
                    f.to_bits().hash(state);
                }
            }
            Datum::Str(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Datum::Timestamp(t) => {
                state.write_u8(5);
                t.hash(state);
            }
            Datum::Binary(b) => {
                state.write_u8(6);
                b.hash(state);
            }
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::Float(v) => write!(f, "{v}"),
            Datum::Bool(v) => write!(f, "{v}"),
            Datum::Str(s) => f.write_str(s),
            Datum::Timestamp(micros) => match Utc.timestamp_micros(*micros).single() {
                Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true)),
                None => write!(f, "timestamp({micros})"),
            },
            Datum::Binary(bytes) => write!(f, "0x{}", hex::encode(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sorts_first() {
        let mut data = vec![Datum::Int(3), Datum::Null, Datum::Int(1)];
        data.sort();
        assert_eq!(data[0], Datum::Null);
        assert_eq!(data[1], Datum::Int(1));
    }

    #[test]
    fn int_float_compare_numerically() {
        assert_eq!(Datum::Int(2).total_cmp(&Datum::Float(2.0)), Ordering::Equal);
        assert_eq!(Datum::Int(2).total_cmp(&Datum::Float(2.5)), Ordering::Less);
        assert_eq!(Datum::Float(3.0).total_cmp(&Datum::Int(2)), Ordering::Greater);
    }

    #[test]
    fn equal_numerics_hash_alike() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Datum::Int(1));
        assert!(set.contains(&Datum::Float(1.0)));
        assert!(!set.contains(&Datum::Float(1.5)));
    }

    #[test]
    fn coerce_int_to_float() {
        let d = Datum::Int(7).coerce(DataType::Float, "v").unwrap();
        assert_eq!(d, Datum::Float(7.0));
    }

    #[test]
    fn coerce_rejects_cross_type() {
        let err = Datum::Str("x".into()).coerce(DataType::Int, "v").unwrap_err();
        assert!(err.to_string().contains("expected int"));
    }

    #[test]
    fn coerce_string_to_timestamp() {
        let d = Datum::Str("2026-01-01T00:00:00Z".into())
            .coerce(DataType::Timestamp, "ts")
            .unwrap();
        assert!(matches!(d, Datum::Timestamp(_)));
    }

    #[test]
    fn null_passes_any_type() {
        assert_eq!(Datum::Null.coerce(DataType::Binary, "b").unwrap(), Datum::Null);
    }

    #[test]
    fn display_timestamp_rfc3339() {
        let d = Datum::Timestamp(0);
        assert_eq!(d.to_string(), "1970-01-01T00:00:00.000000Z");
    }

    #[test]
    fn datatype_parse_roundtrip() {
        for ty in [
            DataType::Int,
            DataType::Float,
            DataType::Str,
            DataType::Bool,
            DataType::Timestamp,
            DataType::Binary,
        ] {
            assert_eq!(DataType::parse(ty.name()), Some(ty));
        }
        assert_eq!(DataType::parse("no-such-type"), None);
    }
}
