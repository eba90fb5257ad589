//! Value types shared across the store
//!
//! Two levels of value are distinguished:
//!
//! - [`Value`] is a storage-level value, one of SQLite's five storage
//!   classes. It is what goes over the wire as a bound parameter and what
//!   comes back from a cursor.
//! - [`Datum`] is an application-level value: typed, semantic, and what a
//!   model's fields hold. The codec registry maps between the two.
//!
//! [`SemanticType`] names the application type of a field independently of
//! the column affinity it is stored under.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;

use crate::error::{Result, StoreError};

/// A storage-level value (SQLite storage class)
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Short name of the storage class, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// The application-level type of a field, independent of storage affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticType {
    Integer,
    Real,
    Boolean,
    Text,
    Blob,
    Json,
    Date,
    Time,
    DateTime,
    /// A domain type identified by name; its storage mapping comes from a
    /// converter registered at runtime
    Custom(&'static str),
}

impl SemanticType {
    /// The physical column type this semantic type is stored under.
    /// Fixed at first table creation and never changed afterwards.
    pub fn affinity(self) -> Affinity {
        match self {
            SemanticType::Integer | SemanticType::Boolean => Affinity::Integer,
            SemanticType::Real => Affinity::Real,
            SemanticType::Blob => Affinity::Blob,
            _ => Affinity::Text,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SemanticType::Integer => "integer",
            SemanticType::Real => "real",
            SemanticType::Boolean => "boolean",
            SemanticType::Text => "text",
            SemanticType::Blob => "blob",
            SemanticType::Json => "json",
            SemanticType::Date => "date",
            SemanticType::Time => "time",
            SemanticType::DateTime => "datetime",
            SemanticType::Custom(name) => name,
        }
    }
}

/// Physical column type of the embedded engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Real,
    Text,
    Blob,
}

impl Affinity {
    /// The type keyword used in DDL and reported by `PRAGMA table_info`
    pub fn sql_type(self) -> &'static str {
        match self {
            Affinity::Integer => "INTEGER",
            Affinity::Real => "REAL",
            Affinity::Text => "TEXT",
            Affinity::Blob => "BLOB",
        }
    }
}

/// An application-level value held by a model field or decoded from a row
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    Json(serde_json::Value),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Short name of the datum kind, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Int(_) => "int",
            Datum::Float(_) => "float",
            Datum::Bool(_) => "bool",
            Datum::Text(_) => "text",
            Datum::Blob(_) => "blob",
            Datum::Json(_) => "json",
            Datum::Date(_) => "date",
            Datum::Time(_) => "time",
            Datum::DateTime(_) => "datetime",
        }
    }

    /// The semantic type this datum naturally carries, if any.
    /// Used to pre-serialize bare parameter values in compiled expressions.
    pub fn semantic_type(&self) -> Option<SemanticType> {
        match self {
            Datum::Null => None,
            Datum::Int(_) => Some(SemanticType::Integer),
            Datum::Float(_) => Some(SemanticType::Real),
            Datum::Bool(_) => Some(SemanticType::Boolean),
            Datum::Text(_) => Some(SemanticType::Text),
            Datum::Blob(_) => Some(SemanticType::Blob),
            Datum::Json(_) => Some(SemanticType::Json),
            Datum::Date(_) => Some(SemanticType::Date),
            Datum::Time(_) => Some(SemanticType::Time),
            Datum::DateTime(_) => Some(SemanticType::DateTime),
        }
    }
}

impl From<Value> for Datum {
    /// Raw storage passthrough, used when no semantic type is known for a
    /// result column (computed expressions such as `count(*)`)
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Datum::Null,
            Value::Integer(i) => Datum::Int(i),
            Value::Real(f) => Datum::Float(f),
            Value::Text(s) => Datum::Text(s),
            Value::Blob(b) => Datum::Blob(b),
        }
    }
}

/// A Rust type that can live in a model field.
///
/// `TYPE` is the semantic type the field is declared with; `into_datum`
/// and `from_datum` move values across the model boundary. The storage
/// mapping itself lives in the codec registry, keyed by `TYPE`.
pub trait FieldValue: Sized {
    const TYPE: SemanticType;

    fn into_datum(self) -> Datum;
    fn from_datum(datum: Datum) -> Result<Self>;

    fn to_datum(&self) -> Datum
    where
        Self: Clone,
    {
        self.clone().into_datum()
    }
}

fn unexpected<T>(expected: &str, got: &Datum) -> Result<T> {
    Err(StoreError::Conversion(format!(
        "expected {expected}, got {}",
        got.kind()
    )))
}

impl FieldValue for i64 {
    const TYPE: SemanticType = SemanticType::Integer;

    fn into_datum(self) -> Datum {
        Datum::Int(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Int(i) => Ok(i),
            other => unexpected("int", &other),
        }
    }
}

impl FieldValue for i32 {
    const TYPE: SemanticType = SemanticType::Integer;

    fn into_datum(self) -> Datum {
        Datum::Int(self as i64)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Int(i) => i32::try_from(i)
                .map_err(|_| StoreError::Conversion(format!("{i} does not fit in i32"))),
            other => unexpected("int", &other),
        }
    }
}

impl FieldValue for f64 {
    const TYPE: SemanticType = SemanticType::Real;

    fn into_datum(self) -> Datum {
        Datum::Float(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Float(f) => Ok(f),
            // SQLite reports whole reals as integers
            Datum::Int(i) => Ok(i as f64),
            other => unexpected("float", &other),
        }
    }
}

impl FieldValue for bool {
    const TYPE: SemanticType = SemanticType::Boolean;

    fn into_datum(self) -> Datum {
        Datum::Bool(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Bool(b) => Ok(b),
            other => unexpected("bool", &other),
        }
    }
}

impl FieldValue for String {
    const TYPE: SemanticType = SemanticType::Text;

    fn into_datum(self) -> Datum {
        Datum::Text(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Text(s) => Ok(s),
            other => unexpected("text", &other),
        }
    }
}

impl FieldValue for Vec<u8> {
    const TYPE: SemanticType = SemanticType::Blob;

    fn into_datum(self) -> Datum {
        Datum::Blob(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Blob(b) => Ok(b),
            other => unexpected("blob", &other),
        }
    }
}

impl FieldValue for serde_json::Value {
    const TYPE: SemanticType = SemanticType::Json;

    fn into_datum(self) -> Datum {
        Datum::Json(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Json(v) => Ok(v),
            other => unexpected("json", &other),
        }
    }
}

impl FieldValue for NaiveDate {
    const TYPE: SemanticType = SemanticType::Date;

    fn into_datum(self) -> Datum {
        Datum::Date(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Date(d) => Ok(d),
            other => unexpected("date", &other),
        }
    }
}

impl FieldValue for NaiveTime {
    const TYPE: SemanticType = SemanticType::Time;

    fn into_datum(self) -> Datum {
        Datum::Time(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Time(t) => Ok(t),
            other => unexpected("time", &other),
        }
    }
}

impl FieldValue for NaiveDateTime {
    const TYPE: SemanticType = SemanticType::DateTime;

    fn into_datum(self) -> Datum {
        Datum::DateTime(self)
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::DateTime(dt) => Ok(dt),
            other => unexpected("datetime", &other),
        }
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    const TYPE: SemanticType = T::TYPE;

    fn into_datum(self) -> Datum {
        match self {
            Some(v) => v.into_datum(),
            None => Datum::Null,
        }
    }

    fn from_datum(datum: Datum) -> Result<Self> {
        match datum {
            Datum::Null => Ok(None),
            other => T::from_datum(other).map(Some),
        }
    }
}

macro_rules! datum_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Datum {
                fn from(v: $ty) -> Self {
                    Datum::$variant(v.into())
                }
            }
        )*
    };
}

datum_from! {
    i64 => Int,
    i32 => Int,
    f64 => Float,
    bool => Bool,
    String => Text,
    Vec<u8> => Blob,
    serde_json::Value => Json,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => DateTime,
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

impl<T> From<Option<T>> for Datum
where
    T: Into<Datum>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Datum::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_mapping() {
        assert_eq!(SemanticType::Integer.affinity(), Affinity::Integer);
        assert_eq!(SemanticType::Boolean.affinity(), Affinity::Integer);
        assert_eq!(SemanticType::Real.affinity(), Affinity::Real);
        assert_eq!(SemanticType::Blob.affinity(), Affinity::Blob);
        assert_eq!(SemanticType::Text.affinity(), Affinity::Text);
        assert_eq!(SemanticType::Json.affinity(), Affinity::Text);
        assert_eq!(SemanticType::DateTime.affinity(), Affinity::Text);
        assert_eq!(SemanticType::Custom("point").affinity(), Affinity::Text);
    }

    #[test]
    fn test_option_field_value_round_trip() {
        let datum = Some(42i64).into_datum();
        assert_eq!(datum, Datum::Int(42));
        assert_eq!(Option::<i64>::from_datum(Datum::Null).unwrap(), None);
        assert_eq!(
            Option::<i64>::from_datum(Datum::Int(7)).unwrap(),
            Some(7)
        );
    }

    #[test]
    fn test_from_datum_rejects_wrong_kind() {
        assert!(String::from_datum(Datum::Int(1)).is_err());
        assert!(bool::from_datum(Datum::Text("true".into())).is_err());
    }

    #[test]
    fn test_float_accepts_integral_storage() {
        assert_eq!(f64::from_datum(Datum::Int(3)).unwrap(), 3.0);
    }
}
