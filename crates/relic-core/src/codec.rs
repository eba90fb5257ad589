//! Value conversion registry
//!
//! Bidirectional converters between semantic types and storage values.
//! The registry is process-wide: builtins are installed on first touch and
//! `register_converter` extends or overrides it at runtime. Later
//! registrations for the same semantic type win; there is no removal.
//!
//! Converters must be pure and deterministic: smart-update diffing compares
//! freshly re-read rows through this same path, so a non-deterministic
//! converter would make the diff spuriously detect or miss changes.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;

use crate::error::{Result, StoreError};
use crate::value::{Datum, SemanticType, Value};

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S%.f";
const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.f";

type SerializeFn = Box<dyn Fn(&Datum) -> Result<Value> + Send + Sync>;
type DeserializeFn = Box<dyn Fn(Value) -> Result<Datum> + Send + Sync>;

/// A serialize/deserialize pair for one semantic type
pub struct Converter {
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

impl Converter {
    pub fn new<S, D>(serialize: S, deserialize: D) -> Self
    where
        S: Fn(&Datum) -> Result<Value> + Send + Sync + 'static,
        D: Fn(Value) -> Result<Datum> + Send + Sync + 'static,
    {
        Self {
            serialize: Box::new(serialize),
            deserialize: Box::new(deserialize),
        }
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<SemanticType, Converter>> = RwLock::new(builtins());
}

/// Install or override the converter for a semantic type
pub fn register_converter(ty: SemanticType, converter: Converter) {
    REGISTRY
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(ty, converter);
}

/// Serialize an application value for storage under the given semantic type.
///
/// Null always stores as null. Types without an explicit converter pass
/// scalar values through unchanged; anything else falls back to its textual
/// representation, which has no inverse.
pub fn serialize(datum: &Datum, ty: SemanticType) -> Result<Value> {
    if datum.is_null() {
        return Ok(Value::Null);
    }

    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    if let Some(converter) = registry.get(&ty) {
        return (converter.serialize)(datum);
    }

    Ok(match datum {
        Datum::Int(i) => Value::Integer(*i),
        Datum::Float(f) => Value::Real(*f),
        Datum::Blob(b) => Value::Blob(b.clone()),
        Datum::Text(s) => Value::Text(s.clone()),
        other => {
            tracing::warn!(
                ty = ty.name(),
                kind = other.kind(),
                "no converter registered; storing textual representation (not round-trippable)"
            );
            Value::Text(fallback_text(other))
        }
    })
}

/// Deserialize a storage value back into an application value.
///
/// Null always yields null. Without a converter, storage scalars map onto
/// their datum counterparts; the textual fallback of [`serialize`] cannot
/// be reversed here and comes back as plain text.
pub fn deserialize(value: Value, ty: SemanticType) -> Result<Datum> {
    if matches!(value, Value::Null) {
        return Ok(Datum::Null);
    }

    let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
    if let Some(converter) = registry.get(&ty) {
        return (converter.deserialize)(value);
    }

    Ok(match value {
        Value::Null => Datum::Null,
        Value::Integer(i) => Datum::Int(i),
        Value::Real(f) => Datum::Float(f),
        Value::Text(s) => Datum::Text(s),
        Value::Blob(b) => Datum::Blob(b),
    })
}

fn fallback_text(datum: &Datum) -> String {
    match datum {
        Datum::Bool(b) => b.to_string(),
        Datum::Json(v) => v.to_string(),
        Datum::Date(d) => d.format(DATE_FMT).to_string(),
        Datum::Time(t) => t.format(TIME_FMT).to_string(),
        Datum::DateTime(dt) => dt.format(DATETIME_FMT).to_string(),
        other => format!("{other:?}"),
    }
}

fn wrong_datum(expected: SemanticType, got: &Datum) -> StoreError {
    StoreError::Conversion(format!(
        "cannot store {} as {}",
        got.kind(),
        expected.name()
    ))
}

fn wrong_value(expected: SemanticType, got: &Value) -> StoreError {
    StoreError::Conversion(format!(
        "cannot read {} column from {} value",
        expected.name(),
        got.kind()
    ))
}

fn builtins() -> HashMap<SemanticType, Converter> {
    let mut map = HashMap::new();

    map.insert(
        SemanticType::Integer,
        Converter::new(
            |datum| match datum {
                Datum::Int(i) => Ok(Value::Integer(*i)),
                other => Err(wrong_datum(SemanticType::Integer, other)),
            },
            |value| match value {
                Value::Integer(i) => Ok(Datum::Int(i)),
                other => Err(wrong_value(SemanticType::Integer, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::Real,
        Converter::new(
            |datum| match datum {
                Datum::Float(f) => Ok(Value::Real(*f)),
                Datum::Int(i) => Ok(Value::Real(*i as f64)),
                other => Err(wrong_datum(SemanticType::Real, other)),
            },
            |value| match value {
                Value::Real(f) => Ok(Datum::Float(f)),
                // whole reals can come back as integers
                Value::Integer(i) => Ok(Datum::Float(i as f64)),
                other => Err(wrong_value(SemanticType::Real, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::Boolean,
        Converter::new(
            |datum| match datum {
                Datum::Bool(b) => Ok(Value::Integer(i64::from(*b))),
                other => Err(wrong_datum(SemanticType::Boolean, other)),
            },
            |value| match value {
                Value::Integer(i) => Ok(Datum::Bool(i != 0)),
                other => Err(wrong_value(SemanticType::Boolean, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::Text,
        Converter::new(
            |datum| match datum {
                Datum::Text(s) => Ok(Value::Text(s.clone())),
                other => Err(wrong_datum(SemanticType::Text, other)),
            },
            |value| match value {
                Value::Text(s) => Ok(Datum::Text(s)),
                other => Err(wrong_value(SemanticType::Text, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::Blob,
        Converter::new(
            |datum| match datum {
                Datum::Blob(b) => Ok(Value::Blob(b.clone())),
                other => Err(wrong_datum(SemanticType::Blob, other)),
            },
            |value| match value {
                Value::Blob(b) => Ok(Datum::Blob(b)),
                other => Err(wrong_value(SemanticType::Blob, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::Json,
        Converter::new(
            |datum| match datum {
                Datum::Json(v) => Ok(Value::Text(serde_json::to_string(v)?)),
                other => Err(wrong_datum(SemanticType::Json, other)),
            },
            |value| match value {
                Value::Text(s) => Ok(Datum::Json(serde_json::from_str(&s)?)),
                other => Err(wrong_value(SemanticType::Json, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::Date,
        Converter::new(
            |datum| match datum {
                Datum::Date(d) => Ok(Value::Text(d.format(DATE_FMT).to_string())),
                other => Err(wrong_datum(SemanticType::Date, other)),
            },
            |value| match value {
                Value::Text(s) => NaiveDate::parse_from_str(&s, DATE_FMT)
                    .map(Datum::Date)
                    .map_err(|e| StoreError::Conversion(format!("bad date '{s}': {e}"))),
                other => Err(wrong_value(SemanticType::Date, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::Time,
        Converter::new(
            |datum| match datum {
                Datum::Time(t) => Ok(Value::Text(t.format(TIME_FMT).to_string())),
                other => Err(wrong_datum(SemanticType::Time, other)),
            },
            |value| match value {
                // %.f tolerates a missing fractional part on input
                Value::Text(s) => NaiveTime::parse_from_str(&s, TIME_FMT)
                    .map(Datum::Time)
                    .map_err(|e| StoreError::Conversion(format!("bad time '{s}': {e}"))),
                other => Err(wrong_value(SemanticType::Time, &other)),
            },
        ),
    );

    map.insert(
        SemanticType::DateTime,
        Converter::new(
            |datum| match datum {
                Datum::DateTime(dt) => Ok(Value::Text(dt.format(DATETIME_FMT).to_string())),
                other => Err(wrong_datum(SemanticType::DateTime, other)),
            },
            |value| match value {
                Value::Text(s) => NaiveDateTime::parse_from_str(&s, DATETIME_FMT)
                    .map(Datum::DateTime)
                    .map_err(|e| StoreError::Conversion(format!("bad datetime '{s}': {e}"))),
                other => Err(wrong_value(SemanticType::DateTime, &other)),
            },
        ),
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(datum: Datum, ty: SemanticType) -> Datum {
        let stored = serialize(&datum, ty).expect("serialize");
        deserialize(stored, ty).expect("deserialize")
    }

    #[test]
    fn test_builtin_round_trips() {
        assert_eq!(round_trip(Datum::Int(42), SemanticType::Integer), Datum::Int(42));
        assert_eq!(
            round_trip(Datum::Float(3.1415), SemanticType::Real),
            Datum::Float(3.1415)
        );
        assert_eq!(
            round_trip(Datum::Bool(true), SemanticType::Boolean),
            Datum::Bool(true)
        );
        assert_eq!(
            round_trip(Datum::Bool(false), SemanticType::Boolean),
            Datum::Bool(false)
        );
        assert_eq!(
            round_trip(Datum::Text("hi".into()), SemanticType::Text),
            Datum::Text("hi".into())
        );
        assert_eq!(
            round_trip(Datum::Blob(vec![0, 1, 255]), SemanticType::Blob),
            Datum::Blob(vec![0, 1, 255])
        );
    }

    #[test]
    fn test_json_round_trip() {
        let v = serde_json::json!({"a": 1, "b": [1, 2, 3], "c": [true, 4.0, {"d": "e"}]});
        assert_eq!(
            round_trip(Datum::Json(v.clone()), SemanticType::Json),
            Datum::Json(v)
        );
    }

    #[test]
    fn test_boolean_stored_as_integer() {
        assert_eq!(
            serialize(&Datum::Bool(true), SemanticType::Boolean).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            serialize(&Datum::Bool(false), SemanticType::Boolean).unwrap(),
            Value::Integer(0)
        );
    }

    #[test]
    fn test_datetime_textual_format() {
        let dt = NaiveDate::from_ymd_opt(2021, 6, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 45, 123456)
            .unwrap();
        assert_eq!(
            serialize(&Datum::DateTime(dt), SemanticType::DateTime).unwrap(),
            Value::Text("2021-06-01T12:30:45.123456".into())
        );

        // no fractional part when microseconds are zero
        let dt = NaiveDate::from_ymd_opt(2021, 6, 1)
            .unwrap()
            .and_hms_opt(12, 30, 45)
            .unwrap();
        assert_eq!(
            serialize(&Datum::DateTime(dt), SemanticType::DateTime).unwrap(),
            Value::Text("2021-06-01T12:30:45".into())
        );
    }

    #[test]
    fn test_datetime_parse_tolerates_missing_fraction() {
        let parsed = deserialize(
            Value::Text("2021-06-01T12:30:45".into()),
            SemanticType::DateTime,
        )
        .unwrap();
        let expected = NaiveDate::from_ymd_opt(2021, 6, 1)
            .unwrap()
            .and_hms_opt(12, 30, 45)
            .unwrap();
        assert_eq!(parsed, Datum::DateTime(expected));
    }

    #[test]
    fn test_null_short_circuits() {
        assert_eq!(
            serialize(&Datum::Null, SemanticType::Json).unwrap(),
            Value::Null
        );
        assert_eq!(
            deserialize(Value::Null, SemanticType::Boolean).unwrap(),
            Datum::Null
        );
    }

    #[test]
    fn test_unconverted_scalar_passes_through() {
        let ty = SemanticType::Custom("opaque-scalar");
        assert_eq!(serialize(&Datum::Int(5), ty).unwrap(), Value::Integer(5));
        assert_eq!(deserialize(Value::Integer(5), ty).unwrap(), Datum::Int(5));
    }

    #[test]
    fn test_custom_converter_overrides() {
        let ty = SemanticType::Custom("point");
        register_converter(
            ty,
            Converter::new(
                |datum| match datum {
                    Datum::Json(v) => {
                        let x = v[0].as_f64().unwrap_or(0.0);
                        let y = v[1].as_f64().unwrap_or(0.0);
                        Ok(Value::Text(format!("{x},{y}")))
                    }
                    other => Err(StoreError::Conversion(format!(
                        "expected point, got {}",
                        other.kind()
                    ))),
                },
                |value| match value {
                    Value::Text(s) => {
                        let mut parts = s.splitn(2, ',');
                        let x: f64 = parts
                            .next()
                            .and_then(|p| p.parse().ok())
                            .ok_or_else(|| StoreError::Conversion(format!("bad point '{s}'")))?;
                        let y: f64 = parts
                            .next()
                            .and_then(|p| p.parse().ok())
                            .ok_or_else(|| StoreError::Conversion(format!("bad point '{s}'")))?;
                        Ok(Datum::Json(serde_json::json!([x, y])))
                    }
                    other => Err(StoreError::Conversion(format!(
                        "expected text, got {}",
                        other.kind()
                    ))),
                },
            ),
        );

        let point = Datum::Json(serde_json::json!([1.5, -2.25]));
        let stored = serialize(&point, ty).unwrap();
        assert_eq!(stored, Value::Text("1.5,-2.25".into()));
        assert_eq!(deserialize(stored, ty).unwrap(), point);
    }

    #[test]
    fn test_wrong_kind_is_conversion_error() {
        assert!(matches!(
            serialize(&Datum::Text("x".into()), SemanticType::Integer),
            Err(StoreError::Conversion(_))
        ));
        assert!(matches!(
            deserialize(Value::Blob(vec![1]), SemanticType::Text),
            Err(StoreError::Conversion(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_text_round_trips(s in ".*") {
            let datum = Datum::Text(s);
            prop_assert_eq!(round_trip(datum.clone(), SemanticType::Text), datum);
        }

        #[test]
        fn prop_integer_round_trips(i in any::<i64>()) {
            prop_assert_eq!(round_trip(Datum::Int(i), SemanticType::Integer), Datum::Int(i));
        }

        #[test]
        fn prop_datetime_round_trips(secs in 0i64..253_402_300_799, micros in 0u32..1_000_000) {
            let dt = chrono::DateTime::from_timestamp(secs, micros * 1000)
                .unwrap()
                .naive_utc();
            prop_assert_eq!(
                round_trip(Datum::DateTime(dt), SemanticType::DateTime),
                Datum::DateTime(dt)
            );
        }
    }
}
