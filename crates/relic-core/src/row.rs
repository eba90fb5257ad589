//! Row projections returned by queries
//!
//! A [`Row`] is addressable by output column name or by position. Values
//! are already decoded through the codec registry by the time a row is
//! handed out; computed columns with no known semantic type hold their raw
//! storage value.

use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::value::{Datum, FieldValue};

/// One decoded result row
#[derive(Debug, Clone)]
pub struct Row {
    names: Arc<Vec<String>>,
    datums: Vec<Datum>,
}

impl Row {
    pub(crate) fn new(names: Arc<Vec<String>>, datums: Vec<Datum>) -> Self {
        Self { names, datums }
    }

    pub fn len(&self) -> usize {
        self.datums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datums.is_empty()
    }

    /// Output column names, in projection order
    pub fn columns(&self) -> &[String] {
        &self.names
    }

    /// The decoded value at a name or position
    pub fn datum(&self, key: impl RowKey) -> Result<&Datum> {
        let index = key.resolve(self)?;
        Ok(&self.datums[index])
    }

    /// The decoded value at a name or position, converted to a field type
    pub fn get<T: FieldValue>(&self, key: impl RowKey) -> Result<T> {
        let index = key.resolve(self)?;
        T::from_datum(self.datums[index].clone())
    }

    /// `(name, value)` pairs in projection order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Datum)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.datums.iter())
    }
}

/// Name- or index-based row access
pub trait RowKey {
    fn resolve(&self, row: &Row) -> Result<usize>;
}

impl RowKey for usize {
    fn resolve(&self, row: &Row) -> Result<usize> {
        if *self < row.datums.len() {
            Ok(*self)
        } else {
            Err(StoreError::AttributeNotFound(self.to_string()))
        }
    }
}

impl RowKey for &str {
    fn resolve(&self, row: &Row) -> Result<usize> {
        row.names
            .iter()
            .position(|n| n == self)
            .ok_or_else(|| StoreError::AttributeNotFound(format!("'{self}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            Arc::new(vec!["name".into(), "age".into()]),
            vec![Datum::Text("bob".into()), Datum::Int(42)],
        )
    }

    #[test]
    fn test_access_by_name_and_index() {
        let row = sample();
        assert_eq!(row.get::<String>("name").unwrap(), "bob");
        assert_eq!(row.get::<i64>(1).unwrap(), 42);
        assert_eq!(row.datum("age").unwrap(), &Datum::Int(42));
    }

    #[test]
    fn test_unknown_name_is_attribute_not_found() {
        let row = sample();
        assert!(matches!(
            row.datum("nope"),
            Err(StoreError::AttributeNotFound(_))
        ));
        assert!(matches!(
            row.datum(7usize),
            Err(StoreError::AttributeNotFound(_))
        ));
    }

    #[test]
    fn test_iter_follows_projection_order() {
        let row = sample();
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["name", "age"]);
    }
}
