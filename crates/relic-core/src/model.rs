//! The `Model` trait and column accessors
//!
//! A persisted class declares its table name and an explicit, ordered field
//! list, and moves its field values across the store boundary as datums.
//! Field order is fixed by `fields()`; `to_datums` must produce one datum
//! per declared field in that order. Private, non-persisted state is simply
//! not declared.

use crate::error::Result;
use crate::expr::Expr;
use crate::row::Row;
use crate::schema::{ClassDescriptor, FieldDef, PRIMARY_KEY};
use crate::value::SemanticType;

/// A record type that can be persisted by the store.
///
/// ```
/// use relic_core::{field, Model, Result, Row, SemanticType};
/// use relic_core::schema::FieldDef;
///
/// struct Person {
///     id: Option<i64>,
///     username: String,
///     karma: i64,
/// }
///
/// impl Model for Person {
///     const TABLE: &'static str = "person";
///
///     fn fields() -> &'static [FieldDef] {
///         const FIELDS: &[FieldDef] = &[
///             field("username", SemanticType::Text),
///             field("karma", SemanticType::Integer),
///         ];
///         FIELDS
///     }
///
///     fn to_datums(&self) -> Vec<relic_core::Datum> {
///         vec![self.username.clone().into(), self.karma.into()]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Person {
///             id: row.get("id")?,
///             username: row.get("username")?,
///             karma: row.get("karma")?,
///         })
///     }
///
///     fn id(&self) -> Option<i64> {
///         self.id
///     }
///
///     fn set_id(&mut self, id: Option<i64>) {
///         self.id = id;
///     }
/// }
/// ```
pub trait Model: Sized + Send + Sync + 'static {
    /// Table name; one table per registered class
    const TABLE: &'static str;

    /// Ordered declared fields, excluding the implicit `id` primary key.
    /// The slice must come from a `const` or `static` table; a borrowed
    /// slice literal built in the function body is not `'static`.
    fn fields() -> &'static [FieldDef];

    /// Field values in declaration order, one datum per declared field
    fn to_datums(&self) -> Vec<crate::value::Datum>;

    /// Materializes an instance from a loaded row. The row carries `id`
    /// plus every declared column, decoded; non-persisted state is up to
    /// the implementation.
    fn from_row(row: &Row) -> Result<Self>;

    /// The persisted primary key, `None` until first save
    fn id(&self) -> Option<i64>;

    /// Called by the store on save (assign) and delete (clear)
    fn set_id(&mut self, id: Option<i64>);

    fn descriptor() -> ClassDescriptor {
        ClassDescriptor {
            table: Self::TABLE,
            fields: Self::fields(),
        }
    }

    /// Column accessor for building query expressions
    fn cols() -> Cols {
        Cols {
            descriptor: Self::descriptor(),
        }
    }
}

/// Column accessor for one class: resolves field names into typed column
/// references. Late-bound clauses receive one of these just before
/// compilation, so expression fragments can be written without a forward
/// reference to the class.
#[derive(Debug, Clone, Copy)]
pub struct Cols {
    descriptor: ClassDescriptor,
}

impl Cols {
    /// A reference to a declared column (or `id`). Unknown names produce a
    /// poisoned expression that fails with `InvalidArgument` when compiled.
    pub fn c(&self, name: &str) -> Expr {
        if name == PRIMARY_KEY {
            return self.id();
        }
        match self.descriptor.field(name) {
            Some(field) => Expr::Column {
                table: self.descriptor.table,
                name: field.name,
                ty: field.ty,
            },
            None => Expr::Invalid {
                table: self.descriptor.table,
                field: name.to_string(),
            },
        }
    }

    /// The implicit primary key column
    pub fn id(&self) -> Expr {
        Expr::Column {
            table: self.descriptor.table,
            name: PRIMARY_KEY,
            ty: SemanticType::Integer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr;
    use crate::schema::field;

    struct Dummy;

    impl Model for Dummy {
        const TABLE: &'static str = "dummy";

        fn fields() -> &'static [FieldDef] {
            const FIELDS: &[FieldDef] = &[
                field("name", SemanticType::Text),
                field("flag", SemanticType::Boolean),
            ];
            FIELDS
        }

        fn to_datums(&self) -> Vec<crate::value::Datum> {
            Vec::new()
        }

        fn from_row(_row: &Row) -> Result<Self> {
            Ok(Dummy)
        }

        fn id(&self) -> Option<i64> {
            None
        }

        fn set_id(&mut self, _id: Option<i64>) {}
    }

    #[test]
    fn test_cols_resolves_declared_fields() {
        let cols = Dummy::cols();
        match cols.c("name") {
            Expr::Column { name, ty, .. } => {
                assert_eq!(name, "name");
                assert_eq!(ty, SemanticType::Text);
            }
            other => panic!("expected column, got {other:?}"),
        }
        match cols.c("id") {
            Expr::Column { ty, .. } => assert_eq!(ty, SemanticType::Integer),
            other => panic!("expected column, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_field_poisons_expression() {
        let cols = Dummy::cols();
        let compiled = expr::compile(&cols.c("nope").eq(1));
        assert!(matches!(
            compiled,
            Err(crate::error::StoreError::InvalidArgument { .. })
        ));
    }
}
