//! Schema synthesis and additive migration
//!
//! A class registers once per store under its table name. First
//! registration creates the physical table; later registrations against an
//! existing table introspect its columns through `PRAGMA table_info` and
//! may only append new columns, never retype or drop existing ones. Schema
//! truth is the live table's column list; there is no catalog table.

use std::any::TypeId;
use std::collections::HashMap;

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::value::SemanticType;

/// Name of the implicit primary key column
pub const PRIMARY_KEY: &str = "id";

/// One declared, persisted field of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: SemanticType,
}

/// Convenience constructor for static field tables
pub const fn field(name: &'static str, ty: SemanticType) -> FieldDef {
    FieldDef { name, ty }
}

/// Table name plus the ordered declared field list of a class.
/// The primary key is implicit and not part of `fields`.
#[derive(Debug, Clone, Copy)]
pub struct ClassDescriptor {
    pub table: &'static str,
    pub fields: &'static [FieldDef],
}

impl ClassDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Semantic type of a declared column, including the implicit key
    pub fn semantic_type_of(&self, name: &str) -> Option<SemanticType> {
        if name == PRIMARY_KEY {
            return Some(SemanticType::Integer);
        }
        self.field(name).map(|f| f.ty)
    }
}

struct RegisteredClass {
    type_id: TypeId,
    descriptor: ClassDescriptor,
}

/// Per-store registry of classes, keyed by table name
pub(crate) struct SchemaRegistry {
    by_table: HashMap<&'static str, RegisteredClass>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            by_table: HashMap::new(),
        }
    }

    /// Registers a class, creating or additively migrating its table.
    ///
    /// Fails with `AlreadyRegistered` when the same type registers twice,
    /// `NameConflict` when a different type claims an occupied table name
    /// without `upgrade`, `TypeMismatch` when a declared affinity disagrees
    /// with an existing column, and `UpgradeRequired` when the existing
    /// table lacks a declared column and `upgrade` is false.
    pub fn register(
        &mut self,
        conn: &Connection,
        type_id: TypeId,
        descriptor: ClassDescriptor,
        upgrade: bool,
    ) -> Result<()> {
        if descriptor.field(PRIMARY_KEY).is_some() {
            return Err(StoreError::InvalidArgument {
                table: descriptor.table,
                field: PRIMARY_KEY.into(),
            });
        }

        if let Some(existing) = self.by_table.get(descriptor.table) {
            if existing.type_id == type_id {
                return Err(StoreError::AlreadyRegistered(descriptor.table));
            }
            if !upgrade {
                return Err(StoreError::NameConflict(descriptor.table));
            }
        }

        ensure_table(conn, &descriptor, upgrade)?;
        self.by_table
            .insert(descriptor.table, RegisteredClass { type_id, descriptor });
        Ok(())
    }

    /// Guard used by every save/query/delete operation
    pub fn schema_for(
        &self,
        type_id: TypeId,
        table: &'static str,
    ) -> Result<&ClassDescriptor> {
        match self.by_table.get(table) {
            Some(entry) if entry.type_id == type_id => Ok(&entry.descriptor),
            _ => Err(StoreError::UnknownClass(table)),
        }
    }
}

fn column_ddl(field: &FieldDef) -> String {
    format!("{} {}", field.name, field.ty.affinity().sql_type())
}

/// Creates the table or appends missing columns, checking affinity of the
/// ones already present. Idempotent to retry.
fn ensure_table(conn: &Connection, descriptor: &ClassDescriptor, upgrade: bool) -> Result<()> {
    let existing = existing_columns(conn, descriptor.table)?;

    if existing.is_empty() {
        let mut columns = vec![format!("{PRIMARY_KEY} INTEGER PRIMARY KEY")];
        columns.extend(descriptor.fields.iter().map(column_ddl));
        let sql = format!(
            "CREATE TABLE {} ({})",
            descriptor.table,
            columns.join(", ")
        );
        tracing::debug!(sql = %sql, "create table");
        conn.execute(&sql, [])?;
        return Ok(());
    }

    for field in descriptor.fields {
        match existing.get(field.name) {
            Some(found) => {
                let expected = field.ty.affinity().sql_type();
                if !found.eq_ignore_ascii_case(expected) {
                    return Err(StoreError::TypeMismatch {
                        table: descriptor.table,
                        column: field.name.into(),
                        expected: expected.into(),
                        found: found.clone(),
                    });
                }
            }
            None if upgrade => {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    descriptor.table,
                    column_ddl(field)
                );
                tracing::debug!(sql = %sql, "append column");
                conn.execute(&sql, [])?;
            }
            None => {
                return Err(StoreError::UpgradeRequired {
                    table: descriptor.table,
                    column: field.name.into(),
                });
            }
        }
    }

    // columns present in storage but absent from the descriptor stay as-is
    Ok(())
}

/// Column name -> declared type, from `PRAGMA table_info`
fn existing_columns(conn: &Connection, table: &str) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut columns = HashMap::new();
    for row in rows {
        let (name, ty) = row?;
        columns.insert(name, ty);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;

    const FIELDS_V1: &[FieldDef] = &[field("bar", SemanticType::Text)];
    const FIELDS_V2: &[FieldDef] = &[
        field("bar", SemanticType::Text),
        field("baz", SemanticType::Integer),
    ];
    const FIELDS_RETYPED: &[FieldDef] = &[field("bar", SemanticType::Integer)];

    fn conn() -> Connection {
        Connection::open_in_memory().expect("in-memory SQLite should open")
    }

    fn descriptor(fields: &'static [FieldDef]) -> ClassDescriptor {
        ClassDescriptor {
            table: "foo",
            fields,
        }
    }

    #[test]
    fn test_first_registration_creates_table() {
        let conn = conn();
        let mut registry = SchemaRegistry::new();
        registry
            .register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V1), false)
            .unwrap();

        let columns = existing_columns(&conn, "foo").unwrap();
        assert_eq!(columns.get("id").map(String::as_str), Some("INTEGER"));
        assert_eq!(columns.get("bar").map(String::as_str), Some("TEXT"));
    }

    #[test]
    fn test_reregistering_same_type_fails() {
        let conn = conn();
        let mut registry = SchemaRegistry::new();
        registry
            .register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V1), false)
            .unwrap();
        assert!(matches!(
            registry.register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V1), false),
            Err(StoreError::AlreadyRegistered("foo"))
        ));
    }

    #[test]
    fn test_name_conflict_without_upgrade() {
        let conn = conn();
        let mut registry = SchemaRegistry::new();
        registry
            .register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V1), false)
            .unwrap();
        assert!(matches!(
            registry.register(&conn, TypeId::of::<B>(), descriptor(FIELDS_V2), false),
            Err(StoreError::NameConflict("foo"))
        ));
    }

    #[test]
    fn test_upgrade_appends_column() {
        let conn = conn();
        let mut registry = SchemaRegistry::new();
        registry
            .register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V1), false)
            .unwrap();
        registry
            .register(&conn, TypeId::of::<B>(), descriptor(FIELDS_V2), true)
            .unwrap();

        let columns = existing_columns(&conn, "foo").unwrap();
        assert_eq!(columns.get("baz").map(String::as_str), Some("INTEGER"));
    }

    #[test]
    fn test_upgrade_with_retyped_column_fails() {
        let conn = conn();
        let mut registry = SchemaRegistry::new();
        registry
            .register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V1), false)
            .unwrap();
        assert!(matches!(
            registry.register(&conn, TypeId::of::<B>(), descriptor(FIELDS_RETYPED), true),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_existing_table_missing_column_requires_upgrade() {
        let conn = conn();
        conn.execute("CREATE TABLE foo (id INTEGER PRIMARY KEY, bar TEXT)", [])
            .unwrap();
        let mut registry = SchemaRegistry::new();
        assert!(matches!(
            registry.register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V2), false),
            Err(StoreError::UpgradeRequired { .. })
        ));
        // same registration with upgrade succeeds
        registry
            .register(&conn, TypeId::of::<A>(), descriptor(FIELDS_V2), true)
            .unwrap();
    }

    #[test]
    fn test_schema_for_unregistered_class_fails() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.schema_for(TypeId::of::<A>(), "foo"),
            Err(StoreError::UnknownClass("foo"))
        ));
    }

    #[test]
    fn test_declared_id_field_is_rejected() {
        let conn = conn();
        let mut registry = SchemaRegistry::new();
        const WITH_ID: &[FieldDef] = &[field("id", SemanticType::Integer)];
        assert!(matches!(
            registry.register(
                &conn,
                TypeId::of::<A>(),
                ClassDescriptor {
                    table: "foo",
                    fields: WITH_ID
                },
                false
            ),
            Err(StoreError::InvalidArgument { .. })
        ));
    }
}
