//! The store: one SQLite connection, one lock, one identity cache
//!
//! All schema, CRUD, query and cache operations serialize on a single
//! mutex owned by the store; public methods lock once and thread the
//! locked state through internal helpers, so compound operations never
//! re-enter the lock. Every call blocks until its statement completes;
//! query results are fully materialized before the lock is released.
//!
//! The connection runs inside an explicit transaction: the first write
//! after open (or after a commit) issues `BEGIN`, and nothing is durable
//! until [`Store::commit`] or [`Store::close`]. Acquiring a store is
//! scoped: every exit path ends in a final commit-then-close, either
//! explicitly through [`Store::close`] (which reports failures) or
//! best-effort on drop (which logs them).

use std::any::TypeId;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use rusqlite::Connection;

use crate::cache::{IdentityCache, Shared};
use crate::codec;
use crate::error::{Result, StoreError};
use crate::expr::{self, Expr};
use crate::model::{Cols, Model};
use crate::row::Row;
use crate::schema::{ClassDescriptor, SchemaRegistry, PRIMARY_KEY};
use crate::value::{Datum, SemanticType, Value};

/// Store behavior switches
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Diff updates against the persisted row and write only changed
    /// columns, skipping the statement entirely when nothing differs
    pub smart_update: bool,
    /// Run `VACUUM` before closing the database file
    pub vacuum_on_close: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            smart_update: false,
            vacuum_on_close: true,
        }
    }
}

struct StoreInner {
    conn: Connection,
    in_txn: bool,
    closed: bool,
    schema: SchemaRegistry,
    cache: IdentityCache,
}

/// A SQLite-backed object store
pub struct Store {
    inner: Mutex<StoreInner>,
    options: StoreOptions,
}

impl Store {
    /// Opens (or creates) a store backed by the given database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::from_conn(Connection::open(path)?, options)
    }

    /// An in-memory store, deleted when closed
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(StoreOptions::default())
    }

    pub fn open_in_memory_with(options: StoreOptions) -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?, options)
    }

    fn from_conn(conn: Connection, options: StoreOptions) -> Result<Self> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                in_txn: false,
                closed: false,
                schema: SchemaRegistry::new(),
                cache: IdentityCache::new(),
            }),
            options,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a class on this store, creating or additively migrating
    /// its table. Must precede any save/query/delete for the class.
    pub fn register<M: Model>(&self, upgrade: bool) -> Result<()> {
        let mut inner = self.lock();
        inner.begin()?;
        let StoreInner { conn, schema, .. } = &mut *inner;
        schema.register(conn, TypeId::of::<M>(), M::descriptor(), upgrade)
    }

    /// Inserts the instance as a new row — never an update — assigns the
    /// engine-chosen primary key, and returns the now-shared instance.
    pub fn save<M: Model>(&self, mut instance: M) -> Result<Shared<M>> {
        let mut inner = self.lock();
        let descriptor = *inner.schema.schema_for(TypeId::of::<M>(), M::TABLE)?;
        let values = serialized_fields(&descriptor, &instance.to_datums())?;

        let sql = if descriptor.fields.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", descriptor.table)
        } else {
            let columns: Vec<&str> = descriptor.fields.iter().map(|f| f.name).collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                descriptor.table,
                columns.join(", "),
                placeholders
            )
        };
        inner.execute(&sql, &values)?;

        let id = inner.conn.last_insert_rowid();
        instance.set_id(Some(id));
        let shared = Arc::new(RwLock::new(instance));
        inner.cache.insert(M::TABLE, id, &shared);
        Ok(shared)
    }

    /// Writes the instance's current field values back to its row.
    /// With smart-update enabled, only changed columns are written and an
    /// unchanged instance issues no statement at all.
    pub fn update<M: Model>(&self, handle: &Shared<M>) -> Result<()> {
        let mut inner = self.lock();
        let descriptor = *inner.schema.schema_for(TypeId::of::<M>(), M::TABLE)?;

        let (id, values) = {
            let guard = read_lock(handle);
            let id = guard.id().ok_or(StoreError::MissingPrimaryKey(M::TABLE))?;
            (id, serialized_fields(&descriptor, &guard.to_datums())?)
        };

        if descriptor.fields.is_empty() {
            inner.cache.insert(M::TABLE, id, handle);
            return Ok(());
        }

        let (columns, mut params): (Vec<&str>, Vec<Value>) = if self.options.smart_update {
            match inner.current_row(&descriptor, id)? {
                Some(current) => {
                    let mut columns = Vec::new();
                    let mut params = Vec::new();
                    for (field, (new, old)) in descriptor
                        .fields
                        .iter()
                        .zip(values.iter().zip(current.iter()))
                    {
                        if new != old {
                            columns.push(field.name);
                            params.push(new.clone());
                        }
                    }
                    (columns, params)
                }
                // the row vanished underneath us; write everything
                None => (descriptor.fields.iter().map(|f| f.name).collect(), values),
            }
        } else {
            (descriptor.fields.iter().map(|f| f.name).collect(), values)
        };

        if columns.is_empty() {
            tracing::debug!(table = descriptor.table, id, "no columns changed, skipping update");
            inner.cache.insert(M::TABLE, id, handle);
            return Ok(());
        }

        let assignments: Vec<String> = columns.iter().map(|c| format!("{c} = ?")).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {PRIMARY_KEY} = ?",
            descriptor.table,
            assignments.join(", ")
        );
        params.push(Value::Integer(id));
        inner.execute(&sql, &params)?;
        inner.cache.insert(M::TABLE, id, handle);
        Ok(())
    }

    /// Deletes the instance's row and clears its in-memory primary key.
    /// Deleting an instance whose key was already cleared fails.
    pub fn delete<M: Model>(&self, handle: &Shared<M>) -> Result<()> {
        let mut inner = self.lock();
        let descriptor = *inner.schema.schema_for(TypeId::of::<M>(), M::TABLE)?;

        let mut guard = write_lock(handle);
        let id = guard.id().ok_or(StoreError::MissingPrimaryKey(M::TABLE))?;
        inner.execute(
            &format!("DELETE FROM {} WHERE {PRIMARY_KEY} = ?", descriptor.table),
            &[Value::Integer(id)],
        )?;
        inner.cache.remove(M::TABLE, id);
        guard.set_id(None);
        Ok(())
    }

    /// Deletes every row matching the expression; returns the row count
    pub fn delete_where<M: Model>(&self, filter: Expr) -> Result<usize> {
        self.delete_filtered::<M>(Some(filter))
    }

    /// Late-bound variant of [`Store::delete_where`]
    pub fn delete_where_with<M: Model>(
        &self,
        filter: impl FnOnce(&Cols) -> Expr,
    ) -> Result<usize> {
        self.delete_filtered::<M>(Some(filter(&M::cols())))
    }

    /// Deletes rows matching an exact-match conjunction of field values.
    /// An empty field list deletes every row of the class.
    pub fn delete_by<M: Model>(&self, fields: &[(&str, Datum)]) -> Result<usize> {
        let filter = exact_match(&M::descriptor(), fields)?;
        self.delete_filtered::<M>(filter)
    }

    fn delete_filtered<M: Model>(&self, filter: Option<Expr>) -> Result<usize> {
        let mut inner = self.lock();
        let descriptor = *inner.schema.schema_for(TypeId::of::<M>(), M::TABLE)?;
        let mut sql = format!("DELETE FROM {}", descriptor.table);
        let mut params = Vec::new();
        if let Some(filter) = filter {
            let compiled = expr::compile(&filter)?;
            sql.push_str(" WHERE ");
            sql.push_str(&compiled.sql);
            params = compiled.params;
        }
        inner.execute(&sql, &params)
    }

    /// Starts a SELECT against the class's table
    pub fn query<M: Model>(&self) -> QueryBuilder<'_, M> {
        QueryBuilder {
            store: self,
            select: None,
            filter: None,
            order_by: None,
            group_by: None,
            limit: None,
            _marker: PhantomData,
        }
    }

    /// Loads every instance of the class
    pub fn load<M: Model>(&self) -> Result<Vec<Shared<M>>> {
        self.load_filtered(None)
    }

    /// Loads instances matching the expression
    pub fn load_where<M: Model>(&self, filter: Expr) -> Result<Vec<Shared<M>>> {
        self.load_filtered(Some(filter))
    }

    /// Late-bound variant of [`Store::load_where`]
    pub fn load_where_with<M: Model>(
        &self,
        filter: impl FnOnce(&Cols) -> Expr,
    ) -> Result<Vec<Shared<M>>> {
        self.load_filtered(Some(filter(&M::cols())))
    }

    /// Loads instances matching an exact-match conjunction of field values
    pub fn load_by<M: Model>(&self, fields: &[(&str, Datum)]) -> Result<Vec<Shared<M>>> {
        let filter = exact_match(&M::descriptor(), fields)?;
        self.load_filtered(filter)
    }

    /// The instance with this primary key, if any
    pub fn get_by_id<M: Model>(&self, id: i64) -> Result<Option<Shared<M>>> {
        single::<M>(self.load_by(&[(PRIMARY_KEY, Datum::Int(id))])?)
    }

    /// Like [`Store::load_where`] but requires at most one match; zero
    /// matches is `None`, two or more is an error
    pub fn get_where<M: Model>(&self, filter: Expr) -> Result<Option<Shared<M>>> {
        single::<M>(self.load_where(filter)?)
    }

    /// Late-bound variant of [`Store::get_where`]
    pub fn get_where_with<M: Model>(
        &self,
        filter: impl FnOnce(&Cols) -> Expr,
    ) -> Result<Option<Shared<M>>> {
        single::<M>(self.load_where_with(filter)?)
    }

    /// Exact-match variant of [`Store::get_where`]
    pub fn get_by<M: Model>(&self, fields: &[(&str, Datum)]) -> Result<Option<Shared<M>>> {
        single::<M>(self.load_by(fields)?)
    }

    fn load_filtered<M: Model>(&self, filter: Option<Expr>) -> Result<Vec<Shared<M>>> {
        let mut inner = self.lock();
        let descriptor = *inner.schema.schema_for(TypeId::of::<M>(), M::TABLE)?;

        let mut columns = vec![PRIMARY_KEY];
        columns.extend(descriptor.fields.iter().map(|f| f.name));
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), descriptor.table);
        let mut params = Vec::new();
        if let Some(filter) = &filter {
            let compiled = expr::compile(filter)?;
            sql.push_str(" WHERE ");
            sql.push_str(&compiled.sql);
            params = compiled.params;
        }

        let rows = inner.select_rows(&sql, &params, &[], &descriptor)?;
        rows.into_iter()
            .map(|row| {
                let id: i64 = row.get(PRIMARY_KEY)?;
                inner.cache.materialize(M::TABLE, id, || {
                    let mut instance = M::from_row(&row)?;
                    instance.set_id(Some(id));
                    Ok(instance)
                })
            })
            .collect()
    }

    /// Commits the open transaction, if any
    pub fn commit(&self) -> Result<()> {
        self.lock().commit()
    }

    /// Commits, optionally vacuums, and closes the database.
    /// Dropping the store without calling this does the same best-effort,
    /// logging failures instead of reporting them.
    pub fn close(mut self) -> Result<()> {
        let vacuum = self.options.vacuum_on_close;
        self.inner
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown(vacuum)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let vacuum = self.options.vacuum_on_close;
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = inner.shutdown(vacuum) {
            tracing::warn!(error = %e, "failed to close store cleanly");
        }
    }
}

impl StoreInner {
    fn begin(&mut self) -> Result<()> {
        if !self.in_txn {
            tracing::debug!("BEGIN");
            self.conn.execute_batch("BEGIN")?;
            self.in_txn = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_txn {
            tracing::debug!("COMMIT");
            self.conn.execute_batch("COMMIT")?;
            self.in_txn = false;
        }
        Ok(())
    }

    /// Final commit-then-close; idempotent so the drop path can run it
    /// after an explicit close already has
    fn shutdown(&mut self, vacuum: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.commit()?;
        if vacuum {
            tracing::debug!("VACUUM");
            self.conn.execute_batch("VACUUM")?;
        }
        self.closed = true;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        self.begin()?;
        tracing::debug!(sql = %sql, params = params.len(), "execute");
        Ok(self
            .conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))?)
    }

    /// Runs a SELECT and decodes every column. When projection metadata
    /// covers the output, each position decodes by its compiled type and
    /// computed columns stay raw, whatever their output name. Without
    /// metadata (`*` or the declared-column load path), columns decode by
    /// the declared type of the matching field name.
    fn select_rows(
        &self,
        sql: &str,
        params: &[Value],
        outputs: &[(Option<String>, Option<SemanticType>)],
        descriptor: &ClassDescriptor,
    ) -> Result<Vec<Row>> {
        tracing::debug!(sql = %sql, params = params.len(), "select");
        let mut stmt = self.conn.prepare(sql)?;
        let names: Arc<Vec<String>> = Arc::new(
            stmt.column_names().iter().map(|n| n.to_string()).collect(),
        );
        let positional = outputs.len() == names.len();

        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut decoded = Vec::new();
        while let Some(row) = rows.next()? {
            let mut datums = Vec::with_capacity(names.len());
            for i in 0..names.len() {
                let value = Value::from(row.get_ref(i)?);
                let ty = if positional {
                    outputs[i].1
                } else {
                    descriptor.semantic_type_of(&names[i])
                };
                let datum = match ty {
                    Some(ty) => codec::deserialize(value, ty)?,
                    None => Datum::from(value),
                };
                datums.push(datum);
            }
            decoded.push(Row::new(Arc::clone(&names), datums));
        }
        Ok(decoded)
    }

    /// Current stored values of every declared column for one row, in
    /// declaration order; `None` if the row does not exist
    fn current_row(&self, descriptor: &ClassDescriptor, id: i64) -> Result<Option<Vec<Value>>> {
        let columns: Vec<&str> = descriptor.fields.iter().map(|f| f.name).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {PRIMARY_KEY} = ?",
            columns.join(", "),
            descriptor.table
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    values.push(Value::from(row.get_ref(i)?));
                }
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }
}

/// Composable SELECT over one class's table.
///
/// Clauses accept either a ready expression or (via the `_with` variants)
/// a late-bound closure over the class's column accessor, resolved
/// immediately before compilation. The select list defaults to `*`.
pub struct QueryBuilder<'a, M: Model> {
    store: &'a Store,
    select: Option<Clause<'a>>,
    filter: Option<Clause<'a>>,
    order_by: Option<Clause<'a>>,
    group_by: Option<Clause<'a>>,
    limit: Option<i64>,
    _marker: PhantomData<M>,
}

enum Clause<'a> {
    Ready(Expr),
    Late(Box<dyn FnOnce(&Cols) -> Expr + 'a>),
}

impl Clause<'_> {
    fn resolve(self, cols: &Cols) -> Expr {
        match self {
            Clause::Ready(expr) => expr,
            Clause::Late(f) => f(cols),
        }
    }
}

impl<'a, M: Model> QueryBuilder<'a, M> {
    pub fn select(mut self, expr: Expr) -> Self {
        self.select = Some(Clause::Ready(expr));
        self
    }

    pub fn select_with(mut self, f: impl FnOnce(&Cols) -> Expr + 'a) -> Self {
        self.select = Some(Clause::Late(Box::new(f)));
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(Clause::Ready(expr));
        self
    }

    pub fn filter_with(mut self, f: impl FnOnce(&Cols) -> Expr + 'a) -> Self {
        self.filter = Some(Clause::Late(Box::new(f)));
        self
    }

    pub fn order_by(mut self, expr: Expr) -> Self {
        self.order_by = Some(Clause::Ready(expr));
        self
    }

    pub fn order_by_with(mut self, f: impl FnOnce(&Cols) -> Expr + 'a) -> Self {
        self.order_by = Some(Clause::Late(Box::new(f)));
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by = Some(Clause::Ready(expr));
        self
    }

    pub fn group_by_with(mut self, f: impl FnOnce(&Cols) -> Expr + 'a) -> Self {
        self.group_by = Some(Clause::Late(Box::new(f)));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Executes the query and returns every result row, decoded
    pub fn rows(self) -> Result<Vec<Row>> {
        let cols = M::cols();
        let select = self
            .select
            .map(|c| c.resolve(&cols))
            .unwrap_or_else(Expr::star);
        let filter = self.filter.map(|c| c.resolve(&cols));
        let group_by = self.group_by.map(|c| c.resolve(&cols));
        let order_by = self.order_by.map(|c| c.resolve(&cols));

        let inner = self.store.lock();
        let descriptor = *inner.schema.schema_for(TypeId::of::<M>(), M::TABLE)?;

        let compiled = expr::compile(&select)?;
        let mut sql = format!("SELECT {} FROM {}", compiled.sql, descriptor.table);
        let mut params = compiled.params;

        if let Some(filter) = &filter {
            let compiled = expr::compile(filter)?;
            sql.push_str(" WHERE ");
            sql.push_str(&compiled.sql);
            params.extend(compiled.params);
        }
        if let Some(group_by) = &group_by {
            let compiled = expr::compile(group_by)?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&compiled.sql);
            params.extend(compiled.params);
        }
        if let Some(order_by) = &order_by {
            let compiled = expr::compile(order_by)?;
            sql.push_str(" ORDER BY ");
            sql.push_str(&compiled.sql);
            params.extend(compiled.params);
        }
        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            params.push(Value::Integer(limit));
        }

        let outputs = expr::output_columns(&select);
        inner.select_rows(&sql, &params, &outputs, &descriptor)
    }

    /// Executes the query requiring at most one row
    pub fn one(self) -> Result<Option<Row>> {
        let mut rows = self.rows()?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            _ => Err(StoreError::MultipleResults(M::TABLE)),
        }
    }
}

fn single<M: Model>(mut matches: Vec<Shared<M>>) -> Result<Option<Shared<M>>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        _ => Err(StoreError::MultipleResults(M::TABLE)),
    }
}

/// Serializes declared field values through the codec, in declaration order
fn serialized_fields(descriptor: &ClassDescriptor, datums: &[Datum]) -> Result<Vec<Value>> {
    if datums.len() != descriptor.fields.len() {
        return Err(StoreError::Conversion(format!(
            "model '{}' produced {} values for {} declared fields",
            descriptor.table,
            datums.len(),
            descriptor.fields.len()
        )));
    }
    descriptor
        .fields
        .iter()
        .zip(datums)
        .map(|(field, datum)| codec::serialize(datum, field.ty))
        .collect()
}

/// Conjunction of `column = value` comparisons over declared fields
/// (null values become `IS NULL`); `None` for an empty field list
fn exact_match(descriptor: &ClassDescriptor, fields: &[(&str, Datum)]) -> Result<Option<Expr>> {
    let mut combined: Option<Expr> = None;
    for (name, datum) in fields {
        let column = if *name == PRIMARY_KEY {
            Expr::Column {
                table: descriptor.table,
                name: PRIMARY_KEY,
                ty: SemanticType::Integer,
            }
        } else {
            let field = descriptor
                .field(name)
                .ok_or_else(|| StoreError::InvalidArgument {
                    table: descriptor.table,
                    field: (*name).to_string(),
                })?;
            Expr::Column {
                table: descriptor.table,
                name: field.name,
                ty: field.ty,
            }
        };
        let comparison = column.eq(datum.clone());
        combined = Some(match combined {
            Some(acc) => acc.and(comparison),
            None => comparison,
        });
    }
    Ok(combined)
}

fn read_lock<M>(handle: &Shared<M>) -> std::sync::RwLockReadGuard<'_, M> {
    handle.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<M>(handle: &Shared<M>) -> std::sync::RwLockWriteGuard<'_, M> {
    handle.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_builds_conjunction() {
        use crate::schema::{field, FieldDef};
        const FIELDS: &[FieldDef] = &[
            field("bar", SemanticType::Text),
            field("baz", SemanticType::Integer),
        ];
        let descriptor = ClassDescriptor {
            table: "foo",
            fields: FIELDS,
        };

        let filter = exact_match(
            &descriptor,
            &[("bar", Datum::Text("x".into())), ("baz", Datum::Null)],
        )
        .unwrap()
        .expect("non-empty filter");
        let compiled = expr::compile(&filter).unwrap();
        assert_eq!(compiled.sql, "(bar = ? AND baz IS NULL)");
        assert_eq!(compiled.params, vec![Value::Text("x".into())]);

        assert!(exact_match(&descriptor, &[]).unwrap().is_none());
        assert!(matches!(
            exact_match(&descriptor, &[("nope", Datum::Int(1))]),
            Err(StoreError::InvalidArgument { .. })
        ));
    }
}
