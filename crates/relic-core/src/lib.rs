//! Relic — a small object-relational store over embedded SQLite.
//!
//! A record type implements [`Model`], declaring its table name and an
//! ordered list of typed fields; [`Store::register`] synthesizes the table
//! (or additively migrates it when `upgrade` is requested) and every later
//! save, load, query and delete goes through the same store. Queries are
//! built from a typed expression AST ([`Expr`]) and compiled to
//! parameterized SQL; values cross the storage boundary through a
//! process-wide converter registry that maps semantic types (dates, JSON,
//! booleans, user-defined types) onto SQLite's scalar storage classes.
//!
//! Loaded instances are shared: while any handle to a row's instance is
//! alive, loading the same row again returns the same [`Shared`] instance
//! rather than a second copy. Writes run inside an explicit transaction
//! that commits on [`Store::commit`] or [`Store::close`]; a store dropped
//! without an explicit close still commits and closes best-effort.

pub mod cache;
pub mod codec;
pub mod error;
pub mod expr;
pub mod model;
pub mod row;
pub mod schema;
pub mod store;
pub mod value;

pub use cache::Shared;
pub use codec::{register_converter, Converter};
pub use error::{Result, StoreError};
pub use expr::{Expr, IntoExpr};
pub use model::{Cols, Model};
pub use row::Row;
pub use schema::{field, FieldDef, PRIMARY_KEY};
pub use store::{QueryBuilder, Store, StoreOptions};
pub use value::{Datum, FieldValue, SemanticType, Value};
