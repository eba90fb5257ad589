//! Query expression AST and SQL compiler
//!
//! Expressions are built from column handles (see [`crate::model::Cols`])
//! through named builder methods: `.lt/.le/.eq/.ne/.gt/.ge` for
//! comparisons, `.and/.or` for boolean combination, `.then` for
//! multi-column sequences, `.asc/.desc` for ordering, `.alias` for
//! renaming, and scalar/aggregate helpers. Compilation turns a tree into a
//! SQL fragment plus its bound parameters in left-to-right order.
//!
//! Comparing a column against a null value compiles to `IS NULL` /
//! `IS NOT NULL`, never `= NULL`. Boolean combination always parenthesizes
//! both sides so arbitrarily deep composition stays associative-safe.

use crate::codec;
use crate::error::{Result, StoreError};
use crate::value::{Datum, SemanticType, Value};

/// One node of the query expression tree
#[derive(Debug, Clone)]
pub enum Expr {
    /// Verbatim SQL fragment, no parameters (`*`, `1` and the like)
    Literal(String),
    /// Reference to a declared column of a registered class
    Column {
        table: &'static str,
        name: &'static str,
        ty: SemanticType,
    },
    /// A bare value; compiles to a `?` placeholder carrying the value
    Value(Datum),
    /// Unary or binary operation, optionally parenthesized
    Op {
        a: Box<Expr>,
        op: Option<&'static str>,
        b: Option<Box<Expr>>,
        parens: bool,
    },
    /// Function call, arguments compiled left to right
    Func { name: &'static str, args: Vec<Expr> },
    /// Renames a projected expression; the underlying semantic type is
    /// preserved so decoding still works after renaming
    Alias { inner: Box<Expr>, name: String },
    /// Comma-joined expression list; output positions follow item order
    Seq(Vec<Expr>),
    /// A column lookup that named no declared field. Surfaces as
    /// `InvalidArgument` when the expression is compiled.
    Invalid { table: &'static str, field: String },
}

/// Conversion into an expression operand: expressions pass through,
/// plain values become parameter placeholders.
pub trait IntoExpr {
    fn into_expr(self) -> Expr;
}

impl IntoExpr for Expr {
    fn into_expr(self) -> Expr {
        self
    }
}

impl IntoExpr for Datum {
    fn into_expr(self) -> Expr {
        Expr::Value(self)
    }
}

macro_rules! into_expr_via_datum {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoExpr for $ty {
                fn into_expr(self) -> Expr {
                    Expr::Value(self.into())
                }
            }
        )*
    };
}

into_expr_via_datum! {
    i64, i32, f64, bool, String, &str, Vec<u8>,
    serde_json::Value,
    chrono::NaiveDate, chrono::NaiveTime, chrono::NaiveDateTime,
}

impl<T> IntoExpr for Option<T>
where
    T: Into<Datum>,
{
    fn into_expr(self) -> Expr {
        Expr::Value(self.map_or(Datum::Null, Into::into))
    }
}

impl Expr {
    /// A verbatim SQL fragment with no parameters
    pub fn literal(sql: impl Into<String>) -> Expr {
        Expr::Literal(sql.into())
    }

    /// The `*` projection
    pub fn star() -> Expr {
        Expr::Literal("*".into())
    }

    fn binary(self, op: &'static str, other: impl IntoExpr) -> Expr {
        Expr::Op {
            a: Box::new(self),
            op: Some(op),
            b: Some(Box::new(other.into_expr())),
            parens: false,
        }
    }

    fn unary(self, op: &'static str) -> Expr {
        Expr::Op {
            a: Box::new(self),
            op: Some(op),
            b: None,
            parens: false,
        }
    }

    fn func1(self, name: &'static str) -> Expr {
        Expr::Func {
            name,
            args: vec![self],
        }
    }

    pub fn lt(self, other: impl IntoExpr) -> Expr {
        self.binary("<", other)
    }

    pub fn le(self, other: impl IntoExpr) -> Expr {
        self.binary("<=", other)
    }

    /// Equality; a null operand compiles to `IS NULL`
    pub fn eq(self, other: impl IntoExpr) -> Expr {
        match other.into_expr() {
            Expr::Value(Datum::Null) => self.unary("IS NULL"),
            rhs => self.binary("=", rhs),
        }
    }

    /// Inequality; a null operand compiles to `IS NOT NULL`
    pub fn ne(self, other: impl IntoExpr) -> Expr {
        match other.into_expr() {
            Expr::Value(Datum::Null) => self.unary("IS NOT NULL"),
            rhs => self.binary("!=", rhs),
        }
    }

    pub fn gt(self, other: impl IntoExpr) -> Expr {
        self.binary(">", other)
    }

    pub fn ge(self, other: impl IntoExpr) -> Expr {
        self.binary(">=", other)
    }

    pub fn like(self, pattern: impl IntoExpr) -> Expr {
        self.binary("LIKE", pattern)
    }

    /// Boolean AND; both sides stay parenthesized
    pub fn and(self, other: impl IntoExpr) -> Expr {
        Expr::Op {
            a: Box::new(self),
            op: Some("AND"),
            b: Some(Box::new(other.into_expr())),
            parens: true,
        }
    }

    /// Boolean OR; both sides stay parenthesized
    pub fn or(self, other: impl IntoExpr) -> Expr {
        Expr::Op {
            a: Box::new(self),
            op: Some("OR"),
            b: Some(Box::new(other.into_expr())),
            parens: true,
        }
    }

    /// Appends another expression to a comma-separated sequence.
    /// Sequence order is output order.
    pub fn then(self, other: impl IntoExpr) -> Expr {
        match self {
            Expr::Seq(mut items) => {
                items.push(other.into_expr());
                Expr::Seq(items)
            }
            first => Expr::Seq(vec![first, other.into_expr()]),
        }
    }

    pub fn asc(self) -> Expr {
        self.unary("ASC")
    }

    pub fn desc(self) -> Expr {
        self.unary("DESC")
    }

    /// Renames this expression in the projection, keeping the underlying
    /// semantic type for decoding
    pub fn alias(self, name: impl Into<String>) -> Expr {
        Expr::Alias {
            inner: Box::new(self),
            name: name.into(),
        }
    }

    pub fn abs(self) -> Expr {
        self.func1("abs")
    }

    pub fn length(self) -> Expr {
        self.func1("length")
    }

    pub fn lower(self) -> Expr {
        self.func1("lower")
    }

    pub fn upper(self) -> Expr {
        self.func1("upper")
    }

    pub fn ltrim(self) -> Expr {
        self.func1("ltrim")
    }

    pub fn rtrim(self) -> Expr {
        self.func1("rtrim")
    }

    pub fn trim(self) -> Expr {
        self.func1("trim")
    }

    pub fn count(self) -> Expr {
        self.func1("count")
    }

    pub fn avg(self) -> Expr {
        self.func1("avg")
    }

    pub fn min(self) -> Expr {
        self.func1("min")
    }

    pub fn max(self) -> Expr {
        self.func1("max")
    }

    pub fn sum(self) -> Expr {
        self.func1("sum")
    }

    pub fn distinct(self) -> Expr {
        self.func1("distinct")
    }
}

/// Free-standing function-call constructors, for variadic and zero-argument
/// SQL functions
pub mod func {
    use super::{Expr, IntoExpr};

    pub fn random() -> Expr {
        Expr::Func {
            name: "random",
            args: Vec::new(),
        }
    }

    fn variadic(name: &'static str, args: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Func {
            name,
            args: args.into_iter().collect(),
        }
    }

    pub fn max(args: impl IntoIterator<Item = Expr>) -> Expr {
        variadic("max", args)
    }

    pub fn min(args: impl IntoIterator<Item = Expr>) -> Expr {
        variadic("min", args)
    }

    pub fn count(arg: impl IntoExpr) -> Expr {
        arg.into_expr().count()
    }

    pub fn sum(arg: impl IntoExpr) -> Expr {
        arg.into_expr().sum()
    }

    pub fn avg(arg: impl IntoExpr) -> Expr {
        arg.into_expr().avg()
    }

    pub fn distinct(arg: impl IntoExpr) -> Expr {
        arg.into_expr().distinct()
    }
}

/// A compiled expression: SQL fragment plus parameters in placeholder order
#[derive(Debug, Clone)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compiles an expression tree into `(sql, ordered_params)`.
///
/// Bare values are serialized through the codec registry keyed by the
/// semantic type they naturally carry, so e.g. a datetime operand is bound
/// as its textual storage form.
pub fn compile(expr: &Expr) -> Result<Compiled> {
    let mut sql = String::new();
    let mut params = Vec::new();
    emit(expr, &mut sql, &mut params, None)?;
    Ok(Compiled { sql, params })
}

/// Serializes a bare operand value. A hint from the column it is compared
/// against takes precedence so domain-typed columns bind their registered
/// storage form; on a kind mismatch the value's natural type applies.
fn bind(datum: &Datum, hint: Option<SemanticType>) -> Result<Value> {
    if let Some(ty) = hint {
        if let Ok(value) = codec::serialize(datum, ty) {
            return Ok(value);
        }
    }
    match datum.semantic_type() {
        Some(ty) => codec::serialize(datum, ty),
        None => Ok(Value::Null),
    }
}

fn emit(
    expr: &Expr,
    sql: &mut String,
    params: &mut Vec<Value>,
    hint: Option<SemanticType>,
) -> Result<()> {
    match expr {
        Expr::Literal(text) => sql.push_str(text),
        Expr::Column { name, .. } => sql.push_str(name),
        Expr::Value(datum) => {
            sql.push('?');
            params.push(bind(datum, hint)?);
        }
        Expr::Op { a, op, b, parens } => {
            let operand_hint = column_type(a).or_else(|| b.as_deref().and_then(column_type));
            if *parens {
                sql.push('(');
            }
            emit(a, sql, params, operand_hint)?;
            if let Some(op) = op {
                sql.push(' ');
                sql.push_str(op);
            }
            if let Some(b) = b {
                sql.push(' ');
                emit(b, sql, params, operand_hint)?;
            }
            if *parens {
                sql.push(')');
            }
        }
        Expr::Func { name, args } => {
            sql.push_str(name);
            sql.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                emit(arg, sql, params, None)?;
            }
            sql.push(')');
        }
        Expr::Alias { inner, name } => {
            emit(inner, sql, params, None)?;
            sql.push_str(" AS ");
            sql.push_str(name);
        }
        Expr::Seq(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                emit(item, sql, params, None)?;
            }
        }
        Expr::Invalid { table, field } => {
            return Err(StoreError::InvalidArgument {
                table,
                field: field.clone(),
            });
        }
    }
    Ok(())
}

/// Positional projection metadata for a select expression: output name (if
/// statically known) and the semantic type of the underlying column.
///
/// Only column references and aliases of column references carry a type;
/// computed expressions such as `count(*)` decode as raw storage values.
pub fn output_columns(expr: &Expr) -> Vec<(Option<String>, Option<SemanticType>)> {
    let mut out = Vec::new();
    collect_outputs(expr, &mut out);
    out
}

fn collect_outputs(expr: &Expr, out: &mut Vec<(Option<String>, Option<SemanticType>)>) {
    match expr {
        Expr::Seq(items) => {
            for item in items {
                collect_outputs(item, out);
            }
        }
        Expr::Column { name, ty, .. } => out.push((Some((*name).to_string()), Some(*ty))),
        Expr::Alias { inner, name } => out.push((Some(name.clone()), column_type(inner))),
        other => out.push((None, column_type(other))),
    }
}

fn column_type(expr: &Expr) -> Option<SemanticType> {
    match expr {
        Expr::Column { ty, .. } => Some(*ty),
        Expr::Alias { inner, .. } => column_type(inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &'static str, ty: SemanticType) -> Expr {
        Expr::Column {
            table: "t",
            name,
            ty,
        }
    }

    #[test]
    fn test_comparison_compiles_to_placeholder() {
        let compiled = compile(&col("age", SemanticType::Integer).lt(21)).unwrap();
        assert_eq!(compiled.sql, "age < ?");
        assert_eq!(compiled.params, vec![Value::Integer(21)]);
    }

    #[test]
    fn test_null_comparison_uses_is_null() {
        let compiled = compile(&col("name", SemanticType::Text).eq(Datum::Null)).unwrap();
        assert_eq!(compiled.sql, "name IS NULL");
        assert!(compiled.params.is_empty());

        let compiled = compile(&col("name", SemanticType::Text).ne(Option::<i64>::None)).unwrap();
        assert_eq!(compiled.sql, "name IS NOT NULL");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn test_boolean_combination_parenthesizes() {
        let expr = col("a", SemanticType::Integer)
            .lt(10)
            .and(col("b", SemanticType::Text).like("%x%"))
            .or(col("c", SemanticType::Integer).eq(0));
        let compiled = compile(&expr).unwrap();
        assert_eq!(compiled.sql, "((a < ? AND b LIKE ?) OR c = ?)");
        assert_eq!(
            compiled.params,
            vec![
                Value::Integer(10),
                Value::Text("%x%".into()),
                Value::Integer(0)
            ]
        );
    }

    #[test]
    fn test_function_flattens_params_left_to_right() {
        let expr = func::max(vec![
            1i64.into_expr(),
            col("name", SemanticType::Text).lower(),
            3i64.into_expr(),
            func::random(),
        ]);
        let compiled = compile(&expr).unwrap();
        assert_eq!(compiled.sql, "max(?, lower(name), ?, random())");
        assert_eq!(compiled.params, vec![Value::Integer(1), Value::Integer(3)]);
    }

    #[test]
    fn test_sequence_preserves_order() {
        let expr = col("a", SemanticType::Integer)
            .then(col("b", SemanticType::Text))
            .then(col("c", SemanticType::Real).desc());
        let compiled = compile(&expr).unwrap();
        assert_eq!(compiled.sql, "a, b, c DESC");
    }

    #[test]
    fn test_alias_emits_as_and_keeps_type() {
        let expr = col("bar", SemanticType::Json).alias("renamed");
        let compiled = compile(&expr).unwrap();
        assert_eq!(compiled.sql, "bar AS renamed");

        let outputs = output_columns(&expr);
        assert_eq!(
            outputs,
            vec![(Some("renamed".into()), Some(SemanticType::Json))]
        );
    }

    #[test]
    fn test_computed_expression_has_no_type() {
        let expr = Expr::star().count().alias("count");
        let outputs = output_columns(&expr);
        assert_eq!(outputs, vec![(Some("count".into()), None)]);
    }

    #[test]
    fn test_datetime_param_serializes_to_text() {
        let dt = chrono::NaiveDate::from_ymd_opt(2020, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let compiled = compile(&col("dt", SemanticType::DateTime).eq(dt)).unwrap();
        assert_eq!(compiled.params, vec![Value::Text("2020-01-02T03:04:05".into())]);
    }

    #[test]
    fn test_invalid_column_fails_at_compile() {
        let expr = Expr::Invalid {
            table: "t",
            field: "nope".into(),
        };
        assert!(matches!(
            compile(&expr.eq(1)),
            Err(StoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_boolean_param_stored_as_integer() {
        let compiled = compile(&col("flag", SemanticType::Boolean).eq(true)).unwrap();
        assert_eq!(compiled.params, vec![Value::Integer(1)]);
    }
}
