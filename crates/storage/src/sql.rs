//! Composable SELECT builder.
//!
//! Queries are assembled from [`Fragment`]s whose `?` placeholders are bound
//! positionally. [`SelectQuery::to_sql`] renders the whole tree (CTEs,
//! sub-selects, joins, predicates) into Postgres `$n` syntax with a single
//! ordered argument list, numbering placeholders left to right.
//!
//! A `?` inside a quoted literal (`'...'`) or identifier (`"..."`) is never a
//! placeholder, and a `?` with no argument left to consume is written
//! verbatim. Postgres' jsonb `?`, `?|` and `?&` operators cannot be told
//! apart from placeholders: use `jsonb_exists` and friends instead.

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, FromRow, PgExecutor};

use crate::error::{StorageError, StorageResult, map_sqlx_error};

/// A value bound to a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Bound as text; the fragment is expected to cast it (`?::numeric`).
    Numeric(BigInt),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
    TextArray(Vec<String>),
}

impl SqlValue {
    fn add_to(&self, args: &mut PgArguments) -> StorageResult<()> {
        let res = match self {
            Self::Null => args.add(None::<String>),
            Self::Bool(v) => args.add(*v),
            Self::Int(v) => args.add(*v),
            Self::Numeric(v) => args.add(v.to_string()),
            Self::Text(v) => args.add(v.clone()),
            Self::Timestamp(v) => args.add(*v),
            Self::Json(v) => args.add(v.clone()),
            Self::TextArray(v) => args.add(v.clone()),
        };
        res.map_err(|e| StorageError::Database {
            operation: "bind".to_string(),
            message: e.to_string(),
        })
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(v) => Self::Int(v),
            Err(_) => Self::Numeric(BigInt::from(v)),
        }
    }
}

impl From<BigInt> for SqlValue {
    fn from(v: BigInt) -> Self {
        Self::Numeric(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(v: Vec<String>) -> Self {
        Self::TextArray(v)
    }
}

/// A piece of SQL with `?` placeholders and the values they bind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    sql: String,
    args: Vec<SqlValue>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    /// `(a) and (b) and ...`; a single part is returned as is.
    pub fn and(parts: Vec<Fragment>) -> Fragment {
        Self::join_parts(parts, " and ")
    }

    pub fn or(parts: Vec<Fragment>) -> Fragment {
        Self::join_parts(parts, " or ")
    }

    pub fn not(part: Fragment) -> Fragment {
        Fragment {
            sql: format!("not ({})", part.sql),
            args: part.args,
        }
    }

    fn join_parts(parts: Vec<Fragment>, separator: &str) -> Fragment {
        if parts.len() == 1 {
            if let Some(only) = parts.into_iter().next() {
                return only;
            }
            return Fragment::default();
        }
        let mut sql = String::new();
        let mut args = Vec::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                sql.push_str(separator);
            }
            sql.push('(');
            sql.push_str(&part.sql);
            sql.push(')');
            args.extend(part.args);
        }
        Fragment { sql, args }
    }
}

impl From<&str> for Fragment {
    fn from(sql: &str) -> Self {
        Fragment::new(sql)
    }
}

impl From<String> for Fragment {
    fn from(sql: String) -> Self {
        Fragment::new(sql)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Table(String),
    Subquery(Box<SelectQuery>, String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    ctes: Vec<(String, SelectQuery)>,
    columns: Vec<Fragment>,
    from: Option<Source>,
    joins: Vec<Fragment>,
    wheres: Vec<Fragment>,
    group_by: Vec<String>,
    order_by: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectQuery {
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            from: Some(Source::Table(table.into())),
            ..Self::default()
        }
    }

    /// `select ... from (<query>) <alias>`
    pub fn from_subquery(query: SelectQuery, alias: impl Into<String>) -> Self {
        Self {
            from: Some(Source::Subquery(Box::new(query), alias.into())),
            ..Self::default()
        }
    }

    pub fn with(mut self, name: impl Into<String>, query: SelectQuery) -> Self {
        self.ctes.push((name.into(), query));
        self
    }

    pub fn column(mut self, column: impl Into<Fragment>) -> Self {
        self.columns.push(column.into());
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Fragment>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Add a column next to the current selection (`*` when nothing was
    /// selected yet).
    pub fn also_column(mut self, column: impl Into<Fragment>) -> Self {
        if self.columns.is_empty() {
            self.columns.push(Fragment::new("*"));
        }
        self.columns.push(column.into());
        self
    }

    pub fn join(mut self, join: impl Into<Fragment>) -> Self {
        self.joins.push(join.into());
        self
    }

    /// Add a predicate; predicates are AND-ed together.
    pub fn and_where(mut self, predicate: impl Into<Fragment>) -> Self {
        self.wheres.push(predicate.into());
        self
    }

    pub fn group_by(mut self, expr: impl Into<String>) -> Self {
        self.group_by.push(expr.into());
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.order_by.push(expr.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// `select count(*) from (<self>) dataset`
    pub fn into_count(self) -> SelectQuery {
        SelectQuery::from_subquery(self, "dataset").column("count(*)")
    }

    /// Render to Postgres SQL and the arguments in placeholder order.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut writer = SqlWriter::default();
        self.write(&mut writer);
        (writer.sql, writer.args)
    }

    fn write(&self, w: &mut SqlWriter) {
        if !self.ctes.is_empty() {
            w.push("with ");
            for (i, (name, query)) in self.ctes.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push(&quote_ident(name));
                w.push(" as (");
                query.write(w);
                w.push(")");
            }
            w.push(" ");
        }

        w.push("select ");
        if self.columns.is_empty() {
            w.push("*");
        }
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push_fragment(column);
        }

        match &self.from {
            Some(Source::Table(table)) => {
                w.push(" from ");
                w.push(table);
            }
            Some(Source::Subquery(query, alias)) => {
                w.push(" from (");
                query.write(w);
                w.push(") ");
                w.push(alias);
            }
            None => {}
        }

        for join in &self.joins {
            w.push(" ");
            w.push_fragment(join);
        }

        if !self.wheres.is_empty() {
            w.push(" where ");
            let predicate = Fragment::and(self.wheres.clone());
            w.push_fragment(&predicate);
        }

        if !self.group_by.is_empty() {
            w.push(" group by ");
            w.push(&self.group_by.join(", "));
        }

        if !self.order_by.is_empty() {
            w.push(" order by ");
            w.push(&self.order_by.join(", "));
        }

        if let Some(limit) = self.limit {
            w.push(&format!(" limit {limit}"));
        }
        if let Some(offset) = self.offset {
            w.push(&format!(" offset {offset}"));
        }
    }
}

#[derive(Default)]
struct SqlWriter {
    sql: String,
    args: Vec<SqlValue>,
}

impl SqlWriter {
    fn push(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    fn push_fragment(&mut self, fragment: &Fragment) {
        let mut args = fragment.args.iter();
        let mut quote: Option<char> = None;
        for c in fragment.sql.chars() {
            match quote {
                // A doubled quote closes and reopens, which keeps escapes quoted.
                Some(open) if c == open => quote = None,
                Some(_) => {}
                None if c == '\'' || c == '"' => quote = Some(c),
                None => {}
            }
            if c == '?' && quote.is_none() {
                if let Some(arg) = args.next() {
                    self.args.push(arg.clone());
                    self.sql.push('$');
                    self.sql.push_str(&self.args.len().to_string());
                    continue;
                }
            }
            self.sql.push(c);
        }
    }
}

/// Double-quote an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn arguments(values: &[SqlValue]) -> StorageResult<PgArguments> {
    let mut args = PgArguments::default();
    for value in values {
        value.add_to(&mut args)?;
    }
    Ok(args)
}

/// Run a select and map every row through `FromRow`.
pub async fn fetch_all<'e, E, R>(
    executor: E,
    query: &SelectQuery,
    operation: &str,
) -> StorageResult<Vec<R>>
where
    E: PgExecutor<'e>,
    R: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let (sql, values) = query.to_sql();
    tracing::trace!(%sql, args = values.len(), operation, "executing select");
    sqlx::query_as_with::<sqlx::Postgres, R, _>(&sql, arguments(&values)?)
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error(operation, e))
}

pub async fn fetch_count<'e, E>(executor: E, query: SelectQuery, operation: &str) -> StorageResult<u64>
where
    E: PgExecutor<'e>,
{
    let (sql, values) = query.into_count().to_sql();
    let count: i64 = sqlx::query_scalar_with::<sqlx::Postgres, i64, _>(&sql, arguments(&values)?)
        .fetch_one(executor)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(u64::try_from(count).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_numbered_across_the_whole_tree() {
        let inner = SelectQuery::from_table("\"_default\".transactions")
            .and_where(Fragment::new("ledger = ?").bind("main"));
        let query = SelectQuery::from_subquery(inner, "dataset")
            .with(
                "expand0",
                SelectQuery::from_table("volumes").and_where(Fragment::new("asset = ?").bind("USD")),
            )
            .and_where(Fragment::new("id >= ?").bind(10i64))
            .order_by("id asc")
            .limit(11);

        let (sql, args) = query.to_sql();
        assert_eq!(
            sql,
            "with \"expand0\" as (select * from volumes where asset = $1) \
             select * from (select * from \"_default\".transactions where ledger = $2) dataset \
             where id >= $3 order by id asc limit 11"
        );
        assert_eq!(
            args,
            vec![SqlValue::from("USD"), SqlValue::from("main"), SqlValue::Int(10)]
        );
    }

    #[test]
    fn boolean_combinators_parenthesize_each_part() {
        let expr = Fragment::or(vec![
            Fragment::new("a = ?").bind(1i64),
            Fragment::not(Fragment::new("b < ?").bind(2i64)),
        ]);
        assert_eq!(expr.sql(), "(a = ?) or (not (b < ?))");
        assert_eq!(expr.args().len(), 2);

        let single = Fragment::and(vec![Fragment::new("x")]);
        assert_eq!(single.sql(), "x");
    }

    #[test]
    fn count_wraps_the_query() {
        let (sql, _) = SelectQuery::from_table("logs").limit(1).into_count().to_sql();
        assert_eq!(sql, "select count(*) from (select * from logs limit 1) dataset");
    }

    #[test]
    fn surplus_question_marks_are_literal() {
        let (sql, args) = SelectQuery::from_table("accounts")
            .and_where(Fragment::new("address = ? or address = ?").bind("k"))
            .to_sql();
        assert_eq!(sql, "select * from accounts where address = $1 or address = ?");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn quoted_question_marks_are_not_placeholders() {
        let (sql, args) = SelectQuery::from_table("accounts")
            .and_where(
                Fragment::new("address <> 'what?' and \"odd?col\" = ? and note = 'it''s ?'")
                    .bind("bank"),
            )
            .and_where(Fragment::new("ledger = ?").bind("main"))
            .to_sql();
        assert_eq!(
            sql,
            "select * from accounts where (address <> 'what?' and \"odd?col\" = $1 and note = 'it''s ?') \
             and (ledger = $2)"
        );
        assert_eq!(args, vec![SqlValue::from("bank"), SqlValue::from("main")]);
    }

    #[test]
    fn large_unsigned_values_become_numeric() {
        assert_eq!(SqlValue::from(u64::MAX), SqlValue::Numeric(BigInt::from(u64::MAX)));
        assert_eq!(SqlValue::from(7u64), SqlValue::Int(7));
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
