//! Generic typed record store over SQLite.
//!
//! Each record type maps to one table of shape
//! `(id INTEGER PRIMARY KEY AUTOINCREMENT, data TEXT NOT NULL)` holding the
//! serde-JSON row. Predicates, grouping and aggregation all compile to
//! `json_extract` SQL, so one implementation serves every record shape.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::cond::{compile, field_expr, Cond};

/// A value type persistable through a [`Pager`].
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCache<T> {
    pub total: i64,
    pub page: i64,
    pub size: i64,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Default)]
pub struct Sorter {
    pub sort_field: Option<String>,
    pub expr: Option<String>,
    pub asc: bool,
}

impl Sorter {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            sort_field: Some(field.into()),
            expr: None,
            asc: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            sort_field: Some(field.into()),
            expr: None,
            asc: false,
        }
    }

    /// Order by a derived SQL expression over aggregate aliases,
    /// e.g. `sum / NULLIF(cnt,0)`.
    pub fn by_expr(expr: impl Into<String>, asc: bool) -> Self {
        Self {
            sort_field: None,
            expr: Some(expr.into()),
            asc,
        }
    }

    fn direction(&self) -> &'static str {
        if self.asc {
            "ASC"
        } else {
            "DESC"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub fn seconds(self) -> i64 {
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3600,
            Granularity::Day => 86400,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minute" | "min" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agg {
    Sum,
    /// Same aggregation as `Sum`; kept as a distinct variant because rows
    /// store pre-counted integers and callers name their intent.
    Total,
    Avg,
    Max,
}

impl Agg {
    fn sql(self) -> &'static str {
        match self {
            Agg::Sum | Agg::Total => "SUM",
            Agg::Avg => "AVG",
            Agg::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggField {
    pub field: String,
    pub op: Agg,
    pub alias: String,
}

impl AggField {
    pub fn new(field: impl Into<String>, op: Agg, alias: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op,
            alias: alias.into(),
        }
    }
}

/// One time-aligned aggregation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBucket {
    pub bucket: i64,
    pub value: HashMap<String, f64>,
}

/// One multi-field group row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRow {
    pub group: HashMap<String, String>,
    pub value: HashMap<String, f64>,
}

fn check_ident(s: &str) -> Result<()> {
    if s.is_empty()
        || !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("invalid identifier: {s:?}");
    }
    Ok(())
}

/// Shared SQLite handle; hands out typed [`Pager`] views and the [`KvStore`].
///
/// [`KvStore`]: super::kv::KvStore
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    pub fn pager<T: Record>(&self) -> Pager<T> {
        let table = T::TABLE;
        {
            let conn = self.conn.lock();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     data TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_{table}_at
                     ON {table} (json_extract(data, '$.at'));"
            ))
            .expect("create record table");
        }
        Pager {
            conn: self.conn.clone(),
            table,
            _marker: PhantomData,
        }
    }
}

/// Typed view over one record table.
pub struct Pager<T: Record> {
    conn: Arc<Mutex<Connection>>,
    table: &'static str,
    _marker: PhantomData<T>,
}

impl<T: Record> Clone for Pager<T> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            table: self.table,
            _marker: PhantomData,
        }
    }
}

impl<T: Record> Pager<T> {
    /// Insert a record. No dedup.
    pub fn put(&self, record: &T) -> Result<()> {
        let data = serde_json::to_string(record)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!("INSERT INTO {} (data) VALUES (?1)", self.table),
            [&data],
        )?;
        Ok(())
    }

    /// First matching record, if any.
    pub fn get(&self, cond: &Cond) -> Result<Option<T>> {
        let compiled = compile(Some(cond))?;
        let sql = format!(
            "SELECT data FROM {}{} LIMIT 1",
            self.table,
            compiled.where_clause()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(compiled.params.iter()))?;
        match rows.next()? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    /// Paged query. `page <= 0` → 1, `size <= 0` → 10.
    pub fn find(
        &self,
        page: i64,
        size: i64,
        cond: Option<&Cond>,
        sorter: Option<&Sorter>,
    ) -> Result<PageCache<T>> {
        let page = if page <= 0 { 1 } else { page };
        let size = if size <= 0 { 10 } else { size };
        let compiled = compile(cond)?;
        let where_clause = compiled.where_clause();

        let total: i64 = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {}{}", self.table, where_clause),
                params_from_iter(compiled.params.iter()),
                |row| row.get(0),
            )?
        };

        let order = match sorter {
            Some(s) => {
                let key = match (&s.sort_field, &s.expr) {
                    (Some(field), _) => field_expr(field),
                    (None, Some(expr)) => expr.clone(),
                    (None, None) => "id".to_string(),
                };
                format!(" ORDER BY {key} {}", s.direction())
            }
            None => " ORDER BY id ASC".to_string(),
        };

        let sql = format!(
            "SELECT data FROM {}{}{} LIMIT {} OFFSET {}",
            self.table,
            where_clause,
            order,
            size,
            (page - 1) * size
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(compiled.params.iter()), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|data| serde_json::from_str(&data).map_err(Into::into))
            .collect::<Result<Vec<T>>>()?;

        Ok(PageCache {
            total,
            page,
            size,
            items,
        })
    }

    /// Overwrite every matching row with the given record.
    pub fn update(&self, cond: &Cond, record: &T) -> Result<usize> {
        let compiled = compile(Some(cond))?;
        let data = serde_json::to_string(record)?;
        let sql = format!(
            "UPDATE {} SET data = ?{}",
            self.table,
            if compiled.where_sql.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", compiled.where_sql)
            }
        );
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(data)];
        params.extend(compiled.params);
        let conn = self.conn.lock();
        let n = conn.execute(&sql, params_from_iter(params.iter()))?;
        Ok(n)
    }

    pub fn delete(&self, cond: &Cond) -> Result<usize> {
        let compiled = compile(Some(cond))?;
        let sql = format!("DELETE FROM {}{}", self.table, compiled.where_clause());
        let conn = self.conn.lock();
        let n = conn.execute(&sql, params_from_iter(compiled.params.iter()))?;
        Ok(n)
    }

    pub fn count(&self, cond: Option<&Cond>) -> Result<i64> {
        let compiled = compile(cond)?;
        let conn = self.conn.lock();
        let n = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {}{}",
                self.table,
                compiled.where_clause()
            ),
            params_from_iter(compiled.params.iter()),
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Time-bucketed aggregation over `[from, to]` on the record's `at`
    /// field. Buckets truncate to the granularity start.
    pub fn group_by_time(
        &self,
        cond: Option<&Cond>,
        from: i64,
        to: i64,
        granularity: Granularity,
        agg: Agg,
        fields: &[&str],
    ) -> Result<Vec<TimeBucket>> {
        if fields.is_empty() {
            bail!("group_by_time requires at least one field");
        }
        let gran = granularity.seconds();
        let compiled = compile(cond)?;

        let mut selects = vec![format!(
            "(CAST({} AS INTEGER) / {gran}) * {gran} AS bucket",
            field_expr("at")
        )];
        for (i, field) in fields.iter().enumerate() {
            selects.push(format!(
                "COALESCE({}({}), 0) AS v{i}",
                agg.sql(),
                field_expr(field)
            ));
        }

        let mut wheres = vec![
            format!("CAST({} AS INTEGER) >= ?", field_expr("at")),
            format!("CAST({} AS INTEGER) <= ?", field_expr("at")),
        ];
        if !compiled.where_sql.is_empty() {
            wheres.push(compiled.where_sql.clone());
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} GROUP BY bucket ORDER BY bucket ASC",
            selects.join(", "),
            self.table,
            wheres.join(" AND ")
        );

        let mut params: Vec<SqlValue> =
            vec![SqlValue::Integer(from), SqlValue::Integer(to)];
        params.extend(compiled.params);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            let bucket: i64 = row.get(0)?;
            let mut value = HashMap::with_capacity(fields.len());
            for (i, field) in fields.iter().enumerate() {
                let v: f64 = row.get(i + 1)?;
                value.insert(field.to_string(), v);
            }
            Ok(TimeBucket { bucket, value })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Multi-field group-by with aggregate aliases, `$having` support and
    /// paging. Sorters may reference aliases or expressions over them.
    pub fn group_by_fields(
        &self,
        cond: Option<&Cond>,
        group_fields: &[&str],
        agg_fields: &[AggField],
        page: i64,
        size: i64,
        sorter: Option<&Sorter>,
    ) -> Result<PageCache<GroupRow>> {
        if group_fields.is_empty() || agg_fields.is_empty() {
            bail!("group_by_fields requires group and aggregate fields");
        }
        let page = if page <= 0 { 1 } else { page };
        let size = if size <= 0 { 10 } else { size };
        let compiled = compile(cond)?;

        let mut selects = Vec::new();
        let mut group_cols = Vec::new();
        for field in group_fields {
            let alias = format!("g_{}", field.replace('.', "_"));
            check_ident(&alias)?;
            selects.push(format!(
                "CAST({} AS TEXT) AS {alias}",
                field_expr(field)
            ));
            group_cols.push(alias);
        }
        for agg in agg_fields {
            check_ident(&agg.alias)?;
            selects.push(format!(
                "COALESCE({}({}), 0) AS {}",
                agg.op.sql(),
                field_expr(&agg.field),
                agg.alias
            ));
        }

        let having = match &compiled.having {
            Some(expr) => format!(" HAVING {expr}"),
            None => String::new(),
        };
        let body = format!(
            "SELECT {} FROM {}{} GROUP BY {}{having}",
            selects.join(", "),
            self.table,
            compiled.where_clause(),
            group_cols.join(", ")
        );

        let total: i64 = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT COUNT(*) FROM ({body})"),
                params_from_iter(compiled.params.iter()),
                |row| row.get(0),
            )?
        };

        let order = match sorter {
            Some(s) => {
                let key = match (&s.sort_field, &s.expr) {
                    (Some(field), _) => {
                        check_ident(field)?;
                        field.clone()
                    }
                    (None, Some(expr)) => expr.clone(),
                    (None, None) => group_cols[0].clone(),
                };
                format!(" ORDER BY {key} {}", s.direction())
            }
            None => String::new(),
        };

        let sql = format!(
            "{body}{order} LIMIT {} OFFSET {}",
            size,
            (page - 1) * size
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(compiled.params.iter()), |row| {
            let mut group = HashMap::with_capacity(group_fields.len());
            for (i, field) in group_fields.iter().enumerate() {
                let v: Option<String> = row.get(i)?;
                group.insert(field.to_string(), v.unwrap_or_default());
            }
            let mut value = HashMap::with_capacity(agg_fields.len());
            for (i, agg) in agg_fields.iter().enumerate() {
                let v: f64 = row.get(group_fields.len() + i)?;
                value.insert(agg.alias.clone(), v);
            }
            Ok(GroupRow { group, value })
        })?;

        Ok(PageCache {
            total,
            page,
            size,
            items: rows.collect::<Result<Vec<_>, _>>()?,
        })
    }
}
