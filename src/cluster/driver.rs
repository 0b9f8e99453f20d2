//! SQL driver shim over the replicated store.
//!
//! The engine has no server-side prepared statements, so parameters are
//! rendered client-side: each `?` placeholder is substituted with a
//! literal for one of the enumerated scalar types (quoted and escaped
//! for text, a hex literal for blobs).  Anything outside that list is
//! rejected rather than rendered as arbitrary text.
//!
//! Exec and query delegate to the store; when the store answers
//! `NotLeader`, the statement is re-issued through the current leader's
//! cluster-DB endpoint and the result is unwrapped as if it had run
//! locally.  Transactions call through to the store directly.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::cluster::store::{ExecResult, Rows};
use crate::cluster::ClusterRuntime;
use crate::errors::ClusterError;

/// A renderable statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

/// Single-quote a string literal, escaping embedded quotes.
pub fn quote_text(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Text(t) => quote_text(t),
        // Blobs are not text; a hex literal survives arbitrary bytes.
        Value::Blob(b) => format!("X'{}'", hex::encode(b)),
        Value::Timestamp(t) => quote_text(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}

/// Substitute each `?` placeholder with the rendered literal of the
/// matching parameter.  The placeholder and parameter counts must
/// agree.
pub fn render(sql: &str, params: &[Value]) -> Result<String, ClusterError> {
    let placeholders = sql.matches('?').count();
    if placeholders != params.len() {
        return Err(ClusterError::Protocol(format!(
            "statement has {placeholders} placeholders but {} parameters were given",
            params.len()
        )));
    }

    let mut rendered = String::with_capacity(sql.len());
    let mut params = params.iter();
    for (i, piece) in sql.split('?').enumerate() {
        if i > 0 {
            rendered.push_str(&render_value(params.next().expect("counted above")));
        }
        rendered.push_str(piece);
    }
    Ok(rendered)
}

/// The standard SQL-client surface of the replicated database.
pub struct ClusterDb {
    runtime: Arc<ClusterRuntime>,
}

impl ClusterDb {
    pub fn new(runtime: Arc<ClusterRuntime>) -> Self {
        Self { runtime }
    }

    /// Execute one parameterised statement, redirecting to the leader
    /// when the local node is a follower.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecResult, ClusterError> {
        let rendered = render(sql, params)?;
        debug!("running cluster stmt: {rendered}");
        self.runtime.cluster_db_execute(&rendered).await
    }

    /// Query one parameterised statement, redirecting to the leader
    /// when the local node is a follower.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Rows, ClusterError> {
        let rendered = render(sql, params)?;
        debug!("running cluster query: {rendered}");
        self.runtime.cluster_db_query(&rendered).await
    }

    /// Apply a statement batch as one transaction, straight through the
    /// store: a follower gets `NotLeader` back unforwarded.
    pub async fn transaction(
        &self,
        stmts: &[(&str, Vec<Value>)],
    ) -> Result<Vec<ExecResult>, ClusterError> {
        let rendered = stmts
            .iter()
            .map(|(sql, params)| render(sql, params))
            .collect::<Result<Vec<_>, _>>()?;
        self.runtime.store.execute(rendered, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_scalars() {
        let sql = render(
            "INSERT INTO t VALUES (?, ?, ?, ?)",
            &[
                Value::Integer(42),
                Value::Real(1.5),
                Value::Bool(true),
                Value::Text("hello".into()),
            ],
        )
        .unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES (42, 1.5, true, 'hello')");
    }

    #[test]
    fn test_render_escapes_quotes() {
        let sql = render("UPDATE t SET v = ?", &[Value::Text("o'brien".into())]).unwrap();
        assert_eq!(sql, "UPDATE t SET v = 'o''brien'");
    }

    #[test]
    fn test_render_blob_as_hex_literal() {
        // Deliberately not valid UTF-8.
        let sql = render(
            "INSERT INTO t VALUES (?)",
            &[Value::Blob(vec![0x00, 0xff, 0x27, 0x80])],
        )
        .unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES (X'00ff2780')");
    }

    #[test]
    fn test_render_timestamp_iso8601() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 23, 12, 0, 0).unwrap();
        let sql = render("INSERT INTO t VALUES (?)", &[Value::Timestamp(ts)]).unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES ('2026-02-23T12:00:00Z')");
    }

    #[test]
    fn test_render_count_mismatch() {
        assert!(render("SELECT ?", &[]).is_err());
        assert!(render("SELECT 1", &[Value::Integer(1)]).is_err());
    }

    /// Rendering followed by SQLite parsing preserves the value.
    #[test]
    fn test_render_round_trips_through_sqlite() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (i INTEGER, f REAL, b INTEGER, s TEXT, bl BLOB, ts TEXT)",
        )
        .unwrap();

        let blob = vec![0x00, 0xfe, 0x27, 0x80, 0x0a];
        let ts = Utc.with_ymd_and_hms(2026, 2, 23, 12, 0, 0).unwrap();
        let sql = render(
            "INSERT INTO t VALUES (?, ?, ?, ?, ?, ?)",
            &[
                Value::Integer(-7),
                Value::Real(2.25),
                Value::Bool(false),
                Value::Text("it's".into()),
                Value::Blob(blob.clone()),
                Value::Timestamp(ts),
            ],
        )
        .unwrap();
        conn.execute(&sql, []).unwrap();

        let (i, f, b, s, bl, t): (i64, f64, bool, String, Vec<u8>, String) = conn
            .query_row("SELECT i, f, b, s, bl, ts FROM t", [], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })
            .unwrap();

        assert_eq!(i, -7);
        assert_eq!(f, 2.25);
        assert!(!b);
        assert_eq!(s, "it's");
        assert_eq!(bl, blob);
        assert_eq!(t, "2026-02-23T12:00:00Z");
    }
}
