use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sync_types::TabularValue;

/// A single bound parameter for [`DbDriver::batch_exec`].
#[derive(Debug, Clone)]
pub enum SqlParam {
    Text(String),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Null,
}

pub type ParamRow = Vec<SqlParam>;

/// The one abstraction the pipeline crates depend on for database access:
/// a tabular select, a batched parameterized write, and a scalar query.
///
/// This is the only seam at which a concrete SQL engine enters the picture;
/// every pipeline crate above `sync-db` is written against this trait, never
/// against `sqlx` directly.
#[async_trait]
pub trait DbDriver: Send + Sync {
    /// Run `query` and decode every row into the invoice shape.
    async fn select(&self, query: &str) -> Result<TabularValue>;

    /// Execute `statement` once per row in `rows`, inside a single
    /// transaction. Callers are responsible for chunking (1000 rows per
    /// batch, in this engine).
    async fn batch_exec(&self, statement: &str, rows: &[ParamRow]) -> Result<u64>;

    /// Run a query expected to return exactly one row with one column, and
    /// return that value as JSON (`Number`, `String`, or `Null`).
    async fn scalar(&self, query: &str) -> Result<serde_json::Value>;
}
