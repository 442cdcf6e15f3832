//! An in-memory stand-in for [`sync_db::DbDriver`].
//!
//! This is *not* a SQL engine: it recognizes exactly the small, fixed set
//! of query shapes `sync_db::ops` issues (the only caller of `DbDriver` in
//! this codebase) and interprets them against an in-memory table store. New
//! query shapes added to `sync-db::ops` need a matching case here.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sync_db::{DbDriver, ParamRow, SqlParam};
use sync_types::{InvoiceKey, InvoiceRow, TabularValue};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    tables: HashMap<String, HashMap<InvoiceKey, InvoiceRow>>,
    /// `(schema, table, column) -> exists`, consulted by the `column_exists`
    /// query shape.
    columns: HashMap<(String, String, String), bool>,
}

pub struct FakeDriver {
    state: Mutex<State>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seed `qualified_table` with `rows`, replacing whatever was there.
    pub async fn seed(&self, qualified_table: &str, rows: Vec<InvoiceRow>) {
        let mut state = self.state.lock().await;
        let map = rows.into_iter().map(|r| (r.key(), r)).collect();
        state.tables.insert(qualified_table.to_string(), map);
    }

    /// Declare whether `schema.table` has `column`, for `column_exists`
    /// checks. Unconfigured columns read as absent.
    pub async fn set_column(&self, schema: &str, table: &str, column: &str, exists: bool) {
        let mut state = self.state.lock().await;
        state.columns.insert(
            (
                schema.to_ascii_lowercase(),
                table.to_string(),
                column.to_string(),
            ),
            exists,
        );
    }

    /// Snapshot the current contents of `qualified_table`, for assertions.
    pub async fn rows(&self, qualified_table: &str) -> Vec<InvoiceRow> {
        let state = self.state.lock().await;
        state
            .tables
            .get(qualified_table)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn table_name_from(query: &str) -> Result<String> {
    let after_from = query
        .split("from ")
        .nth(1)
        .with_context(|| format!("no FROM clause in query: {query}"))?;
    let token = after_from
        .split_whitespace()
        .next()
        .with_context(|| format!("empty FROM clause in query: {query}"))?;
    Ok(token.trim_end_matches(['(', ';']).to_string())
}

/// Pull the single-quoted literal following `marker` out of `query`, e.g.
/// `dossier_0 = '` -> `CAS`.
fn literal_after(query: &str, marker: &str) -> Option<String> {
    let idx = query.find(marker)? + marker.len();
    let rest = &query[idx..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

#[async_trait]
impl DbDriver for FakeDriver {
    async fn select(&self, query: &str) -> Result<TabularValue> {
        let lower = query.to_ascii_lowercase();
        let table = table_name_from(&lower)?;
        let state = self.state.lock().await;
        let mut rows: Vec<InvoiceRow> = state
            .tables
            .get(&table)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        drop(state);

        if lower.contains("mntreg_0 < mntglb_0") {
            rows.retain(|r| r.is_active());
        }
        if let Some(dossier) = literal_after(&lower, "dossier_0 = '") {
            rows.retain(|r| r.dossier_0.to_ascii_lowercase() == dossier);
        }
        if let Some(ts) = literal_after(&lower, "sync_date > '") {
            let watermark: DateTime<Utc> = ts.parse().with_context(|| format!("bad watermark literal: {ts}"))?;
            rows.retain(|r| r.sync_date.map(|d| d > watermark).unwrap_or(false));
        }
        // Raw-source-row shape: "... 'SCHEMA' as dossier_0 ..." stamps an
        // origin tag that doesn't exist in the stored rows at all.
        if let Some(origin) = source_row_dossier_stamp(query) {
            rows = rows
                .into_iter()
                .map(|r| InvoiceRow {
                    dossier_0: origin.clone(),
                    sync_date: None,
                    ..r
                })
                .collect();
        }

        Ok(TabularValue::new(rows))
    }

    async fn batch_exec(&self, statement: &str, rows: &[ParamRow]) -> Result<u64> {
        let lower = statement.to_ascii_lowercase();
        let table = table_name_from(&lower)?;
        let mut state = self.state.lock().await;
        let map = state.tables.entry(table).or_default();
        let mut affected = 0u64;

        if lower.starts_with("insert into") {
            for params in rows {
                let row = params_to_invoice_row(params)?;
                let key = row.key();
                if !map.contains_key(&key) {
                    map.insert(key, row);
                    affected += 1;
                }
            }
        } else if lower.starts_with("update") {
            for params in rows {
                let (mntreg, sync_date, num_0, dossier_0) = params_to_update(params)?;
                let key = InvoiceKey::new(num_0, dossier_0);
                if let Some(existing) = map.get_mut(&key) {
                    existing.mntreg_0 = mntreg;
                    existing.sync_date = Some(sync_date);
                    affected += 1;
                }
            }
        } else {
            anyhow::bail!("FakeDriver does not recognize statement: {statement}");
        }

        Ok(affected)
    }

    async fn scalar(&self, query: &str) -> Result<serde_json::Value> {
        let lower = query.to_ascii_lowercase();

        if lower.contains("information_schema.columns") {
            let schema = literal_after(&lower, "table_schema = '").unwrap_or_default();
            let table = literal_after(&lower, "table_name = '").unwrap_or_default();
            let column = literal_after(&lower, "column_name = '").unwrap_or_default();
            let state = self.state.lock().await;
            let exists = state
                .columns
                .get(&(schema, table, column))
                .copied()
                .unwrap_or(false);
            return Ok(serde_json::json!(if exists { 1 } else { 0 }));
        }

        let table = table_name_from(&lower)?;
        let state = self.state.lock().await;
        let rows: Vec<InvoiceRow> = state
            .tables
            .get(&table)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        drop(state);

        if lower.starts_with("select count(*)") {
            let mut rows = rows;
            if lower.contains("mntreg_0 < mntglb_0") {
                rows.retain(|r| r.is_active());
            }
            if let Some(dossier) = literal_after(&lower, "dossier_0 = '") {
                rows.retain(|r| r.dossier_0.to_ascii_lowercase() == dossier);
            }
            return Ok(serde_json::json!(rows.len() as i64));
        }

        if lower.starts_with("select max(sync_date)") {
            let max = rows.iter().filter_map(|r| r.sync_date).max();
            return Ok(match max {
                Some(ts) => serde_json::json!(ts.to_rfc3339()),
                None => serde_json::Value::Null,
            });
        }

        anyhow::bail!("FakeDriver does not recognize scalar query: {query}")
    }
}

/// Recognizes the `select_source_rows` shape, e.g.
/// `select num_0, 'CAS' as dossier_0, ... from cas.ximpaye`, returning the
/// stamped origin (`CAS`).
fn source_row_dossier_stamp(query: &str) -> Option<String> {
    let idx = query.find("as dossier_0")?;
    let before = &query[..idx];
    let quote_end = before.trim_end().rfind('\'')?;
    let head = &before[..quote_end];
    let quote_start = head.rfind('\'')?;
    Some(before[quote_start + 1..quote_end].to_string())
}

fn params_to_invoice_row(params: &[SqlParam]) -> Result<InvoiceRow> {
    let [num_0, dossier_0, mntglb_0, mntreg_0, sync_date, bpr_0, extra] = params else {
        anyhow::bail!("insert statement did not bind exactly 7 params");
    };
    Ok(InvoiceRow {
        num_0: text(num_0)?,
        dossier_0: text(dossier_0)?,
        mntglb_0: float(mntglb_0)?,
        mntreg_0: float(mntreg_0)?,
        sync_date: Some(timestamp(sync_date)?),
        bpr_0: optional_text(bpr_0),
        extra: match extra {
            SqlParam::Json(serde_json::Value::Object(m)) => m.clone(),
            _ => serde_json::Map::new(),
        },
    })
}

fn params_to_update(params: &[SqlParam]) -> Result<(f64, DateTime<Utc>, String, String)> {
    let [mntreg_0, sync_date, num_0, dossier_0] = params else {
        anyhow::bail!("update statement did not bind exactly 4 params");
    };
    Ok((
        float(mntreg_0)?,
        timestamp(sync_date)?,
        text(num_0)?,
        text(dossier_0)?,
    ))
}

fn text(p: &SqlParam) -> Result<String> {
    match p {
        SqlParam::Text(s) => Ok(s.clone()),
        other => anyhow::bail!("expected text param, got {other:?}"),
    }
}

fn optional_text(p: &SqlParam) -> Option<String> {
    match p {
        SqlParam::Text(s) => Some(s.clone()),
        _ => None,
    }
}

fn float(p: &SqlParam) -> Result<f64> {
    match p {
        SqlParam::Float(f) => Ok(*f),
        other => anyhow::bail!("expected float param, got {other:?}"),
    }
}

fn timestamp(p: &SqlParam) -> Result<DateTime<Utc>> {
    match p {
        SqlParam::Timestamp(ts) => Ok(*ts),
        other => anyhow::bail!("expected timestamp param, got {other:?}"),
    }
}
