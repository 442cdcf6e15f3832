//! Typed accessors built on top of [`DbDriver`]. These are the only queries
//! the pipeline crates (`sync-centralize`, `sync-dispatch`, `sync-integrity`)
//! issue; none of them hold a `PgPool` or write raw SQL of their own.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sync_types::{InvoiceKey, InvoiceRow, TabularValue};

use crate::driver::{DbDriver, ParamRow, SqlParam};

const INSERT_CHUNK_SIZE: usize = 1000;

fn insert_statement(qualified_table: &str) -> String {
    format!(
        "insert into {qualified_table} \
         (num_0, dossier_0, mntglb_0, mntreg_0, sync_date, bpr_0, extra_attrs) \
         values ($1, $2, $3, $4, $5, $6, $7) \
         on conflict (num_0, dossier_0) do nothing"
    )
}

fn row_to_insert_params(row: &InvoiceRow) -> Result<ParamRow> {
    let sync_date = row
        .sync_date
        .with_context(|| format!("row {:?} has no sync_date; the Centralizer must stamp it before writing", row.key()))?;
    Ok(vec![
        SqlParam::Text(row.num_0.clone()),
        SqlParam::Text(row.dossier_0.clone()),
        SqlParam::Float(row.mntglb_0),
        SqlParam::Float(row.mntreg_0),
        SqlParam::Timestamp(sync_date),
        match &row.bpr_0 {
            Some(s) => SqlParam::Text(s.clone()),
            None => SqlParam::Null,
        },
        SqlParam::Json(serde_json::Value::Object(row.extra.clone())),
    ])
}

/// `COUNT(*) == 0` on `qualified_table` — the mode switch between initial
/// load and delta.
pub async fn is_empty_table(driver: &dyn DbDriver, qualified_table: &str) -> Result<bool> {
    Ok(count_rows(driver, qualified_table).await? == 0)
}

/// Whether `schema.table` has a column named `column`. Used by the
/// Extractor to decide, per source, whether to read `BPR_0` or the typo'd
/// `BRP_0`.
pub async fn column_exists(driver: &dyn DbDriver, schema: &str, table: &str, column: &str) -> Result<bool> {
    let query = format!(
        "select count(*) from information_schema.columns \
         where table_schema = '{}' and table_name = '{}' and column_name = '{}'",
        escape_literal(&schema.to_ascii_lowercase()),
        escape_literal(table),
        escape_literal(column),
    );
    let value = driver.scalar(&query).await?;
    Ok(value.as_i64().unwrap_or(0) > 0)
}

pub async fn count_rows(driver: &dyn DbDriver, qualified_table: &str) -> Result<i64> {
    let query = format!("select count(*) from {qualified_table}");
    let value = driver.scalar(&query).await?;
    value
        .as_i64()
        .with_context(|| format!("count query did not return an integer: {query}"))
}

/// `SELECT NUM_0, DOSSIER_0, MNTREG_0, MNTGLB_0 ... WHERE MNTREG_0 < MNTGLB_0`
/// — the active subset of the CRM used for delta classification.
pub async fn get_active_invoices(driver: &dyn DbDriver, qualified_table: &str) -> Result<TabularValue> {
    let query = format!(
        "select num_0, dossier_0, mntglb_0, mntreg_0, sync_date, bpr_0, extra_attrs \
         from {qualified_table} where mntreg_0 < mntglb_0"
    );
    driver.select(&query).await
}

pub async fn select_all(driver: &dyn DbDriver, qualified_table: &str) -> Result<TabularValue> {
    let query = format!(
        "select num_0, dossier_0, mntglb_0, mntreg_0, sync_date, bpr_0, extra_attrs \
         from {qualified_table}"
    );
    driver.select(&query).await
}

/// Every `(NUM_0, DOSSIER_0)` currently present in `qualified_table`, used by
/// the Dispatcher to decide insert vs. update per row.
pub async fn key_set(driver: &dyn DbDriver, qualified_table: &str) -> Result<std::collections::HashSet<InvoiceKey>> {
    let table = select_all(driver, qualified_table).await?;
    Ok(table.rows().iter().map(|r| r.key()).collect())
}

/// `MAX(SYNC_DATE)` over `qualified_table`; `None` when the table is empty.
pub async fn max_sync_date(driver: &dyn DbDriver, qualified_table: &str) -> Result<Option<DateTime<Utc>>> {
    let query = format!("select max(sync_date) from {qualified_table}");
    let value = driver.scalar(&query).await?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(
            DateTime::parse_from_rfc3339(&s)
                .with_context(|| format!("invalid timestamp from {query}: {s}"))?
                .with_timezone(&Utc),
        )),
        other => anyhow::bail!("unexpected scalar shape for max_sync_date: {other}"),
    }
}

/// Per-dossier row count on `qualified_table`, used by the Integrity Checker.
pub async fn count_by_dossier(driver: &dyn DbDriver, qualified_table: &str, dossier: &str) -> Result<i64> {
    let query = format!(
        "select count(*) from {qualified_table} where dossier_0 = '{}'",
        escape_literal(dossier)
    );
    let value = driver.scalar(&query).await?;
    value
        .as_i64()
        .with_context(|| format!("count query did not return an integer: {query}"))
}

/// Per-dossier row count restricted to active invoices (`IntegrityScope::ActiveOnly`).
pub async fn count_active_by_dossier(driver: &dyn DbDriver, qualified_table: &str, dossier: &str) -> Result<i64> {
    let query = format!(
        "select count(*) from {qualified_table} where dossier_0 = '{}' and mntreg_0 < mntglb_0",
        escape_literal(dossier)
    );
    let value = driver.scalar(&query).await?;
    value
        .as_i64()
        .with_context(|| format!("count query did not return an integer: {query}"))
}

/// Insert every row of `rows` into `qualified_table`, chunked at 1000 rows
/// per batch. Returns the number of rows affected.
pub async fn insert_rows(driver: &dyn DbDriver, qualified_table: &str, rows: &[InvoiceRow]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let statement = insert_statement(qualified_table);
    let mut affected = 0u64;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let params: Vec<ParamRow> = chunk
            .iter()
            .map(row_to_insert_params)
            .collect::<Result<_>>()?;
        affected += driver.batch_exec(&statement, &params).await?;
    }
    Ok(affected)
}

/// Update `(MNTREG_0, SYNC_DATE)` by primary key for every row in `rows`.
pub async fn update_mntreg_rows(
    driver: &dyn DbDriver,
    qualified_table: &str,
    rows: &[InvoiceRow],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let statement = format!(
        "update {qualified_table} set mntreg_0 = $1, sync_date = $2 \
         where num_0 = $3 and dossier_0 = $4"
    );
    let mut affected = 0u64;
    for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
        let mut params: Vec<ParamRow> = Vec::with_capacity(chunk.len());
        for r in chunk {
            let sync_date = r.sync_date.with_context(|| {
                format!("row {:?} has no sync_date; the Centralizer must stamp it before writing", r.key())
            })?;
            params.push(vec![
                SqlParam::Float(r.mntreg_0),
                SqlParam::Timestamp(sync_date),
                SqlParam::Text(r.num_0.clone()),
                SqlParam::Text(r.dossier_0.clone()),
            ]);
        }
        affected += driver.batch_exec(&statement, &params).await?;
    }
    Ok(affected)
}

/// Rows with `SYNC_DATE > watermark`, used by the global Dispatcher.
pub async fn select_since(
    driver: &dyn DbDriver,
    qualified_table: &str,
    watermark: DateTime<Utc>,
) -> Result<TabularValue> {
    let query = format!(
        "select num_0, dossier_0, mntglb_0, mntreg_0, sync_date, bpr_0, extra_attrs \
         from {qualified_table} where sync_date > '{}'",
        watermark.to_rfc3339()
    );
    driver.select(&query).await
}

/// Read every row of `schema`'s raw source table, aliasing `bpr_source_col`
/// (whichever of `BPR_0` / `BRP_0` the caller determined actually exists)
/// to `bpr_0` and stamping `dossier_0 = schema` — the column-normalization
/// the Extractor is responsible for. `sync_date` comes back `NULL`;
/// it is only assigned once the Centralizer accepts the row.
pub async fn select_source_rows(
    driver: &dyn DbDriver,
    schema: &str,
    bpr_source_col: &str,
) -> Result<TabularValue> {
    let table = crate::qualified_source_table(schema);
    let query = format!(
        "select num_0, '{}' as dossier_0, mntglb_0, mntreg_0, \
         null::timestamptz as sync_date, {bpr_source_col} as bpr_0, extra_attrs \
         from {table}",
        escape_literal(&schema.to_ascii_uppercase()),
    );
    driver.select(&query).await
}

/// Minimal defensive escaping for the one literal we interpolate (dossier /
/// schema names), which always originate from this crate's own fixed
/// configuration, never from untrusted input.
fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}
