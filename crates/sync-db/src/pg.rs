use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use sync_types::{InvoiceRow, TabularValue};

use crate::driver::{DbDriver, ParamRow, SqlParam};

/// Open a pool against the URL in `env_var`, mirroring
/// `mqk_db::connect_from_env`'s shape but parameterized over which
/// connection-group variable to read (source group 1, group 2, or CRM).
pub async fn connect_from_env(env_var: &str) -> Result<PgPool> {
    let url = std::env::var(env_var).with_context(|| format!("{env_var} is not set"))?;
    connect(&url).await
}

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .with_context(|| "failed to connect to database".to_string())
}

/// Run the reference migration against `pool`'s default schema. Safe to
/// call repeatedly.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sync-db migrate failed")?;
    Ok(())
}

/// Create `schema` (if needed) and the reference `ximpaye_conso` table
/// inside it, using the same shape `migrate` installs in the default
/// schema. Every CRM / source / target schema the engine talks to is
/// provisioned this way; it is how the integration tests stand up a
/// multi-schema fixture against one Postgres instance.
pub async fn provision_schema(pool: &PgPool, schema: &str) -> Result<()> {
    let schema = schema.to_ascii_lowercase();
    let qualified = crate::qualified_table(&schema);

    sqlx::query(&format!(r#"create schema if not exists "{schema}""#))
        .execute(pool)
        .await
        .with_context(|| format!("create schema {schema} failed"))?;

    sqlx::query(&format!(
        "create table if not exists {qualified} (
            num_0        text not null,
            dossier_0    text not null,
            mntglb_0     double precision not null,
            mntreg_0     double precision not null,
            sync_date    timestamptz not null,
            bpr_0        text,
            extra_attrs  jsonb not null default '{{}}'::jsonb,
            primary key (num_0, dossier_0)
        )"
    ))
    .execute(pool)
    .await
    .with_context(|| format!("create table {qualified} failed"))?;

    sqlx::query(&format!(
        "create index if not exists ix_{schema}_dossier on {qualified} (dossier_0)"
    ))
    .execute(pool)
    .await
    .with_context(|| format!("create index on {qualified} failed"))?;

    sqlx::query(&format!(
        "create index if not exists ix_{schema}_sync_date on {qualified} (sync_date)"
    ))
    .execute(pool)
    .await
    .with_context(|| format!("create index on {qualified} failed"))?;

    Ok(())
}

/// Create `schema` (if needed) and a raw `ximpaye` source table inside it,
/// shaped like an un-consolidated source view: it may carry either `bpr_0`
/// or the typo'd `brp_0` (never both populated) and may already have a
/// stale `dossier_0` column, exercising the Extractor's column-normalization
/// path. Test/fixture use only — real source schemas are owned by
/// whatever system populates `XIMPAYE`.
pub async fn provision_source_table(pool: &PgPool, schema: &str) -> Result<()> {
    let schema = schema.to_ascii_lowercase();
    let qualified = crate::qualified_source_table(&schema);

    sqlx::query(&format!(r#"create schema if not exists "{schema}""#))
        .execute(pool)
        .await
        .with_context(|| format!("create schema {schema} failed"))?;

    sqlx::query(&format!(
        "create table if not exists {qualified} (
            num_0        text not null primary key,
            mntglb_0     double precision not null,
            mntreg_0     double precision not null,
            bpr_0        text,
            brp_0        text,
            dossier_0    text,
            extra_attrs  jsonb not null default '{{}}'::jsonb
        )"
    ))
    .execute(pool)
    .await
    .with_context(|| format!("create table {qualified} failed"))?;

    Ok(())
}

/// `DbDriver` backed by a `sqlx::PgPool` against one schema. The engine
/// opens one `PgDriver` per (connection, schema) pair it talks to, since
/// every query in this crate is schema-qualified by the caller when it
/// builds the SQL text.
pub struct PgDriver {
    pool: PgPool,
}

impl PgDriver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DbDriver for PgDriver {
    async fn select(&self, query: &str) -> Result<TabularValue> {
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("select failed: {query}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(row_to_invoice(row)?);
        }
        Ok(TabularValue::new(out))
    }

    async fn batch_exec(&self, statement: &str, rows: &[ParamRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin batch_exec transaction")?;
        let mut affected = 0u64;

        for params in rows {
            let mut q = sqlx::query(statement);
            for p in params {
                q = match p {
                    SqlParam::Text(s) => q.bind(s.clone()),
                    SqlParam::Float(f) => q.bind(*f),
                    SqlParam::Timestamp(ts) => q.bind(*ts),
                    SqlParam::Json(v) => q.bind(sqlx::types::Json(v.clone())),
                    SqlParam::Null => q.bind(Option::<String>::None),
                };
            }
            let result = q
                .execute(&mut *tx)
                .await
                .with_context(|| format!("batch_exec row failed: {statement}"))?;
            affected += result.rows_affected();
        }

        tx.commit().await.context("batch_exec commit failed")?;
        Ok(affected)
    }

    async fn scalar(&self, query: &str) -> Result<serde_json::Value> {
        let row = sqlx::query(query)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("scalar query failed: {query}"))?;
        scalar_from_row(&row)
    }
}

fn row_to_invoice(row: &PgRow) -> Result<InvoiceRow> {
    let extra: Option<sqlx::types::Json<serde_json::Value>> = row
        .try_get("extra_attrs")
        .context("decode extra_attrs failed")?;
    let extra = match extra.map(|j| j.0) {
        Some(serde_json::Value::Object(m)) => m,
        _ => serde_json::Map::new(),
    };

    Ok(InvoiceRow {
        num_0: row.try_get("num_0").context("decode num_0 failed")?,
        dossier_0: row.try_get("dossier_0").context("decode dossier_0 failed")?,
        mntglb_0: row.try_get("mntglb_0").context("decode mntglb_0 failed")?,
        mntreg_0: row.try_get("mntreg_0").context("decode mntreg_0 failed")?,
        sync_date: row
            .try_get::<Option<DateTime<Utc>>, _>("sync_date")
            .context("decode sync_date failed")?,
        bpr_0: row.try_get("bpr_0").context("decode bpr_0 failed")?,
        extra,
    })
}

/// Decode the single column of a scalar-query result. Tries the shapes the
/// engine actually needs (row count, max timestamp) before falling back to
/// a text representation.
fn scalar_from_row(row: &PgRow) -> Result<serde_json::Value> {
    if let Ok(n) = row.try_get::<i64, _>(0) {
        return Ok(serde_json::json!(n));
    }
    if let Ok(ts) = row.try_get::<Option<DateTime<Utc>>, _>(0) {
        return Ok(match ts {
            Some(ts) => serde_json::json!(ts.to_rfc3339()),
            None => serde_json::Value::Null,
        });
    }
    if let Ok(s) = row.try_get::<Option<String>, _>(0) {
        return Ok(match s {
            Some(s) => serde_json::json!(s),
            None => serde_json::Value::Null,
        });
    }
    anyhow::bail!("scalar result column had an unsupported type")
}
