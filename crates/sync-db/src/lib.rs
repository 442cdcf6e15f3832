//! Database access layer: the one place this engine depends on a concrete
//! SQL engine.
//!
//! Everything above this crate is written against the [`DbDriver`] trait;
//! [`pg::PgDriver`] is the one production implementation, backed by
//! `sqlx::PgPool` against PostgreSQL. One driver, one mode — no thick/thin
//! client toggle.

mod driver;
mod ops;
mod pg;

pub use driver::{DbDriver, ParamRow, SqlParam};
pub use ops::{
    column_exists, count_active_by_dossier, count_by_dossier, count_rows, get_active_invoices,
    insert_rows, is_empty_table, key_set, max_sync_date, select_all, select_since,
    select_source_rows, update_mntreg_rows,
};
pub use pg::{connect, connect_from_env, migrate, provision_schema, provision_source_table, PgDriver};

/// Build the fully-qualified reference table name for `schema`. Schema
/// names are folded to lower case, matching how an unquoted identifier of
/// the same name would be stored by Postgres.
pub fn qualified_table(schema: &str) -> String {
    format!("{}.ximpaye_conso", schema.to_ascii_lowercase())
}

/// Fully-qualified raw source table name for `schema` (pre-consolidation).
pub fn qualified_source_table(schema: &str) -> String {
    format!("{}.ximpaye", schema.to_ascii_lowercase())
}
