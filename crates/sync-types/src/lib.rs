//! Shared data model for the impayés synchronization engine.
//!
//! Every pipeline crate (`sync-extract`, `sync-centralize`, `sync-integrity`,
//! `sync-dispatch`, `sync-orchestrator`) talks in terms of [`InvoiceRow`] and
//! [`TabularValue`] rather than driver-specific row types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The column names this engine uses verbatim as SQL identifiers.
pub const COL_NUM: &str = "NUM_0";
pub const COL_DOSSIER: &str = "DOSSIER_0";
pub const COL_MNTGLB: &str = "MNTGLB_0";
pub const COL_MNTREG: &str = "MNTREG_0";
pub const COL_SYNC_DATE: &str = "SYNC_DATE";
pub const COL_BPR: &str = "BPR_0";
/// Typo'd source column name that the extractor must rename to [`COL_BPR`].
pub const COL_BPR_TYPO: &str = "BRP_0";

pub const SOURCE_VIEW: &str = "XIMPAYE";
pub const TARGET_TABLE: &str = "XIMPAYE_CONSO";

/// Primary key of an invoice row: `(NUM_0, DOSSIER_0)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvoiceKey {
    pub num_0: String,
    pub dossier_0: String,
}

impl InvoiceKey {
    pub fn new(num_0: impl Into<String>, dossier_0: impl Into<String>) -> Self {
        Self {
            num_0: num_0.into(),
            dossier_0: dossier_0.into(),
        }
    }
}

/// One invoice record. `extra` carries every column beyond the six named by
/// the data model, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRow {
    pub num_0: String,
    pub dossier_0: String,
    pub mntglb_0: f64,
    pub mntreg_0: f64,
    /// `None` for a freshly extracted row that has not yet passed through
    /// the Centralizer, which is the only component that stamps this
    /// column. Every row read back out of a table has `Some`.
    pub sync_date: Option<DateTime<Utc>>,
    pub bpr_0: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InvoiceRow {
    pub fn key(&self) -> InvoiceKey {
        InvoiceKey::new(self.num_0.clone(), self.dossier_0.clone())
    }

    /// Returns a copy stamped with `sync_date = ts`, as the Centralizer does
    /// for every row it writes in a single invocation.
    pub fn stamped(&self, ts: DateTime<Utc>) -> Self {
        Self {
            sync_date: Some(ts),
            ..self.clone()
        }
    }

    /// An invoice is active while it still owes money. Inactive (settled)
    /// rows never resurrect from a source delta.
    pub fn is_active(&self) -> bool {
        self.mntreg_0 < self.mntglb_0
    }
}

/// The in-memory tabular value the pipeline passes between stages: an
/// ordered sequence of rows plus a lazily-built key index.
///
/// The index is never built implicitly — callers that need a keyed join
/// (the Centralizer, the Dispatcher) call [`TabularValue::index`] exactly
/// once and reuse it, so a pure pass-through (e.g. concatenating several
/// extractions) never pays for a map it doesn't need.
#[derive(Debug, Clone, Default)]
pub struct TabularValue {
    rows: Vec<InvoiceRow>,
}

impl TabularValue {
    pub fn new(rows: Vec<InvoiceRow>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[InvoiceRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<InvoiceRow> {
        self.rows
    }

    pub fn push(&mut self, row: InvoiceRow) {
        self.rows.push(row);
    }

    pub fn extend(&mut self, other: TabularValue) {
        self.rows.extend(other.rows);
    }

    /// Build a key -> row-index map over the current contents.
    pub fn index(&self) -> HashMap<InvoiceKey, usize> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key(), i))
            .collect()
    }

    /// Distinct `DOSSIER_0` values present, with per-dossier row counts.
    pub fn counts_by_dossier(&self) -> HashMap<String, usize> {
        let mut out = HashMap::new();
        for row in &self.rows {
            *out.entry(row.dossier_0.clone()).or_insert(0) += 1;
        }
        out
    }
}

impl FromIterator<InvoiceRow> for TabularValue {
    fn from_iter<T: IntoIterator<Item = InvoiceRow>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

/// One configured connection group: a DSN plus the list of schemas it hosts
/// (source group 1, source group 2, or the CRM group).
#[derive(Debug, Clone)]
pub struct ConnectionGroup {
    pub name: String,
    pub database_url: String,
    pub schemas: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(num: &str, dossier: &str, glb: f64, reg: f64) -> InvoiceRow {
        InvoiceRow {
            num_0: num.to_string(),
            dossier_0: dossier.to_string(),
            mntglb_0: glb,
            mntreg_0: reg,
            sync_date: Some(Utc::now()),
            bpr_0: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn active_iff_partially_paid() {
        assert!(row("A", "CAS", 100.0, 30.0).is_active());
        assert!(!row("A", "CAS", 100.0, 100.0).is_active());
    }

    #[test]
    fn counts_by_dossier_groups_correctly() {
        let table: TabularValue = vec![
            row("A", "CAS", 100.0, 0.0),
            row("B", "CAS", 50.0, 0.0),
            row("C", "CMGP", 10.0, 0.0),
        ]
        .into_iter()
        .collect();
        let counts = table.counts_by_dossier();
        assert_eq!(counts.get("CAS"), Some(&2));
        assert_eq!(counts.get("CMGP"), Some(&1));
    }

    #[test]
    fn index_maps_primary_key_to_position() {
        let table: TabularValue = vec![row("A", "CAS", 100.0, 0.0)].into_iter().collect();
        let idx = table.index();
        assert_eq!(idx.get(&InvoiceKey::new("A", "CAS")), Some(&0));
    }
}
