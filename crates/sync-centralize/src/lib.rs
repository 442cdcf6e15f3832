//! Centralizer: merges the union of extracted rows into the CRM
//! table, in initial-load or delta mode.

use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sync_db::DbDriver;
use sync_monitor::{Metrics, MonitorSink, Stage, StepStatus};
use sync_types::{InvoiceRow, TabularValue};

pub const CENTRALISATION_STEP: &str = "CRM_GLOBAL";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CentralizeReport {
    pub inserts: u64,
    pub updates: u64,
}

/// Run one Centralizer invocation against `qualified_crm_table`. Propagates
/// errors (unlike the Extractor) so the orchestrator's retry wrapper can
/// retry it.
pub async fn centralize(
    driver: &dyn DbDriver,
    sink: &dyn MonitorSink,
    qualified_crm_table: &str,
    union: &TabularValue,
) -> Result<CentralizeReport> {
    if union.is_empty() {
        sink.publish(
            Stage::Centralisation,
            CENTRALISATION_STEP,
            StepStatus::Success,
            Metrics::default(),
            "Nothing to centralize",
        )
        .await?;
        return Ok(CentralizeReport::default());
    }

    let started = Instant::now();
    let now = Utc::now();
    match centralize_attempt(driver, qualified_crm_table, union, now).await {
        Ok(report) => {
            sink.publish(
                Stage::Centralisation,
                CENTRALISATION_STEP,
                StepStatus::Success,
                Metrics {
                    inserts: Some(report.inserts),
                    updates: Some(report.updates),
                    duration_seconds: Some(started.elapsed().as_secs_f64()),
                    ..Default::default()
                },
                "ok",
            )
            .await?;
            Ok(report)
        }
        Err(err) => {
            sink.publish(
                Stage::Centralisation,
                CENTRALISATION_STEP,
                StepStatus::Failure,
                Metrics {
                    duration_seconds: Some(started.elapsed().as_secs_f64()),
                    ..Default::default()
                },
                &err.to_string(),
            )
            .await?;
            Err(err)
        }
    }
}

/// One raw centralization attempt against a fixed `now`, with no publishing
/// — the unit the orchestrator's retry wrapper retries. Retries of
/// the same cycle must reuse the same `now` so every write in the cycle
/// carries one watermark.
pub async fn centralize_attempt(
    driver: &dyn DbDriver,
    qualified_crm_table: &str,
    union: &TabularValue,
    now: DateTime<Utc>,
) -> Result<CentralizeReport> {
    if sync_db::is_empty_table(driver, qualified_crm_table).await? {
        let stamped: Vec<InvoiceRow> = union.rows().iter().map(|r| r.stamped(now)).collect();
        let inserted = sync_db::insert_rows(driver, qualified_crm_table, &stamped).await?;
        return Ok(CentralizeReport {
            inserts: inserted,
            updates: 0,
        });
    }

    let active = sync_db::get_active_invoices(driver, qualified_crm_table).await?;
    let active_index = active.index();
    let source_index = union.index();

    let (new_rows, partial_payment_rows) =
        classify_against_active(union, &active, &active_index, now);
    let disappeared_rows = settle_disappeared(&active, &source_index, now);

    let inserted = sync_db::insert_rows(driver, qualified_crm_table, &new_rows).await?;
    let mut updated =
        sync_db::update_mntreg_rows(driver, qualified_crm_table, &partial_payment_rows).await?;
    updated += sync_db::update_mntreg_rows(driver, qualified_crm_table, &disappeared_rows).await?;

    Ok(CentralizeReport {
        inserts: inserted,
        updates: updated,
    })
}

/// Partitions `union` against the CRM's active rows: keys absent from the
/// CRM are new inserts; keys present with a strictly larger `MNTREG_0` are
/// partial-payment updates. Equal or smaller amounts are a no-op (I7).
///
/// `now` is applied by the caller via [`InvoiceRow::stamped`]; this
/// function only classifies, so it is trivially unit-testable.
fn classify_against_active(
    union: &TabularValue,
    active: &TabularValue,
    active_index: &std::collections::HashMap<sync_types::InvoiceKey, usize>,
    now: DateTime<Utc>,
) -> (Vec<InvoiceRow>, Vec<InvoiceRow>) {
    let mut new_rows = Vec::new();
    let mut partial_payment_rows = Vec::new();

    for src_row in union.rows() {
        match active_index.get(&src_row.key()) {
            None => new_rows.push(src_row.stamped(now)),
            Some(&idx) => {
                let crm_row = &active.rows()[idx];
                if src_row.mntreg_0 > crm_row.mntreg_0 {
                    partial_payment_rows.push(src_row.stamped(now));
                }
            }
        }
    }

    (new_rows, partial_payment_rows)
}

/// Active CRM keys with no counterpart in `union` are settled: `MNTREG_0`
/// is raised to `MNTGLB_0` (I6).
fn settle_disappeared(
    active: &TabularValue,
    source_index: &std::collections::HashMap<sync_types::InvoiceKey, usize>,
    now: DateTime<Utc>,
) -> Vec<InvoiceRow> {
    active
        .rows()
        .iter()
        .filter(|r| !source_index.contains_key(&r.key()))
        .map(|r| {
            let mut settled = r.clone();
            settled.mntreg_0 = r.mntglb_0;
            settled.sync_date = Some(now);
            settled
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_testkit::{invoice, now as fixed_now, FakeDriver, FakeSink};

    const CRM: &str = "crm.ximpaye_conso";

    #[tokio::test]
    async fn scenario_1_initial_load_inserts_the_only_row() {
        let driver = FakeDriver::new();
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("A", "ignored", 100.0, 30.0, None)]);

        let report = centralize(&driver, &sink, CRM, &union).await.unwrap();

        assert_eq!(report, CentralizeReport { inserts: 1, updates: 0 });
        let stored = driver.rows(CRM).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].mntreg_0, 30.0);
        assert!(stored[0].sync_date.is_some());
    }

    #[tokio::test]
    async fn scenario_2_partial_payment_updates_in_place() {
        let driver = FakeDriver::new();
        driver
            .seed(CRM, vec![invoice("A", "CAS", 100.0, 30.0, Some(fixed_now()))])
            .await;
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("A", "CAS", 100.0, 70.0, None)]);

        let report = centralize(&driver, &sink, CRM, &union).await.unwrap();

        assert_eq!(report, CentralizeReport { inserts: 0, updates: 1 });
        let stored = driver.rows(CRM).await;
        assert_eq!(stored[0].mntreg_0, 70.0);
    }

    #[tokio::test]
    async fn scenario_3_disappearance_settles_to_global_amount() {
        let driver = FakeDriver::new();
        driver
            .seed(CRM, vec![invoice("A", "CAS", 100.0, 70.0, Some(fixed_now()))])
            .await;
        let sink = FakeSink::new();
        // Source no longer reports A; union carries some other row so it
        // isn't empty (an empty union is the early-return "nothing to do"
        // path, not a disappearance signal).
        let union = TabularValue::new(vec![invoice("B", "CMGP", 5.0, 0.0, None)]);

        let report = centralize(&driver, &sink, CRM, &union).await.unwrap();

        assert_eq!(report.updates, 1);
        let stored = driver.rows(CRM).await;
        let a = stored.iter().find(|r| r.num_0 == "A").unwrap();
        assert_eq!(a.mntreg_0, 100.0);
    }

    #[tokio::test]
    async fn scenario_4_equal_amount_is_a_no_op() {
        let driver = FakeDriver::new();
        driver
            .seed(CRM, vec![invoice("A", "CAS", 100.0, 70.0, Some(fixed_now()))])
            .await;
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("A", "CAS", 100.0, 70.0, None)]);

        let report = centralize(&driver, &sink, CRM, &union).await.unwrap();

        assert_eq!(report.updates, 0);
        assert_eq!(report.inserts, 0);
    }

    #[tokio::test]
    async fn i1_key_uniqueness_survives_repeated_inserts_of_the_same_row() {
        let driver = FakeDriver::new();
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("A", "CAS", 100.0, 30.0, None)]);

        centralize(&driver, &sink, CRM, &union).await.unwrap();
        // Second cycle, same source state: A is now active in CRM with
        // mntreg_0 == 30, so the identical source row is a no-op, not a
        // duplicate insert.
        centralize(&driver, &sink, CRM, &union).await.unwrap();

        let stored = driver.rows(CRM).await;
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn i2_mntreg_never_decreases_even_if_source_reports_less() {
        let driver = FakeDriver::new();
        driver
            .seed(CRM, vec![invoice("A", "CAS", 100.0, 70.0, Some(fixed_now()))])
            .await;
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("A", "CAS", 100.0, 40.0, None)]);

        centralize(&driver, &sink, CRM, &union).await.unwrap();

        let stored = driver.rows(CRM).await;
        assert_eq!(stored[0].mntreg_0, 70.0);
    }

    #[tokio::test]
    async fn empty_union_is_a_success_with_no_writes() {
        let driver = FakeDriver::new();
        let sink = FakeSink::new();

        let report = centralize(&driver, &sink, CRM, &TabularValue::empty())
            .await
            .unwrap();

        assert_eq!(report, CentralizeReport::default());
        let published = sink.published().await;
        assert_eq!(published[0].status, StepStatus::Success);
        assert_eq!(published[0].message, "Nothing to centralize");
    }
}
