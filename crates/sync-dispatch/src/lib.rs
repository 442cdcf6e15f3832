//! Dispatcher: per-target propagation of the CRM table and the
//! global coordination that decides which mode each target runs in and
//! computes the shared watermark.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use sync_db::DbDriver;
use sync_monitor::{Metrics, MonitorSink, Stage, StepStatus};
use sync_types::{InvoiceRow, TabularValue};

/// Bound on how many targets are dispatched to concurrently in one cycle.
const MAX_CONCURRENT_DISPATCHES: usize = 5;

/// One propagation target: a live connection plus its qualified
/// `XIMPAYE_CONSO` table name.
#[derive(Clone)]
pub struct DispatchTarget {
    pub name: String,
    pub driver: Arc<dyn DbDriver>,
    pub qualified_table: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub targets_initial: u64,
    pub targets_delta: u64,
    pub targets_failed: u64,
    pub rows_written: u64,
}

/// `SELECT * FROM CRM` once, batch-INSERT into `target` — used when the
/// target table is empty.
pub async fn dispatch_initial(
    driver: &dyn DbDriver,
    sink: &dyn MonitorSink,
    schema_label: &str,
    qualified_target_table: &str,
    rows: &TabularValue,
) -> Result<u64> {
    match sync_db::insert_rows(driver, qualified_target_table, rows.rows()).await {
        Ok(inserted) => {
            sink.publish(
                Stage::Dispatching,
                schema_label,
                StepStatus::Success,
                Metrics {
                    inserts: Some(inserted),
                    ..Default::default()
                },
                "initial load",
            )
            .await?;
            Ok(inserted)
        }
        Err(err) => {
            sink.publish(
                Stage::Dispatching,
                schema_label,
                StepStatus::Failure,
                Metrics::default(),
                &err.to_string(),
            )
            .await?;
            Err(err)
        }
    }
}

/// Reads the target's local key set, splits `delta` into inserts and
/// updates accordingly, and writes both in batches.
pub async fn dispatch_delta(
    driver: &dyn DbDriver,
    sink: &dyn MonitorSink,
    schema_label: &str,
    qualified_target_table: &str,
    delta: &TabularValue,
) -> Result<u64> {
    match dispatch_delta_inner(driver, qualified_target_table, delta).await {
        Ok((inserted, updated)) => {
            sink.publish(
                Stage::Dispatching,
                schema_label,
                StepStatus::Success,
                Metrics {
                    inserts: Some(inserted),
                    updates: Some(updated),
                    ..Default::default()
                },
                "delta",
            )
            .await?;
            Ok(inserted + updated)
        }
        Err(err) => {
            sink.publish(
                Stage::Dispatching,
                schema_label,
                StepStatus::Failure,
                Metrics::default(),
                &err.to_string(),
            )
            .await?;
            Err(err)
        }
    }
}

async fn dispatch_delta_inner(
    driver: &dyn DbDriver,
    qualified_target_table: &str,
    delta: &TabularValue,
) -> Result<(u64, u64)> {
    let local_keys = sync_db::key_set(driver, qualified_target_table).await?;
    let mut inserts: Vec<InvoiceRow> = Vec::new();
    let mut updates: Vec<InvoiceRow> = Vec::new();

    for row in delta.rows() {
        if local_keys.contains(&row.key()) {
            updates.push(row.clone());
        } else {
            inserts.push(row.clone());
        }
    }

    let inserted = sync_db::insert_rows(driver, qualified_target_table, &inserts).await?;
    let updated = sync_db::update_mntreg_rows(driver, qualified_target_table, &updates).await?;
    Ok((inserted, updated))
}

/// A target, classified by whichever mode it needs this cycle.
enum Classified {
    Initial(DispatchTarget),
    Delta(DispatchTarget, DateTime<Utc>),
    Unreachable,
}

async fn classify(target: DispatchTarget, sink: &dyn MonitorSink) -> Classified {
    match sync_db::is_empty_table(target.driver.as_ref(), &target.qualified_table).await {
        Ok(true) => Classified::Initial(target),
        Ok(false) => match sync_db::max_sync_date(target.driver.as_ref(), &target.qualified_table).await {
            Ok(Some(watermark)) => Classified::Delta(target, watermark),
            Ok(None) => Classified::Initial(target),
            Err(err) => {
                unreachable_target(&target, sink, &err.to_string()).await;
                Classified::Unreachable
            }
        },
        Err(err) => {
            unreachable_target(&target, sink, &err.to_string()).await;
            Classified::Unreachable
        }
    }
}

async fn unreachable_target(target: &DispatchTarget, sink: &dyn MonitorSink, message: &str) {
    tracing::warn!(target = %target.name, error = message, "target unreachable, dropped from this cycle");
    let _ = sink
        .publish(
            Stage::Dispatching,
            &target.name,
            StepStatus::Failure,
            Metrics::default(),
            message,
        )
        .await;
    let _ = sink
        .add_alert("DISPATCH_TARGET_UNREACHABLE", &format!("{}: {message}", target.name))
        .await;
}

/// Enumerate every target, classify it (initial vs. delta),
/// compute the single shared watermark `W = min(MAX(SYNC_DATE))` over the
/// delta set, fetch `delta = SELECT * FROM CRM WHERE SYNC_DATE > W` exactly
/// once, then dispatch to every reachable target concurrently.
pub async fn dispatch_all(
    crm_driver: &dyn DbDriver,
    qualified_crm_table: &str,
    sink: &dyn MonitorSink,
    targets: Vec<DispatchTarget>,
) -> Result<DispatchReport> {
    let classified: Vec<Classified> = stream::iter(targets)
        .map(|t| classify(t, sink))
        .buffer_unordered(MAX_CONCURRENT_DISPATCHES)
        .collect()
        .await;

    let mut initial_targets = Vec::new();
    let mut delta_targets = Vec::new();
    let mut targets_failed = 0u64;

    for c in classified {
        match c {
            Classified::Initial(t) => initial_targets.push(t),
            Classified::Delta(t, watermark) => delta_targets.push((t, watermark)),
            Classified::Unreachable => targets_failed += 1,
        }
    }

    let mut report = DispatchReport {
        targets_failed,
        ..Default::default()
    };

    if !initial_targets.is_empty() {
        let full_crm = sync_db::select_all(crm_driver, qualified_crm_table).await?;
        let full_crm = Arc::new(full_crm);
        let written: Vec<Result<u64>> = stream::iter(initial_targets)
            .map(|t| {
                let full_crm = Arc::clone(&full_crm);
                async move {
                    dispatch_initial(t.driver.as_ref(), sink, &t.name, &t.qualified_table, &full_crm).await
                }
            })
            .buffer_unordered(MAX_CONCURRENT_DISPATCHES)
            .collect()
            .await;
        for r in written {
            match r {
                Ok(rows) => {
                    report.targets_initial += 1;
                    report.rows_written += rows;
                }
                Err(_) => report.targets_failed += 1,
            }
        }
    }

    if !delta_targets.is_empty() {
        let watermark = delta_targets
            .iter()
            .map(|(_, w)| *w)
            .min()
            .expect("delta_targets is non-empty");
        let delta = sync_db::select_since(crm_driver, qualified_crm_table, watermark).await?;
        let delta = Arc::new(delta);

        let written: Vec<Result<u64>> = stream::iter(delta_targets)
            .map(|(t, _)| {
                let delta = Arc::clone(&delta);
                async move { dispatch_delta(t.driver.as_ref(), sink, &t.name, &t.qualified_table, &delta).await }
            })
            .buffer_unordered(MAX_CONCURRENT_DISPATCHES)
            .collect()
            .await;
        for r in written {
            match r {
                Ok(rows) => {
                    report.targets_delta += 1;
                    report.rows_written += rows;
                }
                Err(_) => report.targets_failed += 1,
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_testkit::{invoice, FakeDriver, FakeSink};

    const CRM: &str = "crm.ximpaye_conso";

    #[tokio::test]
    async fn dispatch_initial_copies_every_crm_row_into_an_empty_target() {
        let crm = FakeDriver::new();
        crm.seed(CRM, vec![invoice("A", "CAS", 100.0, 30.0, Some(sync_testkit::now()))])
            .await;
        let target = FakeDriver::new();
        let sink = FakeSink::new();
        let rows = sync_db::select_all(&crm, CRM).await.unwrap();

        let inserted = dispatch_initial(&target, &sink, "CAS", "cas.ximpaye_conso", &rows)
            .await
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(target.rows("cas.ximpaye_conso").await.len(), 1);
    }

    #[tokio::test]
    async fn dispatch_delta_updates_known_keys_and_inserts_new_ones() {
        let target = FakeDriver::new();
        target
            .seed(
                "cas.ximpaye_conso",
                vec![invoice("A", "CAS", 100.0, 30.0, Some(sync_testkit::now()))],
            )
            .await;
        let sink = FakeSink::new();
        let delta = TabularValue::new(vec![
            invoice("A", "CAS", 100.0, 70.0, Some(sync_testkit::now())),
            invoice("B", "CAS", 20.0, 5.0, Some(sync_testkit::now())),
        ]);

        let written = dispatch_delta(&target, &sink, "CAS", "cas.ximpaye_conso", &delta)
            .await
            .unwrap();

        assert_eq!(written, 2);
        let rows = target.rows("cas.ximpaye_conso").await;
        let a = rows.iter().find(|r| r.num_0 == "A").unwrap();
        assert_eq!(a.mntreg_0, 70.0);
        assert!(rows.iter().any(|r| r.num_0 == "B"));
    }

    #[tokio::test]
    async fn dispatch_all_routes_empty_and_populated_targets_differently() {
        let crm = FakeDriver::new();
        crm.seed(
            CRM,
            vec![
                invoice("A", "CAS", 100.0, 30.0, Some(sync_testkit::now())),
                invoice("B", "CMGP", 20.0, 20.0, Some(sync_testkit::now())),
            ],
        )
        .await;
        let sink = FakeSink::new();

        let empty_target = Arc::new(FakeDriver::new());
        let populated_target = Arc::new(FakeDriver::new());
        populated_target
            .seed(
                "cmgp.ximpaye_conso",
                vec![invoice("B", "CMGP", 20.0, 10.0, Some(chrono::Utc::now() - chrono::Duration::hours(1)))],
            )
            .await;

        let targets = vec![
            DispatchTarget {
                name: "CAS".to_string(),
                driver: empty_target.clone(),
                qualified_table: "cas.ximpaye_conso".to_string(),
            },
            DispatchTarget {
                name: "CMGP".to_string(),
                driver: populated_target.clone(),
                qualified_table: "cmgp.ximpaye_conso".to_string(),
            },
        ];

        let report = dispatch_all(&crm, CRM, &sink, targets).await.unwrap();

        assert_eq!(report.targets_initial, 1);
        assert_eq!(report.targets_delta, 1);
        assert_eq!(report.targets_failed, 0);
        assert_eq!(empty_target.rows("cas.ximpaye_conso").await.len(), 1);
    }

    #[tokio::test]
    async fn dispatching_the_same_delta_twice_does_not_duplicate_rows() {
        let target = FakeDriver::new();
        target
            .seed(
                "cas.ximpaye_conso",
                vec![invoice("A", "CAS", 100.0, 30.0, Some(sync_testkit::now()))],
            )
            .await;
        let sink = FakeSink::new();
        let delta = TabularValue::new(vec![
            invoice("A", "CAS", 100.0, 70.0, Some(sync_testkit::now())),
            invoice("B", "CAS", 20.0, 5.0, Some(sync_testkit::now())),
        ]);

        dispatch_delta(&target, &sink, "CAS", "cas.ximpaye_conso", &delta)
            .await
            .unwrap();
        dispatch_delta(&target, &sink, "CAS", "cas.ximpaye_conso", &delta)
            .await
            .unwrap();

        let rows = target.rows("cas.ximpaye_conso").await;
        assert_eq!(rows.len(), 2, "re-dispatching the same delta must not create duplicate rows");
        let a = rows.iter().find(|r| r.num_0 == "A").unwrap();
        assert_eq!(a.mntreg_0, 70.0);
    }

    #[tokio::test]
    async fn shared_watermark_is_the_oldest_of_all_delta_targets() {
        let crm = FakeDriver::new();
        let old = sync_testkit::now() - chrono::Duration::hours(2);
        let recent = sync_testkit::now() - chrono::Duration::minutes(5);
        crm.seed(
            CRM,
            vec![
                invoice("A", "CAS", 100.0, 30.0, Some(old + chrono::Duration::minutes(1))),
                invoice("B", "CAS", 20.0, 5.0, Some(recent + chrono::Duration::minutes(1))),
            ],
        )
        .await;
        let sink = FakeSink::new();

        // One target synced long ago, one synced recently: the shared
        // watermark must be the older of the two, so target `stale`'s
        // backlog since `old` is still fetched even though `fresh` only
        // needs rows since `recent`.
        let stale = Arc::new(FakeDriver::new());
        stale
            .seed(
                "cas.ximpaye_conso",
                vec![invoice("Z", "CAS", 1.0, 1.0, Some(old))],
            )
            .await;
        let fresh = Arc::new(FakeDriver::new());
        fresh
            .seed(
                "cmgp.ximpaye_conso",
                vec![invoice("Y", "CAS", 1.0, 1.0, Some(recent))],
            )
            .await;

        let targets = vec![
            DispatchTarget {
                name: "stale".to_string(),
                driver: stale.clone(),
                qualified_table: "cas.ximpaye_conso".to_string(),
            },
            DispatchTarget {
                name: "fresh".to_string(),
                driver: fresh.clone(),
                qualified_table: "cmgp.ximpaye_conso".to_string(),
            },
        ];

        let report = dispatch_all(&crm, CRM, &sink, targets).await.unwrap();

        assert_eq!(report.targets_delta, 2);
        // Both targets received row A (sync_date just after `old`), proving
        // the fetch used the older watermark rather than each target's own.
        assert!(stale.rows("cas.ximpaye_conso").await.iter().any(|r| r.num_0 == "A"));
        assert!(fresh.rows("cmgp.ximpaye_conso").await.iter().any(|r| r.num_0 == "A"));
    }
}
