//! Integrity Checker: compares per-dossier row counts between the
//! union of extractions and the CRM table. Advisory only — a mismatch is
//! published and alerted, never returned as an error that would stop the
//! cycle.

use sync_config::IntegrityScope;
use sync_db::DbDriver;
use sync_monitor::{Metrics, MonitorSink, Stage, StepStatus};
use sync_types::TabularValue;

const ALERT_KIND: &str = "INTEGRITY_MISMATCH";

/// Check every dossier present in `union` against `qualified_crm_table`,
/// publishing one step per dossier and alerting on any mismatch. Returns
/// the AND of all per-dossier checks (including query failures, which
/// count as a failed check).
pub async fn verify(
    driver: &dyn DbDriver,
    sink: &dyn MonitorSink,
    qualified_crm_table: &str,
    union: &TabularValue,
    scope: IntegrityScope,
) -> bool {
    let mut all_ok = true;
    for (dossier, expected) in union.counts_by_dossier() {
        let ok = verify_dossier(driver, sink, qualified_crm_table, &dossier, expected, scope).await;
        all_ok &= ok;
    }
    all_ok
}

async fn verify_dossier(
    driver: &dyn DbDriver,
    sink: &dyn MonitorSink,
    qualified_crm_table: &str,
    dossier: &str,
    expected: usize,
    scope: IntegrityScope,
) -> bool {
    let step = format!("INTEGRITY_{dossier}");
    let actual = match scope {
        IntegrityScope::AllRows => sync_db::count_by_dossier(driver, qualified_crm_table, dossier).await,
        IntegrityScope::ActiveOnly => {
            sync_db::count_active_by_dossier(driver, qualified_crm_table, dossier).await
        }
    };

    let actual = match actual {
        Ok(n) => n,
        Err(err) => {
            tracing::warn!(dossier, error = %err, "integrity check query failed");
            let message = format!("could not count CRM rows for {dossier}: {err}");
            let _ = sink
                .publish(
                    Stage::Centralisation,
                    &step,
                    StepStatus::Failure,
                    Metrics {
                        expected: Some(expected as i64),
                        ..Default::default()
                    },
                    &message,
                )
                .await;
            let _ = sink.add_alert(ALERT_KIND, &message).await;
            return false;
        }
    };

    if actual as usize == expected {
        let _ = sink
            .publish(
                Stage::Centralisation,
                &step,
                StepStatus::Success,
                Metrics {
                    expected: Some(expected as i64),
                    actual: Some(actual),
                    ..Default::default()
                },
                "ok",
            )
            .await;
        true
    } else {
        let message = format!(
            "dossier {dossier}: expected {expected} rows in CRM, found {actual}"
        );
        let _ = sink
            .publish(
                Stage::Centralisation,
                &step,
                StepStatus::Failure,
                Metrics {
                    expected: Some(expected as i64),
                    actual: Some(actual),
                    ..Default::default()
                },
                &message,
            )
            .await;
        let _ = sink.add_alert(ALERT_KIND, &message).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_testkit::{invoice, FakeDriver, FakeSink};

    const CRM: &str = "crm.ximpaye_conso";

    #[tokio::test]
    async fn matching_counts_report_success_with_no_alert() {
        let driver = FakeDriver::new();
        driver
            .seed(CRM, vec![invoice("A", "CAS", 100.0, 30.0, Some(sync_testkit::now()))])
            .await;
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("A", "CAS", 100.0, 30.0, None)]);

        let ok = verify(&driver, &sink, CRM, &union, IntegrityScope::AllRows).await;

        assert!(ok);
        assert!(sink.alerts().await.is_empty());
        let published = sink.published().await;
        assert_eq!(published[0].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn mismatched_counts_fail_and_alert() {
        let driver = FakeDriver::new();
        // CRM has two CAS rows but the union only extracted one.
        driver
            .seed(
                CRM,
                vec![
                    invoice("A", "CAS", 100.0, 30.0, Some(sync_testkit::now())),
                    invoice("B", "CAS", 50.0, 10.0, Some(sync_testkit::now())),
                ],
            )
            .await;
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("A", "CAS", 100.0, 30.0, None)]);

        let ok = verify(&driver, &sink, CRM, &union, IntegrityScope::AllRows).await;

        assert!(!ok);
        let alerts = sink.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "INTEGRITY_MISMATCH");
        let published = sink.published().await;
        assert_eq!(published[0].status, StepStatus::Failure);
    }

    #[tokio::test]
    async fn active_only_scope_ignores_settled_rows() {
        let driver = FakeDriver::new();
        driver
            .seed(
                CRM,
                vec![
                    // settled: mntreg == mntglb, inactive
                    invoice("A", "CAS", 100.0, 100.0, Some(sync_testkit::now())),
                    invoice("B", "CAS", 50.0, 10.0, Some(sync_testkit::now())),
                ],
            )
            .await;
        let sink = FakeSink::new();
        let union = TabularValue::new(vec![invoice("B", "CAS", 50.0, 10.0, None)]);

        let ok = verify(&driver, &sink, CRM, &union, IntegrityScope::ActiveOnly).await;

        assert!(ok);
    }
}
