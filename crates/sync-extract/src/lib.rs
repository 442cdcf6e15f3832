//! Extractor: pulls one source schema into an in-memory tabular
//! value, normalizes column names, and stamps the origin tag.

use std::time::Instant;

use sync_db::DbDriver;
use sync_monitor::{Metrics, MonitorSink, Stage, StepStatus};
use sync_types::TabularValue;

/// Extract `schema` through `driver`, publishing progress on `sink`.
///
/// Never fails outward: a driver error is caught, published as `FAILURE`,
/// and an empty tabular value is returned — retrying belongs to the
/// orchestrator, not to this function.
pub async fn extract(driver: &dyn DbDriver, sink: &dyn MonitorSink, schema: &str) -> TabularValue {
    let started = Instant::now();
    match extract_attempt(driver, schema).await {
        Ok(table) => {
            let _ = sink
                .publish(
                    Stage::Extraction,
                    schema,
                    StepStatus::Success,
                    Metrics {
                        rows_extracted: Some(table.len() as u64),
                        duration_seconds: Some(started.elapsed().as_secs_f64()),
                        ..Default::default()
                    },
                    "ok",
                )
                .await;
            table
        }
        Err(err) => {
            tracing::warn!(schema, error = %err, "extraction failed");
            let _ = sink
                .publish(
                    Stage::Extraction,
                    schema,
                    StepStatus::Failure,
                    Metrics {
                        duration_seconds: Some(started.elapsed().as_secs_f64()),
                        ..Default::default()
                    },
                    &err.to_string(),
                )
                .await;
            TabularValue::empty()
        }
    }
}

/// One raw extraction attempt, with no publishing and no error handling —
/// the unit the orchestrator's retry wrapper retries.
pub async fn extract_attempt(driver: &dyn DbDriver, schema: &str) -> anyhow::Result<TabularValue> {
    let bpr_column = resolve_bpr_column(
        sync_db::column_exists(driver, schema, "ximpaye", "bpr_0").await?,
        sync_db::column_exists(driver, schema, "ximpaye", "brp_0").await?,
    );
    sync_db::select_source_rows(driver, schema, bpr_column).await
}

/// Which source column to read as `BPR_0`: prefer a correctly-named
/// `BPR_0` column; fall back to the typo'd `BRP_0`; read `NULL` if neither
/// exists. Kept as a pure function so the precedence rule is unit-testable
/// without a driver.
fn resolve_bpr_column(has_bpr: bool, has_brp: bool) -> &'static str {
    match (has_bpr, has_brp) {
        (true, _) => "bpr_0",
        (false, true) => "brp_0",
        (false, false) => "null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_testkit::{invoice, FakeDriver, FakeSink};

    #[test]
    fn bpr_column_prefers_correctly_named_over_typo() {
        assert_eq!(resolve_bpr_column(true, true), "bpr_0");
        assert_eq!(resolve_bpr_column(true, false), "bpr_0");
        assert_eq!(resolve_bpr_column(false, true), "brp_0");
        assert_eq!(resolve_bpr_column(false, false), "null");
    }

    #[tokio::test]
    async fn extracted_rows_are_stamped_with_the_schema_as_origin() {
        let driver = FakeDriver::new();
        driver
            .seed(
                "cas.ximpaye",
                vec![invoice("A", "STALE_ORIGIN", 100.0, 30.0, None)],
            )
            .await;
        let sink = FakeSink::new();

        let table = extract(&driver, &sink, "CAS").await;

        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0].dossier_0, "CAS");
        assert!(table.rows()[0].sync_date.is_none());

        let published = sink.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].status, StepStatus::Success);
        assert_eq!(published[0].metrics.rows_extracted, Some(1));
    }

    #[tokio::test]
    async fn driver_failure_yields_empty_table_and_failure_publication() {
        struct FailingDriver;
        #[async_trait::async_trait]
        impl DbDriver for FailingDriver {
            async fn select(&self, _query: &str) -> anyhow::Result<TabularValue> {
                anyhow::bail!("source unreachable")
            }
            async fn batch_exec(&self, _s: &str, _r: &[sync_db::ParamRow]) -> anyhow::Result<u64> {
                anyhow::bail!("unused")
            }
            async fn scalar(&self, _query: &str) -> anyhow::Result<serde_json::Value> {
                anyhow::bail!("source unreachable")
            }
        }

        let sink = FakeSink::new();
        let table = extract(&FailingDriver, &sink, "CAS").await;

        assert!(table.is_empty());
        let published = sink.published().await;
        assert_eq!(published[0].status, StepStatus::Failure);
    }
}
