//! One engine cycle: extract, centralize, check integrity, dispatch —
//! strictly sequential between stages, bounded parallelism within each.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use sync_config::IntegrityScope;
use sync_db::DbDriver;
use sync_dispatch::DispatchTarget;
use sync_monitor::{GlobalStatus, Metrics, MonitorSink, Stage, StepStatus};
use sync_types::TabularValue;

use crate::retry::with_retry;

/// One source schema to extract from, each cycle, under its own retry.
#[derive(Clone)]
pub struct ExtractionSource {
    pub schema: String,
    pub driver: Arc<dyn DbDriver>,
}

#[derive(Debug, Clone, Copy)]
pub struct CycleConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub integrity_scope: IntegrityScope,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleReport {
    pub schemas_extracted: usize,
    pub schemas_failed: usize,
    pub centralize_inserts: u64,
    pub centralize_updates: u64,
    pub integrity_ok: bool,
    pub dispatch_targets_initial: u64,
    pub dispatch_targets_delta: u64,
    pub dispatch_targets_failed: u64,
}

#[derive(Clone, Copy)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Step 3: every extraction failed after retries. Cycle aborted.
    ExtractionTotalFailure,
    /// Step 6: the Centralizer failed after retries. Cycle aborted.
    CentralizationFailure,
    /// Step 8: the global Dispatcher failed after retries. Cycle aborted.
    DispatchFailure,
}

const STEP_BOUND: usize = 10;

/// Runs steps 1-9 of one cycle. Never panics outward on ordinary
/// extraction/centralization/dispatch failures — those are reported through
/// `CycleOutcome`. A genuine panic inside this function is the engine's own
/// `CRITICAL` condition and is only caught by [`run_cycle_guarded`], not
/// here.
pub async fn run_cycle(
    sink: &dyn MonitorSink,
    sources: &[ExtractionSource],
    crm_driver: &dyn DbDriver,
    qualified_crm_table: &str,
    dispatch_targets: Vec<DispatchTarget>,
    cfg: &CycleConfig,
) -> Result<CycleOutcome> {
    sink.set_global_status(GlobalStatus::Running, Some(Utc::now())).await?;
    sink.clear_alerts().await?;

    let concurrency = sources.len().clamp(1, STEP_BOUND);
    let extractions: Vec<(String, Result<TabularValue>)> = stream::iter(sources.iter())
        .map(|source| extract_with_retry(source, sink, cfg))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let total = extractions.len();
    let failed = extractions.iter().filter(|(_, r)| r.is_err()).count();

    if total > 0 && failed == total {
        sink.add_alert("CRITICAL_FAIL", "every source extraction failed this cycle")
            .await?;
        sink.set_global_status(GlobalStatus::Error, None).await?;
        return Ok(CycleOutcome::ExtractionTotalFailure);
    }
    if failed > 0 {
        sink.add_alert(
            "WARNING",
            &format!("{failed}/{total} source extractions failed this cycle"),
        )
        .await?;
    }

    let mut union = TabularValue::empty();
    for (_, result) in extractions {
        if let Ok(table) = result {
            union.extend(table);
        }
    }

    let now = Utc::now();
    let centralize_started = Instant::now();
    let centralize_outcome = with_retry(
        cfg.max_retries,
        cfg.retry_delay,
        || sync_centralize::centralize_attempt(crm_driver, qualified_crm_table, &union, now),
        |retries, err| {
            publish_retry_in_progress(
                sink,
                Stage::Centralisation,
                sync_centralize::CENTRALISATION_STEP,
                retries,
                err,
            )
        },
    )
    .await;

    let centralize_report = match centralize_outcome {
        Ok(attempted) => {
            sink.publish(
                Stage::Centralisation,
                sync_centralize::CENTRALISATION_STEP,
                StepStatus::Success,
                Metrics {
                    inserts: Some(attempted.value.inserts),
                    updates: Some(attempted.value.updates),
                    duration_seconds: Some(centralize_started.elapsed().as_secs_f64()),
                    retries: Some(attempted.retries),
                    ..Default::default()
                },
                "ok",
            )
            .await?;
            attempted.value
        }
        Err(err) => {
            sink.publish(
                Stage::Centralisation,
                sync_centralize::CENTRALISATION_STEP,
                StepStatus::Failure,
                Metrics {
                    duration_seconds: Some(centralize_started.elapsed().as_secs_f64()),
                    retries: Some(cfg.max_retries),
                    ..Default::default()
                },
                &err.to_string(),
            )
            .await?;
            sink.add_alert("CENTRALISATION_FAIL", &err.to_string()).await?;
            sink.set_global_status(GlobalStatus::Error, None).await?;
            return Ok(CycleOutcome::CentralizationFailure);
        }
    };

    let integrity_ok = sync_integrity::verify(
        crm_driver,
        sink,
        qualified_crm_table,
        &union,
        cfg.integrity_scope,
    )
    .await;

    let dispatch_outcome = with_retry(
        cfg.max_retries,
        cfg.retry_delay,
        || sync_dispatch::dispatch_all(crm_driver, qualified_crm_table, sink, dispatch_targets.clone()),
        |retries, err| publish_retry_in_progress(sink, Stage::Dispatching, "ALL_TARGETS", retries, err),
    )
    .await;

    let dispatch_report = match dispatch_outcome {
        Ok(attempted) => attempted.value,
        Err(err) => {
            sink.add_alert("DISPATCH_FAIL", &err.to_string()).await?;
            sink.set_global_status(GlobalStatus::Error, None).await?;
            return Ok(CycleOutcome::DispatchFailure);
        }
    };

    sink.set_global_status(GlobalStatus::Idle, Some(Utc::now())).await?;

    Ok(CycleOutcome::Completed(CycleReport {
        schemas_extracted: total - failed,
        schemas_failed: failed,
        centralize_inserts: centralize_report.inserts,
        centralize_updates: centralize_report.updates,
        integrity_ok,
        dispatch_targets_initial: dispatch_report.targets_initial,
        dispatch_targets_delta: dispatch_report.targets_delta,
        dispatch_targets_failed: dispatch_report.targets_failed,
    }))
}

async fn extract_with_retry(
    source: &ExtractionSource,
    sink: &dyn MonitorSink,
    cfg: &CycleConfig,
) -> (String, Result<TabularValue>) {
    let started = Instant::now();
    let outcome = with_retry(
        cfg.max_retries,
        cfg.retry_delay,
        || sync_extract::extract_attempt(source.driver.as_ref(), &source.schema),
        |retries, err| publish_retry_in_progress(sink, Stage::Extraction, &source.schema, retries, err),
    )
    .await;

    match outcome {
        Ok(attempted) => {
            let _ = sink
                .publish(
                    Stage::Extraction,
                    &source.schema,
                    StepStatus::Success,
                    Metrics {
                        rows_extracted: Some(attempted.value.len() as u64),
                        duration_seconds: Some(started.elapsed().as_secs_f64()),
                        retries: Some(attempted.retries),
                        ..Default::default()
                    },
                    "ok",
                )
                .await;
            (source.schema.clone(), Ok(attempted.value))
        }
        Err(err) => {
            let _ = sink
                .publish(
                    Stage::Extraction,
                    &source.schema,
                    StepStatus::Failure,
                    Metrics {
                        duration_seconds: Some(started.elapsed().as_secs_f64()),
                        retries: Some(cfg.max_retries),
                        ..Default::default()
                    },
                    &err.to_string(),
                )
                .await;
            (source.schema.clone(), Err(err))
        }
    }
}

/// Wraps [`run_cycle`] in `catch_unwind`: a panic anywhere inside a cycle is
/// the engine's own `CRITICAL` condition — Rust has no in-band
/// exception to return, so a panic is the only way the orchestrator itself
/// can fail, and this is the one place it's caught rather than propagated
/// into an aborted process.
pub async fn run_cycle_guarded(
    sink: &dyn MonitorSink,
    sources: &[ExtractionSource],
    crm_driver: &dyn DbDriver,
    qualified_crm_table: &str,
    dispatch_targets: Vec<DispatchTarget>,
    cfg: &CycleConfig,
) -> Result<CycleOutcome> {
    let guarded = AssertUnwindSafe(run_cycle(
        sink,
        sources,
        crm_driver,
        qualified_crm_table,
        dispatch_targets,
        cfg,
    ));

    match guarded.catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(message, "orchestrator panicked mid-cycle");
            let _ = sink.add_alert("CRITICAL", &message).await;
            let _ = sink.set_global_status(GlobalStatus::Error, None).await;
            anyhow::bail!("orchestrator panicked: {message}")
        }
    }
}

/// Publishes an `IN_PROGRESS` step carrying the retry count so far — called
/// from a `with_retry` `on_retry` hook between failed attempts, before the
/// caller decides whether to give up.
async fn publish_retry_in_progress(
    sink: &dyn MonitorSink,
    stage: Stage,
    step: &str,
    retries: u32,
    err: &anyhow::Error,
) {
    let _ = sink
        .publish(
            stage,
            step,
            StepStatus::InProgress,
            Metrics {
                retries: Some(retries),
                ..Default::default()
            },
            &err.to_string(),
        )
        .await;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_testkit::{invoice, FakeDriver, FakeSink};

    const CRM: &str = "crm.ximpaye_conso";

    fn cfg() -> CycleConfig {
        CycleConfig {
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            integrity_scope: IntegrityScope::AllRows,
        }
    }

    #[tokio::test]
    async fn a_full_cycle_extracts_centralizes_and_dispatches() {
        let source_driver = Arc::new(FakeDriver::new());
        source_driver
            .seed(
                "cas.ximpaye",
                vec![invoice("A", "STALE", 100.0, 30.0, None)],
            )
            .await;
        source_driver.set_column("cas", "ximpaye", "bpr_0", true).await;

        let crm_driver = FakeDriver::new();
        let sink = FakeSink::new();

        let sources = vec![ExtractionSource {
            schema: "CAS".to_string(),
            driver: source_driver.clone(),
        }];

        let target_driver = Arc::new(FakeDriver::new());
        let targets = vec![DispatchTarget {
            name: "CAS_TARGET".to_string(),
            driver: target_driver.clone(),
            qualified_table: "cas.ximpaye_conso".to_string(),
        }];

        let outcome = run_cycle(&sink, &sources, &crm_driver, CRM, targets, &cfg())
            .await
            .unwrap();

        match outcome {
            CycleOutcome::Completed(report) => {
                assert_eq!(report.schemas_extracted, 1);
                assert_eq!(report.schemas_failed, 0);
                assert_eq!(report.centralize_inserts, 1);
                assert!(report.integrity_ok);
                assert_eq!(report.dispatch_targets_initial, 1);
            }
            other => panic!("expected a completed cycle, got {other:?}"),
        }

        assert_eq!(crm_driver.rows(CRM).await.len(), 1);
        assert_eq!(target_driver.rows("cas.ximpaye_conso").await.len(), 1);
        assert_eq!(sink.status().await, Some(sync_monitor::GlobalStatus::Idle));
    }

    #[tokio::test]
    async fn every_source_failing_aborts_the_cycle() {
        struct FailingDriver;
        #[async_trait::async_trait]
        impl DbDriver for FailingDriver {
            async fn select(&self, _q: &str) -> Result<TabularValue> {
                anyhow::bail!("source down")
            }
            async fn batch_exec(&self, _s: &str, _r: &[sync_db::ParamRow]) -> Result<u64> {
                anyhow::bail!("unused")
            }
            async fn scalar(&self, _q: &str) -> Result<serde_json::Value> {
                anyhow::bail!("source down")
            }
        }

        let crm_driver = FakeDriver::new();
        let sink = FakeSink::new();
        let sources = vec![ExtractionSource {
            schema: "CAS".to_string(),
            driver: Arc::new(FailingDriver),
        }];

        let outcome = run_cycle(&sink, &sources, &crm_driver, CRM, vec![], &cfg())
            .await
            .unwrap();

        assert!(matches!(outcome, CycleOutcome::ExtractionTotalFailure));
        let alerts = sink.alerts().await;
        assert!(alerts.iter().any(|a| a.kind == "CRITICAL_FAIL"));
        assert_eq!(sink.status().await, Some(sync_monitor::GlobalStatus::Error));
    }
}

impl std::fmt::Debug for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::Completed(r) => write!(f, "Completed({r:?})"),
            CycleOutcome::ExtractionTotalFailure => write!(f, "ExtractionTotalFailure"),
            CycleOutcome::CentralizationFailure => write!(f, "CentralizationFailure"),
            CycleOutcome::DispatchFailure => write!(f, "DispatchFailure"),
        }
    }
}
