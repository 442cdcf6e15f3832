//! Monitoring sink: publishes per-stage step status and alerts so an
//! external dashboard can observe the engine. Ships one reference
//! implementation — a single JSON artifact — behind a [`MonitorSink`] trait,
//! so pipeline crates never depend on "JSON file" directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// The three stages that publish step records, per the monitoring schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extraction,
    Centralisation,
    Dispatching,
}

impl Stage {
    fn key(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Centralisation => "centralisation",
            Stage::Dispatching => "dispatching",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Success,
    Failure,
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GlobalStatus {
    Idle,
    Running,
    Error,
    Stopped,
}

/// Metrics attached to a step record. All fields are optional; a stage only
/// fills in the ones relevant to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_extracted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updates: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub message: String,
}

const MAX_ALERTS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringArtifact {
    pub status: GlobalStatus,
    pub last_run: Option<DateTime<Utc>>,
    pub extraction: HashMap<String, StepRecord>,
    pub centralisation: HashMap<String, StepRecord>,
    pub dispatching: HashMap<String, StepRecord>,
    pub alerts: Vec<Alert>,
}

impl Default for MonitoringArtifact {
    fn default() -> Self {
        Self {
            status: GlobalStatus::Idle,
            last_run: None,
            extraction: HashMap::new(),
            centralisation: HashMap::new(),
            dispatching: HashMap::new(),
            alerts: Vec::new(),
        }
    }
}

/// The interface every pipeline stage publishes progress through.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn publish(
        &self,
        stage: Stage,
        step: &str,
        status: StepStatus,
        metrics: Metrics,
        message: &str,
    ) -> Result<()>;

    async fn add_alert(&self, kind: &str, message: &str) -> Result<()>;

    async fn set_global_status(&self, status: GlobalStatus, last_run: Option<DateTime<Utc>>)
        -> Result<()>;

    async fn clear_alerts(&self) -> Result<()>;
}

/// Writes the whole-file JSON artifact the dashboard reads, at `path`.
/// Concurrent calls are serialized through an internal mutex and every
/// write replaces the file atomically (write to a sibling temp file, then
/// rename), so a reader can never observe a half-written file.
pub struct FileMonitorSink {
    path: PathBuf,
    state: Mutex<MonitoringArtifact>,
}

impl FileMonitorSink {
    /// Load the artifact at `path` if it exists, or initialize a fresh one
    /// (status `IDLE`, no alerts) and write it out immediately.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parse monitoring artifact: {}", path.display()))?,
            Err(_) => MonitoringArtifact::default(),
        };
        let sink = Self {
            path,
            state: Mutex::new(state),
        };
        sink.flush().await?;
        Ok(sink)
    }

    async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        write_atomic(&self.path, &*state).await
    }
}

async fn write_atomic(path: &Path, artifact: &MonitoringArtifact) -> Result<()> {
    let json = serde_json::to_string_pretty(artifact).context("serialize monitoring artifact")?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .with_context(|| format!("write temp monitoring file: {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename monitoring file into place: {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl MonitorSink for FileMonitorSink {
    async fn publish(
        &self,
        stage: Stage,
        step: &str,
        status: StepStatus,
        metrics: Metrics,
        message: &str,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let record = StepRecord {
                status,
                message: message.to_string(),
                timestamp: Utc::now(),
                metrics,
            };
            let bucket = match stage {
                Stage::Extraction => &mut state.extraction,
                Stage::Centralisation => &mut state.centralisation,
                Stage::Dispatching => &mut state.dispatching,
            };
            bucket.insert(step.to_string(), record);
        }
        self.flush().await
    }

    async fn add_alert(&self, kind: &str, message: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.alerts.insert(
                0,
                Alert {
                    timestamp: Utc::now(),
                    alert_type: kind.to_string(),
                    message: message.to_string(),
                },
            );
            state.alerts.truncate(MAX_ALERTS);
        }
        self.flush().await
    }

    async fn set_global_status(
        &self,
        status: GlobalStatus,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.status = status;
            if let Some(ts) = last_run {
                state.last_run = Some(ts);
            }
        }
        self.flush().await
    }

    async fn clear_alerts(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.alerts.clear();
        }
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alerts_stay_capped_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileMonitorSink::open(dir.path().join("sync_monitoring.json"))
            .await
            .unwrap();

        for i in 0..(MAX_ALERTS + 5) {
            sink.add_alert("TEST", &format!("alert {i}")).await.unwrap();
        }

        let state = sink.state.lock().await;
        assert_eq!(state.alerts.len(), MAX_ALERTS);
        assert_eq!(state.alerts[0].message, format!("alert {}", MAX_ALERTS + 4));
    }

    #[tokio::test]
    async fn publish_writes_step_record_under_its_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_monitoring.json");
        let sink = FileMonitorSink::open(&path).await.unwrap();

        sink.publish(
            Stage::Extraction,
            "CAS",
            StepStatus::Success,
            Metrics {
                rows_extracted: Some(12),
                duration_seconds: Some(0.5),
                ..Default::default()
            },
            "ok",
        )
        .await
        .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let artifact: MonitoringArtifact = serde_json::from_str(&raw).unwrap();
        let record = artifact.extraction.get("CAS").expect("step recorded");
        assert_eq!(record.status, StepStatus::Success);
        assert_eq!(record.metrics.rows_extracted, Some(12));
    }

    #[tokio::test]
    async fn reopening_an_existing_artifact_preserves_its_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_monitoring.json");
        {
            let sink = FileMonitorSink::open(&path).await.unwrap();
            sink.add_alert("WARNING", "first run").await.unwrap();
        }
        let sink = FileMonitorSink::open(&path).await.unwrap();
        let state = sink.state.lock().await;
        assert_eq!(state.alerts.len(), 1);
        assert_eq!(state.alerts[0].message, "first run");
    }
}
