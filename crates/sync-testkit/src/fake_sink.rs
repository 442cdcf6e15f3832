use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sync_monitor::{GlobalStatus, Metrics, MonitorSink, Stage, StepStatus};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Published {
    pub stage: &'static str,
    pub step: String,
    pub status: StepStatus,
    pub metrics: Metrics,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RecordedAlert {
    pub kind: String,
    pub message: String,
}

/// A [`MonitorSink`] that just remembers every call, for assertions in
/// pipeline-crate unit tests.
#[derive(Default)]
pub struct FakeSink {
    state: Mutex<FakeSinkState>,
}

#[derive(Default)]
struct FakeSinkState {
    published: Vec<Published>,
    alerts: Vec<RecordedAlert>,
    status: Option<GlobalStatus>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<Published> {
        self.state.lock().await.published.clone()
    }

    pub async fn alerts(&self) -> Vec<RecordedAlert> {
        self.state.lock().await.alerts.clone()
    }

    pub async fn status(&self) -> Option<GlobalStatus> {
        self.state.lock().await.status
    }
}

#[async_trait]
impl MonitorSink for FakeSink {
    async fn publish(
        &self,
        stage: Stage,
        step: &str,
        status: StepStatus,
        metrics: Metrics,
        message: &str,
    ) -> Result<()> {
        let stage_name = match stage {
            Stage::Extraction => "extraction",
            Stage::Centralisation => "centralisation",
            Stage::Dispatching => "dispatching",
        };
        self.state.lock().await.published.push(Published {
            stage: stage_name,
            step: step.to_string(),
            status,
            metrics,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn add_alert(&self, kind: &str, message: &str) -> Result<()> {
        self.state.lock().await.alerts.push(RecordedAlert {
            kind: kind.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn set_global_status(
        &self,
        status: GlobalStatus,
        _last_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.state.lock().await.status = Some(status);
        Ok(())
    }

    async fn clear_alerts(&self) -> Result<()> {
        self.state.lock().await.alerts.clear();
        Ok(())
    }
}
