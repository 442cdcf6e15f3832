//! Cycle scheduling: runs cycles back-to-back forever, sleeping between
//! them while watching the force-run flag file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sync_db::DbDriver;
use sync_dispatch::DispatchTarget;
use sync_monitor::{GlobalStatus, MonitorSink};

use crate::cycle::{run_cycle_guarded, CycleConfig, ExtractionSource};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one running instance of the engine needs to keep cycling.
/// Built once by `sync-cli`'s `run` subcommand and driven by
/// [`Engine::run_forever`], which the caller races against a termination
/// signal with `tokio::select!`.
pub struct Engine {
    pub sink: Arc<dyn MonitorSink>,
    pub sources: Vec<ExtractionSource>,
    pub crm_driver: Arc<dyn DbDriver>,
    pub qualified_crm_table: String,
    pub dispatch_targets: Vec<DispatchTarget>,
    pub cfg: CycleConfig,
    pub sync_interval: Duration,
    pub force_run_file: PathBuf,
}

impl Engine {
    /// Loops cycles forever: run one, clear the force-run flag, sleep up to
    /// `sync_interval` (observing the flag so a force-run request shortens
    /// the wait), repeat. Ordinary cycle failures never stop the loop —
    /// only an external cancellation of this future does (see
    /// `sync-cli::run`, which races this against a signal future).
    pub async fn run_forever(&self) -> std::convert::Infallible {
        loop {
            let outcome = run_cycle_guarded(
                self.sink.as_ref(),
                &self.sources,
                self.crm_driver.as_ref(),
                &self.qualified_crm_table,
                self.dispatch_targets.clone(),
                &self.cfg,
            )
            .await;

            if let Err(err) = outcome {
                tracing::error!(error = %err, "cycle ended in a critical failure");
            }

            clear_force_run_flag(&self.force_run_file).await;
            sleep_observing_force_run(self.sync_interval, &self.force_run_file).await;
        }
    }
}

/// Publish `STOPPED` — called by `sync-cli` once its signal-select resolves
/// in favor of the signal, not the cycle loop.
pub async fn publish_stopped(sink: &dyn MonitorSink) -> anyhow::Result<()> {
    sink.set_global_status(GlobalStatus::Stopped, None).await
}

async fn clear_force_run_flag(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "cleared force-run flag"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "could not clear force-run flag"),
    }
}

/// Sleeps in one-second increments for up to `total`, returning early the
/// moment `flag_path` exists.
async fn sleep_observing_force_run(total: Duration, flag_path: &Path) {
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        if tokio::fs::try_exists(flag_path).await.unwrap_or(false) {
            tracing::info!(path = %flag_path.display(), "force-run trigger observed, starting next cycle early");
            return;
        }
        let step = POLL_INTERVAL.min(total - elapsed);
        tokio::time::sleep(step).await;
        elapsed += step;
    }
}
