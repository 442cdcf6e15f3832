//! Environment-variable configuration loading.
//!
//! Configuration is environment-like key/value, all optional with defaults
//! — no layered-file merge, just `std::env::var` reads with sane fallbacks.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use sync_types::ConnectionGroup;

pub const ENV_INTERVAL_MINUTES: &str = "SYNC_INTERVAL_MINUTES";
pub const ENV_MAX_RETRIES: &str = "MAX_RETRIES";
pub const ENV_RETRY_DELAY_SECONDS: &str = "RETRY_DELAY_SECONDS";
pub const ENV_INTEGRITY_SCOPE: &str = "SYNC_INTEGRITY_SCOPE";
pub const ENV_MONITORING_FILE: &str = "SYNC_MONITORING_FILE";
pub const ENV_FORCE_RUN_FILE: &str = "SYNC_FORCE_RUN_FILE";

const DEFAULT_INTERVAL_MINUTES: u64 = 15;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECONDS: u64 = 10;
const DEFAULT_MONITORING_FILE: &str = "sync_monitoring.json";
const DEFAULT_FORCE_RUN_FILE: &str = "force_sync.flag";

/// Whether the integrity check compares against every CRM row for a dossier
/// (`AllRows`) or only the active ones (`ActiveOnly`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityScope {
    AllRows,
    ActiveOnly,
}

impl IntegrityScope {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "ALL_ROWS" | "ALLROWS" => Ok(Self::AllRows),
            "ACTIVE_ONLY" | "ACTIVEONLY" => Ok(Self::ActiveOnly),
            other => anyhow::bail!("unrecognized {ENV_INTEGRITY_SCOPE} value: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub group_1: ConnectionGroup,
    pub group_2: ConnectionGroup,
    pub crm: ConnectionGroup,
    pub sync_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub integrity_scope: IntegrityScope,
    pub monitoring_file: String,
    pub force_run_file: String,
}

impl EngineConfig {
    /// Load every connection group and engine-wide tunable from the process
    /// environment, falling back to sane defaults.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            group_1: connection_group_from_env("1", &["CAS"])?,
            group_2: connection_group_from_env("2", &["CMGP", "PHILEA"])?,
            crm: connection_group_from_env("CRM", &["CRM"])?,
            sync_interval: Duration::from_secs(
                env_u64(ENV_INTERVAL_MINUTES, DEFAULT_INTERVAL_MINUTES)? * 60,
            ),
            max_retries: env_u32(ENV_MAX_RETRIES, DEFAULT_MAX_RETRIES)?,
            retry_delay: Duration::from_secs(env_u64(
                ENV_RETRY_DELAY_SECONDS,
                DEFAULT_RETRY_DELAY_SECONDS,
            )?),
            integrity_scope: match env::var(ENV_INTEGRITY_SCOPE) {
                Ok(raw) => IntegrityScope::parse(&raw)?,
                Err(_) => IntegrityScope::AllRows,
            },
            monitoring_file: env::var(ENV_MONITORING_FILE)
                .unwrap_or_else(|_| DEFAULT_MONITORING_FILE.to_string()),
            force_run_file: env::var(ENV_FORCE_RUN_FILE)
                .unwrap_or_else(|_| DEFAULT_FORCE_RUN_FILE.to_string()),
        })
    }
}

fn connection_group_from_env(suffix: &str, default_schemas: &[&str]) -> Result<ConnectionGroup> {
    let user_key = format!("DB_USER_{suffix}");
    let password_key = format!("DB_PASSWORD_{suffix}");
    let dsn_key = format!("DB_DSN_{suffix}");
    let schemas_key = format!("DB_SCHEMAS_{suffix}");

    let user = env::var(&user_key).unwrap_or_default();
    let password = env::var(&password_key).unwrap_or_default();
    let dsn = env::var(&dsn_key)
        .with_context(|| format!("{dsn_key} must be set (host:port/dbname)"))?;

    let schemas = match env::var(&schemas_key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default_schemas.iter().map(|s| s.to_string()).collect(),
    };

    Ok(ConnectionGroup {
        name: format!("group_{suffix}"),
        database_url: postgres_url(&user, &password, &dsn),
        schemas,
    })
}

/// Assembles a Postgres connection URL from the three-part credential shape
/// (user, password, DSN) each connection group is configured with.
fn postgres_url(user: &str, password: &str, dsn: &str) -> String {
    if user.is_empty() && password.is_empty() {
        format!("postgres://{dsn}")
    } else {
        format!("postgres://{user}:{password}@{dsn}")
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("{key} must be a u64, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("{key} must be a u32, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
