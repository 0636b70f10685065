use crate::cluster::{Granularity, DEFAULT_MAX_CLUSTERS_PER_PASS};
use crate::fetch::DEFAULT_WINDOW_SIZE;
use crate::gapfill::DEFAULT_PROXIMITY_TOLERANCE_SECONDS;
use crate::reconciler::ReconcilerSettings;
use crate::trigger::TriggerSettings;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TABLE: &str = "sensor_readings";

fn setup_config_path() -> Option<PathBuf> {
    ["RECONCILER_SETUP_CONFIG_PATH", "FARM_SETUP_CONFIG_PATH"]
        .into_iter()
        .find_map(env_optional_string)
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    sensor_table: Option<String>,
    #[serde(default)]
    reconciler_window_size: Option<usize>,
    #[serde(default)]
    reconciler_granularity: Option<String>,
    #[serde(default)]
    backend_host: Option<String>,
    #[serde(default)]
    backend_port: Option<u16>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "sensor-reconciler failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "sensor-reconciler failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Setup-file values only land where the matching env var was left unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("RECONCILER_TABLE") {
        if let Some(table) = overrides
            .sensor_table
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.table = table.to_string();
        }
    }
    if env_allows("RECONCILER_WINDOW_SIZE") {
        if let Some(value) = overrides.reconciler_window_size.filter(|v| *v != 0) {
            config.window_size = value;
        }
    }
    if env_allows("RECONCILER_GRANULARITY") {
        if let Some(value) = overrides
            .reconciler_granularity
            .as_deref()
            .and_then(|raw| raw.parse::<Granularity>().ok())
        {
            config.granularity = value;
        }
    }
    if env_allows("RECONCILER_LIVENESS_HOST") {
        if let Some(host) = overrides
            .backend_host
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.liveness_host = host.to_string();
        }
    }
    if env_allows("RECONCILER_LIVENESS_PORT") {
        if let Some(port) = overrides.backend_port.filter(|v| *v != 0) {
            config.liveness_port = port;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub table: String,
    pub window_size: usize,
    pub max_clusters_per_pass: usize,
    pub granularity: Granularity,
    pub proximity_tolerance_seconds: u64,
    pub interval_seconds: u64,
    pub liveness_poll_seconds: u64,
    pub restart_cooldown_seconds: u64,
    pub liveness_host: String,
    pub liveness_port: u16,
    pub probe_timeout_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = setup_config_path()
            .as_deref()
            .and_then(load_setup_config_overrides);

        let database_url = env_optional_string("RECONCILER_DATABASE_URL")
            .or_else(|| env_optional_string("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("RECONCILER_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let granularity = match env_optional_string("RECONCILER_GRANULARITY") {
            Some(raw) => raw
                .parse::<Granularity>()
                .map_err(anyhow::Error::msg)
                .context("invalid RECONCILER_GRANULARITY")?,
            None => Granularity::default(),
        };

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("RECONCILER_DB_POOL_SIZE", 4),
            table: env_optional_string("RECONCILER_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            window_size: env_parse("RECONCILER_WINDOW_SIZE", DEFAULT_WINDOW_SIZE),
            max_clusters_per_pass: env_parse(
                "RECONCILER_MAX_CLUSTERS_PER_PASS",
                DEFAULT_MAX_CLUSTERS_PER_PASS,
            ),
            granularity,
            proximity_tolerance_seconds: env_parse(
                "RECONCILER_PROXIMITY_TOLERANCE_SECONDS",
                DEFAULT_PROXIMITY_TOLERANCE_SECONDS as u64,
            ),
            interval_seconds: env_parse("RECONCILER_INTERVAL_SECONDS", 300),
            liveness_poll_seconds: env_parse("RECONCILER_LIVENESS_POLL_SECONDS", 30),
            restart_cooldown_seconds: env_parse("RECONCILER_RESTART_COOLDOWN_SECONDS", 120),
            liveness_host: env_optional_string("RECONCILER_LIVENESS_HOST")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            liveness_port: env_parse("RECONCILER_LIVENESS_PORT", 5000),
            probe_timeout_ms: env_parse("RECONCILER_PROBE_TIMEOUT_MS", 2000),
            otlp_endpoint: env_optional_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| {
                env_optional_string(key).is_none()
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.table)?;
        if self.window_size == 0 {
            anyhow::bail!("RECONCILER_WINDOW_SIZE must be greater than zero");
        }
        if self.interval_seconds == 0 || self.liveness_poll_seconds == 0 {
            anyhow::bail!("trigger periods must be greater than zero");
        }
        Ok(())
    }

    pub fn proximity_tolerance(&self) -> Duration {
        Duration::from_secs(self.proximity_tolerance_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_secs(self.liveness_poll_seconds)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            window_size: self.window_size,
            max_clusters_per_pass: self.max_clusters_per_pass,
            granularity: self.granularity,
            proximity_tolerance: self.proximity_tolerance(),
        }
    }

    pub fn trigger_settings(&self) -> TriggerSettings {
        TriggerSettings {
            interval: self.interval(),
            liveness_poll: self.liveness_poll(),
            restart_cooldown: self.restart_cooldown(),
        }
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

/// The table name is interpolated into SQL, so only plain (optionally schema-qualified)
/// identifiers are accepted.
fn validate_table_name(table: &str) -> Result<()> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|part| valid_part(part)) {
        anyhow::bail!("invalid RECONCILER_TABLE '{table}'");
    }
    Ok(())
}

fn env_optional_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}
