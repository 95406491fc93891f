use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const MIN_POLL_INTERVAL_MS: u64 = 1000;

/// The setup file is opt-in; without `ENGINE_SETUP_CONFIG_PATH` only the environment is read.
fn setup_config_path(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    lookup("ENGINE_SETUP_CONFIG_PATH").map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    offline_threshold_seconds: Option<u64>,
    #[serde(default)]
    engine_poll_interval_ms: Option<u64>,
    #[serde(default)]
    engine_cycle_deadline_ms: Option<u64>,
    #[serde(default)]
    engine_store_timeout_ms: Option<u64>,
    #[serde(default)]
    engine_max_window_keys: Option<usize>,
    #[serde(default)]
    engine_tenants: Option<Vec<String>>,
}

/// Reads the setup file if present. Unreadable or malformed files are logged and ignored.
pub fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "alert-engine failed to read setup config; using env defaults"
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
                "alert-engine failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub poll_interval_ms: u64,
    pub cycle_deadline_ms: Option<u64>,
    pub store_timeout_ms: u64,
    pub staleness_threshold_seconds: u64,
    pub max_window_keys: usize,
    pub tenants: Vec<Uuid>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let lookup = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let overrides =
            setup_config_path(&lookup).and_then(|path| load_setup_config_overrides(&path));
        Self::from_sources(&lookup, overrides.as_ref())
    }

    /// Builds the config from a variable lookup plus optional setup-file
    /// overrides. A variable that is set always wins over the setup file.
    pub fn from_sources(
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: Option<&SetupConfigOverrides>,
    ) -> Result<Self> {
        let overrides = overrides.cloned().unwrap_or_default();

        let database_url = lookup("ENGINE_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .or_else(|| {
                overrides
                    .database_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(ToOwned::to_owned)
            })
            .context("ENGINE_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

        let db_pool_size = lookup("ENGINE_DB_POOL_SIZE")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let poll_interval_ms = parsed("ENGINE_POLL_INTERVAL_MS")
            .or(overrides.engine_poll_interval_ms.filter(|v| *v != 0))
            .unwrap_or(30_000)
            .max(MIN_POLL_INTERVAL_MS);
        let cycle_deadline_ms = parsed("ENGINE_CYCLE_DEADLINE_MS")
            .or(overrides.engine_cycle_deadline_ms)
            .filter(|v| *v != 0);
        let store_timeout_ms = parsed("ENGINE_STORE_TIMEOUT_MS")
            .or(overrides.engine_store_timeout_ms.filter(|v| *v != 0))
            .unwrap_or(5_000);
        let staleness_threshold_seconds = parsed("ENGINE_STALENESS_THRESHOLD_SECONDS")
            .or(overrides.offline_threshold_seconds.filter(|v| *v != 0))
            .unwrap_or(300);
        let max_window_keys = lookup("ENGINE_MAX_WINDOW_KEYS")
            .and_then(|v| v.parse::<usize>().ok())
            .or(overrides.engine_max_window_keys.filter(|v| *v != 0))
            .unwrap_or(50_000);

        let tenants = match lookup("ENGINE_TENANTS") {
            Some(raw) => parse_tenants(raw.split(','))?,
            None => parse_tenants(overrides.engine_tenants.iter().flatten().map(String::as_str))?,
        };
        let otlp_endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            database_url,
            db_pool_size,
            poll_interval_ms,
            cycle_deadline_ms,
            store_timeout_ms,
            staleness_threshold_seconds,
            max_window_keys,
            tenants,
            otlp_endpoint,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Soft per-tenant deadline; never later than the next tick.
    pub fn cycle_deadline(&self) -> Duration {
        let deadline_ms = self
            .cycle_deadline_ms
            .unwrap_or(self.poll_interval_ms)
            .min(self.poll_interval_ms);
        Duration::from_millis(deadline_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn parse_tenants<'a>(raw: impl Iterator<Item = &'a str>) -> Result<Vec<Uuid>> {
    let mut tenants = Vec::new();
    for value in raw.map(str::trim).filter(|value| !value.is_empty()) {
        let tenant = Uuid::parse_str(value)
            .with_context(|| format!("invalid tenant id '{value}' in tenant allowlist"))?;
        if !tenants.contains(&tenant) {
            tenants.push(tenant);
        }
    }
    Ok(tenants)
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
