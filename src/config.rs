/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use toml_edit::{DocumentMut, Item, Value};

use crate::gateway::documents::DocumentStoreConfig;
use crate::gateway::timeseries::GatewayConfig;
use crate::orchestrator::OrchestratorSettings;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/bms-orchestratord";
const DEFAULT_CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_TIME_SERIES_URL: &str = "http://127.0.0.1:8086";
const DEFAULT_DOCUMENT_STORE_URL: &str = "http://127.0.0.1:5984";
const DEFAULT_CACHE_URL: &str = "memory://local";

/// Everything read once at boot from `config.toml` (§A.4 "Configuration
/// surface"), hot-reloadable only via restart -- the same limitation the
/// teacher documents for `CoolerControlSettings`.
pub struct Config {
    path: PathBuf,
    document: DocumentMut,
}

impl Config {
    /// Loads `config.toml` from `DEFAULT_CONFIG_DIR`, creating a
    /// defaults-only file if none exists yet.
    pub async fn load_config_file() -> Result<Self> {
        let config_dir = Path::new(DEFAULT_CONFIG_DIR);
        if !config_dir.exists() {
            info!("config directory doesn't exist, creating it: {DEFAULT_CONFIG_DIR}");
            tokio::fs::create_dir_all(config_dir)
                .await
                .with_context(|| format!("creating {DEFAULT_CONFIG_DIR}"))?;
        }
        let path = config_dir.join(DEFAULT_CONFIG_FILE_NAME);
        Self::load_from_path(path).await
    }

    pub async fn load_from_path(path: PathBuf) -> Result<Self> {
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.trim().is_empty() => contents,
            Ok(_) => {
                warn!("config file at {} is empty, using defaults", path.display());
                String::new()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no config file found at {}, using defaults", path.display());
                String::new()
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let document: DocumentMut = contents
            .parse()
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Config { path, document })
    }

    /// Writes the in-memory document back to disk, verifying write-ability
    /// (exercised by `--config`).
    pub async fn save_config_file(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&self.path, self.document.to_string())
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    fn table(&self, name: &str) -> Option<&Item> {
        self.document.get(name)
    }

    fn string_in(&self, table: &str, key: &str, default: &str) -> String {
        self.table(table)
            .and_then(Item::as_table)
            .and_then(|t| t.get(key))
            .and_then(Item::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    fn integer_in(&self, table: &str, key: &str, default: i64) -> i64 {
        self.table(table)
            .and_then(Item::as_table)
            .and_then(|t| t.get(key))
            .and_then(Item::as_integer)
            .unwrap_or(default)
    }

    /// Validates the loaded document is at least well-formed TOML and every
    /// duration/concurrency field is positive (the `--config` path).
    pub fn validate(&self) -> Result<()> {
        let settings = self.orchestrator_settings();
        anyhow::ensure!(settings.initial_batch_size > 0, "initial_batch_size must be > 0");
        anyhow::ensure!(
            settings.per_location_concurrency > 0,
            "per_location_concurrency must be > 0"
        );
        anyhow::ensure!(!settings.tick_interval.is_zero(), "tick_interval must be > 0");
        anyhow::ensure!(!settings.algorithm_deadline.is_zero(), "algorithm_deadline must be > 0");
        Ok(())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            initial_batch_size: self.integer_in("orchestrator", "initial_batch_size", 3) as usize,
            per_location_concurrency: self.integer_in("orchestrator", "per_location_concurrency", 3) as usize,
            algorithm_deadline: Duration::from_millis(
                self.integer_in("orchestrator", "algorithm_deadline_ms", 5_000) as u64,
            ),
            tick_interval: Duration::from_millis(self.integer_in("orchestrator", "tick_interval_ms", 1_000) as u64),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.string_in("time_series", "url", DEFAULT_TIME_SERIES_URL),
            query_timeout: Duration::from_millis(self.integer_in("time_series", "query_timeout_ms", 2_000) as u64),
            write_timeout: Duration::from_millis(self.integer_in("time_series", "write_timeout_ms", 2_000) as u64),
            max_retries: self.integer_in("time_series", "max_retries", 3) as u32,
            retry_delay: Duration::from_millis(self.integer_in("time_series", "retry_delay_ms", 250) as u64),
            deadline: Duration::from_millis(self.integer_in("time_series", "deadline_ms", 10_000) as u64),
        }
    }

    pub fn document_store_config(&self) -> DocumentStoreConfig {
        DocumentStoreConfig {
            base_url: self.string_in("document_store", "url", DEFAULT_DOCUMENT_STORE_URL),
            request_timeout: Duration::from_millis(
                self.integer_in("document_store", "request_timeout_ms", 2_000) as u64
            ),
        }
    }

    pub fn cache_url(&self) -> String {
        self.string_in("cache", "url", DEFAULT_CACHE_URL)
    }

    pub fn ui_queue_concurrency(&self) -> usize {
        self.integer_in("ui_commands", "concurrency", 5) as usize
    }
}

/// Small helper kept for symmetry with the teacher's `toml_edit::Value`
/// accessors used when writing (not just reading) settings; unused today but
/// the natural extension point for a future `PUT /api/config` surface.
#[allow(dead_code)]
fn as_table_value(value: &Value) -> Option<&str> {
    value.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("bms-orchestratord-test-{}.toml", std::process::id()));
        let config = Config::load_from_path(path).await.unwrap();
        let settings = config.orchestrator_settings();
        assert_eq!(settings.initial_batch_size, 3);
        assert_eq!(settings.per_location_concurrency, 3);
    }

    #[tokio::test]
    async fn reads_overridden_values() {
        let dir = std::env::temp_dir().join(format!("bms-orchestratord-test-dir-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.toml");
        tokio::fs::write(
            &path,
            "[orchestrator]\ninitial_batch_size = 7\ntick_interval_ms = 60000\n",
        )
        .await
        .unwrap();
        let config = Config::load_from_path(path).await.unwrap();
        let settings = config.orchestrator_settings();
        assert_eq!(settings.initial_batch_size, 7);
        assert_eq!(settings.tick_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn validate_rejects_zero_durations() {
        let dir = std::env::temp_dir().join(format!("bms-orchestratord-test-invalid-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.toml");
        tokio::fs::write(&path, "[orchestrator]\ntick_interval_ms = 0\n")
            .await
            .unwrap();
        let config = Config::load_from_path(path).await.unwrap();
        assert!(config.validate().is_err());
    }
}
