//! Configuration for pledge-scheduler

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::processor::ProcessorConfig;
use crate::settings::TenantPledgeSettings;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pledge-scheduler")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and the generated config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Explicit database path (defaults to `<storage_dir>/pledges.db`)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Upper bound on one gateway call, in seconds
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,

    /// Pledges processed concurrently within a sweep (1 = sequential)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Claims older than this may be taken over by another run
    #[serde(default = "default_claim_stale_after")]
    pub claim_stale_after_secs: u64,

    /// How long tenant settings are cached
    #[serde(default = "default_settings_cache_ttl")]
    pub settings_cache_ttl_secs: u64,

    /// Interval between sweeps in daemon mode
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Policy for tenants that never stored their own
    #[serde(default)]
    pub default_tenant_settings: TenantPledgeSettings,
}

fn default_gateway_timeout() -> u64 {
    30
}

fn default_worker_count() -> usize {
    1
}

fn default_claim_stale_after() -> u64 {
    900
}

fn default_settings_cache_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            db_path: None,
            gateway_timeout_secs: default_gateway_timeout(),
            worker_count: default_worker_count(),
            claim_stale_after_secs: default_claim_stale_after(),
            settings_cache_ttl_secs: default_settings_cache_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            default_tenant_settings: TenantPledgeSettings::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("pledges.db"))
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn settings_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.settings_cache_ttl_secs)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            gateway_timeout: Duration::from_secs(self.gateway_timeout_secs.max(1)),
            claim_stale_after: Duration::from_secs(self.claim_stale_after_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_takes_defaults() {
        let config: Config = toml::from_str(
            r#"
            storage_dir = "/var/lib/pledges"
            worker_count = 4

            [default_tenant_settings]
            maxFailuresBeforePause = 5
            retryIntervalHours = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.gateway_timeout_secs, 30);
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/pledges/pledges.db"));
        assert_eq!(config.default_tenant_settings.max_failures_before_pause, 5);
        assert_eq!(config.processor_config().claim_stale_after, Duration::from_secs(900));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.db_path = Some(dir.path().join("custom.db"));
        config.sweep_interval_secs = 60;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.database_path(), dir.path().join("custom.db"));
        assert_eq!(loaded.sweep_interval(), Duration::from_secs(60));
    }
}
