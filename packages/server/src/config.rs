use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::kernel::jobs::PipelineConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub max_concurrency: usize,
    /// Vendored analysis toolchain, working directory of every stage
    pub vendor_root: PathBuf,
    pub python_executable: String,
    pub kill_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let max_concurrency: usize = var("MEDIAMONITOR_MAX_CONCURRENCY", "1")
            .trim()
            .parse()
            .context("MEDIAMONITOR_MAX_CONCURRENCY must be a positive number")?;
        let kill_grace_secs: u64 = var("MEDIAMONITOR_KILL_GRACE_SECS", "10")
            .trim()
            .parse()
            .context("MEDIAMONITOR_KILL_GRACE_SECS must be a number of seconds")?;

        Ok(Self {
            database_url: var("MEDIAMONITOR_DB_URL", "sqlite://data/mediamonitor.db"),
            port: var("PORT", "8000")
                .trim()
                .parse()
                .context("PORT must be a valid number")?,
            max_concurrency: max_concurrency.max(1),
            vendor_root: PathBuf::from(var("MEDIAMONITOR_VENDOR_ROOT", "vendor/BettaFish")),
            python_executable: var("PYTHON_EXECUTABLE", "python"),
            kill_grace: Duration::from_secs(kill_grace_secs),
        })
    }

    /// Stage launch settings derived from this configuration.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::builder()
            .toolchain_root(self.vendor_root.clone())
            .interpreter(self.python_executable.clone())
            .kill_grace(self.kill_grace)
            .build()
    }
}
