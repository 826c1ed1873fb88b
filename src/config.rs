//! Application configuration
//!
//! A small TOML file holds the catalogue coordinates and run tuning knobs.
//! Everything tenant-specific lives in the catalogue store, not here.

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_VAR: &str = "OUTBOUND_SYNC_CONFIG";

const CONFIG_FILE: &str = "outbound-sync.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Catalogue database holding customer_info and api_list.
    pub catalog_db_url: String,
    /// Tenant database URL template; `{database}` is replaced with the
    /// tenant's database name from its access info.
    pub tenant_db_url: String,
    /// Which credential rows to read: production (`Y`) or test (`N`).
    #[serde(default = "default_prod")]
    pub prod: String,
    /// Run-groups starting with this prefix name a single table.
    #[serde(default = "default_single_table_prefix")]
    pub single_table_prefix: String,
    /// Budget for the run's token and API work, in seconds.
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,
    /// Log file, truncated on each run.
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

fn default_prod() -> String {
    "N".to_string()
}

fn default_single_table_prefix() -> String {
    "HFS".to_string()
}

fn default_run_deadline_secs() -> u64 {
    600
}

fn default_log_file() -> String {
    "outbound-sync.log".to_string()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE));
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid config file")
    }

    /// Concrete tenant database URL for one customer's database name.
    pub fn tenant_db_url_for(&self, database_name: &str) -> String {
        self.tenant_db_url.replace("{database}", database_name)
    }
}
