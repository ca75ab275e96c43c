//! Application configuration management.
//!
//! Configuration is stored at `~/.config/coursekeep/config.json`. Every
//! field has a default, so a missing file is not an error.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheConfig, CACHE_STORAGE_KEY, DEFAULT_CACHE_MAX_AGE_DAYS, DEFAULT_CACHE_MAX_ITEMS};
use crate::events::DEFAULT_BUS_CAPACITY;
use crate::progress::{StoreConfig, DEFAULT_CASCADE_DELAY, DEFAULT_RECORD_TTL_DAYS};
use crate::storage::file::DEFAULT_WATCH_INTERVAL;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "coursekeep";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides `data_dir` when set.
pub const DATA_DIR_ENV: &str = "COURSEKEEP_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Key prefix, e.g. `tajweed` gives `tajweed_lesson_c1_u1_l1`.
    pub namespace: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub record_ttl_days: i64,
    /// 0 recomputes parents synchronously.
    pub cascade_delay_ms: u64,
    pub cache_max_items: usize,
    pub cache_max_age_hours: i64,
    pub watch_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            data_dir: None,
            record_ttl_days: DEFAULT_RECORD_TTL_DAYS,
            cascade_delay_ms: DEFAULT_CASCADE_DELAY.as_millis() as u64,
            cache_max_items: DEFAULT_CACHE_MAX_ITEMS,
            cache_max_age_hours: DEFAULT_CACHE_MAX_AGE_DAYS * 24,
            watch_interval_ms: DEFAULT_WATCH_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the record files: `$COURSEKEEP_DATA_DIR`, then the
    /// configured `data_dir`, then the platform data directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn watch_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.watch_interval_ms.max(1))
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            namespace: self.namespace.clone().filter(|ns| !ns.is_empty()),
            record_ttl: Duration::days(self.record_ttl_days.max(1)),
            cascade_delay: (self.cascade_delay_ms > 0)
                .then(|| StdDuration::from_millis(self.cascade_delay_ms)),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            sweep_on_open: true,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_items: self.cache_max_items,
            max_age: Duration::hours(self.cache_max_age_hours.max(1)),
            storage_key: CACHE_STORAGE_KEY.to_string(),
        }
    }
}
