//! Store configuration (`charmstore.toml`) loading.
//!
//! All fields are optional and fall back to the built-in defaults, so an
//! absent config file is valid. Durations accept either humantime strings
//! (`"10m"`) or integer seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::lock::UPDATE_TIMEOUT;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "charmstore.toml";

/// Default bound on each token cache generation.
pub const DEFAULT_TOKEN_CACHE_SIZE: usize = 1024;

/// Default merge window for counter documents.
pub const DEFAULT_COUNTER_WINDOW: Duration = Duration::from_secs(60);

/// Get the config file path for a directory.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Deserialize a Duration from either a humantime string or integer seconds.
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Serialize a Duration as seconds so it roundtrips with deserialize_duration.
fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

/// Complete store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub lock: LockConfig,
    pub stats: StatsConfig,
}

/// Update-lock tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Age after which a lock holder is considered gone.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: UPDATE_TIMEOUT,
        }
    }
}

/// Counter-engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Bound on each of the two token cache generations.
    pub token_cache_size: usize,
    /// Merge window for counter documents. Must stay under one day so the
    /// smallest bucketing granularity still aggregates cleanly.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub counter_window: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            token_cache_size: DEFAULT_TOKEN_CACHE_SIZE,
            counter_window: DEFAULT_COUNTER_WINDOW,
        }
    }
}

impl StoreConfig {
    /// Load configuration from `dir`, falling back to defaults when no
    /// config file exists.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = config_path(dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engines cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.stats.token_cache_size == 0 {
            bail!("stats.token_cache_size must be at least 1");
        }
        if self.stats.counter_window.is_zero() {
            bail!("stats.counter_window must be positive");
        }
        if self.stats.counter_window >= Duration::from_secs(24 * 60 * 60) {
            bail!("stats.counter_window must be shorter than one day");
        }
        if self.lock.timeout.is_zero() {
            bail!("lock.timeout must be positive");
        }
        Ok(())
    }
}
