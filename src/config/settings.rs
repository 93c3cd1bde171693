/*
* Configuration
* -------------
* Layered, lowest priority first:
*
* 1. Hardcoded defaults (below)
* 2. $CONFIG_PATH/default.toml (optional)
* 3. $CONFIG_PATH/local.toml (optional, machine specific)
* 4. PROXMIGRATE_* environment variables, `__` between section and key,
*    e.g. PROXMIGRATE_API__BASE_URL=http://balancer:5000
*
* `--config <file>` on the command line replaces layers 2 and 3 with that file.
*/

use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::TrackerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub api: ApiSettings,
    pub polling: PollingSettings,
    pub refresh: RefreshSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    pub interval_secs: u64,
    pub max_wait_secs: u64,
    pub completion_display_secs: u64,
    pub max_failures: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSettings {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl From<&PollingSettings> for TrackerConfig {
    fn from(polling: &PollingSettings) -> Self {
        TrackerConfig {
            // a zero interval would spin against the remote service
            poll_interval: Duration::from_secs(polling.interval_secs.max(1)),
            max_wait: Duration::from_secs(polling.max_wait_secs),
            completion_display: Duration::from_secs(polling.completion_display_secs),
            max_failures: polling.max_failures,
        }
    }
}

impl LoggingSettings {
    pub fn max_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("api.base_url", "http://127.0.0.1:5000")?
        .set_default("api.request_timeout_secs", 15)?
        .set_default("polling.interval_secs", 3)?
        .set_default("polling.max_wait_secs", 600)?
        .set_default("polling.completion_display_secs", 5)?
        .set_default("polling.max_failures", 256)?
        .set_default("refresh.interval_secs", 30)?
        .set_default("logging.level", "info")
}

fn environment() -> Environment {
    Environment::with_prefix("PROXMIGRATE")
        .prefix_separator("_")
        .separator("__")
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        with_defaults()?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());

        with_defaults()?
            .add_source(File::from(path))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        api: ApiSettings {
            base_url: "http://127.0.0.1:5000".to_string(),
            request_timeout_secs: 15,
        },
        polling: PollingSettings {
            interval_secs: 3,
            max_wait_secs: 600,
            completion_display_secs: 5,
            max_failures: 256,
        },
        refresh: RefreshSettings { interval_secs: 30 },
        logging: LoggingSettings {
            level: "info".to_string(),
        },
    }
}
