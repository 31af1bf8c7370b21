use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    error::{AggregatorError, Result},
    plan::{MeteringPlanConfig, RatingPlanConfig, StaticPlanCatalog},
    time_window::Slack,
};

pub const SLACK_ENV: &str = "USAGE_AGGREGATOR_SLACK";
pub const LOG_FILTER_ENV: &str = "USAGE_AGGREGATOR_LOG";
const CONFIG_DIR_NAME: &str = ".usage-aggregator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            ansi: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Extra consumer retention past the two month baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<Slack>,
    /// Bearer token forwarded to plan lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_token: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metering_plans: Vec<MeteringPlanConfig>,
    #[serde(default)]
    pub rating_plans: Vec<RatingPlanConfig>,
}

impl AggregatorConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Applies `USAGE_AGGREGATOR_SLACK` and `USAGE_AGGREGATOR_LOG`.
    pub fn apply_env(&mut self) {
        if let Ok(value) = env::var(SLACK_ENV) {
            self.apply_slack_override(&value);
        }
        if let Ok(filter) = env::var(LOG_FILTER_ENV) {
            if !filter.trim().is_empty() {
                self.logging.filter = filter;
            }
        }
    }

    fn apply_slack_override(&mut self, value: &str) {
        if value.trim().is_empty() {
            return;
        }
        match value.parse::<Slack>() {
            Ok(slack) => self.slack = Some(slack),
            Err(err) => warn!("ignoring {SLACK_ENV}: {err}"),
        }
    }

    pub fn plan_catalog(&self) -> StaticPlanCatalog {
        StaticPlanCatalog::from_config(&self.metering_plans, &self.rating_plans)
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = default_config_root()?;
    path.push("config.toml");
    Ok(path)
}

/// Reads the configuration at `path` (or the default location), falling back
/// to defaults when no file exists, then applies environment overrides.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(AggregatorConfig, PathBuf)> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    let mut config = if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        AggregatorConfig::from_toml(&contents)?
    } else {
        AggregatorConfig::default()
    };
    config.apply_env();
    Ok((config, config_path))
}

fn default_config_root() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        Ok(home.join(CONFIG_DIR_NAME))
    } else {
        env::current_dir()
            .map(|dir| dir.join(CONFIG_DIR_NAME))
            .map_err(|err| AggregatorError::Config(err.to_string()))
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
