//! Configuration system for Tango.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.
//! Configuration is loaded from `~/.config/tango/config.toml` and/or
//! `tango.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Name of the workspace-local configuration file.
pub const WORKSPACE_CONFIG_FILE: &str = "tango.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TangoConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub dataloader: DataLoaderSettings,
    #[serde(default)]
    pub eval: EvalSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where step results and work directories live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory of a local workspace. `None` keeps everything in memory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from(".tango")),
        }
    }
}

/// Compute device selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of devices to expose. Detected from the host when unset.
    #[serde(default)]
    pub count: Option<usize>,
}

/// Batching knobs for the data loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub drop_last: bool,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for DataLoaderSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            drop_last: true,
            shuffle: true,
        }
    }
}

fn default_batch_size() -> usize {
    1
}

/// Evaluation loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSettings {
    /// Dataset split to evaluate on.
    #[serde(default = "default_test_split")]
    pub test_split: String,
    /// Seed for the shuffling permutation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Report progress every N steps.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// Replicate the evaluation function across all devices.
    #[serde(default)]
    pub distributed: bool,
    /// Explicit step budget. Mandatory for unsized datasets.
    #[serde(default)]
    pub eval_steps: Option<usize>,
    /// Metrics averaged over the run when `auto_aggregate` is on.
    #[serde(default = "default_metric_names")]
    pub metric_names: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_aggregate: bool,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            test_split: default_test_split(),
            seed: default_seed(),
            log_every: default_log_every(),
            distributed: false,
            eval_steps: None,
            metric_names: default_metric_names(),
            auto_aggregate: true,
        }
    }
}

impl EvalSettings {
    /// Reject settings that can never run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_every == 0 {
            return Err(ConfigError::InvalidValue {
                field: "eval.log_every".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.eval_steps == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "eval.eval_steps".into(),
                message: "must be at least 1 when set".into(),
            });
        }
        Ok(())
    }
}

fn default_test_split() -> String {
    "test".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_log_every() -> usize {
    1
}

fn default_metric_names() -> Vec<String> {
    vec!["loss".to_string()]
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write JSON logs to a daily rolling file in this directory.
    #[serde(default)]
    pub json_dir: Option<PathBuf>,
    /// Base filter when no verbosity flag is given.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TANGO_`)
/// 3. Workspace-local config (`tango.toml`)
/// 4. User config (`~/.config/tango/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&TangoConfig>,
) -> Result<TangoConfig, ConfigError> {
    load_layered(workspace, None, overrides)
}

/// Like [`load_config`], with a job file layered above the workspace config
/// and below the environment.
pub fn load_config_with_job(
    workspace: Option<&Path>,
    job_file: &Path,
    overrides: Option<&TangoConfig>,
) -> Result<TangoConfig, ConfigError> {
    if !job_file.exists() {
        return Err(ConfigError::FileNotFound {
            path: job_file.to_path_buf(),
        });
    }
    load_layered(workspace, Some(job_file), overrides)
}

fn load_layered(
    workspace: Option<&Path>,
    job_file: Option<&Path>,
    overrides: Option<&TangoConfig>,
) -> Result<TangoConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TangoConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("org", "allenai", "tango") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(job_file) = job_file {
        figment = figment.merge(Toml::file(job_file));
    }

    // TANGO_EVAL__SEED, TANGO_DEVICES__COUNT, ...
    figment = figment.merge(Env::prefixed("TANGO_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TangoConfig = figment.extract().map_err(|e| ConfigError::Load {
        message: e.to_string(),
    })?;
    config.eval.validate()?;
    Ok(config)
}

/// Load a single TOML file on top of the defaults, without environment layering.
pub fn load_config_file(path: &Path) -> Result<TangoConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let config: TangoConfig = Figment::from(Serialized::defaults(TangoConfig::default()))
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigError::Load {
            message: e.to_string(),
        })?;
    config.eval.validate()?;
    Ok(config)
}
