//! Error types for the Tango core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, component registries, steps and workspaces.

use std::path::PathBuf;

/// Top-level error type for the Tango core library.
#[derive(Debug, thiserror::Error)]
pub enum TangoError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TangoError {
    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {message}")]
    Load { message: String },

    #[error("Config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Errors from the string-keyed component registries.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No component registered under '{key}' in the {kind} registry")]
    NotFound { kind: String, key: String },

    #[error("A component is already registered under '{key}' in the {kind} registry")]
    AlreadyRegistered { kind: String, key: String },

    #[error("Invalid parameters for '{key}': {reason}")]
    InvalidParams { key: String, reason: String },
}

/// Errors raised while running a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Step '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("Step '{name}' depends on '{dependency}', which has no result")]
    MissingDependency { name: String, dependency: String },

    #[error("Step '{name}' is not in the step graph")]
    Unknown { name: String },
}

impl StepError {
    pub fn failed(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Failed {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T, E = TangoError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::NotFound {
            kind: "callback".into(),
            key: "wandb".into(),
        };
        assert_eq!(
            err.to_string(),
            "No component registered under 'wandb' in the callback registry"
        );
    }

    #[test]
    fn test_step_error_converts() {
        let err: TangoError = StepError::failed("eval", "boom").into();
        assert!(matches!(err, TangoError::Step(StepError::Failed { .. })));
        assert_eq!(err.to_string(), "Step error: Step 'eval' failed: boom");
    }
}
