//! Errors raised by the `roster` driver around the engine.

use roster_core::{ReconcileError, SettingsError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid desired-state file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("timed out acquiring lock {path} after {timeout_ms}ms")]
    Locked { path: String, timeout_ms: u64 },
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl CliError {
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        CliError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
