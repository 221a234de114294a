use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or converting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid YAML or does not match the schema.
    #[error("Invalid configuration document: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    /// The configuration file could not be read.
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A value is out of range.
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// PascalCase key of the offending value.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The requested store or codec is not compiled in.
    #[error("Not available in this build: {0}")]
    BackendNotAvailable(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
