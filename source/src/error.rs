//! Error types for package source operations.
//!
//! Covers reading the package directory, parsing and validating its
//! configuration, and querying git.

use std::path::PathBuf;

use dbpm_core::{ValidationError, VersionError};
use thiserror::Error;

/// Errors that can occur while loading a package from disk.
#[derive(Debug, Error)]
pub enum SourceError {
    /// File I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing failure.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML parsing failure.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// No `config.json`/`config.yaml`/`config.yml` in the package root.
    #[error("no package configuration found in '{}'", .0.display())]
    ConfigNotFound(PathBuf),

    /// A configuration file whose top level is not a mapping.
    #[error("configuration '{}' must be a mapping of keys to values", .0.display())]
    NotAMapping(PathBuf),

    /// A required configuration key is absent.
    #[error("missing required configuration key '{0}'")]
    MissingField(&'static str),

    /// A configuration value has the wrong shape or content.
    #[error("invalid value for '{field}': {message}")]
    InvalidField { field: String, message: String },

    /// A version or version pattern failed to parse.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// The assembled descriptor failed validation.
    #[error("invalid package configuration: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),

    /// A git invocation failed, timed out or printed something unexpected.
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias for results with [`SourceError`].
pub type Result<T> = std::result::Result<T, SourceError>;
