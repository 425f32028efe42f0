//! Error types for engine operations.
//!
//! [`EngineError`] covers every way an install, deploy, remove or query run
//! can stop. Callers that need to tell "nothing happened" from "something
//! happened" branch on [`EngineError::category`]; the CLI maps the category
//! to a process exit code with [`EngineError::exit_code`].

use dbpm_core::{ResolveError, Version, VersionError};
use thiserror::Error;

use crate::executor::ExecutionError;

/// Broad classes of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected before any mutating statement ran.
    Precondition,
    /// Type declarations could not be ordered.
    Resolution,
    /// A statement failed on the server.
    Execution,
    /// The connection is gone.
    Connectivity,
}

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The metadata schema is absent.
    #[error("dbpm is not installed: metadata schema '{0}' does not exist (run `dbpm install`)")]
    EngineNotInstalled(String),

    /// The metadata schema is older than this tool.
    #[error(
        "metadata schema is at version {installed}, this tool expects {expected} (run `dbpm install --upgrade`)"
    )]
    MigrationRequired { installed: Version, expected: Version },

    /// The metadata schema is newer than this tool.
    #[error(
        "metadata schema is at version {installed}, newer than this tool ({expected}); upgrade dbpm"
    )]
    EngineVersionTooOld { installed: Version, expected: Version },

    /// The migration catalog does not connect two versions.
    #[error("no migration path from {from} to {to}")]
    MigrationGap { from: Version, to: Version },

    /// Declared dependencies that are not deployed.
    #[error("unresolved package dependencies: {}", .missing.join(", "))]
    UnresolvedDependency { missing: Vec<String> },

    #[error("schema '{0}' already exists (use moderate, unsafe or overwrite mode)")]
    SchemaAlreadyExists(String),

    #[error("schema '{0}' does not exist")]
    SchemaMissing(String),

    /// Auto-commit was requested outside of a safe, file-filtered deployment.
    #[error("auto-commit is only allowed in safe mode with an explicit file list")]
    AutocommitNotAllowed,

    #[error("dbpm {0} is already installed")]
    AlreadyInstalled(Version),

    #[error("role '{0}' is not a superuser")]
    NotSuperuser(String),

    #[error("package {name} {version} is not deployed")]
    PackageNotFound { name: String, version: String },

    #[error("package {name} is required by: {}", .dependents.join(", "))]
    PackageInUse { name: String, dependents: Vec<String> },

    /// A table script name is not an integer under integer ordering.
    #[error("table script '{0}' does not have an integer name")]
    InvalidTableScriptName(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Versions that cannot be compared, e.g. a stored version in another
    /// encoding than the engine's.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// An object script failed. `partial` is set when earlier statements were
    /// already committed (auto-commit mode).
    #[error("script '{script}' failed: {source}")]
    Script {
        script: String,
        partial: bool,
        #[source]
        source: ExecutionError,
    },

    /// A statement issued by the engine itself failed.
    #[error(transparent)]
    Execution(ExecutionError),
}

impl EngineError {
    /// Wraps a failure of an object script, keeping connection loss
    /// distinguishable from statement errors.
    pub fn script(script: impl Into<String>, partial: bool, source: ExecutionError) -> Self {
        if source.is_connectivity() {
            Self::Execution(source)
        } else {
            Self::Script {
                script: script.into(),
                partial,
                source,
            }
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Resolve(_) => ErrorCategory::Resolution,
            Self::Script { .. } => ErrorCategory::Execution,
            Self::Execution(e) if e.is_connectivity() => ErrorCategory::Connectivity,
            Self::Execution(_) => ErrorCategory::Execution,
            _ => ErrorCategory::Precondition,
        }
    }

    /// `1` for precondition failures, `2` for everything else.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Precondition => 1,
            _ => 2,
        }
    }

    /// Whether statements committed before the failure stay applied.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Script { partial: true, .. })
    }
}

impl From<ExecutionError> for EngineError {
    fn from(e: ExecutionError) -> Self {
        Self::Execution(e)
    }
}

/// Convenience alias for results with [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_and_exit_codes() {
        let missing = EngineError::UnresolvedDependency {
            missing: vec!["util 1_x_x".into(), "auth 0_2_x".into()],
        };
        assert_eq!(missing.category(), ErrorCategory::Precondition);
        assert_eq!(missing.exit_code(), 1);
        assert_eq!(
            missing.to_string(),
            "unresolved package dependencies: util 1_x_x, auth 0_2_x"
        );

        let cycle = EngineError::from(ResolveError::Unresolved(vec!["a".into()]));
        assert_eq!(cycle.category(), ErrorCategory::Resolution);
        assert_eq!(cycle.exit_code(), 2);

        let lost = EngineError::from(ExecutionError::Connection("closed".into()));
        assert_eq!(lost.category(), ErrorCategory::Connectivity);
    }

    #[test]
    fn test_script_error_keeps_connectivity_distinct() {
        let failed = EngineError::script("functions/a.sql", true, ExecutionError::statement("boom"));
        assert_eq!(failed.category(), ErrorCategory::Execution);
        assert!(failed.is_partial());
        assert!(failed.to_string().contains("functions/a.sql"));

        let lost = EngineError::script("functions/a.sql", true, ExecutionError::Connection("eof".into()));
        assert_eq!(lost.category(), ErrorCategory::Connectivity);
        assert!(!lost.is_partial());
    }
}
