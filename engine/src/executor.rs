//! The statement-executor seam.
//!
//! Every engine operation talks to the database through [`Executor`] (raw
//! SQL and transaction control) together with the catalog and ledger traits
//! in [`crate::catalog`] and [`crate::ledger`]. [`PgSession`](crate::PgSession)
//! implements them against PostgreSQL; the `testing` feature provides an
//! in-memory implementation.

use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::sql::{self, QualifiedName};

/// A single column value as returned by [`Executor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    /// Integer view of the value; text is parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) | Self::Null => None,
        }
    }

    /// SQL literal form.
    pub fn to_literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Text(s) => sql::quote_literal(s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// Failure reported by the database or the connection to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The server rejected a statement.
    #[error("{message}")]
    Statement {
        message: String,
        /// SQLSTATE code, when the server sent one.
        code: Option<String>,
        detail: Option<String>,
        hint: Option<String>,
    },
    /// The connection was lost or could not be used.
    #[error("connection error: {0}")]
    Connection(String),
}

impl ExecutionError {
    /// A statement error carrying only a message.
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            code: None,
            detail: None,
            hint: None,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Multi-line description with detail, hint and code when present.
    pub fn describe(&self) -> String {
        match self {
            Self::Statement {
                message,
                code,
                detail,
                hint,
            } => {
                let mut parts = vec![format!("database error: {message}")];
                if let Some(detail) = detail {
                    parts.push(format!("  Detail: {detail}"));
                }
                if let Some(hint) = hint {
                    parts.push(format!("  Hint: {hint}"));
                }
                if let Some(code) = code {
                    parts.push(format!("  Code: {code}"));
                }
                parts.join("\n")
            }
            Self::Connection(message) => format!("connection error: {message}"),
        }
    }
}

/// Raw SQL execution and transaction control on one session.
///
/// Outside auto-commit mode nothing is committed until [`commit`](Self::commit);
/// in auto-commit mode [`begin`](Self::begin), `commit` and `rollback` are
/// no-ops and every statement commits on its own.
pub trait Executor {
    /// Runs one or more statements and returns the rows of the last one.
    fn execute(&mut self, sql: &str) -> Result<Vec<Row>, ExecutionError>;

    /// Calls a set-returning or scalar function, `name` possibly
    /// schema-qualified.
    fn call_procedure(
        &mut self,
        name: &QualifiedName,
        args: &[Value],
    ) -> Result<Vec<Row>, ExecutionError> {
        let sql = sql::call_procedure(name, args);
        self.execute(&sql)
    }

    fn begin(&mut self) -> Result<(), ExecutionError>;
    fn commit(&mut self) -> Result<(), ExecutionError>;
    fn rollback(&mut self) -> Result<(), ExecutionError>;

    fn set_autocommit(&mut self, enabled: bool) -> Result<(), ExecutionError>;
    fn autocommit(&self) -> bool;
}

/// Rolls back after a failure, logging instead of masking the original
/// error when the rollback itself fails.
pub(crate) fn rollback_after_failure<E: Executor + ?Sized>(executor: &mut E) {
    if let Err(e) = executor.rollback() {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Text(" 0 ".into()).as_i64(), Some(0));
        assert_eq!(Value::Int(7).as_i64(), Some(7));
        assert_eq!(Value::Null.as_i64(), None);
        assert_eq!(Value::from("it's").to_literal(), "'it''s'");
        assert_eq!(Value::Null.to_literal(), "NULL");
    }

    #[test]
    fn test_describe_includes_detail_hint_and_code() {
        let err = ExecutionError::Statement {
            message: "relation \"x\" does not exist".into(),
            code: Some("42P01".into()),
            detail: None,
            hint: Some("check the search path".into()),
        };
        let text = err.describe();
        assert!(text.starts_with("database error: relation"));
        assert!(text.contains("  Hint: check the search path"));
        assert!(text.contains("  Code: 42P01"));
        assert!(!text.contains("Detail"));
    }
}
