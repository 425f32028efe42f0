//! Ad-hoc statement execution.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::Row;
use crate::migration;
use crate::settings::{EngineSettings, Session};

/// Upper bound on repetitions with `until_zero`.
pub const MAX_REPEATS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    /// How many times the statement ran.
    pub runs: usize,
    /// Rows of the last run.
    pub rows: Vec<Row>,
    /// `until_zero` stopped at [`MAX_REPEATS`] instead of reaching zero.
    pub limit_reached: bool,
}

/// Runs `sql` in auto-commit mode after the engine version gate.
///
/// With `until_zero` the statement is repeated until the first column of
/// its first row is `0` (or it returns no rows), at most [`MAX_REPEATS`]
/// times. Useful for batched data migrations that report how many rows they
/// touched.
pub fn execute_query<S: Session + ?Sized>(
    session: &mut S,
    sql: &str,
    until_zero: bool,
    settings: &EngineSettings,
) -> Result<QueryOutcome> {
    migration::require_current(session, settings)?;
    session.set_autocommit(true)?;

    let mut runs = 0;
    loop {
        let rows = session.execute(sql)?;
        runs += 1;
        if !until_zero {
            return Ok(QueryOutcome {
                runs,
                rows,
                limit_reached: false,
            });
        }

        let first = rows.first().and_then(|row| row.first()).and_then(|v| v.as_i64());
        debug!(run = runs, result = ?first, "Statement executed");
        if first.is_none_or(|n| n == 0) {
            info!(runs, "Statement reached zero");
            return Ok(QueryOutcome {
                runs,
                rows,
                limit_reached: false,
            });
        }
        if runs >= MAX_REPEATS {
            warn!(runs, "Stopped repeating statement at the limit");
            return Ok(QueryOutcome {
                runs,
                rows,
                limit_reached: true,
            });
        }
    }
}
