//! Version-control metadata for deployment records.
//!
//! [`VcsInfo`] is the seam the CLI uses to fill in `vcs_ref`/`vcs_link` when
//! the operator did not pass them; [`Git`] implements it by shelling out to
//! `git -C <path> ...` with a timeout.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;
use wait_timeout::ChildExt;

use crate::error::{Result, SourceError};

/// Default time allowed for a single git invocation.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only access to the version control state of a package directory.
pub trait VcsInfo {
    /// Returns `true` if `path` is inside a work tree.
    fn is_repository(&self, path: &Path) -> bool;
    /// Hash of the checked-out revision.
    fn revision_hash(&self, path: &Path) -> Result<String>;
    /// Fetch URL of the default remote.
    fn remote_url(&self, path: &Path) -> Result<String>;
}

/// [`VcsInfo`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct Git {
    program: String,
    timeout: Duration,
    remote: String,
}

impl Default for Git {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
            timeout: DEFAULT_GIT_TIMEOUT,
            remote: "origin".to_string(),
        }
    }
}

impl Git {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn run(&self, path: &Path, args: &[&str]) -> Result<String> {
        let label = args.join(" ");
        let git_error = |message: String| SourceError::Git {
            command: label.clone(),
            message,
        };

        let mut child = Command::new(&self.program)
            .arg("-C")
            .arg(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| git_error(e.to_string()))?;

        // Drain pipes off-thread so a chatty child cannot block on a full buffer.
        let stdout_thread = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_thread = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                debug!(command = %label, timeout_ms = self.timeout.as_millis() as u64, "git timed out, killing process");
                let _ = child.kill();
                let _ = child.wait();
                return Err(git_error(format!("timed out after {:?}", self.timeout)));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(git_error(e.to_string()));
            }
        };

        let stdout = stdout_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();
        let stderr = stderr_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(git_error(
                String::from_utf8_lossy(&stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

impl VcsInfo for Git {
    fn is_repository(&self, path: &Path) -> bool {
        match self.run(path, &["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) => out == "true",
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Not a git work tree");
                false
            }
        }
    }

    fn revision_hash(&self, path: &Path) -> Result<String> {
        self.run(path, &["rev-parse", "HEAD"])
    }

    fn remote_url(&self, path: &Path) -> Result<String> {
        let output = self.run(path, &["remote", "show", "-n", &self.remote])?;
        parse_fetch_url(&output).ok_or_else(|| SourceError::Git {
            command: format!("remote show -n {}", self.remote),
            message: "no fetch URL in output".to_string(),
        })
    }
}

/// Extracts the URL from the `Fetch URL: ...` line of `git remote show -n`.
fn parse_fetch_url(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Fetch URL:"))
        .and_then(|line| line.split_whitespace().last())
        .filter(|url| *url != "URL:")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch_url() {
        let output = "* remote origin\n  Fetch URL: git@example.com:team/billing.git\n  Push  URL: git@example.com:team/billing.git\n";
        assert_eq!(
            parse_fetch_url(output).as_deref(),
            Some("git@example.com:team/billing.git")
        );
        assert_eq!(parse_fetch_url("* remote origin\n"), None);
        assert_eq!(parse_fetch_url("  Fetch URL:"), None);
    }

    #[test]
    fn test_missing_program_is_not_a_repository() {
        let git = Git::new().with_program("dbpm-no-such-git-binary");
        let dir = tempfile::tempdir().unwrap();
        assert!(!git.is_repository(dir.path()));
        assert!(matches!(
            git.revision_hash(dir.path()),
            Err(SourceError::Git { .. })
        ));
    }
}
