//! Script collection from a package directory.
//!
//! [`ScriptSource`] walks the directories a [`PackageDescriptor`] lists for
//! each [`ObjectKind`] and returns their files as [`ObjectScript`]s. Within a
//! directory, files come first in name order, then subdirectories in name
//! order. Hidden entries (leading `.`) and configuration files are skipped.
//!
//! Identifiers are paths relative to the package root with `/` separators, so
//! they are stable across machines and usable as table-script ledger keys.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use dbpm_core::{ObjectKind, ObjectScript, PackageDescriptor, PackageScripts};
use tracing::{debug, warn};

use crate::config::CONFIG_FILE_NAMES;
use crate::error::Result;

/// Scripts gathered for a deployment plus the filter entries that matched
/// nothing.
#[derive(Debug, Clone, Default)]
pub struct CollectedScripts {
    pub scripts: PackageScripts,
    /// Filter entries that are not files inside any configured script path.
    pub unmatched: Vec<String>,
}

/// Reads package scripts from a root directory.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    root: PathBuf,
}

impl ScriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Collects the scripts of one kind.
    ///
    /// With an empty `filter` every file under `paths` is returned. Otherwise
    /// only the listed files (relative to the root) that lie under one of
    /// `paths` are returned, in filter order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when a directory or file cannot be read. Missing
    /// script directories are logged and skipped.
    pub fn collect(&self, paths: &[PathBuf], filter: &[String]) -> Result<Vec<ObjectScript>> {
        let mut scripts = Vec::new();
        if filter.is_empty() {
            for path in paths {
                let dir = self.root.join(path);
                if !dir.is_dir() {
                    warn!(path = %dir.display(), "Script directory does not exist, skipping");
                    continue;
                }
                self.walk(&dir, &mut scripts)?;
            }
        } else {
            for entry in filter {
                let file = self.root.join(entry);
                if file.is_file() && paths.iter().any(|p| file.starts_with(self.root.join(p))) {
                    scripts.push(self.read_script(&file)?);
                }
            }
        }
        Ok(scripts)
    }

    /// Collects every kind configured in `descriptor`.
    pub fn collect_package(
        &self,
        descriptor: &PackageDescriptor,
        filter: &[String],
    ) -> Result<CollectedScripts> {
        let mut collected = CollectedScripts::default();
        let mut matched: BTreeSet<String> = BTreeSet::new();

        for kind in ObjectKind::ALL {
            let paths = descriptor.paths.get(kind);
            if paths.is_empty() {
                continue;
            }
            let scripts = self.collect(paths, filter)?;
            debug!(kind = %kind, count = scripts.len(), "Collected scripts");
            matched.extend(scripts.iter().map(|s| s.identifier.clone()));
            collected.scripts.insert(kind, scripts);
        }

        collected.unmatched = filter
            .iter()
            .filter(|entry| !matched.contains(&normalize(entry)))
            .cloned()
            .collect();
        for entry in &collected.unmatched {
            warn!(file = %entry, "File is not inside any configured script path");
        }
        Ok(collected)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<ObjectScript>) -> Result<()> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else if file_type.is_file() && !CONFIG_FILE_NAMES.contains(&name.as_ref()) {
                files.push(entry.path());
            }
        }
        files.sort();
        dirs.sort();

        for file in files {
            out.push(self.read_script(&file)?);
        }
        for sub in dirs {
            self.walk(&sub, out)?;
        }
        Ok(())
    }

    fn read_script(&self, file: &Path) -> Result<ObjectScript> {
        let bytes = fs::read(file)?;
        let text = String::from_utf8_lossy(&bytes);
        let text = text.strip_prefix('\u{feff}').unwrap_or(text.as_ref());
        let identifier = self.identifier(file);
        debug!(script = %identifier, "Read script");
        Ok(ObjectScript::new(identifier, text))
    }

    fn identifier(&self, file: &Path) -> String {
        let relative = file.strip_prefix(&self.root).unwrap_or(file);
        normalize(&relative.to_string_lossy())
    }
}

/// `/`-separated form of a relative path, without `./` segments.
fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
