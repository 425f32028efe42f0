//! Package sources for dbpm.
//!
//! Everything dbpm needs from the filesystem before it talks to a database:
//!
//! - [`PackageConfig`] / [`load_descriptor`]: reads `config.json` (or YAML),
//!   merges an overlay file and command-line overrides, and validates the
//!   result into a [`PackageDescriptor`](dbpm_core::PackageDescriptor).
//! - [`ScriptSource`]: collects object scripts per kind, optionally limited
//!   to an explicit file list.
//! - [`VcsInfo`] / [`Git`]: revision hash and remote URL of the package
//!   checkout.
//!
//! # Quick start
//!
//! ```no_run
//! use dbpm_source::{ConfigOverrides, ScriptSource, load_descriptor};
//! use std::path::Path;
//!
//! let root = Path::new("packages/billing");
//! let descriptor = load_descriptor(root, None, &ConfigOverrides::default()).unwrap();
//! let collected = ScriptSource::new(root).collect_package(&descriptor, &[]).unwrap();
//! println!("{} scripts", collected.scripts.total());
//! ```

mod config;
mod error;
mod scripts;
mod vcs;

pub use config::{
    CONFIG_FILE_NAMES, ConfigOverrides, PackageConfig, PathList, find_config_file,
    load_descriptor, read_config_map,
};
pub use error::{Result, SourceError};
pub use scripts::{CollectedScripts, ScriptSource};
pub use vcs::{DEFAULT_GIT_TIMEOUT, Git, VcsInfo};
