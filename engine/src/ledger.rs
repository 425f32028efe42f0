//! Package metadata ledger.
//!
//! The durable record of what was deployed: packages and their versions,
//! dependency links, table scripts that already ran, applied metadata
//! migrations and a log of deployment events. All writes happen inside the
//! transaction of the operation they describe, so a rollback also rolls back
//! the bookkeeping.

use chrono::{DateTime, Utc};
use dbpm_core::{
    DeploymentMode, Encoding, PackageDescriptor, Subclass, Version, VersionPattern,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::executor::ExecutionError;

/// A package row as written at the end of a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRecord {
    pub name: String,
    pub subclass: Subclass,
    pub version: Version,
    pub description: Option<String>,
    pub license: Option<String>,
    /// Ids of the deployed packages this one depends on.
    pub dependency_ids: Vec<i64>,
    pub vcs_ref: Option<String>,
    pub vcs_link: Option<String>,
    pub issue_ref: Option<String>,
    pub issue_link: Option<String>,
}

impl PackageRecord {
    pub fn new(name: impl Into<String>, subclass: Subclass, version: Version) -> Self {
        Self {
            name: name.into(),
            subclass,
            version,
            description: None,
            license: None,
            dependency_ids: Vec::new(),
            vcs_ref: None,
            vcs_link: None,
            issue_ref: None,
            issue_link: None,
        }
    }

    pub fn from_descriptor(descriptor: &PackageDescriptor, dependency_ids: Vec<i64>) -> Self {
        Self {
            description: descriptor.description.clone(),
            license: descriptor.license.clone(),
            dependency_ids,
            ..Self::new(
                descriptor.name.clone(),
                descriptor.subclass,
                descriptor.version.clone(),
            )
        }
    }
}

/// A package row read back from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPackage {
    pub id: i64,
    pub name: String,
    pub subclass: Subclass,
    pub version: Version,
    /// Set once the package's schema was renamed aside by a moderate
    /// deployment.
    pub revision: Option<u32>,
}

impl StoredPackage {
    /// Name of the schema that holds this package's objects.
    pub fn schema_name(&self) -> String {
        let current = match self.subclass {
            Subclass::Basic => self.name.clone(),
            Subclass::Versioned => format!("{}_{}", self.name, self.version.raw),
        };
        match self.revision {
            Some(revision) => format!("{current}_{revision}"),
            None => current,
        }
    }
}

/// "This table script already ran for this package version."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableScriptRecord {
    pub script: String,
    pub package_id: i64,
    /// SHA-256 of the executed text; absent for records written before
    /// checksums were tracked.
    pub checksum: Option<String>,
}

/// One successful deployment, appended to the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentEvent {
    pub package_id: i64,
    pub mode: DeploymentMode,
    pub vcs_ref: Option<String>,
    pub vcs_link: Option<String>,
    pub issue_ref: Option<String>,
    pub issue_link: Option<String>,
    pub deployed_at: DateTime<Utc>,
}

/// Hex SHA-256 of a script's text.
pub fn checksum(text: &str) -> String {
    Sha256::digest(text.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Rebuilds a version from stored components.
pub(crate) fn stored_version(
    encoding: Encoding,
    major: i64,
    minor: i64,
    patch: i64,
    pre: Option<String>,
    metadata: Option<String>,
) -> Version {
    let component = |v: i64| u64::try_from(v).unwrap_or_default();
    let base = match encoding {
        Encoding::Engine => Version::engine(component(major), component(minor), component(patch)),
        Encoding::Package => Version::package(component(major), component(minor), component(patch)),
    };
    base.with_suffixes(pre, metadata)
}

/// Durable metadata operations.
///
/// The metadata schema registers itself as a package; its version is the
/// installed engine version.
pub trait MetadataStore {
    /// Engine version recorded in the metadata schema, `None` when the
    /// metadata schema does not exist.
    fn installed_version(&mut self) -> Result<Option<Version>, ExecutionError>;

    /// Highest current (non-superseded) version of `name` matching
    /// `pattern`.
    fn find_package(
        &mut self,
        name: &str,
        pattern: &VersionPattern,
    ) -> Result<Option<StoredPackage>, ExecutionError>;

    /// Inserts or updates the current row of a package and replaces its
    /// dependency links. Keyed by name for basic packages and by name and
    /// version for versioned ones.
    fn upsert_package(&mut self, record: &PackageRecord) -> Result<i64, ExecutionError>;

    /// Marks the current row of a package as superseded by `revision`.
    /// Returns `false` when there is no current row.
    fn mark_revision(
        &mut self,
        name: &str,
        subclass: Subclass,
        version: &Version,
        revision: u32,
    ) -> Result<bool, ExecutionError>;

    fn record_table_script(
        &mut self,
        script: &str,
        package_id: i64,
        checksum: &str,
    ) -> Result<(), ExecutionError>;

    /// Record of `script` for the current row of `name` at `version`.
    fn table_script_record(
        &mut self,
        script: &str,
        name: &str,
        version: &Version,
    ) -> Result<Option<TableScriptRecord>, ExecutionError>;

    fn is_table_script_recorded(
        &mut self,
        script: &str,
        name: &str,
        version: &Version,
    ) -> Result<bool, ExecutionError> {
        Ok(self.table_script_record(script, name, version)?.is_some())
    }

    fn record_migration_applied(&mut self, from: &Version, to: &Version)
    -> Result<(), ExecutionError>;
    fn is_migration_applied(&mut self, from: &Version, to: &Version)
    -> Result<bool, ExecutionError>;

    fn record_deployment_event(&mut self, event: &DeploymentEvent) -> Result<(), ExecutionError>;

    /// Every row of `name` at `version`: the current one and superseded
    /// revisions.
    fn package_rows(
        &mut self,
        name: &str,
        version: &Version,
    ) -> Result<Vec<StoredPackage>, ExecutionError>;

    /// Names of packages, outside `ids`, that depend on any of `ids`.
    fn dependents_of(&mut self, ids: &[i64]) -> Result<Vec<String>, ExecutionError>;

    /// Deletes a package row with its dependency links, table-script
    /// records and events.
    fn delete_package(&mut self, id: i64) -> Result<(), ExecutionError>;
}
