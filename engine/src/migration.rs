//! Metadata schema versioning.
//!
//! The metadata schema is created at [`BASELINE_VERSION`] and brought up to
//! the running engine's version by replaying the shipped [`catalog`] of
//! migration steps. Every step runs in its own transaction and is recorded
//! in the migration ledger once it commits, so a failed upgrade keeps the
//! steps before the failure and can be resumed.
//!
//! # Example
//!
//! ```
//! use dbpm_core::{Encoding, Version};
//! use dbpm_engine::migration::{catalog, plan_migration};
//!
//! let installed = Version::parse("0.1.0", Encoding::Engine).unwrap();
//! let target = Version::parse("0.3.0", Encoding::Engine).unwrap();
//! let steps = plan_migration(&installed, &target, &catalog()).unwrap();
//! assert_eq!(steps.len(), 2);
//! assert_eq!(steps[0].to.raw, "0.2.0");
//! ```

use std::cmp::Ordering;

use dbpm_core::{Encoding, Subclass, Version};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::executor::rollback_after_failure;
use crate::ledger::{MetadataStore, PackageRecord};
use crate::settings::{EngineSettings, Session};
use crate::sql;

/// Version of the metadata schema created by the install script.
pub const BASELINE_VERSION: &str = "0.1.0";

const CATALOG_SOURCES: [(&str, &str, &str); 2] = [
    ("0.1.0", "0.2.0", include_str!("../sql/migrations/0.1.0-0.2.0.sql")),
    ("0.2.0", "0.3.0", include_str!("../sql/migrations/0.2.0-0.3.0.sql")),
];

/// One script that moves the metadata schema from `from` to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStep {
    pub from: Version,
    pub to: Version,
    /// Script text with a `{schema}` placeholder for the metadata schema.
    pub script: String,
}

impl MigrationStep {
    pub fn new(from: Version, to: Version, script: impl Into<String>) -> Self {
        Self {
            from,
            to,
            script: script.into(),
        }
    }
}

/// Where the installed metadata schema stands relative to this engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    NotInstalled,
    Current(Version),
    Behind(Version),
    Ahead(Version),
}

pub fn baseline() -> Version {
    Version::parse(BASELINE_VERSION, Encoding::Engine).unwrap_or_else(|_| Version::engine(0, 1, 0))
}

/// Migration steps shipped with this engine, sorted by `from`.
pub fn catalog() -> Vec<MigrationStep> {
    CATALOG_SOURCES
        .iter()
        .filter_map(|(from, to, script)| {
            let from = Version::parse(from, Encoding::Engine).ok()?;
            let to = Version::parse(to, Encoding::Engine).ok()?;
            Some(MigrationStep::new(from, to, *script))
        })
        .collect()
}

/// Compares the installed metadata version with `settings.engine_version`.
pub fn engine_status<S: MetadataStore + ?Sized>(
    session: &mut S,
    settings: &EngineSettings,
) -> Result<EngineStatus> {
    let Some(installed) = session.installed_version()? else {
        return Ok(EngineStatus::NotInstalled);
    };
    Ok(match installed.compare(&settings.engine_version)? {
        Ordering::Less => EngineStatus::Behind(installed),
        Ordering::Greater => EngineStatus::Ahead(installed),
        Ordering::Equal => EngineStatus::Current(installed),
    })
}

/// Fails unless the metadata schema is installed at exactly the engine
/// version.
pub fn require_current<S: MetadataStore + ?Sized>(
    session: &mut S,
    settings: &EngineSettings,
) -> Result<Version> {
    match engine_status(session, settings)? {
        EngineStatus::Current(version) => Ok(version),
        EngineStatus::NotInstalled => Err(EngineError::EngineNotInstalled(
            settings.metadata_schema.clone(),
        )),
        EngineStatus::Behind(installed) => Err(EngineError::MigrationRequired {
            installed,
            expected: settings.engine_version.clone(),
        }),
        EngineStatus::Ahead(installed) => Err(EngineError::EngineVersionTooOld {
            installed,
            expected: settings.engine_version.clone(),
        }),
    }
}

/// Selects the steps that take `installed` to `target`: every step with
/// `from <= target` and `to > installed`, in ascending `from` order.
///
/// # Errors
///
/// [`EngineError::EngineVersionTooOld`] when `target < installed`;
/// [`EngineError::MigrationGap`] when the selected steps leave part of the
/// range uncovered.
pub fn plan_migration(
    installed: &Version,
    target: &Version,
    catalog: &[MigrationStep],
) -> Result<Vec<MigrationStep>> {
    if target < installed {
        return Err(EngineError::EngineVersionTooOld {
            installed: installed.clone(),
            expected: target.clone(),
        });
    }

    let mut steps: Vec<MigrationStep> = catalog
        .iter()
        .filter(|step| step.from <= *target && step.to > *installed)
        .cloned()
        .collect();
    steps.sort_by(|a, b| a.from.partial_cmp(&b.from).unwrap_or(Ordering::Equal));

    let mut reached = installed.clone();
    for step in &steps {
        if step.from > reached {
            return Err(EngineError::MigrationGap {
                from: reached,
                to: step.from.clone(),
            });
        }
        if step.to > reached {
            reached = step.to.clone();
        }
    }
    if reached < *target {
        return Err(EngineError::MigrationGap {
            from: reached,
            to: target.clone(),
        });
    }
    Ok(steps)
}

/// Records `version` as the installed engine version.
pub(crate) fn register_engine_version<S: MetadataStore + ?Sized>(
    session: &mut S,
    settings: &EngineSettings,
    version: &Version,
) -> Result<i64> {
    let mut record = PackageRecord::new(&settings.metadata_schema, Subclass::Basic, version.clone());
    record.description = Some("dbpm metadata".to_string());
    Ok(session.upsert_package(&record)?)
}

/// Replays `steps` in order, one transaction each. Steps already in the
/// migration ledger are skipped. Returns the version reached.
///
/// A failing step is rolled back and stops the chain; earlier steps stay
/// committed.
pub fn apply<S: Session + ?Sized>(
    session: &mut S,
    steps: &[MigrationStep],
    settings: &EngineSettings,
) -> Result<Option<Version>> {
    let mut reached = None;
    for step in steps {
        if session.is_migration_applied(&step.from, &step.to)? {
            debug!(from = %step.from, to = %step.to, "Migration already applied, skipping");
            reached = Some(step.to.clone());
            continue;
        }

        session.begin()?;
        if let Err(e) = apply_step(session, step, settings) {
            rollback_after_failure(session);
            return Err(e);
        }
        session.commit()?;
        info!(from = %step.from, to = %step.to, "Applied metadata migration");
        reached = Some(step.to.clone());
    }
    Ok(reached)
}

fn apply_step<S: Session + ?Sized>(
    session: &mut S,
    step: &MigrationStep,
    settings: &EngineSettings,
) -> Result<()> {
    let script = sql::render_metadata_script(&step.script, &settings.metadata_schema);
    session.execute(&script)?;
    session.record_migration_applied(&step.from, &step.to)?;
    register_engine_version(session, settings, &step.to)?;
    Ok(())
}

/// Brings the installed metadata schema to the engine version.
///
/// With `upgrade` unset a schema that is behind fails with
/// [`EngineError::MigrationRequired`] and nothing is changed.
pub fn migrate<S: Session + ?Sized>(
    session: &mut S,
    settings: &EngineSettings,
    upgrade: bool,
) -> Result<Vec<MigrationStep>> {
    match engine_status(session, settings)? {
        EngineStatus::NotInstalled => Err(EngineError::EngineNotInstalled(
            settings.metadata_schema.clone(),
        )),
        EngineStatus::Current(_) => Ok(Vec::new()),
        EngineStatus::Ahead(installed) => Err(EngineError::EngineVersionTooOld {
            installed,
            expected: settings.engine_version.clone(),
        }),
        EngineStatus::Behind(installed) if !upgrade => Err(EngineError::MigrationRequired {
            installed,
            expected: settings.engine_version.clone(),
        }),
        EngineStatus::Behind(installed) => {
            let steps = plan_migration(&installed, &settings.engine_version, &catalog())?;
            info!(from = %installed, to = %settings.engine_version, steps = steps.len(), "Upgrading metadata schema");
            apply(session, &steps, settings)?;
            Ok(steps)
        }
    }
}

#[cfg(test)]
mod tests {
    use dbpm_core::VersionError;

    use super::*;
    use crate::testing::MemoryDatabase;

    fn v(raw: &str) -> Version {
        Version::parse(raw, Encoding::Engine).unwrap()
    }

    fn step(from: &str, to: &str) -> MigrationStep {
        MigrationStep::new(v(from), v(to), format!("-- {from} to {to}"))
    }

    fn settings(version: &str) -> EngineSettings {
        EngineSettings::default().with_engine_version(v(version))
    }

    #[test]
    fn test_shipped_catalog_tiles_baseline_to_engine_version() {
        let steps = plan_migration(&baseline(), &EngineSettings::default().engine_version, &catalog())
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.script.contains("{schema}")));
    }

    #[test]
    fn test_plan_selects_steps_in_order() {
        let catalog = vec![step("0.2.0", "0.3.0"), step("0.1.0", "0.2.0")];
        let steps = plan_migration(&v("0.1.0"), &v("0.3.0"), &catalog).unwrap();
        let ends: Vec<_> = steps.iter().map(|s| s.to.raw.as_str()).collect();
        assert_eq!(ends, ["0.2.0", "0.3.0"]);

        let steps = plan_migration(&v("0.2.0"), &v("0.3.0"), &catalog).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(plan_migration(&v("0.3.0"), &v("0.3.0"), &catalog).unwrap().is_empty());
    }

    #[test]
    fn test_plan_refuses_downgrade_and_gaps() {
        let catalog = vec![step("0.1.0", "0.2.0"), step("0.2.5", "0.3.0")];
        assert!(matches!(
            plan_migration(&v("0.3.0"), &v("0.2.0"), &catalog),
            Err(EngineError::EngineVersionTooOld { .. })
        ));
        assert!(matches!(
            plan_migration(&v("0.1.0"), &v("0.3.0"), &catalog),
            Err(EngineError::MigrationGap { ref from, .. }) if from.raw == "0.2.0"
        ));
        assert!(matches!(
            plan_migration(&v("0.1.0"), &v("0.4.0"), &[step("0.1.0", "0.2.0")]),
            Err(EngineError::MigrationGap { .. })
        ));
    }

    #[test]
    fn test_apply_records_each_step_and_advances_version() {
        let mut db = MemoryDatabase::installed("0.1.0");
        let settings = settings("0.3.0");
        let steps = plan_migration(&v("0.1.0"), &v("0.3.0"), &catalog()).unwrap();

        let reached = apply(&mut db, &steps, &settings).unwrap();
        assert_eq!(reached, Some(v("0.3.0")));
        assert_eq!(db.installed_version().unwrap(), Some(v("0.3.0")));
        assert!(db.is_migration_applied(&v("0.1.0"), &v("0.2.0")).unwrap());
        assert!(db.is_migration_applied(&v("0.2.0"), &v("0.3.0")).unwrap());
        assert_eq!(db.commits(), 2);
        assert!(db.executed("ALTER TABLE \"_dbpm\".table_evolutions ADD COLUMN checksum"));
    }

    #[test]
    fn test_failed_step_keeps_earlier_steps() {
        let mut db = MemoryDatabase::installed("0.1.0");
        db.fail_on("deployment_events");
        let steps = plan_migration(&v("0.1.0"), &v("0.3.0"), &catalog()).unwrap();

        let err = apply(&mut db, &steps, &settings("0.3.0")).unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
        assert_eq!(db.installed_version().unwrap(), Some(v("0.2.0")));
        assert!(!db.is_migration_applied(&v("0.2.0"), &v("0.3.0")).unwrap());
    }

    #[test]
    fn test_applied_steps_are_not_replayed() {
        let mut db = MemoryDatabase::installed("0.1.0");
        db.record_migration_applied(&v("0.1.0"), &v("0.2.0")).unwrap();
        let steps = plan_migration(&v("0.1.0"), &v("0.3.0"), &catalog()).unwrap();
        apply(&mut db, &steps, &settings("0.3.0")).unwrap();
        assert!(!db.executed("ADD COLUMN checksum"));
        assert_eq!(db.commits(), 1);
    }

    #[test]
    fn test_gate_reports_each_state() {
        let mut db = MemoryDatabase::new();
        assert!(matches!(
            require_current(&mut db, &settings("0.3.0")),
            Err(EngineError::EngineNotInstalled(_))
        ));

        let mut db = MemoryDatabase::installed("0.2.0");
        assert!(matches!(
            require_current(&mut db, &settings("0.3.0")),
            Err(EngineError::MigrationRequired { .. })
        ));
        assert!(matches!(
            require_current(&mut db, &settings("0.1.0")),
            Err(EngineError::EngineVersionTooOld { .. })
        ));
        assert_eq!(require_current(&mut db, &settings("0.2.0")).unwrap(), v("0.2.0"));
    }

    #[test]
    fn test_status_rejects_versions_in_another_encoding() {
        let mut db = MemoryDatabase::installed("0.2.0");
        let settings = EngineSettings::default().with_engine_version(Version::package(0, 2, 0));
        let err = engine_status(&mut db, &settings).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Version(VersionError::IncompatibleEncodings { .. })
        ));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_migrate_without_upgrade_changes_nothing() {
        let mut db = MemoryDatabase::installed("0.1.0");
        let err = migrate(&mut db, &settings("0.3.0"), false).unwrap_err();
        assert!(matches!(err, EngineError::MigrationRequired { .. }));
        assert!(db.statements().is_empty());

        let steps = migrate(&mut db, &settings("0.3.0"), true).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(db.installed_version().unwrap(), Some(v("0.3.0")));
    }
}
