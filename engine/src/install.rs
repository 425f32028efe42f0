//! Installing, upgrading and removing the metadata schema.

use dbpm_core::Version;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::executor::rollback_after_failure;
use crate::migration::{self, EngineStatus, MigrationStep};
use crate::settings::{EngineSettings, Session};
use crate::sql;

/// Options of [`install`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Migrate an existing metadata schema that is behind.
    pub upgrade: bool,
    /// Roles granted read/write access to the metadata schema.
    pub usage_roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    Installed(Version),
    Upgraded {
        from: Version,
        to: Version,
        steps: Vec<MigrationStep>,
    },
}

/// Creates the metadata schema, or upgrades it with `options.upgrade`.
///
/// # Errors
///
/// [`EngineError::AlreadyInstalled`] when the schema is current,
/// [`EngineError::MigrationRequired`] when it is behind and no upgrade was
/// asked for, [`EngineError::EngineVersionTooOld`] when it is ahead.
pub fn install<S: Session + ?Sized>(
    session: &mut S,
    settings: &EngineSettings,
    options: &InstallOptions,
) -> Result<InstallOutcome> {
    let role = session.current_role()?;
    if !session.is_superuser()? {
        warn!(role = %role, "Installing as a non-superuser; owner changes may fail later");
    }

    let outcome = match migration::engine_status(session, settings)? {
        EngineStatus::NotInstalled => {
            if session.schema_exists(&settings.metadata_schema)? {
                return Err(EngineError::EngineNotInstalled(format!(
                    "{} (schema exists but holds no dbpm metadata)",
                    settings.metadata_schema
                )));
            }
            session.begin()?;
            if let Err(e) = create_metadata_schema(session, settings, options) {
                rollback_after_failure(session);
                return Err(e);
            }
            session.commit()?;
            InstallOutcome::Installed(settings.engine_version.clone())
        }
        EngineStatus::Current(version) => return Err(EngineError::AlreadyInstalled(version)),
        EngineStatus::Ahead(installed) => {
            return Err(EngineError::EngineVersionTooOld {
                installed,
                expected: settings.engine_version.clone(),
            });
        }
        EngineStatus::Behind(installed) => {
            let steps = migration::migrate(session, settings, options.upgrade)?;
            session.begin()?;
            if let Err(e) = grant_access(session, settings, options) {
                rollback_after_failure(session);
                return Err(e);
            }
            session.commit()?;
            InstallOutcome::Upgraded {
                from: installed,
                to: settings.engine_version.clone(),
                steps,
            }
        }
    };
    info!(schema = %settings.metadata_schema, outcome = ?outcome, "Metadata schema ready");
    Ok(outcome)
}

/// Baseline tables plus every catalog step up to the engine version, in the
/// caller's transaction.
fn create_metadata_schema<S: Session + ?Sized>(
    session: &mut S,
    settings: &EngineSettings,
    options: &InstallOptions,
) -> Result<()> {
    session.execute(sql::PREAMBLE)?;
    session.create_schema(&settings.metadata_schema)?;
    session.execute(&sql::install_script(&settings.metadata_schema))?;

    let baseline = migration::baseline();
    let steps = migration::plan_migration(&baseline, &settings.engine_version, &migration::catalog())?;
    for step in &steps {
        session.execute(&sql::render_metadata_script(&step.script, &settings.metadata_schema))?;
        session.record_migration_applied(&step.from, &step.to)?;
    }
    migration::register_engine_version(session, settings, &settings.engine_version)?;
    grant_access(session, settings, options)
}

fn grant_access<S: Session + ?Sized>(
    session: &mut S,
    settings: &EngineSettings,
    options: &InstallOptions,
) -> Result<()> {
    session.revoke_public(&settings.metadata_schema)?;
    if !options.usage_roles.is_empty() {
        session.grant_data_privileges(&settings.metadata_schema, &options.usage_roles)?;
    }
    Ok(())
}

/// Drops the metadata schema. Deployed package schemas stay in place.
///
/// # Errors
///
/// [`EngineError::NotSuperuser`] unless the connecting role is a superuser;
/// [`EngineError::EngineNotInstalled`] when there is nothing to drop.
pub fn uninstall<S: Session + ?Sized>(session: &mut S, settings: &EngineSettings) -> Result<()> {
    let role = session.current_role()?;
    if !session.is_superuser()? {
        return Err(EngineError::NotSuperuser(role));
    }
    if !session.schema_exists(&settings.metadata_schema)? {
        return Err(EngineError::EngineNotInstalled(settings.metadata_schema.clone()));
    }

    session.begin()?;
    if let Err(e) = session.drop_schema(&settings.metadata_schema) {
        rollback_after_failure(session);
        return Err(e.into());
    }
    session.commit()?;
    info!(schema = %settings.metadata_schema, "Metadata schema dropped");
    Ok(())
}
