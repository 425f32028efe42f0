//! The deployment orchestrator.
//!
//! [`deploy`] runs one package deployment as a single unit of work:
//!
//! 1. resolve declared dependencies against the package registry;
//! 2. run the session preamble;
//! 3. establish the target schema ([`lifecycle::establish`]), or, for a
//!    file-filtered deployment, require it to exist;
//! 4. execute type scripts in dependency order ([`resolve_types`]);
//! 5. execute table scripts that are not yet in the table-script ledger;
//! 6. execute function, view and trigger scripts;
//! 7. reset privileges and ownership (full deployments only);
//! 8. upsert the package record, record table scripts and the event;
//! 9. commit.
//!
//! Any failure rolls the whole run back, unless auto-commit was requested,
//! in which case every statement commits on its own and earlier statements
//! stay applied.

use std::collections::BTreeMap;

use chrono::Utc;
use dbpm_core::{
    DeploymentMode, ObjectKind, ObjectScript, Package, PackageDescriptor, TableOrder,
    TypeStatement, resolve_types, split_statements,
};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::executor::{Value, rollback_after_failure};
use crate::ledger::{DeploymentEvent, PackageRecord, checksum};
use crate::lifecycle::{self, SchemaAction};
use crate::migration;
use crate::settings::{EngineSettings, Session};
use crate::sql;

/// Caller options for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployRequest {
    pub mode: DeploymentMode,
    /// Explicit script files (relative to the package root). When non-empty
    /// the schema lifecycle is skipped and only these scripts run.
    pub files: Vec<String>,
    /// Entries of `files` that matched no script. They count as requested
    /// and never as deployed.
    pub missing_files: Vec<String>,
    pub table_order: TableOrder,
    /// Commit every statement on its own. Only valid in safe mode with
    /// `files`.
    pub auto_commit: bool,
    pub vcs_ref: Option<String>,
    pub vcs_link: Option<String>,
    pub issue_ref: Option<String>,
    pub issue_link: Option<String>,
}

impl DeployRequest {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn is_filtered(&self) -> bool {
        !self.files.is_empty()
    }

    /// # Errors
    ///
    /// [`EngineError::AutocommitNotAllowed`] for auto-commit outside a safe,
    /// file-filtered deployment.
    pub fn validate(&self) -> Result<()> {
        if self.auto_commit && (self.mode != DeploymentMode::Safe || !self.is_filtered()) {
            return Err(EngineError::AutocommitNotAllowed);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Ok,
    /// Some requested scripts were skipped.
    NotAllDeployed,
}

/// Requested and deployed scripts of one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindReport {
    pub requested: Vec<String>,
    pub deployed: Vec<String>,
    /// Table scripts skipped because the ledger says they already ran.
    pub skipped: Vec<String>,
    /// Recorded table scripts whose text no longer matches the ledger
    /// checksum.
    pub changed: Vec<String>,
}

/// Outcome of a successful [`deploy`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentResult {
    pub package_id: i64,
    /// `None` for database-scoped packages.
    pub schema: Option<String>,
    /// `None` when the lifecycle step was skipped.
    pub action: Option<SchemaAction>,
    pub kinds: BTreeMap<ObjectKind, KindReport>,
    /// Requested files that matched no script.
    pub missing: Vec<String>,
    pub status: DeploymentStatus,
}

impl DeploymentResult {
    pub fn report(&self, kind: ObjectKind) -> Option<&KindReport> {
        self.kinds.get(&kind)
    }

    pub fn requested(&self) -> usize {
        self.kinds.values().map(|k| k.requested.len()).sum::<usize>() + self.missing.len()
    }

    pub fn deployed(&self) -> usize {
        self.kinds.values().map(|k| k.deployed.len()).sum()
    }
}

/// Deploys `package` according to `request`.
///
/// # Errors
///
/// Precondition errors ([`EngineError::AutocommitNotAllowed`],
/// [`EngineError::InvalidTableScriptName`], the engine version gate,
/// [`EngineError::UnresolvedDependency`], [`EngineError::SchemaAlreadyExists`],
/// [`EngineError::SchemaMissing`]) are raised before any object script runs.
/// [`EngineError::Resolve`] reports type declarations that cannot be
/// ordered; [`EngineError::Script`] names the script whose statement failed.
///
/// # Examples
///
/// ```no_run
/// use dbpm_core::{DeploymentMode, Package, PackageDescriptor, PackageScripts, Subclass, Version};
/// use dbpm_engine::{DeployRequest, EngineSettings, PgSession, deploy};
///
/// let settings = EngineSettings::default();
/// let mut session = PgSession::connect("host=localhost user=postgres", &settings.metadata_schema).unwrap();
/// let package = Package {
///     descriptor: PackageDescriptor::new("billing", Subclass::Basic, Version::package(1, 0, 0)),
///     scripts: PackageScripts::new(),
/// };
/// let result = deploy(&mut session, &package, &DeployRequest::new(DeploymentMode::Safe), &settings).unwrap();
/// println!("deployed {} of {} scripts", result.deployed(), result.requested());
/// ```
pub fn deploy<S: Session + ?Sized>(
    session: &mut S,
    package: &Package,
    request: &DeployRequest,
    settings: &EngineSettings,
) -> Result<DeploymentResult> {
    request.validate()?;
    let tables = order_table_scripts(package.scripts.get(ObjectKind::Tables), request.table_order)?;
    migration::require_current(session, settings)?;

    let descriptor = &package.descriptor;
    info!(
        package = %descriptor.name,
        version = %descriptor.version,
        mode = %request.mode,
        filtered = request.is_filtered(),
        "Deploying package"
    );

    if request.auto_commit {
        warn!("Auto-commit mode: statements executed before a failure stay committed");
        session.set_autocommit(true)?;
    } else {
        session.begin()?;
    }

    let outcome = Deployment {
        session: &mut *session,
        package,
        request,
        settings,
    }
    .run(&tables);

    match outcome {
        Ok(result) => {
            if !request.auto_commit {
                session.commit()?;
            }
            if result.status == DeploymentStatus::NotAllDeployed {
                warn!(
                    requested = result.requested(),
                    deployed = result.deployed(),
                    "Not all requested scripts were deployed"
                );
            }
            info!(package = %descriptor.name, package_id = result.package_id, "Deployment complete");
            Ok(result)
        }
        Err(e) => {
            if !request.auto_commit {
                rollback_after_failure(session);
            }
            Err(e)
        }
    }
}

/// Sorts table scripts by file stem, as text or as integers.
///
/// # Errors
///
/// [`EngineError::InvalidTableScriptName`] when integer ordering is
/// requested and a stem is not a number.
pub fn order_table_scripts(
    scripts: &[ObjectScript],
    order: TableOrder,
) -> Result<Vec<&ObjectScript>> {
    let mut ordered: Vec<&ObjectScript> = scripts.iter().collect();
    match order {
        TableOrder::Lexicographic => ordered.sort_by(|a, b| a.stem().cmp(b.stem())),
        TableOrder::Integer => {
            let mut keyed = Vec::with_capacity(ordered.len());
            for script in ordered {
                let key = script
                    .stem()
                    .parse::<u64>()
                    .map_err(|_| EngineError::InvalidTableScriptName(script.identifier.clone()))?;
                keyed.push((key, script));
            }
            keyed.sort_by_key(|(key, _)| *key);
            ordered = keyed.into_iter().map(|(_, script)| script).collect();
        }
    }
    Ok(ordered)
}

struct Deployment<'a, S: Session + ?Sized> {
    session: &'a mut S,
    package: &'a Package,
    request: &'a DeployRequest,
    settings: &'a EngineSettings,
}

impl<S: Session + ?Sized> Deployment<'_, S> {
    fn descriptor(&self) -> &PackageDescriptor {
        &self.package.descriptor
    }

    fn run(mut self, tables: &[&ObjectScript]) -> Result<DeploymentResult> {
        let dependency_ids = self.resolve_dependencies()?;
        self.session.execute(sql::PREAMBLE)?;

        let schema = self.descriptor().schema_name();
        let mut action = None;
        if let Some(schema) = &schema {
            if self.request.is_filtered() {
                if !self.session.schema_exists(schema)? {
                    return Err(EngineError::SchemaMissing(schema.clone()));
                }
            } else {
                action = Some(lifecycle::establish(
                    self.session,
                    &self.package.descriptor,
                    schema,
                    self.request.mode,
                )?);
            }
            self.session.set_search_path(Some(schema))?;
        }

        let mut kinds = BTreeMap::new();
        kinds.insert(ObjectKind::Types, self.deploy_types()?);
        let (table_report, executed_tables) = self.deploy_tables(tables)?;
        kinds.insert(ObjectKind::Tables, table_report);
        for kind in [ObjectKind::Functions, ObjectKind::Views, ObjectKind::Triggers] {
            kinds.insert(kind, self.deploy_scripts(kind)?);
        }

        if let Some(schema) = &schema {
            if !self.request.is_filtered() && self.request.mode != DeploymentMode::Overwrite {
                self.apply_privileges(schema)?;
            }
        }

        let package_id = self.record(dependency_ids, &executed_tables)?;

        let missing = self.request.missing_files.clone();
        let status = if missing.is_empty()
            && kinds.values().all(|k| k.requested.len() == k.deployed.len())
        {
            DeploymentStatus::Ok
        } else {
            DeploymentStatus::NotAllDeployed
        };
        Ok(DeploymentResult {
            package_id,
            schema,
            action,
            kinds,
            missing,
            status,
        })
    }

    /// Collects every missing dependency before failing.
    fn resolve_dependencies(&mut self) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        let mut missing = Vec::new();
        for dependency in &self.package.descriptor.dependencies {
            match self.session.find_package(&dependency.name, &dependency.pattern)? {
                Some(found) => {
                    debug!(dependency = %dependency.name, version = %found.version, id = found.id, "Resolved dependency");
                    ids.push(found.id);
                }
                None => missing.push(format!("{} {}", dependency.name, dependency.pattern)),
            }
        }
        if !missing.is_empty() {
            return Err(EngineError::UnresolvedDependency { missing });
        }
        Ok(ids)
    }

    fn deploy_types(&mut self) -> Result<KindReport> {
        let scripts = self.package.scripts.get(ObjectKind::Types);
        let statements = TypeStatement::from_scripts(
            scripts
                .iter()
                .map(|s| (s.identifier.as_str(), s.source_text.as_str())),
        );
        let resolved = resolve_types(statements)?;
        debug!(
            drops = resolved.drops.len(),
            creates = resolved.creates.len(),
            others = resolved.others.len(),
            "Ordered type statements"
        );
        for statement in resolved.iter() {
            self.session
                .execute(&statement.text)
                .map_err(|e| EngineError::script(&statement.script, self.request.auto_commit, e))?;
        }

        let identifiers: Vec<String> = scripts.iter().map(|s| s.identifier.clone()).collect();
        Ok(KindReport {
            requested: identifiers.clone(),
            deployed: identifiers,
            ..KindReport::default()
        })
    }

    /// Returns the report and the `(script, checksum)` pairs to record.
    fn deploy_tables(
        &mut self,
        tables: &[&ObjectScript],
    ) -> Result<(KindReport, Vec<(String, String)>)> {
        let mut report = KindReport::default();
        let mut to_record = Vec::new();
        let name = self.package.descriptor.name.clone();
        let version = self.package.descriptor.version.clone();

        for script in tables {
            report.requested.push(script.identifier.clone());
            let digest = checksum(&script.source_text);
            let recorded = self
                .session
                .table_script_record(&script.identifier, &name, &version)?;

            if let Some(record) = &recorded {
                if record.checksum.as_deref().is_some_and(|c| c != digest) {
                    warn!(script = %script.identifier, "Table script changed since it was executed");
                    report.changed.push(script.identifier.clone());
                }
                if self.request.mode != DeploymentMode::Unsafe {
                    debug!(script = %script.identifier, "Table script already executed, skipping");
                    report.skipped.push(script.identifier.clone());
                    continue;
                }
            }

            self.run_script(script)?;
            report.deployed.push(script.identifier.clone());
            if recorded.is_none() {
                to_record.push((script.identifier.clone(), digest));
            }
        }
        Ok((report, to_record))
    }

    fn deploy_scripts(&mut self, kind: ObjectKind) -> Result<KindReport> {
        let mut report = KindReport::default();
        let package = self.package;
        for script in package.scripts.get(kind) {
            report.requested.push(script.identifier.clone());
            self.run_script(script)?;
            report.deployed.push(script.identifier.clone());
        }
        Ok(report)
    }

    fn run_script(&mut self, script: &ObjectScript) -> Result<()> {
        debug!(script = %script.identifier, "Executing script");
        if self.request.auto_commit {
            for statement in split_statements(&script.source_text) {
                self.session
                    .execute(&statement)
                    .map_err(|e| EngineError::script(&script.identifier, true, e))?;
            }
        } else if !script.source_text.trim().is_empty() {
            self.session
                .execute(&script.source_text)
                .map_err(|e| EngineError::script(&script.identifier, false, e))?;
        }
        Ok(())
    }

    fn apply_privileges(&mut self, schema: &str) -> Result<()> {
        self.session.revoke_public(schema)?;
        let descriptor = &self.package.descriptor;
        if !descriptor.usage_roles.is_empty() {
            self.session.grant_usage(schema, &descriptor.usage_roles)?;
        }
        if let Some(owner) = &descriptor.owner_role {
            debug!(schema = %schema, owner = %owner, "Reassigning schema ownership");
            self.session.call_procedure(
                &self.settings.procedure("_alter_schema_owner"),
                &[Value::from(schema), Value::from(owner.as_str())],
            )?;
        }
        Ok(())
    }

    fn record(&mut self, dependency_ids: Vec<i64>, tables: &[(String, String)]) -> Result<i64> {
        let mut record = PackageRecord::from_descriptor(&self.package.descriptor, dependency_ids);
        record.vcs_ref = self.request.vcs_ref.clone();
        record.vcs_link = self.request.vcs_link.clone();
        record.issue_ref = self.request.issue_ref.clone();
        record.issue_link = self.request.issue_link.clone();
        let package_id = self.session.upsert_package(&record)?;

        for (script, digest) in tables {
            self.session.record_table_script(script, package_id, digest)?;
        }

        self.session.record_deployment_event(&DeploymentEvent {
            package_id,
            mode: self.request.mode,
            vcs_ref: self.request.vcs_ref.clone(),
            vcs_link: self.request.vcs_link.clone(),
            issue_ref: self.request.issue_ref.clone(),
            issue_link: self.request.issue_link.clone(),
            deployed_at: Utc::now(),
        })?;
        Ok(package_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> Vec<ObjectScript> {
        names
            .iter()
            .map(|n| ObjectScript::new(format!("tables/{n}"), "SELECT 1;"))
            .collect()
    }

    fn order(scripts: &[ObjectScript], order: TableOrder) -> Vec<String> {
        order_table_scripts(scripts, order)
            .unwrap()
            .into_iter()
            .map(|s| s.identifier.clone())
            .collect()
    }

    #[test]
    fn test_table_scripts_order_as_text_or_integers() {
        let scripts = tables(&["10.sql", "9.sql", "010.sql", "2.sql"]);
        assert_eq!(
            order(&scripts, TableOrder::Lexicographic),
            ["tables/010.sql", "tables/10.sql", "tables/2.sql", "tables/9.sql"]
        );
        assert_eq!(
            order(&scripts, TableOrder::Integer),
            ["tables/2.sql", "tables/9.sql", "tables/10.sql", "tables/010.sql"]
        );
    }

    #[test]
    fn test_integer_order_rejects_non_numeric_names() {
        let scripts = tables(&["1.sql", "accounts.sql"]);
        let err = order_table_scripts(&scripts, TableOrder::Integer).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTableScriptName(ref s) if s == "tables/accounts.sql"));
    }

    #[test]
    fn test_auto_commit_requires_safe_mode_with_files() {
        let mut request = DeployRequest::new(DeploymentMode::Safe);
        request.auto_commit = true;
        assert!(matches!(request.validate(), Err(EngineError::AutocommitNotAllowed)));

        request.files = vec!["functions/a.sql".into()];
        assert!(request.validate().is_ok());

        request.mode = DeploymentMode::Unsafe;
        assert!(matches!(request.validate(), Err(EngineError::AutocommitNotAllowed)));
    }
}
