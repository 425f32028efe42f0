//! In-memory [`Session`](crate::Session) for tests.
//!
//! [`MemoryDatabase`] models what the engine observes of a PostgreSQL
//! database: schemas with their owner and grants, the metadata ledger,
//! transactions (a snapshot taken on `begin`, restored on `rollback`),
//! auto-commit, and the text of every statement sent. Object scripts are
//! not interpreted, only logged.
//!
//! Failures are injected with [`fail_on`](MemoryDatabase::fail_on) (any
//! statement containing the pattern fails) and
//! [`disconnect`](MemoryDatabase::disconnect) (every later call fails with a
//! connection error).
//!
//! ```
//! use dbpm_engine::testing::MemoryDatabase;
//! use dbpm_engine::{Executor, SchemaCatalog};
//!
//! let mut db = MemoryDatabase::new();
//! db.begin().unwrap();
//! db.create_schema("billing").unwrap();
//! db.rollback().unwrap();
//! assert!(!db.has_schema("billing"));
//! ```

use std::collections::{BTreeMap, VecDeque};

use dbpm_core::{Encoding, Subclass, Version, VersionPattern};

use crate::catalog::SchemaCatalog;
use crate::executor::{ExecutionError, Executor, Row, Value};
use crate::ledger::{
    DeploymentEvent, MetadataStore, PackageRecord, StoredPackage, TableScriptRecord,
};
use crate::migration::register_engine_version;
use crate::settings::{DEFAULT_METADATA_SCHEMA, EngineSettings};
use crate::sql::{self, QualifiedName};

#[derive(Debug, Clone, Default)]
struct SchemaState {
    owner: Option<String>,
    public_revoked: bool,
    usage: Vec<String>,
    data_privileges: Vec<String>,
}

#[derive(Debug, Clone)]
struct PackageRow {
    id: i64,
    record: PackageRecord,
    revision: Option<u32>,
}

impl PackageRow {
    fn stored(&self) -> StoredPackage {
        StoredPackage {
            id: self.id,
            name: self.record.name.clone(),
            subclass: self.record.subclass,
            version: self.record.version.clone(),
            revision: self.revision,
        }
    }

    fn is_current_for(&self, name: &str, subclass: Subclass, version: &Version) -> bool {
        self.revision.is_none()
            && self.record.name == name
            && (subclass == Subclass::Basic || self.record.version == *version)
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    schemas: BTreeMap<String, SchemaState>,
    packages: Vec<PackageRow>,
    last_id: i64,
    table_scripts: Vec<TableScriptRecord>,
    migrations: Vec<(Version, Version)>,
    events: Vec<DeploymentEvent>,
    search_path: Option<String>,
}

/// An in-memory database session.
#[derive(Debug)]
pub struct MemoryDatabase {
    state: State,
    snapshot: Option<State>,
    metadata_schema: String,
    role: String,
    superuser: bool,
    autocommit: bool,
    connected: bool,
    statements: Vec<String>,
    failures: Vec<String>,
    results: VecDeque<Vec<Row>>,
    procedure_calls: Vec<(String, Vec<Value>)>,
    commits: usize,
    rollbacks: usize,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self {
            state: State::default(),
            snapshot: None,
            metadata_schema: DEFAULT_METADATA_SCHEMA.to_string(),
            role: "postgres".to_string(),
            superuser: true,
            autocommit: false,
            connected: true,
            statements: Vec::new(),
            failures: Vec::new(),
            results: VecDeque::new(),
            procedure_calls: Vec::new(),
            commits: 0,
            rollbacks: 0,
        }
    }
}

impl MemoryDatabase {
    /// An empty database without the metadata schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// A database whose metadata schema is installed at `engine_version`.
    ///
    /// # Panics
    ///
    /// If `engine_version` is not a valid engine version.
    pub fn installed(engine_version: &str) -> Self {
        let version = Version::parse(engine_version, Encoding::Engine)
            .unwrap_or_else(|e| panic!("MemoryDatabase::installed: {e}"));
        let mut db = Self::new();
        db.add_schema(DEFAULT_METADATA_SCHEMA);
        let settings = EngineSettings::default();
        if let Err(e) = register_engine_version(&mut db, &settings, &version) {
            panic!("MemoryDatabase::installed: {e}");
        }
        db
    }

    /// Adds an existing schema.
    pub fn with_schema(mut self, schema: &str) -> Self {
        self.add_schema(schema);
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    fn add_schema(&mut self, schema: &str) {
        self.state.schemas.insert(
            schema.to_string(),
            SchemaState {
                owner: Some(self.role.clone()),
                ..SchemaState::default()
            },
        );
    }

    /// Makes every later statement containing `pattern` fail.
    pub fn fail_on(&mut self, pattern: &str) {
        self.failures.push(pattern.to_string());
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    /// Drops the connection; every later call fails.
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn set_superuser(&mut self, superuser: bool) {
        self.superuser = superuser;
    }

    /// Queues the rows returned by the next [`Executor::execute`] call.
    pub fn push_result(&mut self, rows: Vec<Row>) {
        self.results.push_back(rows);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn has_schema(&self, schema: &str) -> bool {
        self.state.schemas.contains_key(schema)
    }

    pub fn schema_names(&self) -> Vec<String> {
        self.state.schemas.keys().cloned().collect()
    }

    pub fn schema_owner(&self, schema: &str) -> Option<&str> {
        self.state.schemas.get(schema)?.owner.as_deref()
    }

    pub fn usage_roles(&self, schema: &str) -> &[String] {
        self.state
            .schemas
            .get(schema)
            .map_or(&[], |s| s.usage.as_slice())
    }

    pub fn data_privilege_roles(&self, schema: &str) -> &[String] {
        self.state
            .schemas
            .get(schema)
            .map_or(&[], |s| s.data_privileges.as_slice())
    }

    pub fn is_public_revoked(&self, schema: &str) -> bool {
        self.state
            .schemas
            .get(schema)
            .is_some_and(|s| s.public_revoked)
    }

    pub fn search_path(&self) -> Option<&str> {
        self.state.search_path.as_deref()
    }

    /// Every statement sent, including failed and rolled-back ones.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Whether any statement sent contained `pattern`.
    pub fn executed(&self, pattern: &str) -> bool {
        self.executed_count(pattern) > 0
    }

    pub fn executed_count(&self, pattern: &str) -> usize {
        self.statements.iter().filter(|s| s.contains(pattern)).count()
    }

    pub fn procedure_calls(&self) -> &[(String, Vec<Value>)] {
        &self.procedure_calls
    }

    /// All package rows, current and superseded.
    pub fn packages(&self) -> Vec<StoredPackage> {
        self.state.packages.iter().map(PackageRow::stored).collect()
    }

    pub fn package_record(&self, id: i64) -> Option<&PackageRecord> {
        self.state
            .packages
            .iter()
            .find(|row| row.id == id)
            .map(|row| &row.record)
    }

    pub fn table_scripts(&self) -> &[TableScriptRecord] {
        &self.state.table_scripts
    }

    pub fn events(&self) -> &[DeploymentEvent] {
        &self.state.events
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_connected(&self) -> Result<(), ExecutionError> {
        if self.connected {
            Ok(())
        } else {
            Err(ExecutionError::Connection("server closed the connection".into()))
        }
    }

    /// Logs a statement and applies injected failures.
    fn send(&mut self, sql: String) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        let failure = self
            .failures
            .iter()
            .find(|pattern| sql.contains(pattern.as_str()))
            .cloned();
        self.statements.push(sql);
        match failure {
            Some(pattern) => Err(ExecutionError::statement(format!(
                "injected failure on statement matching '{pattern}'"
            ))),
            None => Ok(()),
        }
    }

    fn schema_mut(&mut self, schema: &str) -> Result<&mut SchemaState, ExecutionError> {
        self.state
            .schemas
            .get_mut(schema)
            .ok_or_else(|| missing_schema(schema))
    }
}

fn missing_schema(schema: &str) -> ExecutionError {
    ExecutionError::Statement {
        message: format!("schema \"{schema}\" does not exist"),
        code: Some("3F000".into()),
        detail: None,
        hint: None,
    }
}

fn duplicate_schema(schema: &str) -> ExecutionError {
    ExecutionError::Statement {
        message: format!("schema \"{schema}\" already exists"),
        code: Some("42P06".into()),
        detail: None,
        hint: None,
    }
}

fn add_roles(target: &mut Vec<String>, roles: &[String]) {
    for role in roles {
        if !target.contains(role) {
            target.push(role.clone());
        }
    }
}

impl Executor for MemoryDatabase {
    fn execute(&mut self, sql: &str) -> Result<Vec<Row>, ExecutionError> {
        self.send(sql.to_string())?;
        Ok(self.results.pop_front().unwrap_or_default())
    }

    fn call_procedure(
        &mut self,
        name: &QualifiedName,
        args: &[Value],
    ) -> Result<Vec<Row>, ExecutionError> {
        self.send(sql::call_procedure(name, args))?;
        self.procedure_calls.push((name.to_string(), args.to_vec()));
        if name.name == "_alter_schema_owner" {
            if let [Value::Text(schema), Value::Text(owner)] = args {
                let owner = owner.clone();
                self.schema_mut(schema)?.owner = Some(owner);
            }
        }
        Ok(Vec::new())
    }

    fn begin(&mut self) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        if !self.autocommit && self.snapshot.is_none() {
            self.snapshot = Some(self.state.clone());
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        if self.snapshot.take().is_some() {
            self.commits += 1;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        if let Some(snapshot) = self.snapshot.take() {
            self.state = snapshot;
            self.rollbacks += 1;
        }
        Ok(())
    }

    fn set_autocommit(&mut self, enabled: bool) -> Result<(), ExecutionError> {
        if enabled {
            self.commit()?;
        }
        self.autocommit = enabled;
        Ok(())
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }
}

impl SchemaCatalog for MemoryDatabase {
    fn schema_exists(&mut self, schema: &str) -> Result<bool, ExecutionError> {
        self.ensure_connected()?;
        Ok(self.has_schema(schema))
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), ExecutionError> {
        self.send(sql::create_schema(schema))?;
        if self.has_schema(schema) {
            return Err(duplicate_schema(schema));
        }
        self.add_schema(schema);
        Ok(())
    }

    fn rename_schema(&mut self, from: &str, to: &str) -> Result<(), ExecutionError> {
        self.send(sql::rename_schema(from, to))?;
        if self.has_schema(to) {
            return Err(duplicate_schema(to));
        }
        let state = self
            .state
            .schemas
            .remove(from)
            .ok_or_else(|| missing_schema(from))?;
        self.state.schemas.insert(to.to_string(), state);
        Ok(())
    }

    fn drop_schema(&mut self, schema: &str) -> Result<(), ExecutionError> {
        self.send(sql::drop_schema(schema))?;
        self.state
            .schemas
            .remove(schema)
            .map(|_| ())
            .ok_or_else(|| missing_schema(schema))
    }

    fn set_search_path(&mut self, schema: Option<&str>) -> Result<(), ExecutionError> {
        self.send(sql::set_search_path(schema))?;
        self.state.search_path = schema.map(str::to_string);
        Ok(())
    }

    fn revoke_public(&mut self, schema: &str) -> Result<(), ExecutionError> {
        self.send(sql::revoke_all(schema, "public"))?;
        self.schema_mut(schema)?.public_revoked = true;
        Ok(())
    }

    fn grant_usage(&mut self, schema: &str, roles: &[String]) -> Result<(), ExecutionError> {
        self.send(sql::grant_usage(schema, roles))?;
        add_roles(&mut self.schema_mut(schema)?.usage, roles);
        Ok(())
    }

    fn grant_data_privileges(
        &mut self,
        schema: &str,
        roles: &[String],
    ) -> Result<(), ExecutionError> {
        self.send(sql::grant_data_privileges(schema, roles))?;
        add_roles(&mut self.schema_mut(schema)?.data_privileges, roles);
        Ok(())
    }

    fn current_role(&mut self) -> Result<String, ExecutionError> {
        self.ensure_connected()?;
        Ok(self.role.clone())
    }

    fn is_superuser(&mut self) -> Result<bool, ExecutionError> {
        self.ensure_connected()?;
        Ok(self.superuser)
    }
}

impl MetadataStore for MemoryDatabase {
    fn installed_version(&mut self) -> Result<Option<Version>, ExecutionError> {
        self.ensure_connected()?;
        if !self.has_schema(&self.metadata_schema) {
            return Ok(None);
        }
        let name = self.metadata_schema.clone();
        Ok(self
            .state
            .packages
            .iter()
            .find(|row| row.revision.is_none() && row.record.name == name)
            .map(|row| row.record.version.clone()))
    }

    fn find_package(
        &mut self,
        name: &str,
        pattern: &VersionPattern,
    ) -> Result<Option<StoredPackage>, ExecutionError> {
        self.ensure_connected()?;
        Ok(self
            .state
            .packages
            .iter()
            .filter(|row| {
                row.revision.is_none()
                    && row.record.name == name
                    && pattern.matches(&row.record.version)
            })
            .max_by(|a, b| {
                a.record
                    .version
                    .partial_cmp(&b.record.version)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(PackageRow::stored))
    }

    fn upsert_package(&mut self, record: &PackageRecord) -> Result<i64, ExecutionError> {
        self.ensure_connected()?;
        let existing = self
            .state
            .packages
            .iter_mut()
            .find(|row| row.is_current_for(&record.name, record.subclass, &record.version));
        if let Some(row) = existing {
            row.record = record.clone();
            return Ok(row.id);
        }
        self.state.last_id += 1;
        let id = self.state.last_id;
        self.state.packages.push(PackageRow {
            id,
            record: record.clone(),
            revision: None,
        });
        Ok(id)
    }

    fn mark_revision(
        &mut self,
        name: &str,
        subclass: Subclass,
        version: &Version,
        revision: u32,
    ) -> Result<bool, ExecutionError> {
        self.ensure_connected()?;
        match self
            .state
            .packages
            .iter_mut()
            .find(|row| row.is_current_for(name, subclass, version))
        {
            Some(row) => {
                row.revision = Some(revision);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_table_script(
        &mut self,
        script: &str,
        package_id: i64,
        checksum: &str,
    ) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        self.state.table_scripts.push(TableScriptRecord {
            script: script.to_string(),
            package_id,
            checksum: Some(checksum.to_string()),
        });
        Ok(())
    }

    fn table_script_record(
        &mut self,
        script: &str,
        name: &str,
        version: &Version,
    ) -> Result<Option<TableScriptRecord>, ExecutionError> {
        self.ensure_connected()?;
        let Some(package_id) = self
            .state
            .packages
            .iter()
            .find(|row| {
                row.revision.is_none() && row.record.name == name && row.record.version == *version
            })
            .map(|row| row.id)
        else {
            return Ok(None);
        };
        Ok(self
            .state
            .table_scripts
            .iter()
            .rev()
            .find(|record| record.package_id == package_id && record.script == script)
            .cloned())
    }

    fn record_migration_applied(
        &mut self,
        from: &Version,
        to: &Version,
    ) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        if !self.is_migration_applied(from, to)? {
            self.state.migrations.push((from.clone(), to.clone()));
        }
        Ok(())
    }

    fn is_migration_applied(&mut self, from: &Version, to: &Version) -> Result<bool, ExecutionError> {
        self.ensure_connected()?;
        Ok(self
            .state
            .migrations
            .iter()
            .any(|(f, t)| f == from && t == to))
    }

    fn record_deployment_event(&mut self, event: &DeploymentEvent) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        self.state.events.push(event.clone());
        Ok(())
    }

    fn package_rows(
        &mut self,
        name: &str,
        version: &Version,
    ) -> Result<Vec<StoredPackage>, ExecutionError> {
        self.ensure_connected()?;
        Ok(self
            .state
            .packages
            .iter()
            .filter(|row| row.record.name == name && row.record.version == *version)
            .map(PackageRow::stored)
            .collect())
    }

    fn dependents_of(&mut self, ids: &[i64]) -> Result<Vec<String>, ExecutionError> {
        self.ensure_connected()?;
        let mut names: Vec<String> = self
            .state
            .packages
            .iter()
            .filter(|row| !ids.contains(&row.id))
            .filter(|row| row.record.dependency_ids.iter().any(|d| ids.contains(d)))
            .map(|row| row.record.name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn delete_package(&mut self, id: i64) -> Result<(), ExecutionError> {
        self.ensure_connected()?;
        self.state.packages.retain(|row| row.id != id);
        self.state.table_scripts.retain(|r| r.package_id != id);
        self.state.events.retain(|e| e.package_id != id);
        Ok(())
    }
}
