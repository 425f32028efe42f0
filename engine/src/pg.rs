//! PostgreSQL session.
//!
//! [`PgSession`] implements the executor, catalog and ledger traits on top
//! of a synchronous [`postgres::Client`]. Object scripts go through the
//! simple query protocol so one script may hold many statements; metadata
//! reads and writes use parameterized queries. Server notices (`RAISE
//! NOTICE` and friends) are forwarded to `tracing`.

use std::str::FromStr;

use dbpm_core::{Encoding, Subclass, Version, VersionPattern};
use postgres::error::DbError;
use postgres::types::ToSql;
use postgres::{Client, Config, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

use crate::catalog::SchemaCatalog;
use crate::executor::{ExecutionError, Executor, Row, Value};
use crate::ledger::{
    DeploymentEvent, MetadataStore, PackageRecord, StoredPackage, TableScriptRecord,
    stored_version,
};
use crate::sql;

const SCHEMA_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)";
const LEDGER_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE schemaname = $1 AND tablename = 'packages')";
const IS_SUPERUSER: &str = "SELECT usesuper FROM pg_user WHERE usename = CURRENT_USER";

const PACKAGE_COLUMNS: &str = "id, name, subclass, v_major, v_minor, v_patch, v_pre, v_metadata, revision";

const VERSION_MATCH: &str =
    "v_major = $2 AND v_minor = $3 AND v_patch = $4 AND coalesce(v_pre, '') = $5";

/// A connected PostgreSQL session.
pub struct PgSession {
    client: Client,
    metadata_schema: String,
    autocommit: bool,
    in_transaction: bool,
}

impl PgSession {
    /// Connects with a libpq-style connection string or URL.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Connection`] when the string does not parse or the
    /// server cannot be reached.
    pub fn connect(url: &str, metadata_schema: &str) -> Result<Self, ExecutionError> {
        let mut config =
            Config::from_str(url).map_err(|e| ExecutionError::Connection(e.to_string()))?;
        config.notice_callback(log_notice);
        let client = config
            .connect(NoTls)
            .map_err(|e| ExecutionError::Connection(e.to_string()))?;
        debug!(metadata_schema = %metadata_schema, "Connected to PostgreSQL");
        Ok(Self {
            client,
            metadata_schema: metadata_schema.to_string(),
            autocommit: false,
            in_transaction: false,
        })
    }

    /// Renders a metadata query template.
    fn meta(&self, template: &str) -> String {
        sql::render_metadata_script(template, &self.metadata_schema)
    }

    fn query(
        &mut self,
        template: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<postgres::Row>, ExecutionError> {
        let statement = self.meta(template);
        debug!(sql = %statement, "Metadata query");
        self.client
            .query(statement.as_str(), params)
            .map_err(convert_error)
    }

    fn run(&mut self, statement: &str) -> Result<(), ExecutionError> {
        self.execute(statement).map(|_| ())
    }

    /// Id of the current row of a package, keyed like `upsert_package`.
    fn current_package_id(
        &mut self,
        name: &str,
        subclass: Subclass,
        version: &Version,
    ) -> Result<Option<i32>, ExecutionError> {
        let rows = match subclass {
            Subclass::Basic => self.query(
                "SELECT id FROM {schema}.packages WHERE name = $1 AND revision IS NULL",
                &[&name],
            )?,
            Subclass::Versioned => {
                let v = VersionParams::new(version)?;
                self.query(
                    &format!(
                        "SELECT id FROM {{schema}}.packages WHERE name = $1 AND revision IS NULL AND {VERSION_MATCH}"
                    ),
                    &[&name, &v.major, &v.minor, &v.patch, &v.pre],
                )?
            }
        };
        rows.first()
            .map(|row| row.try_get::<_, i32>(0))
            .transpose()
            .map_err(convert_error)
    }
}

fn log_notice(notice: DbError) {
    match notice.severity() {
        "WARNING" => warn!(code = notice.code().code(), "{}", notice.message()),
        "DEBUG" | "LOG" => debug!(code = notice.code().code(), "{}", notice.message()),
        _ => info!(code = notice.code().code(), "{}", notice.message()),
    }
}

fn convert_error(e: postgres::Error) -> ExecutionError {
    if let Some(db) = e.as_db_error() {
        return ExecutionError::Statement {
            message: db.message().to_string(),
            code: Some(db.code().code().to_string()),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
        };
    }
    let io_failure = std::error::Error::source(&e).is_some_and(|s| s.is::<std::io::Error>());
    if e.is_closed() || io_failure {
        ExecutionError::Connection(e.to_string())
    } else {
        ExecutionError::statement(e.to_string())
    }
}

fn out_of_range(what: &str) -> ExecutionError {
    ExecutionError::statement(format!("{what} does not fit in a 32-bit integer"))
}

fn to_i32(value: i64, what: &str) -> Result<i32, ExecutionError> {
    i32::try_from(value).map_err(|_| out_of_range(what))
}

/// Version components as query parameters.
struct VersionParams {
    major: i32,
    minor: i32,
    patch: i32,
    pre: String,
    metadata: Option<String>,
}

impl VersionParams {
    fn new(version: &Version) -> Result<Self, ExecutionError> {
        let component = |v: u64| i32::try_from(v).map_err(|_| out_of_range("version component"));
        Ok(Self {
            major: component(version.major)?,
            minor: component(version.minor)?,
            patch: component(version.patch)?,
            pre: version.pre.clone().unwrap_or_default(),
            metadata: version.metadata.clone(),
        })
    }

    fn pre_column(&self) -> Option<&str> {
        (!self.pre.is_empty()).then_some(self.pre.as_str())
    }
}

fn stored_package(row: &postgres::Row) -> Result<StoredPackage, ExecutionError> {
    let subclass: String = row.try_get("subclass").map_err(convert_error)?;
    let subclass = subclass
        .parse::<Subclass>()
        .map_err(ExecutionError::statement)?;
    let encoding = Encoding::Package;
    let version = stored_version(
        encoding,
        i64::from(row.try_get::<_, i32>("v_major").map_err(convert_error)?),
        i64::from(row.try_get::<_, i32>("v_minor").map_err(convert_error)?),
        i64::from(row.try_get::<_, i32>("v_patch").map_err(convert_error)?),
        row.try_get("v_pre").map_err(convert_error)?,
        row.try_get("v_metadata").map_err(convert_error)?,
    );
    let revision: Option<i32> = row.try_get("revision").map_err(convert_error)?;
    Ok(StoredPackage {
        id: i64::from(row.try_get::<_, i32>("id").map_err(convert_error)?),
        name: row.try_get("name").map_err(convert_error)?,
        subclass,
        version,
        revision: revision.and_then(|r| u32::try_from(r).ok()),
    })
}

impl Executor for PgSession {
    fn execute(&mut self, sql: &str) -> Result<Vec<Row>, ExecutionError> {
        debug!(sql = %sql, "Executing");
        let messages = self.client.simple_query(sql).map_err(convert_error)?;

        let mut current: Vec<Row> = Vec::new();
        let mut last = Vec::new();
        for message in messages {
            match message {
                SimpleQueryMessage::Row(row) => current.push(
                    (0..row.len())
                        .map(|i| row.get(i).map_or(Value::Null, |v| Value::Text(v.to_string())))
                        .collect(),
                ),
                SimpleQueryMessage::CommandComplete(_) => last = std::mem::take(&mut current),
                _ => {}
            }
        }
        Ok(last)
    }

    fn begin(&mut self) -> Result<(), ExecutionError> {
        if self.autocommit || self.in_transaction {
            return Ok(());
        }
        self.client.batch_execute("BEGIN").map_err(convert_error)?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ExecutionError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute("COMMIT").map_err(convert_error)
    }

    fn rollback(&mut self) -> Result<(), ExecutionError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute("ROLLBACK").map_err(convert_error)
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

impl SchemaCatalog for PgSession {
    fn schema_exists(&mut self, schema: &str) -> Result<bool, ExecutionError> {
        let row = self
            .client
            .query_one(SCHEMA_EXISTS, &[&schema])
            .map_err(convert_error)?;
        row.try_get(0).map_err(convert_error)
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), ExecutionError> {
        self.run(&sql::create_schema(schema))
    }

    fn rename_schema(&mut self, from: &str, to: &str) -> Result<(), ExecutionError> {
        self.run(&sql::rename_schema(from, to))
    }

    fn drop_schema(&mut self, schema: &str) -> Result<(), ExecutionError> {
        self.run(&sql::drop_schema(schema))
    }

    fn set_search_path(&mut self, schema: Option<&str>) -> Result<(), ExecutionError> {
        self.run(&sql::set_search_path(schema))
    }

    fn revoke_public(&mut self, schema: &str) -> Result<(), ExecutionError> {
        self.run(&sql::revoke_all(schema, "public"))
    }

    fn grant_usage(&mut self, schema: &str, roles: &[String]) -> Result<(), ExecutionError> {
        self.run(&sql::grant_usage(schema, roles))
    }

    fn grant_data_privileges(
        &mut self,
        schema: &str,
        roles: &[String],
    ) -> Result<(), ExecutionError> {
        self.run(&sql::grant_data_privileges(schema, roles))
    }

    fn current_role(&mut self) -> Result<String, ExecutionError> {
        let row = self
            .client
            .query_one("SELECT current_user::text", &[])
            .map_err(convert_error)?;
        row.try_get(0).map_err(convert_error)
    }

    fn is_superuser(&mut self) -> Result<bool, ExecutionError> {
        let rows = self
            .client
            .query(IS_SUPERUSER, &[])
            .map_err(convert_error)?;
        match rows.first() {
            Some(row) => row.try_get(0).map_err(convert_error),
            None => Ok(false),
        }
    }
}

impl MetadataStore for PgSession {
    fn installed_version(&mut self) -> Result<Option<Version>, ExecutionError> {
        let schema = self.metadata_schema.clone();
        let ledger = self
            .client
            .query_one(LEDGER_EXISTS, &[&schema])
            .map_err(convert_error)?;
        if !ledger.try_get::<_, bool>(0).map_err(convert_error)? {
            return Ok(None);
        }
        let rows = self.query(
            "SELECT v_major, v_minor, v_patch, v_pre, v_metadata FROM {schema}.packages
             WHERE name = $1 AND revision IS NULL",
            &[&schema],
        )?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let major: i32 = row.try_get(0).map_err(convert_error)?;
        let minor: i32 = row.try_get(1).map_err(convert_error)?;
        let patch: i32 = row.try_get(2).map_err(convert_error)?;
        Ok(Some(stored_version(
            Encoding::Engine,
            i64::from(major),
            i64::from(minor),
            i64::from(patch),
            row.try_get(3).map_err(convert_error)?,
            row.try_get(4).map_err(convert_error)?,
        )))
    }

    fn find_package(
        &mut self,
        name: &str,
        pattern: &VersionPattern,
    ) -> Result<Option<StoredPackage>, ExecutionError> {
        let rows = self.query(
            &format!(
                "SELECT {PACKAGE_COLUMNS} FROM {{schema}}.packages WHERE name = $1 AND revision IS NULL"
            ),
            &[&name],
        )?;
        let mut best: Option<StoredPackage> = None;
        for row in &rows {
            let candidate = stored_package(row)?;
            if !pattern.matches(&candidate.version) {
                continue;
            }
            if best.as_ref().is_none_or(|b| candidate.version > b.version) {
                best = Some(candidate);
            }
        }
        Ok(best)
    }

    fn upsert_package(&mut self, record: &PackageRecord) -> Result<i64, ExecutionError> {
        let v = VersionParams::new(&record.version)?;
        let subclass = record.subclass.as_str();
        let id = match self.current_package_id(&record.name, record.subclass, &record.version)? {
            Some(id) => {
                self.query(
                    "UPDATE {schema}.packages SET subclass = $2, v_major = $3, v_minor = $4,
                         v_patch = $5, v_pre = $6, v_metadata = $7, description = $8,
                         license = $9, vcs_ref = $10, vcs_link = $11, issue_ref = $12,
                         issue_link = $13, deployed_at = now()
                     WHERE id = $1",
                    &[
                        &id,
                        &subclass,
                        &v.major,
                        &v.minor,
                        &v.patch,
                        &v.pre_column(),
                        &v.metadata,
                        &record.description,
                        &record.license,
                        &record.vcs_ref,
                        &record.vcs_link,
                        &record.issue_ref,
                        &record.issue_link,
                    ],
                )?;
                id
            }
            None => {
                let rows = self.query(
                    "INSERT INTO {schema}.packages (name, subclass, v_major, v_minor, v_patch,
                         v_pre, v_metadata, description, license, vcs_ref, vcs_link,
                         issue_ref, issue_link)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                     RETURNING id",
                    &[
                        &record.name,
                        &subclass,
                        &v.major,
                        &v.minor,
                        &v.patch,
                        &v.pre_column(),
                        &v.metadata,
                        &record.description,
                        &record.license,
                        &record.vcs_ref,
                        &record.vcs_link,
                        &record.issue_ref,
                        &record.issue_link,
                    ],
                )?;
                let row = rows
                    .first()
                    .ok_or_else(|| ExecutionError::statement("INSERT returned no id"))?;
                row.try_get::<_, i32>(0).map_err(convert_error)?
            }
        };

        self.query(
            "DELETE FROM {schema}.package_dependencies WHERE package_id = $1",
            &[&id],
        )?;
        for dependency in &record.dependency_ids {
            let dependency = to_i32(*dependency, "dependency id")?;
            self.query(
                "INSERT INTO {schema}.package_dependencies (package_id, dependency_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&id, &dependency],
            )?;
        }
        Ok(i64::from(id))
    }

    fn mark_revision(
        &mut self,
        name: &str,
        subclass: Subclass,
        version: &Version,
        revision: u32,
    ) -> Result<bool, ExecutionError> {
        let Some(id) = self.current_package_id(name, subclass, version)? else {
            return Ok(false);
        };
        let revision = i32::try_from(revision).map_err(|_| out_of_range("revision"))?;
        self.query(
            "UPDATE {schema}.packages SET revision = $2 WHERE id = $1",
            &[&id, &revision],
        )?;
        Ok(true)
    }

    fn record_table_script(
        &mut self,
        script: &str,
        package_id: i64,
        checksum: &str,
    ) -> Result<(), ExecutionError> {
        let package_id = to_i32(package_id, "package id")?;
        self.query(
            "INSERT INTO {schema}.table_evolutions (script, package_id, checksum) VALUES ($1, $2, $3)",
            &[&script, &package_id, &checksum],
        )?;
        Ok(())
    }

    fn table_script_record(
        &mut self,
        script: &str,
        name: &str,
        version: &Version,
    ) -> Result<Option<TableScriptRecord>, ExecutionError> {
        let v = VersionParams::new(version)?;
        let rows = self.query(
            "SELECT t.package_id, t.checksum
             FROM {schema}.table_evolutions t
             JOIN {schema}.packages p ON p.id = t.package_id
             WHERE p.name = $1 AND p.revision IS NULL
               AND p.v_major = $2 AND p.v_minor = $3 AND p.v_patch = $4
               AND coalesce(p.v_pre, '') = $5 AND t.script = $6
             ORDER BY t.id DESC
             LIMIT 1",
            &[&name, &v.major, &v.minor, &v.patch, &v.pre, &script],
        )?;
        rows.first()
            .map(|row| {
                Ok::<_, ExecutionError>(TableScriptRecord {
                    script: script.to_string(),
                    package_id: i64::from(row.try_get::<_, i32>(0).map_err(convert_error)?),
                    checksum: row.try_get(1).map_err(convert_error)?,
                })
            })
            .transpose()
    }

    fn record_migration_applied(
        &mut self,
        from: &Version,
        to: &Version,
    ) -> Result<(), ExecutionError> {
        self.query(
            "INSERT INTO {schema}.migrations (version_from, version_to) VALUES ($1, $2)
             ON CONFLICT (version_from, version_to) DO NOTHING",
            &[&from.to_canonical_string(), &to.to_canonical_string()],
        )?;
        Ok(())
    }

    fn is_migration_applied(&mut self, from: &Version, to: &Version) -> Result<bool, ExecutionError> {
        let rows = self.query(
            "SELECT EXISTS (SELECT 1 FROM {schema}.migrations WHERE version_from = $1 AND version_to = $2)",
            &[&from.to_canonical_string(), &to.to_canonical_string()],
        )?;
        match rows.first() {
            Some(row) => row.try_get(0).map_err(convert_error),
            None => Ok(false),
        }
    }

    fn record_deployment_event(&mut self, event: &DeploymentEvent) -> Result<(), ExecutionError> {
        let package_id = to_i32(event.package_id, "package id")?;
        self.query(
            "INSERT INTO {schema}.deployment_events
                 (package_id, mode, vcs_ref, vcs_link, issue_ref, issue_link, deployed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &package_id,
                &event.mode.as_str(),
                &event.vcs_ref,
                &event.vcs_link,
                &event.issue_ref,
                &event.issue_link,
                &event.deployed_at,
            ],
        )?;
        Ok(())
    }

    fn package_rows(
        &mut self,
        name: &str,
        version: &Version,
    ) -> Result<Vec<StoredPackage>, ExecutionError> {
        let v = VersionParams::new(version)?;
        let rows = self.query(
            &format!(
                "SELECT {PACKAGE_COLUMNS} FROM {{schema}}.packages
                 WHERE name = $1 AND {VERSION_MATCH}
                 ORDER BY revision NULLS FIRST"
            ),
            &[&name, &v.major, &v.minor, &v.patch, &v.pre],
        )?;
        rows.iter().map(stored_package).collect()
    }

    fn dependents_of(&mut self, ids: &[i64]) -> Result<Vec<String>, ExecutionError> {
        let ids = ids
            .iter()
            .map(|id| to_i32(*id, "package id"))
            .collect::<Result<Vec<i32>, _>>()?;
        let rows = self.query(
            "SELECT DISTINCT p.name
             FROM {schema}.package_dependencies d
             JOIN {schema}.packages p ON p.id = d.package_id
             WHERE d.dependency_id = ANY($1) AND NOT (d.package_id = ANY($1))
             ORDER BY p.name",
            &[&ids],
        )?;
        rows.iter()
            .map(|row| row.try_get(0).map_err(convert_error))
            .collect()
    }

    fn delete_package(&mut self, id: i64) -> Result<(), ExecutionError> {
        let id = to_i32(id, "package id")?;
        self.query("DELETE FROM {schema}.packages WHERE id = $1", &[&id])?;
        Ok(())
    }
}
