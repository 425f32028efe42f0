//! Deployment engine of the dbpm database package manager.
//!
//! The engine talks to a database through a [`Session`]: raw execution and
//! transaction control ([`Executor`]), schema catalog operations
//! ([`SchemaCatalog`]) and the metadata ledger ([`MetadataStore`]).
//! [`PgSession`] implements all three for PostgreSQL; the in-memory
//! `testing::MemoryDatabase` (feature `testing`) implements them for tests.
//!
//! Operations:
//!
//! - [`install`] / [`uninstall`] create, migrate or drop the metadata schema.
//! - [`deploy`] runs a package's scripts inside its target schema following
//!   the [`DeploymentMode`](dbpm_core::DeploymentMode) lifecycle rules.
//! - [`remove`] drops a deployed package and its metadata.
//! - [`execute_query`] runs an ad-hoc statement, optionally until it reports
//!   zero affected rows.
//!
//! Every operation except `install` and `uninstall` first checks that the
//! installed metadata schema matches [`EngineSettings::engine_version`].
//!
//! # Example
//!
//! ```no_run
//! use dbpm_engine::{EngineSettings, InstallOptions, PgSession, install};
//!
//! let settings = EngineSettings::default();
//! let mut session = PgSession::connect("postgres://postgres@localhost/app", &settings.metadata_schema)?;
//! install(&mut session, &settings, &InstallOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod catalog;
mod deploy;
mod error;
mod executor;
mod install;
mod ledger;
mod lifecycle;
pub mod migration;
mod pg;
mod query;
mod remove;
mod settings;
pub mod sql;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::SchemaCatalog;
pub use deploy::{
    DeployRequest, DeploymentResult, DeploymentStatus, KindReport, deploy, order_table_scripts,
};
pub use error::{EngineError, ErrorCategory, Result};
pub use executor::{ExecutionError, Executor, Row, Value};
pub use install::{InstallOptions, InstallOutcome, install, uninstall};
pub use ledger::{
    DeploymentEvent, MetadataStore, PackageRecord, StoredPackage, TableScriptRecord, checksum,
};
pub use lifecycle::{SchemaAction, establish, next_free_revision};
pub use migration::{EngineStatus, MigrationStep};
pub use pg::PgSession;
pub use query::{MAX_REPEATS, QueryOutcome, execute_query};
pub use remove::{RemoveRequest, remove};
pub use settings::{DEFAULT_METADATA_SCHEMA, ENGINE_VERSION, EngineSettings, Session};
pub use sql::QualifiedName;
