//! Target schema lifecycle.
//!
//! What happens to the target schema before objects are deployed depends on
//! the [`DeploymentMode`] and on whether the schema already exists:
//!
//! | mode        | schema absent | schema exists                                   |
//! |-------------|---------------|-------------------------------------------------|
//! | `safe`      | create        | fail with `SchemaAlreadyExists`                 |
//! | `moderate`  | create        | rename to the lowest free `<name>_N`, create    |
//! | `unsafe`    | create        | drop cascade, create                            |
//! | `overwrite` | fail with `SchemaMissing` | keep as is                          |

use dbpm_core::{DeploymentMode, PackageDescriptor};
use tracing::{info, warn};

use crate::catalog::SchemaCatalog;
use crate::error::{EngineError, Result};
use crate::ledger::MetadataStore;

/// What [`establish`] did to the target schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaAction {
    Created,
    /// The previous schema was renamed to `preserved_as` (revision
    /// `revision`) and a fresh one created.
    Renamed { preserved_as: String, revision: u32 },
    /// The previous schema was dropped and a fresh one created.
    Replaced,
    /// The existing schema was left in place.
    Kept,
}

/// Lowest `N` such that `<schema>_N` does not exist.
pub fn next_free_revision<S: SchemaCatalog + ?Sized>(session: &mut S, schema: &str) -> Result<u32> {
    let mut revision = 0;
    while session.schema_exists(&format!("{schema}_{revision}"))? {
        revision += 1;
    }
    Ok(revision)
}

/// Prepares `schema` for a deployment of `descriptor` under `mode`.
pub fn establish<S: SchemaCatalog + MetadataStore + ?Sized>(
    session: &mut S,
    descriptor: &PackageDescriptor,
    schema: &str,
    mode: DeploymentMode,
) -> Result<SchemaAction> {
    let exists = session.schema_exists(schema)?;
    let action = match (mode, exists) {
        (DeploymentMode::Overwrite, false) => {
            return Err(EngineError::SchemaMissing(schema.to_string()));
        }
        (DeploymentMode::Overwrite, true) => SchemaAction::Kept,
        (_, false) => {
            session.create_schema(schema)?;
            SchemaAction::Created
        }
        (DeploymentMode::Safe, true) => {
            return Err(EngineError::SchemaAlreadyExists(schema.to_string()));
        }
        (DeploymentMode::Moderate, true) => {
            let revision = next_free_revision(session, schema)?;
            let preserved_as = format!("{schema}_{revision}");
            session.rename_schema(schema, &preserved_as)?;
            let marked = session.mark_revision(
                &descriptor.name,
                descriptor.subclass,
                &descriptor.version,
                revision,
            )?;
            if !marked {
                warn!(schema = %schema, "Existing schema has no package record to mark as superseded");
            }
            session.create_schema(schema)?;
            SchemaAction::Renamed {
                preserved_as,
                revision,
            }
        }
        (DeploymentMode::Unsafe, true) => {
            session.drop_schema(schema)?;
            session.create_schema(schema)?;
            SchemaAction::Replaced
        }
    };
    info!(schema = %schema, mode = %mode, action = ?action, "Target schema ready");
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;
    use dbpm_core::{Subclass, Version};

    fn descriptor() -> PackageDescriptor {
        PackageDescriptor::new("foo", Subclass::Basic, Version::package(1, 0, 0))
    }

    #[test]
    fn test_absent_schema_is_created_in_every_creating_mode() {
        for mode in [DeploymentMode::Safe, DeploymentMode::Moderate, DeploymentMode::Unsafe] {
            let mut db = MemoryDatabase::new();
            let action = establish(&mut db, &descriptor(), "foo", mode).unwrap();
            assert_eq!(action, SchemaAction::Created);
            assert!(db.has_schema("foo"));
        }
    }

    #[test]
    fn test_safe_refuses_existing_schema() {
        let mut db = MemoryDatabase::new().with_schema("foo");
        let err = establish(&mut db, &descriptor(), "foo", DeploymentMode::Safe).unwrap_err();
        assert!(matches!(err, EngineError::SchemaAlreadyExists(ref s) if s == "foo"));
        assert!(db.statements().is_empty());
    }

    #[test]
    fn test_moderate_renames_to_lowest_free_suffix() {
        let mut db = MemoryDatabase::new().with_schema("foo").with_schema("foo_0");
        let action = establish(&mut db, &descriptor(), "foo", DeploymentMode::Moderate).unwrap();
        assert_eq!(
            action,
            SchemaAction::Renamed {
                preserved_as: "foo_1".into(),
                revision: 1
            }
        );
        assert!(db.has_schema("foo"));
        assert!(db.has_schema("foo_0"));
        assert!(db.has_schema("foo_1"));
    }

    #[test]
    fn test_moderate_marks_previous_package_row() {
        let mut db = MemoryDatabase::new().with_schema("foo");
        let record = crate::ledger::PackageRecord::from_descriptor(&descriptor(), Vec::new());
        db.upsert_package(&record).unwrap();

        establish(&mut db, &descriptor(), "foo", DeploymentMode::Moderate).unwrap();
        let rows = db.package_rows("foo", &Version::package(1, 0, 0)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].revision, Some(0));
        assert_eq!(rows[0].schema_name(), "foo_0");
    }

    #[test]
    fn test_unsafe_drops_and_recreates() {
        let mut db = MemoryDatabase::new().with_schema("foo");
        let action = establish(&mut db, &descriptor(), "foo", DeploymentMode::Unsafe).unwrap();
        assert_eq!(action, SchemaAction::Replaced);
        assert!(db.executed("DROP SCHEMA \"foo\" CASCADE"));
        assert!(db.has_schema("foo"));
    }

    #[test]
    fn test_overwrite_requires_existing_schema() {
        let mut db = MemoryDatabase::new();
        let err = establish(&mut db, &descriptor(), "foo", DeploymentMode::Overwrite).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMissing(_)));

        let mut db = MemoryDatabase::new().with_schema("foo");
        let action = establish(&mut db, &descriptor(), "foo", DeploymentMode::Overwrite).unwrap();
        assert_eq!(action, SchemaAction::Kept);
        assert!(db.statements().is_empty());
    }
}
