//! Removing deployed packages.

use dbpm_core::Version;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::executor::rollback_after_failure;
use crate::ledger::StoredPackage;
use crate::migration;
use crate::settings::{EngineSettings, Session};

/// Which package rows [`remove`] deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveRequest {
    pub name: String,
    pub version: Version,
    /// Only this superseded revision; otherwise the current row and every
    /// revision.
    pub revision: Option<u32>,
}

/// Drops the schemas of the selected package rows and deletes their
/// metadata, in one transaction. Returns the removed rows.
///
/// # Errors
///
/// [`EngineError::PackageNotFound`] when nothing matches;
/// [`EngineError::PackageInUse`] when another package depends on a selected
/// row.
pub fn remove<S: Session + ?Sized>(
    session: &mut S,
    request: &RemoveRequest,
    settings: &EngineSettings,
) -> Result<Vec<StoredPackage>> {
    migration::require_current(session, settings)?;

    let rows: Vec<StoredPackage> = session
        .package_rows(&request.name, &request.version)?
        .into_iter()
        .filter(|row| request.revision.is_none() || row.revision == request.revision)
        .collect();
    if rows.is_empty() {
        return Err(EngineError::PackageNotFound {
            name: request.name.clone(),
            version: match request.revision {
                Some(revision) => format!("{} (revision {revision})", request.version),
                None => request.version.to_string(),
            },
        });
    }

    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    let dependents = session.dependents_of(&ids)?;
    if !dependents.is_empty() {
        return Err(EngineError::PackageInUse {
            name: request.name.clone(),
            dependents,
        });
    }

    session.begin()?;
    if let Err(e) = drop_rows(session, &rows) {
        rollback_after_failure(session);
        return Err(e);
    }
    session.commit()?;
    Ok(rows)
}

fn drop_rows<S: Session + ?Sized>(session: &mut S, rows: &[StoredPackage]) -> Result<()> {
    for row in rows {
        let schema = row.schema_name();
        if session.schema_exists(&schema)? {
            session.drop_schema(&schema)?;
        } else {
            warn!(schema = %schema, "Schema of removed package does not exist");
        }
        session.delete_package(row.id)?;
        info!(package = %row.name, version = %row.version, revision = ?row.revision, schema = %schema, "Removed package");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MetadataStore, PackageRecord};
    use crate::testing::MemoryDatabase;
    use dbpm_core::Subclass;

    fn request(revision: Option<u32>) -> RemoveRequest {
        RemoveRequest {
            name: "billing".into(),
            version: Version::package(1, 0, 0),
            revision,
        }
    }

    fn deployed() -> (MemoryDatabase, i64) {
        let mut db = MemoryDatabase::installed(crate::settings::ENGINE_VERSION)
            .with_schema("billing_1_0_0")
            .with_schema("billing_1_0_0_0");
        let record = PackageRecord::new("billing", Subclass::Versioned, Version::package(1, 0, 0));
        db.upsert_package(&record).unwrap();
        db.mark_revision("billing", Subclass::Versioned, &Version::package(1, 0, 0), 0)
            .unwrap();
        let id = db.upsert_package(&record).unwrap();
        (db, id)
    }

    #[test]
    fn test_remove_single_revision() {
        let (mut db, _) = deployed();
        let removed = remove(&mut db, &request(Some(0)), &EngineSettings::default()).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!db.has_schema("billing_1_0_0_0"));
        assert!(db.has_schema("billing_1_0_0"));
    }

    #[test]
    fn test_remove_all_rows_of_a_version() {
        let (mut db, _) = deployed();
        let removed = remove(&mut db, &request(None), &EngineSettings::default()).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!db.has_schema("billing_1_0_0"));
        assert!(db.package_rows("billing", &Version::package(1, 0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_refuses_packages_in_use() {
        let (mut db, id) = deployed();
        let mut dependent = PackageRecord::new("reports", Subclass::Basic, Version::package(0, 1, 0));
        dependent.dependency_ids = vec![id];
        db.upsert_package(&dependent).unwrap();

        let err = remove(&mut db, &request(None), &EngineSettings::default()).unwrap_err();
        assert!(matches!(err, EngineError::PackageInUse { ref dependents, .. } if dependents == &["reports"]));
        assert!(db.has_schema("billing_1_0_0"));
    }

    #[test]
    fn test_remove_unknown_package() {
        let (mut db, _) = deployed();
        let err = remove(&mut db, &request(Some(7)), &EngineSettings::default()).unwrap_err();
        assert!(matches!(err, EngineError::PackageNotFound { .. }));
        assert_eq!(err.exit_code(), 1);
    }
}
