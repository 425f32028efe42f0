use dbpm_core::{Encoding, Version};

use crate::catalog::SchemaCatalog;
use crate::executor::Executor;
use crate::ledger::MetadataStore;
use crate::sql::QualifiedName;

/// Default name of the reserved metadata schema.
pub const DEFAULT_METADATA_SCHEMA: &str = "_dbpm";

/// Version of this engine; the metadata schema version it expects.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Explicit engine configuration passed to every operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Schema that holds the package registry and ledgers.
    pub metadata_schema: String,
    /// Metadata schema version this run expects.
    pub engine_version: Version,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            metadata_schema: DEFAULT_METADATA_SCHEMA.to_string(),
            engine_version: Version::parse(ENGINE_VERSION, Encoding::Engine)
                .unwrap_or_else(|_| Version::engine(0, 0, 0)),
        }
    }
}

impl EngineSettings {
    pub fn with_metadata_schema(mut self, schema: impl Into<String>) -> Self {
        self.metadata_schema = schema.into();
        self
    }

    pub fn with_engine_version(mut self, version: Version) -> Self {
        self.engine_version = version;
        self
    }

    /// Schema-qualified name of a helper function in the metadata schema.
    pub fn procedure(&self, name: &str) -> QualifiedName {
        QualifiedName::new(self.metadata_schema.clone(), name)
    }
}

/// Everything an operation needs from one database session.
pub trait Session: Executor + SchemaCatalog + MetadataStore {}

impl<T: Executor + SchemaCatalog + MetadataStore + ?Sized> Session for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_use_crate_version() {
        let settings = EngineSettings::default();
        assert_eq!(settings.metadata_schema, "_dbpm");
        assert_eq!(settings.engine_version.raw, ENGINE_VERSION);
        assert_eq!(
            settings.procedure("_alter_schema_owner").to_string(),
            "_dbpm._alter_schema_owner"
        );
        let dotted = settings.with_metadata_schema("team.meta").procedure("_alter_schema_owner");
        assert_eq!(dotted.schema.as_deref(), Some("team.meta"));
        assert_eq!(dotted.name, "_alter_schema_owner");
    }
}
