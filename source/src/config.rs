//! Package configuration loading and merging.
//!
//! A package root holds a `config.json` (or `config.yaml` / `config.yml`):
//!
//! ```json
//! {
//!   "name": "billing",
//!   "subclass": "versioned",
//!   "version": "1_4_0",
//!   "description": "Billing API",
//!   "license": "MIT",
//!   "owner_role": "billing_owner",
//!   "usage_roles": ["billing_app"],
//!   "dependencies": { "util": "1_x_x" },
//!   "types_path": "types",
//!   "functions_path": ["functions", "api"],
//!   "tables_path": "tables"
//! }
//! ```
//!
//! An optional overlay file replaces top-level keys of the base file, and
//! [`ConfigOverrides`] (from the command line) replace the roles last. The
//! merged result is validated once into a [`PackageDescriptor`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dbpm_core::{
    Dependency, Encoding, ObjectKind, PackageDescriptor, Scope, Subclass, Version,
    VersionPattern, validate_descriptor,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Result, SourceError};

/// File names recognized as package configuration, in lookup order.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["config.json", "config.yaml", "config.yml"];

/// One path or a list of paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathList {
    One(String),
    Many(Vec<String>),
}

impl PathList {
    pub fn to_paths(&self) -> Vec<PathBuf> {
        match self {
            Self::One(path) => vec![PathBuf::from(path)],
            Self::Many(paths) => paths.iter().map(PathBuf::from).collect(),
        }
    }
}

/// Raw, unvalidated package configuration as written on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: Option<String>,
    pub subclass: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub owner_role: Option<String>,
    pub usage_roles: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    pub scope: Option<String>,
    pub types_path: Option<PathList>,
    pub functions_path: Option<PathList>,
    pub views_path: Option<PathList>,
    pub triggers_path: Option<PathList>,
    pub tables_path: Option<PathList>,
}

/// Values supplied on the command line that win over the files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub owner_role: Option<String>,
    pub usage_roles: Option<Vec<String>>,
}

/// Returns the configuration file of a package root.
///
/// # Errors
///
/// [`SourceError::ConfigNotFound`] when none of [`CONFIG_FILE_NAMES`] exists.
pub fn find_config_file(root: &Path) -> Result<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| SourceError::ConfigNotFound(root.to_path_buf()))
}

/// Reads a JSON or YAML (by extension) file into a top-level mapping.
pub fn read_config_map(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&text)?
    } else {
        serde_json::from_str(&text)?
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SourceError::NotAMapping(path.to_path_buf())),
    }
}

impl PackageConfig {
    /// Loads the configuration of the package at `root`, merged with an
    /// optional overlay file.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ConfigNotFound`], I/O, JSON or YAML errors.
    pub fn load(root: &Path, overlay: Option<&Path>) -> Result<Self> {
        let base_path = find_config_file(root)?;
        debug!(path = %base_path.display(), "Reading package configuration");
        let mut merged = read_config_map(&base_path)?;
        if let Some(overlay) = overlay {
            debug!(path = %overlay.display(), "Merging configuration overlay");
            merge_top_level(&mut merged, read_config_map(overlay)?);
        }
        Ok(serde_json::from_value(Value::Object(merged))?)
    }

    /// Validates the configuration and builds a descriptor, applying
    /// `overrides` first.
    ///
    /// # Errors
    ///
    /// [`SourceError::MissingField`] for an absent `name`, `subclass` or
    /// `version`; [`SourceError::InvalidField`] or [`SourceError::Version`]
    /// for malformed values; [`SourceError::Invalid`] when the assembled
    /// descriptor breaks a validation rule.
    pub fn into_descriptor(self, overrides: &ConfigOverrides) -> Result<PackageDescriptor> {
        let name = self
            .name
            .map(|name| name.trim().to_string())
            .ok_or(SourceError::MissingField("name"))?;
        let subclass = self
            .subclass
            .ok_or(SourceError::MissingField("subclass"))?
            .parse::<Subclass>()
            .map_err(|message| SourceError::InvalidField {
                field: "subclass".into(),
                message,
            })?;
        let raw_version = self.version.ok_or(SourceError::MissingField("version"))?;
        let version = Version::parse(&raw_version, Encoding::Package)?;

        let mut descriptor = PackageDescriptor::new(name, subclass, version);
        descriptor.description = self.description;
        descriptor.license = self.license;
        descriptor.owner_role = overrides.owner_role.clone().or(self.owner_role);
        descriptor.usage_roles = overrides
            .usage_roles
            .clone()
            .or(self.usage_roles)
            .unwrap_or_default();

        if let Some(scope) = self.scope {
            descriptor.scope = scope
                .parse::<Scope>()
                .map_err(|message| SourceError::InvalidField {
                    field: "scope".into(),
                    message,
                })?;
        }

        for (dep_name, pattern) in self.dependencies {
            let pattern = VersionPattern::parse(&pattern)?;
            descriptor.dependencies.push(Dependency {
                name: dep_name,
                pattern,
            });
        }

        let kinds = [
            (ObjectKind::Types, self.types_path),
            (ObjectKind::Tables, self.tables_path),
            (ObjectKind::Functions, self.functions_path),
            (ObjectKind::Views, self.views_path),
            (ObjectKind::Triggers, self.triggers_path),
        ];
        for (kind, paths) in kinds {
            if let Some(paths) = paths {
                descriptor.paths.set(kind, paths.to_paths());
            }
        }

        let errors = validate_descriptor(&descriptor);
        if !errors.is_empty() {
            return Err(SourceError::Invalid(errors));
        }
        Ok(descriptor)
    }
}

/// Keys of `overlay` replace keys of `base`; nested values are not merged.
fn merge_top_level(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        base.insert(key, value);
    }
}

/// Loads and validates the descriptor of the package at `root`.
///
/// # Examples
///
/// ```no_run
/// use dbpm_source::{ConfigOverrides, load_descriptor};
/// use std::path::Path;
///
/// let descriptor = load_descriptor(Path::new("./billing"), None, &ConfigOverrides::default()).unwrap();
/// println!("deploying {} {}", descriptor.name, descriptor.version);
/// ```
pub fn load_descriptor(
    root: &Path,
    overlay: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<PackageDescriptor> {
    PackageConfig::load(root, overlay)?.into_descriptor(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "name": "billing",
            "subclass": "versioned",
            "version": "1_4_0",
            "description": "Billing API",
            "owner_role": "billing_owner",
            "usage_roles": ["billing_app"],
            "dependencies": {"util": "1_x_x"},
            "types_path": "types",
            "functions_path": ["functions", "api"]
        }"#
    }

    fn config(json: &str) -> PackageConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_descriptor_from_complete_config() {
        let descriptor = config(sample_json())
            .into_descriptor(&ConfigOverrides::default())
            .unwrap();
        assert_eq!(descriptor.name, "billing");
        assert_eq!(descriptor.subclass, Subclass::Versioned);
        assert_eq!(descriptor.version, Version::package(1, 4, 0));
        assert_eq!(descriptor.scope, Scope::Schema);
        assert_eq!(descriptor.owner_role.as_deref(), Some("billing_owner"));
        assert_eq!(descriptor.usage_roles, vec!["billing_app"]);
        assert_eq!(descriptor.dependencies.len(), 1);
        assert_eq!(descriptor.dependencies[0].pattern.major, Some(1));
        assert_eq!(
            descriptor.paths.get(ObjectKind::Functions),
            [PathBuf::from("functions"), PathBuf::from("api")]
        );
        assert_eq!(descriptor.paths.get(ObjectKind::Types), [PathBuf::from("types")]);
        assert!(descriptor.paths.get(ObjectKind::Views).is_empty());
    }

    #[test]
    fn test_overrides_replace_roles() {
        let overrides = ConfigOverrides {
            owner_role: Some("ops".into()),
            usage_roles: Some(vec!["a".into(), "b".into()]),
        };
        let descriptor = config(sample_json()).into_descriptor(&overrides).unwrap();
        assert_eq!(descriptor.owner_role.as_deref(), Some("ops"));
        assert_eq!(descriptor.usage_roles, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_required_keys() {
        let err = config(r#"{"subclass": "basic", "version": "1_0_0"}"#)
            .into_descriptor(&ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingField("name")));

        let err = config(r#"{"name": "x", "subclass": "basic"}"#)
            .into_descriptor(&ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingField("version")));
    }

    #[test]
    fn test_bad_values_are_reported() {
        let err = config(r#"{"name": "x", "subclass": "fancy", "version": "1_0_0"}"#)
            .into_descriptor(&ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidField { ref field, .. } if field == "subclass"));

        let err = config(r#"{"name": "x", "subclass": "basic", "version": "1.0.0"}"#)
            .into_descriptor(&ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, SourceError::Version(_)));

        let err = config(r#"{"name": "bad-name", "subclass": "basic", "version": "1_0_0"}"#)
            .into_descriptor(&ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, SourceError::Invalid(ref errors) if errors.len() == 1));
    }

    #[test]
    fn test_name_is_trimmed_before_deriving_schema() {
        let descriptor = config(r#"{"name": " billing ", "subclass": "basic", "version": "1_0_0"}"#)
            .into_descriptor(&ConfigOverrides::default())
            .unwrap();
        assert_eq!(descriptor.name, "billing");
        assert_eq!(descriptor.schema_name().as_deref(), Some("billing"));
    }

    #[test]
    fn test_database_scope_is_case_insensitive() {
        let descriptor =
            config(r#"{"name": "x", "subclass": "basic", "version": "0_0_1", "scope": "DATABASE"}"#)
                .into_descriptor(&ConfigOverrides::default())
                .unwrap();
        assert_eq!(descriptor.scope, Scope::Database);
        assert_eq!(descriptor.schema_name(), None);
    }

    #[test]
    fn test_overlay_replaces_top_level_keys() {
        let mut base: Map<String, Value> = serde_json::from_str(sample_json()).unwrap();
        let overlay: Map<String, Value> =
            serde_json::from_str(r#"{"version": "1_5_0", "dependencies": {}}"#).unwrap();
        merge_top_level(&mut base, overlay);
        let config: PackageConfig = serde_json::from_value(Value::Object(base)).unwrap();
        assert_eq!(config.version.as_deref(), Some("1_5_0"));
        assert!(config.dependencies.is_empty());
        assert_eq!(config.name.as_deref(), Some("billing"));
    }
}
