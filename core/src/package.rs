use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::split::{StatementKind, leading_keyword};
use crate::version::{Version, VersionPattern};

/// Lifecycle class of a package schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subclass {
    /// One mutable schema named after the package, replaced on redeploy.
    Basic,
    /// One immutable schema per version, named `<name>_<version>`.
    Versioned,
}

impl Subclass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Versioned => "versioned",
        }
    }
}

impl fmt::Display for Subclass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subclass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "versioned" => Ok(Self::Versioned),
            other => Err(format!("unknown subclass '{other}' (expected basic or versioned)")),
        }
    }
}

/// Where a package's objects live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Objects go into a dedicated schema managed by the lifecycle rules.
    #[default]
    Schema,
    /// Objects go into the database's default search path; no schema is
    /// created, renamed or dropped and privileges are left alone.
    Database,
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "schema" => Ok(Self::Schema),
            "database" => Ok(Self::Database),
            other => Err(format!("unknown scope '{other}' (expected schema or database)")),
        }
    }
}

/// Policy applied when the target schema already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Refuse to touch an existing schema.
    #[default]
    Safe,
    /// Rename the existing schema to the lowest free `<name>_N`, then create.
    Moderate,
    /// Drop the existing schema with cascade, then create.
    Unsafe,
    /// Deploy into the existing schema without recreating it.
    Overwrite,
}

impl DeploymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Moderate => "moderate",
            Self::Unsafe => "unsafe",
            Self::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "moderate" => Ok(Self::Moderate),
            "unsafe" => Ok(Self::Unsafe),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(format!(
                "unknown deployment mode '{other}' (expected safe, moderate, unsafe or overwrite)"
            )),
        }
    }
}

/// Object categories, declared in deployment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Types,
    Tables,
    Functions,
    Views,
    Triggers,
}

impl ObjectKind {
    /// All kinds in the order a deployment applies them.
    pub const ALL: [ObjectKind; 5] = [
        Self::Types,
        Self::Tables,
        Self::Functions,
        Self::Views,
        Self::Triggers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Types => "types",
            Self::Tables => "tables",
            Self::Functions => "functions",
            Self::Views => "views",
            Self::Triggers => "triggers",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How table scripts are ordered before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableOrder {
    /// By file stem, as text.
    #[default]
    Lexicographic,
    /// By file stem parsed as an integer (`001`, `2`, `10`).
    Integer,
}

/// A declared dependency on another deployed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub pattern: VersionPattern,
}

/// Script directories of a package, per object kind, relative to the package
/// root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPaths {
    paths: BTreeMap<ObjectKind, Vec<PathBuf>>,
}

impl ObjectPaths {
    pub fn set(&mut self, kind: ObjectKind, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            self.paths.remove(&kind);
        } else {
            self.paths.insert(kind, paths);
        }
    }

    pub fn get(&self, kind: ObjectKind) -> &[PathBuf] {
        self.paths.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectKind, &[PathBuf])> {
        self.paths.iter().map(|(kind, paths)| (*kind, paths.as_slice()))
    }
}

/// Validated description of a deployable package.
///
/// Built once from configuration (see the `dbpm-source` crate) and passed by
/// reference to every engine operation.
///
/// # Examples
///
/// ```
/// use dbpm_core::{PackageDescriptor, Subclass, Version};
///
/// let mut pkg = PackageDescriptor::new("billing", Subclass::Versioned, Version::package(1, 2, 0));
/// assert_eq!(pkg.schema_name().as_deref(), Some("billing_1_2_0"));
///
/// pkg.subclass = Subclass::Basic;
/// assert_eq!(pkg.schema_name().as_deref(), Some("billing"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDescriptor {
    pub name: String,
    pub subclass: Subclass,
    /// Package version ([`Encoding::Package`](crate::Encoding::Package)).
    pub version: Version,
    pub description: Option<String>,
    pub license: Option<String>,
    /// Role that should own the schema and its objects.
    pub owner_role: Option<String>,
    /// Roles granted usage on the schema.
    pub usage_roles: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub scope: Scope,
    pub paths: ObjectPaths,
}

impl PackageDescriptor {
    pub fn new(name: impl Into<String>, subclass: Subclass, version: Version) -> Self {
        Self {
            name: name.into(),
            subclass,
            version,
            description: None,
            license: None,
            owner_role: None,
            usage_roles: Vec::new(),
            dependencies: Vec::new(),
            scope: Scope::Schema,
            paths: ObjectPaths::default(),
        }
    }

    /// Name of the target schema, or `None` for database-scoped packages.
    pub fn schema_name(&self) -> Option<String> {
        match (self.scope, self.subclass) {
            (Scope::Database, _) => None,
            (Scope::Schema, Subclass::Basic) => Some(self.name.clone()),
            (Scope::Schema, Subclass::Versioned) => {
                Some(format!("{}_{}", self.name, self.version.raw))
            }
        }
    }
}

/// One script file of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectScript {
    /// Path relative to the package root, `/`-separated.
    pub identifier: String,
    pub source_text: String,
}

impl ObjectScript {
    pub fn new(identifier: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            source_text: source_text.into(),
        }
    }

    /// Classification by the script's first keyword.
    pub fn statement_kind(&self) -> StatementKind {
        leading_keyword(&self.source_text)
    }

    /// File name without directories or extension; the key table scripts
    /// are ordered by.
    pub fn stem(&self) -> &str {
        let file = self
            .identifier
            .rsplit('/')
            .next()
            .unwrap_or(&self.identifier);
        match file.rfind('.') {
            Some(0) | None => file,
            Some(dot) => &file[..dot],
        }
    }
}

/// Scripts collected for one deployment, grouped by kind in collection order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageScripts {
    scripts: BTreeMap<ObjectKind, Vec<ObjectScript>>,
}

impl PackageScripts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: ObjectKind, scripts: Vec<ObjectScript>) {
        self.scripts.insert(kind, scripts);
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, kind: ObjectKind, scripts: Vec<ObjectScript>) -> Self {
        self.insert(kind, scripts);
        self
    }

    pub fn get(&self, kind: ObjectKind) -> &[ObjectScript] {
        self.scripts.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn total(&self) -> usize {
        self.scripts.values().map(Vec::len).sum()
    }
}

/// A descriptor together with the scripts to deploy for it.
#[derive(Debug, Clone)]
pub struct Package {
    pub descriptor: PackageDescriptor,
    pub scripts: PackageScripts,
}
