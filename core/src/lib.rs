//! Core model of the dbpm database package manager.
//!
//! This crate holds the pure, I/O-free parts of a deployment:
//!
//! - [`Version`]: engine (`0.3.0`) and package (`1_2_0`) version encodings,
//!   parsing, precedence and wildcard [`VersionPattern`]s.
//! - [`split_statements`]: quote/comment/dollar-quote aware statement
//!   splitting and [`leading_keyword`] classification.
//! - [`resolve_types`]: orders `CREATE TYPE`/`CREATE DOMAIN` statements so
//!   that every declaration runs after the declarations it mentions.
//! - [`PackageDescriptor`] and friends: the validated description of a
//!   package, its [`DeploymentMode`]s and its [`ObjectScript`]s.
//!
//! # Example
//!
//! ```
//! use dbpm_core::*;
//!
//! let pkg = PackageDescriptor::new("inventory", Subclass::Versioned,
//!     Version::parse("2_0_1", Encoding::Package).unwrap());
//! assert!(validate_descriptor(&pkg).is_empty());
//! assert_eq!(pkg.schema_name().unwrap(), "inventory_2_0_1");
//!
//! let statements = TypeStatement::from_scripts([
//!     ("types/item.sql", "CREATE TYPE item AS (sku sku_code, qty int);"),
//!     ("types/sku.sql", "CREATE DOMAIN sku_code AS text;"),
//! ]);
//! let ordered = resolve_types(statements).unwrap();
//! assert_eq!(ordered.creates[0].script, "types/sku.sql");
//! ```

mod package;
mod resolve;
mod split;
mod validate;
mod version;

pub use package::{
    DeploymentMode, Dependency, ObjectKind, ObjectPaths, ObjectScript, Package,
    PackageDescriptor, PackageScripts, Scope, Subclass, TableOrder,
};
pub use resolve::{ResolveError, ResolvedTypes, TypeStatement, declared_type_name, resolve_types};
pub use split::{StatementKind, leading_keyword, split_statements};
pub use validate::{ValidationError, is_valid_package_name, validate_descriptor};
pub use version::{Encoding, Version, VersionError, VersionPattern};
