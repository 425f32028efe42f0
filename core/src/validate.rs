//! Package descriptor validation.
//!
//! Catches configuration mistakes once, when a descriptor is built, so the
//! engine can trust names, versions and paths afterwards.
//!
//! # Examples
//!
//! ```
//! use dbpm_core::*;
//!
//! let pkg = PackageDescriptor::new("billing", Subclass::Basic, Version::package(1, 0, 0));
//! assert!(validate_descriptor(&pkg).is_empty());
//!
//! // Engine-encoded version on a package
//! let bad = PackageDescriptor::new("billing", Subclass::Basic, Version::engine(1, 0, 0));
//! assert!(!validate_descriptor(&bad).is_empty());
//! ```

use std::collections::HashSet;
use std::path::Component;

use thiserror::Error;

use crate::{Encoding, PackageDescriptor};

/// Descriptor validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Package name is empty or whitespace-only.
    #[error("package name cannot be empty")]
    EmptyPackageName,
    /// Package name contains characters other than ASCII letters, digits and
    /// underscores, or starts with a digit.
    #[error("invalid package name '{0}': use letters, digits and underscores, not starting with a digit")]
    InvalidPackageName(String),
    /// Package version is not written in the underscore package encoding.
    #[error("package version '{0}' must use the M_m_p form")]
    WrongVersionEncoding(String),
    /// The same dependency is listed twice.
    #[error("duplicate dependency: {0}")]
    DuplicateDependency(String),
    /// The package lists itself as a dependency.
    #[error("package '{0}' cannot depend on itself")]
    SelfDependency(String),
    /// An owner or usage role is empty.
    #[error("role names cannot be empty")]
    EmptyRole,
    /// A script path is absolute or escapes the package root.
    #[error("script path '{0}' must be relative to the package root")]
    PathOutsidePackage(String),
}

/// Returns `true` for names usable as a package (and schema) name.
pub fn is_valid_package_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates a package descriptor, returning every problem found.
pub fn validate_descriptor(descriptor: &PackageDescriptor) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let name = descriptor.name.as_str();
    if name.trim().is_empty() {
        errors.push(ValidationError::EmptyPackageName);
    } else if !is_valid_package_name(name) {
        errors.push(ValidationError::InvalidPackageName(name.to_string()));
    }

    if descriptor.version.encoding != Encoding::Package {
        errors.push(ValidationError::WrongVersionEncoding(
            descriptor.version.raw.clone(),
        ));
    }

    let mut seen = HashSet::new();
    for dep in &descriptor.dependencies {
        if dep.name == descriptor.name {
            errors.push(ValidationError::SelfDependency(dep.name.clone()));
        } else if !seen.insert(dep.name.as_str()) {
            errors.push(ValidationError::DuplicateDependency(dep.name.clone()));
        }
    }

    let mut roles = descriptor
        .owner_role
        .iter()
        .chain(descriptor.usage_roles.iter());
    if roles.any(|role| role.trim().is_empty()) {
        errors.push(ValidationError::EmptyRole);
    }

    for (_, paths) in descriptor.paths.iter() {
        for path in paths {
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
            if escapes {
                errors.push(ValidationError::PathOutsidePackage(
                    path.display().to_string(),
                ));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{Dependency, ObjectKind, Subclass, Version, VersionPattern};

    fn descriptor() -> PackageDescriptor {
        PackageDescriptor::new("app", Subclass::Versioned, Version::package(0, 1, 0))
    }

    #[test]
    fn test_valid_descriptor_passes() {
        let mut pkg = descriptor();
        pkg.usage_roles = vec!["reader".into()];
        pkg.dependencies.push(Dependency {
            name: "util".into(),
            pattern: VersionPattern::parse("1_x_x").unwrap(),
        });
        pkg.paths.set(ObjectKind::Functions, vec![PathBuf::from("sql/functions")]);
        assert!(validate_descriptor(&pkg).is_empty());
    }

    #[test]
    fn test_package_names() {
        assert!(is_valid_package_name("_private"));
        assert!(is_valid_package_name("app2"));
        assert!(!is_valid_package_name("2app"));
        assert!(!is_valid_package_name("my-app"));
        assert!(!is_valid_package_name("app; drop"));

        let mut pkg = descriptor();
        pkg.name = "  ".into();
        assert_eq!(validate_descriptor(&pkg), vec![ValidationError::EmptyPackageName]);
    }

    #[test]
    fn test_surrounding_whitespace_in_name_is_rejected() {
        let mut pkg = descriptor();
        pkg.name = " billing".into();
        assert_eq!(
            validate_descriptor(&pkg),
            vec![ValidationError::InvalidPackageName(" billing".into())]
        );
    }

    #[test]
    fn test_dependency_problems_are_collected() {
        let mut pkg = descriptor();
        let pattern = VersionPattern::parse("x_x_x").unwrap();
        for name in ["app", "util", "util"] {
            pkg.dependencies.push(Dependency {
                name: name.into(),
                pattern: pattern.clone(),
            });
        }
        pkg.owner_role = Some(String::new());
        let errors = validate_descriptor(&pkg);
        assert_eq!(
            errors,
            vec![
                ValidationError::SelfDependency("app".into()),
                ValidationError::DuplicateDependency("util".into()),
                ValidationError::EmptyRole,
            ]
        );
    }

    #[test]
    fn test_paths_must_stay_inside_package() {
        let mut pkg = descriptor();
        pkg.paths.set(
            ObjectKind::Tables,
            vec![PathBuf::from("../elsewhere"), PathBuf::from("/abs"), PathBuf::from("ok/./x")],
        );
        let errors = validate_descriptor(&pkg);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::PathOutsidePackage(_))));
    }
}
