//! Version strings for the engine and for deployed packages.
//!
//! Two encodings exist side by side:
//!
//! - [`Encoding::Engine`]: dotted semantic versions such as `0.3.0`,
//!   `1.0.0-rc.1` or `1.0.0+build.5`. Used for the tool and its metadata schema.
//! - [`Encoding::Package`]: underscore-delimited versions such as `1_2_3`
//!   (optionally `1_2_3-beta`). Used for package/schema versions, because the
//!   raw string becomes part of a schema name.
//!
//! Versions of different encodings never compare with each other.
//!
//! # Examples
//!
//! ```
//! use dbpm_core::{Encoding, Version};
//! use std::cmp::Ordering;
//!
//! let a = Version::parse("1.2.3", Encoding::Engine).unwrap();
//! let b = Version::parse("1.2.10", Encoding::Engine).unwrap();
//! assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
//!
//! let pkg = Version::parse("1_2_3", Encoding::Package).unwrap();
//! assert!(a.compare(&pkg).is_err());
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static ENGINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+)\.(\d+)\.(\d+)(?:-([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?(?:\+([0-9A-Za-z-]+(?:\.[0-9A-Za-z-]+)*))?$",
    )
    .expect("static regex must compile")
});

static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)_(\d+)_(\d+)(?:-([0-9A-Za-z_]+(?:\.[0-9A-Za-z_]+)*))?$")
        .expect("static regex must compile")
});

static PATTERN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(\d+|x+)_(\d+|x+)_(\d+|x+)$").expect("static regex must compile")
});

/// The grammar a version string is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Dotted semantic version (`M.m.p[-pre][+meta]`).
    Engine,
    /// Underscore-delimited package version (`M_m_p[-pre]`).
    Package,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine => f.write_str("engine"),
            Self::Package => f.write_str("package"),
        }
    }
}

/// Errors raised while parsing or comparing versions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The string does not follow the grammar of the requested encoding.
    #[error("invalid {encoding} version format: '{raw}'")]
    InvalidVersionFormat { raw: String, encoding: Encoding },
    /// The two versions use different encodings.
    #[error("cannot compare {left} version with {right} version")]
    IncompatibleEncodings { left: Encoding, right: Encoding },
}

/// A parsed version.
///
/// Equality and ordering look at `major`, `minor`, `patch` and `pre` only;
/// build metadata and the raw spelling are carried along but never compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
    pub metadata: Option<String>,
    /// The string the version was parsed from.
    pub raw: String,
    pub encoding: Encoding,
}

impl Version {
    /// Parses `raw` according to `encoding`.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::InvalidVersionFormat`] when the string does not
    /// match the grammar or a component does not fit in a `u64`.
    pub fn parse(raw: &str, encoding: Encoding) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidVersionFormat {
            raw: raw.to_string(),
            encoding,
        };
        let re = match encoding {
            Encoding::Engine => &*ENGINE_RE,
            Encoding::Package => &*PACKAGE_RE,
        };
        let caps = re.captures(raw.trim()).ok_or_else(invalid)?;
        let number = |idx: usize| -> Result<u64, VersionError> {
            caps[idx].parse::<u64>().map_err(|_| invalid())
        };

        Ok(Self {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            pre: caps.get(4).map(|m| m.as_str().to_string()),
            metadata: caps.get(5).map(|m| m.as_str().to_string()),
            raw: raw.trim().to_string(),
            encoding,
        })
    }

    /// Builds an engine version from its numeric components.
    pub fn engine(major: u64, minor: u64, patch: u64) -> Self {
        Self::from_parts(major, minor, patch, Encoding::Engine)
    }

    /// Builds a package version from its numeric components.
    pub fn package(major: u64, minor: u64, patch: u64) -> Self {
        Self::from_parts(major, minor, patch, Encoding::Package)
    }

    /// Replaces the pre-release tag and build metadata, rewriting `raw` to
    /// the canonical form.
    pub fn with_suffixes(mut self, pre: Option<String>, metadata: Option<String>) -> Self {
        self.pre = pre;
        self.metadata = metadata;
        self.raw = self.to_canonical_string();
        self
    }

    fn from_parts(major: u64, minor: u64, patch: u64, encoding: Encoding) -> Self {
        let mut version = Self {
            major,
            minor,
            patch,
            pre: None,
            metadata: None,
            raw: String::new(),
            encoding,
        };
        version.raw = version.to_canonical_string();
        version
    }

    /// Compares two versions of the same encoding by semantic-version
    /// precedence.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::IncompatibleEncodings`] when the encodings differ.
    pub fn compare(&self, other: &Self) -> Result<Ordering, VersionError> {
        if self.encoding != other.encoding {
            return Err(VersionError::IncompatibleEncodings {
                left: self.encoding,
                right: other.encoding,
            });
        }
        Ok(self.precedence(other))
    }

    fn precedence(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre_release(a, b),
            })
    }

    /// Returns the stable string form: dotted for engine versions,
    /// underscored for package versions.
    pub fn to_canonical_string(&self) -> String {
        let sep = match self.encoding {
            Encoding::Engine => '.',
            Encoding::Package => '_',
        };
        let mut out = format!(
            "{}{sep}{}{sep}{}",
            self.major, self.minor, self.patch
        );
        if let Some(pre) = &self.pre {
            out.push('-');
            out.push_str(pre);
        }
        if let Some(metadata) = &self.metadata {
            out.push('+');
            out.push_str(metadata);
        }
        out
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.encoding == other.encoding && self.precedence(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    /// `None` when the encodings differ.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other).ok()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_string())
    }
}

/// Pre-release precedence: dot-separated identifiers compared left to right,
/// numeric identifiers numerically and below alphanumeric ones, a longer list
/// winning when all shared identifiers are equal.
fn compare_pre_release(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(n), Ok(m)) => n.cmp(&m),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// A package version with optional wildcard components, written like
/// `1_x_x` or `2_3_xx`. A wildcard accepts any value in its position.
///
/// # Examples
///
/// ```
/// use dbpm_core::{Encoding, Version, VersionPattern};
///
/// let pattern = VersionPattern::parse("1_x_x").unwrap();
/// assert!(pattern.matches(&Version::parse("1_4_0", Encoding::Package).unwrap()));
/// assert!(!pattern.matches(&Version::parse("2_0_0", Encoding::Package).unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionPattern {
    pub major: Option<u64>,
    pub minor: Option<u64>,
    pub patch: Option<u64>,
}

impl VersionPattern {
    /// Parses a pattern; every component is either digits or one or more `x`.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::InvalidVersionFormat`] (with the package
    /// encoding) for anything else.
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidVersionFormat {
            raw: raw.to_string(),
            encoding: Encoding::Package,
        };
        let caps = PATTERN_RE.captures(raw.trim()).ok_or_else(invalid)?;
        let component = |idx: usize| -> Result<Option<u64>, VersionError> {
            let text = &caps[idx];
            if text.chars().all(|c| c.eq_ignore_ascii_case(&'x')) {
                Ok(None)
            } else {
                text.parse::<u64>().map(Some).map_err(|_| invalid())
            }
        };
        Ok(Self {
            major: component(1)?,
            minor: component(2)?,
            patch: component(3)?,
        })
    }

    /// Returns `true` if the numeric components of a package version satisfy
    /// the pattern. Pre-release tags are not considered.
    pub fn matches(&self, version: &Version) -> bool {
        version.encoding == Encoding::Package
            && self.major.is_none_or(|m| m == version.major)
            && self.minor.is_none_or(|m| m == version.minor)
            && self.patch.is_none_or(|p| p == version.patch)
    }

    /// Returns `true` when no component is a wildcard.
    pub fn is_exact(&self) -> bool {
        self.major.is_some() && self.minor.is_some() && self.patch.is_some()
    }
}

impl fmt::Display for VersionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |c: Option<u64>| c.map_or_else(|| "x".to_string(), |v| v.to_string());
        write!(
            f,
            "{}_{}_{}",
            part(self.major),
            part(self.minor),
            part(self.patch)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(raw: &str) -> Version {
        Version::parse(raw, Encoding::Engine).unwrap()
    }

    fn package(raw: &str) -> Version {
        Version::parse(raw, Encoding::Package).unwrap()
    }

    #[test]
    fn test_numeric_components_compare_as_integers() {
        assert_eq!(
            engine("1.2.3").compare(&engine("1.2.10")).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            package("0_10_0").compare(&package("0_9_9")).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_release_outranks_pre_release() {
        assert!(engine("1.0.0-rc.1") < engine("1.0.0"));
        assert!(engine("1.0.0-alpha") < engine("1.0.0-alpha.1"));
        assert!(engine("1.0.0-alpha.1") < engine("1.0.0-alpha.beta"));
        assert!(engine("1.0.0-beta.2") < engine("1.0.0-beta.11"));
        assert!(package("1_0_0-beta") < package("1_0_0"));
    }

    #[test]
    fn test_metadata_is_ignored_for_equality() {
        assert_eq!(engine("1.0.0+build.1"), engine("1.0.0+build.2"));
        assert_eq!(engine("1.0.0+build.1").metadata.as_deref(), Some("build.1"));
    }

    #[test]
    fn test_incompatible_encodings_fail() {
        let err = engine("1.2.3").compare(&package("1_2_3")).unwrap_err();
        assert_eq!(
            err,
            VersionError::IncompatibleEncodings {
                left: Encoding::Engine,
                right: Encoding::Package,
            }
        );
        assert_eq!(engine("1.2.3").partial_cmp(&package("1_2_3")), None);
        assert_ne!(engine("1.2.3"), package("1_2_3"));
    }

    #[test]
    fn test_invalid_formats_are_rejected() {
        for raw in ["", "1.2", "1_2_3", "a.b.c", "1.2.3-", "99999999999999999999.0.0"] {
            assert!(
                matches!(
                    Version::parse(raw, Encoding::Engine),
                    Err(VersionError::InvalidVersionFormat { .. })
                ),
                "{raw} should be rejected"
            );
        }
        for raw in ["1.2.3", "1_2", "1_2_3_4", "x_1_1"] {
            assert!(Version::parse(raw, Encoding::Package).is_err(), "{raw}");
        }
    }

    #[test]
    fn test_canonical_string_reparses_to_equal_version() {
        for raw in ["0.1.0", "1.0.0-rc.1", "2.3.4+sha.abc", "1.0.0-x.7+b"] {
            let v = engine(raw);
            let again = engine(&v.to_canonical_string());
            assert_eq!(v, again);
            assert_eq!(v.metadata, again.metadata);
        }
        for raw in ["1_2_3", "0_0_1-beta"] {
            let v = package(raw);
            assert_eq!(v.to_canonical_string(), raw);
            assert_eq!(package(&v.to_canonical_string()), v);
        }
    }

    #[test]
    fn test_ordering_is_antisymmetric_and_transitive() {
        let versions: Vec<Version> = ["0.9.0", "1.0.0-alpha", "1.0.0-alpha.2", "1.0.0", "1.0.1", "1.10.0"]
            .iter()
            .map(|raw| engine(raw))
            .collect();
        for (i, a) in versions.iter().enumerate() {
            for (j, b) in versions.iter().enumerate() {
                let ab = a.compare(b).unwrap();
                assert_eq!(ab, b.compare(a).unwrap().reverse());
                assert_eq!(ab, i.cmp(&j));
            }
        }
    }

    #[test]
    fn test_constructors_set_raw() {
        assert_eq!(Version::engine(0, 3, 0).raw, "0.3.0");
        assert_eq!(Version::package(1, 0, 2).raw, "1_0_2");
        let pre = Version::engine(0, 3, 0).with_suffixes(Some("rc.1".into()), None);
        assert_eq!(pre.raw, "0.3.0-rc.1");
        assert!(pre < Version::engine(0, 3, 0));
    }

    #[test]
    fn test_pattern_wildcards() {
        let pattern = VersionPattern::parse("1_X_xx").unwrap();
        assert_eq!(pattern.major, Some(1));
        assert_eq!(pattern.minor, None);
        assert!(!pattern.is_exact());
        assert!(pattern.matches(&package("1_9_4")));
        assert!(!pattern.matches(&engine("1.9.4")));
        assert_eq!(pattern.to_string(), "1_x_x");

        let exact = VersionPattern::parse("0_1_0").unwrap();
        assert!(exact.is_exact());
        assert!(exact.matches(&package("0_1_0-beta")));
        assert!(VersionPattern::parse("1_y_0").is_err());
    }
}
