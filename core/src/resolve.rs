//! Ordering of type and domain declarations.
//!
//! Type scripts are executed statement by statement. A `CREATE TYPE` that
//! mentions another type declared in the same batch must run after it, so
//! [`resolve_types`] sorts the batch into three buckets:
//!
//! 1. `drops`: every `DROP ...` statement, in encounter order;
//! 2. `creates`: every `CREATE TYPE` / `CREATE DOMAIN`, ordered so that each
//!    runs after all declarations whose name it mentions as a whole word;
//! 3. `others`: everything else, in encounter order.
//!
//! Ordering runs in rounds over the remaining declarations in encounter order,
//! emitting a declaration as soon as all of its dependencies have been
//! emitted. A round that emits nothing ends the process; anything left at that
//! point is reported as [`ResolveError::Unresolved`] rather than dropped.
//!
//! # Examples
//!
//! ```
//! use dbpm_core::{TypeStatement, resolve_types};
//!
//! let batch = vec![
//!     TypeStatement::new("c.sql", "CREATE TYPE c AS (inner b);"),
//!     TypeStatement::new("a.sql", "CREATE DOMAIN a AS int;"),
//!     TypeStatement::new("b.sql", "CREATE TYPE b AS (value a);"),
//! ];
//! let resolved = resolve_types(batch).unwrap();
//! let names: Vec<_> = resolved.creates.iter().map(|s| s.script.as_str()).collect();
//! assert_eq!(names, ["a.sql", "b.sql", "c.sql"]);
//! ```

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::split::{StatementKind, leading_keyword, split_statements};

static DECLARATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcreate\s+(?:type|domain)\s+(\w+\.\w+|\w+)\b")
        .expect("static regex must compile")
});

/// Errors raised while ordering type declarations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Declarations left over after ordering stabilized: a dependency cycle
    /// among them, or a reference that cannot be satisfied.
    #[error("unresolved type dependencies: {}", .0.join(", "))]
    Unresolved(Vec<String>),
    /// The same type name is declared twice in one batch.
    #[error("type '{0}' is declared more than once")]
    DuplicateDeclaration(String),
}

/// One statement from a type script, tagged with the script it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStatement {
    /// Identifier of the originating script.
    pub script: String,
    pub text: String,
}

impl TypeStatement {
    pub fn new(script: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            text: text.into(),
        }
    }

    /// Splits each `(identifier, source)` pair into statements, keeping the
    /// script order and the statement order within each script.
    pub fn from_scripts<'a, I>(scripts: I) -> Vec<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        scripts
            .into_iter()
            .flat_map(|(script, source)| {
                split_statements(source)
                    .into_iter()
                    .map(move |text| Self::new(script, text))
            })
            .collect()
    }
}

/// Output of [`resolve_types`], in execution order: drops, creates, others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTypes {
    pub drops: Vec<TypeStatement>,
    pub creates: Vec<TypeStatement>,
    pub others: Vec<TypeStatement>,
}

impl ResolvedTypes {
    /// Iterates over all statements in the order they must be executed.
    pub fn iter(&self) -> impl Iterator<Item = &TypeStatement> {
        self.drops
            .iter()
            .chain(self.creates.iter())
            .chain(self.others.iter())
    }

    pub fn len(&self) -> usize {
        self.drops.len() + self.creates.len() + self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returns the type/domain name declared by a `CREATE` statement, if any.
pub fn declared_type_name(statement: &str) -> Option<&str> {
    DECLARATION_RE
        .captures(statement)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

struct Declaration {
    name: String,
    statement: TypeStatement,
    deps: Vec<usize>,
}

/// Sorts a batch of type statements into drop, create and other buckets and
/// orders the creates by textual dependency.
///
/// # Errors
///
/// [`ResolveError::DuplicateDeclaration`] when a name is declared twice
/// (compared case-insensitively) and [`ResolveError::Unresolved`] when some
/// declarations can never be ordered.
pub fn resolve_types(statements: Vec<TypeStatement>) -> Result<ResolvedTypes, ResolveError> {
    let mut resolved = ResolvedTypes::default();
    let mut declarations: Vec<Declaration> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for statement in statements {
        match leading_keyword(&statement.text) {
            StatementKind::Drop => resolved.drops.push(statement),
            StatementKind::Create => match declared_type_name(&statement.text) {
                Some(name) => {
                    let name = name.to_string();
                    if !seen.insert(name.to_lowercase()) {
                        return Err(ResolveError::DuplicateDeclaration(name));
                    }
                    declarations.push(Declaration {
                        name,
                        statement,
                        deps: Vec::new(),
                    });
                }
                None => resolved.others.push(statement),
            },
            StatementKind::Other => resolved.others.push(statement),
        }
    }

    let matchers: Vec<Regex> = declarations
        .iter()
        .map(|d| whole_word(&d.name))
        .collect();
    for (y, declaration) in declarations.iter_mut().enumerate() {
        declaration.deps = matchers
            .iter()
            .enumerate()
            .filter(|(x, re)| *x != y && re.is_match(&declaration.statement.text))
            .map(|(x, _)| x)
            .collect();
    }

    let mut emitted = vec![false; declarations.len()];
    let mut order = Vec::with_capacity(declarations.len());
    loop {
        let mut progressed = false;
        for (idx, declaration) in declarations.iter().enumerate() {
            if !emitted[idx] && declaration.deps.iter().all(|&dep| emitted[dep]) {
                emitted[idx] = true;
                order.push(idx);
                progressed = true;
            }
        }
        if !progressed || order.len() == declarations.len() {
            break;
        }
    }

    if order.len() < declarations.len() {
        let unresolved = declarations
            .iter()
            .enumerate()
            .filter(|(idx, _)| !emitted[*idx])
            .map(|(_, d)| d.name.clone())
            .collect();
        return Err(ResolveError::Unresolved(unresolved));
    }

    let mut slots: Vec<Option<TypeStatement>> =
        declarations.into_iter().map(|d| Some(d.statement)).collect();
    resolved.creates = order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect();
    Ok(resolved)
}

/// Case-insensitive whole-word matcher for a (possibly schema-qualified) name.
fn whole_word(name: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name)))
        .expect("escaped identifier is a valid pattern")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts(resolved: &[TypeStatement]) -> Vec<&str> {
        resolved.iter().map(|s| s.script.as_str()).collect()
    }

    #[test]
    fn test_reorders_chain_submitted_backwards() {
        let batch = vec![
            TypeStatement::new("C", "CREATE TYPE c AS (field b);"),
            TypeStatement::new("A", "CREATE TYPE a AS ENUM ('x', 'y');"),
            TypeStatement::new("B", "CREATE TYPE b AS (field a);"),
        ];
        let resolved = resolve_types(batch).unwrap();
        assert_eq!(scripts(&resolved.creates), ["A", "B", "C"]);
        assert!(resolved.drops.is_empty());
        assert!(resolved.others.is_empty());
    }

    #[test]
    fn test_independent_declarations_keep_encounter_order() {
        let batch = vec![
            TypeStatement::new("z", "CREATE DOMAIN z AS text;"),
            TypeStatement::new("y", "CREATE DOMAIN y AS int;"),
            TypeStatement::new("x", "CREATE TYPE x AS (a int);"),
        ];
        let resolved = resolve_types(batch).unwrap();
        assert_eq!(scripts(&resolved.creates), ["z", "y", "x"]);
    }

    #[test]
    fn test_buckets_drops_and_others() {
        let batch = TypeStatement::from_scripts([(
            "types.sql",
            "DROP TYPE IF EXISTS old_t CASCADE;\n\
             CREATE TYPE pair AS (l int, r int);\n\
             COMMENT ON TYPE pair IS 'two ints';\n\
             CREATE FUNCTION noop() RETURNS void AS $$ $$ LANGUAGE sql;",
        )]);
        let resolved = resolve_types(batch).unwrap();
        assert_eq!(resolved.drops.len(), 1);
        assert_eq!(resolved.creates.len(), 1);
        assert_eq!(resolved.others.len(), 2);
        assert!(resolved.others[1].text.starts_with("CREATE FUNCTION"));

        let order: Vec<&str> = resolved.iter().map(|s| s.text.as_str()).collect();
        assert!(order[0].starts_with("DROP"));
        assert!(order[1].starts_with("CREATE TYPE"));
        assert_eq!(resolved.len(), 4);
    }

    #[test]
    fn test_matching_is_whole_word_and_case_insensitive() {
        let batch = vec![
            TypeStatement::new("uses", "CREATE TYPE wrapper AS (v MONEY_T, w money_tx);"),
            TypeStatement::new("decl", "CREATE DOMAIN money_t AS numeric(12,2);"),
        ];
        let resolved = resolve_types(batch).unwrap();
        assert_eq!(scripts(&resolved.creates), ["decl", "uses"]);

        let batch = vec![
            TypeStatement::new("uses", "CREATE TYPE wrapper AS (w money_tx);"),
            TypeStatement::new("decl", "CREATE DOMAIN money_t AS numeric(12,2);"),
        ];
        let resolved = resolve_types(batch).unwrap();
        assert_eq!(scripts(&resolved.creates), ["uses", "decl"]);
    }

    #[test]
    fn test_schema_qualified_names() {
        let batch = vec![
            TypeStatement::new("b", "CREATE TYPE app.b AS (x app.a);"),
            TypeStatement::new("a", "CREATE DOMAIN app.a AS int;"),
        ];
        let resolved = resolve_types(batch).unwrap();
        assert_eq!(scripts(&resolved.creates), ["a", "b"]);
        assert_eq!(declared_type_name("create  domain app.a as int"), Some("app.a"));
    }

    #[test]
    fn test_cycle_is_reported_not_dropped() {
        let batch = vec![
            TypeStatement::new("ok", "CREATE DOMAIN base AS int;"),
            TypeStatement::new("p", "CREATE TYPE p AS (other q, b base);"),
            TypeStatement::new("q", "CREATE TYPE q AS (other p);"),
        ];
        let err = resolve_types(batch).unwrap_err();
        assert_eq!(err, ResolveError::Unresolved(vec!["p".into(), "q".into()]));
        assert_eq!(err.to_string(), "unresolved type dependencies: p, q");
    }

    #[test]
    fn test_duplicate_declaration_is_rejected() {
        let batch = vec![
            TypeStatement::new("one", "CREATE DOMAIN d AS int;"),
            TypeStatement::new("two", "CREATE DOMAIN D AS text;"),
        ];
        assert_eq!(
            resolve_types(batch).unwrap_err(),
            ResolveError::DuplicateDeclaration("D".into())
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let batch = || {
            TypeStatement::from_scripts([
                ("t/3.sql", "CREATE TYPE t3 AS (a t2, b t1);"),
                ("t/1.sql", "CREATE TYPE t1 AS (a int);"),
                ("t/2.sql", "CREATE TYPE t2 AS (a t1);"),
                ("t/4.sql", "CREATE DOMAIN t4 AS text;"),
            ])
        };
        let first = resolve_types(batch()).unwrap();
        for _ in 0..5 {
            assert_eq!(resolve_types(batch()).unwrap(), first);
        }
        assert_eq!(scripts(&first.creates), ["t/1.sql", "t/2.sql", "t/4.sql", "t/3.sql"]);
    }

    #[test]
    fn test_empty_batch() {
        let resolved = resolve_types(Vec::new()).unwrap();
        assert!(resolved.is_empty());
    }
}
