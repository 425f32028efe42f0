//! SQL generation with quoted identifiers.
//!
//! Every schema and role name that reaches a statement goes through
//! [`quote_ident`], and every value through [`quote_literal`], so names taken
//! from package configuration cannot change the shape of a statement.
//!
//! The metadata schema definition and the migration scripts are kept as
//! `.sql` files under `engine/sql/` with a `{schema}` placeholder that is
//! replaced by the quoted metadata schema name.

use std::fmt;

use crate::executor::Value;

/// Session configuration applied before install and deploy runs.
pub const PREAMBLE: &str = "SET statement_timeout = 0;
SET lock_timeout = 0;
SET client_encoding = 'UTF8';
SET standard_conforming_strings = on;
SET check_function_bodies = false;
SET client_min_messages = warning;";

const INSTALL_TEMPLATE: &str = include_str!("../sql/install.sql");

/// Quotes an identifier: `billing` becomes `"billing"`, embedded quotes are
/// doubled.
///
/// # Examples
///
/// ```
/// use dbpm_engine::sql::quote_ident;
///
/// assert_eq!(quote_ident("billing_1_0_0"), "\"billing_1_0_0\"");
/// assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A function name, optionally qualified by its schema. The parts are
/// quoted separately, so either may contain dots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    pub fn unqualified(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// `PUBLIC` is a keyword, not a role name, and must stay unquoted.
fn role(name: &str) -> String {
    if name.eq_ignore_ascii_case("public") {
        "PUBLIC".to_string()
    } else {
        quote_ident(name)
    }
}

fn role_list(roles: &[String]) -> String {
    roles.iter().map(|r| role(r)).collect::<Vec<_>>().join(", ")
}

/// Replaces the `{schema}` placeholder of a metadata script.
pub fn render_metadata_script(template: &str, metadata_schema: &str) -> String {
    template.replace("{schema}", &quote_ident(metadata_schema))
}

/// Tables, functions and the owner helper of a fresh metadata schema.
pub fn install_script(metadata_schema: &str) -> String {
    render_metadata_script(INSTALL_TEMPLATE, metadata_schema)
}

pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA {};", quote_ident(schema))
}

pub fn rename_schema(from: &str, to: &str) -> String {
    format!(
        "ALTER SCHEMA {} RENAME TO {};",
        quote_ident(from),
        quote_ident(to)
    )
}

pub fn drop_schema(schema: &str) -> String {
    format!("DROP SCHEMA {} CASCADE;", quote_ident(schema))
}

/// Puts `schema` first on the search path, or restores the default.
pub fn set_search_path(schema: Option<&str>) -> String {
    match schema {
        Some(schema) => format!("SET search_path TO {}, public;", quote_ident(schema)),
        None => "RESET search_path;".to_string(),
    }
}

/// Removes every privilege `grantee` holds on the schema and its objects.
pub fn revoke_all(schema: &str, grantee: &str) -> String {
    let s = quote_ident(schema);
    let r = role(grantee);
    format!(
        "REVOKE ALL ON SCHEMA {s} FROM {r};
REVOKE ALL ON ALL TABLES IN SCHEMA {s} FROM {r};
REVOKE ALL ON ALL SEQUENCES IN SCHEMA {s} FROM {r};
REVOKE ALL ON ALL FUNCTIONS IN SCHEMA {s} FROM {r};"
    )
}

/// Lets `roles` look up objects in the schema and call its functions.
pub fn grant_usage(schema: &str, roles: &[String]) -> String {
    let s = quote_ident(schema);
    let r = role_list(roles);
    format!(
        "GRANT USAGE ON SCHEMA {s} TO {r};
GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA {s} TO {r};"
    )
}

/// Read/write access to existing and future tables, functions and
/// sequences. Used for the metadata schema.
pub fn grant_data_privileges(schema: &str, roles: &[String]) -> String {
    let s = quote_ident(schema);
    let r = role_list(roles);
    format!(
        "GRANT USAGE ON SCHEMA {s} TO {r};
GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {s} TO {r};
GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA {s} TO {r};
GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA {s} TO {r};
ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {r};
ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT EXECUTE ON FUNCTIONS TO {r};
ALTER DEFAULT PRIVILEGES IN SCHEMA {s} GRANT USAGE, SELECT ON SEQUENCES TO {r};"
    )
}

/// `SELECT * FROM name(arg, ...)` with literal arguments.
pub fn call_procedure(name: &QualifiedName, args: &[Value]) -> String {
    let args = args
        .iter()
        .map(Value::to_literal)
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT * FROM {}({args});", name.quoted())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(create_schema("billing"), "CREATE SCHEMA \"billing\";");
        assert_eq!(
            rename_schema("billing", "billing_0"),
            "ALTER SCHEMA \"billing\" RENAME TO \"billing_0\";"
        );
        assert_eq!(
            drop_schema("x\"; DROP SCHEMA y; --"),
            "DROP SCHEMA \"x\"\"; DROP SCHEMA y; --\" CASCADE;"
        );
    }

    #[test]
    fn test_search_path() {
        assert_eq!(
            set_search_path(Some("billing")),
            "SET search_path TO \"billing\", public;"
        );
        assert_eq!(set_search_path(None), "RESET search_path;");
    }

    #[test]
    fn test_revoke_all_from_public_keeps_keyword() {
        let sql = revoke_all("billing", "public");
        assert!(sql.contains("REVOKE ALL ON SCHEMA \"billing\" FROM PUBLIC;"));
        assert!(sql.contains("ALL TABLES IN SCHEMA \"billing\" FROM PUBLIC"));
        assert!(sql.contains("ALL SEQUENCES"));
        assert!(sql.contains("ALL FUNCTIONS"));
    }

    #[test]
    fn test_grants_list_every_role() {
        let roles = vec!["app".to_string(), "report ro".to_string()];
        let sql = grant_usage("billing", &roles);
        assert!(sql.contains("GRANT USAGE ON SCHEMA \"billing\" TO \"app\", \"report ro\";"));
        assert!(sql.contains("GRANT EXECUTE ON ALL FUNCTIONS"));

        let sql = grant_data_privileges("_dbpm", &roles);
        assert!(sql.contains("SELECT, INSERT, UPDATE, DELETE ON ALL TABLES"));
        assert_eq!(sql.matches("ALTER DEFAULT PRIVILEGES").count(), 3);
    }

    #[test]
    fn test_install_script_uses_metadata_schema() {
        let sql = install_script("_meta");
        assert!(sql.contains("CREATE TABLE \"_meta\".packages"));
        assert!(sql.contains("CREATE TABLE \"_meta\".package_dependencies"));
        assert!(sql.contains("CREATE TABLE \"_meta\".table_evolutions"));
        assert!(sql.contains("CREATE TABLE \"_meta\".migrations"));
        assert!(sql.contains("\"_meta\"._alter_schema_owner"));
        assert!(!sql.contains("{schema}"));
    }

    #[test]
    fn test_call_procedure_quotes_name_and_arguments() {
        let sql = call_procedure(
            &QualifiedName::new("_dbpm", "_alter_schema_owner"),
            &[Value::from("billing"), Value::from("o'wner")],
        );
        assert_eq!(
            sql,
            "SELECT * FROM \"_dbpm\".\"_alter_schema_owner\"('billing', 'o''wner');"
        );
    }

    #[test]
    fn test_dotted_schema_stays_one_identifier() {
        let name = QualifiedName::new("team.meta", "_alter_schema_owner");
        assert_eq!(name.to_string(), "team.meta._alter_schema_owner");
        assert_eq!(
            call_procedure(&name, &[]),
            "SELECT * FROM \"team.meta\".\"_alter_schema_owner\"();"
        );
        assert_eq!(QualifiedName::unqualified("now").quoted(), "\"now\"");
    }
}
