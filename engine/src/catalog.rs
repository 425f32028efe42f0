//! Schema-level operations on the target database.

use crate::executor::ExecutionError;

/// Schema existence, lifecycle and privilege operations.
///
/// Implementations run these inside whatever transaction the session has
/// open.
pub trait SchemaCatalog {
    fn schema_exists(&mut self, schema: &str) -> Result<bool, ExecutionError>;
    fn create_schema(&mut self, schema: &str) -> Result<(), ExecutionError>;
    fn rename_schema(&mut self, from: &str, to: &str) -> Result<(), ExecutionError>;
    /// Drops the schema and everything in it.
    fn drop_schema(&mut self, schema: &str) -> Result<(), ExecutionError>;
    /// `Some(schema)` puts the schema first on the search path; `None`
    /// restores the default.
    fn set_search_path(&mut self, schema: Option<&str>) -> Result<(), ExecutionError>;

    /// Revokes every privilege `PUBLIC` holds on the schema and its objects.
    fn revoke_public(&mut self, schema: &str) -> Result<(), ExecutionError>;
    /// Grants schema usage and function execution.
    fn grant_usage(&mut self, schema: &str, roles: &[String]) -> Result<(), ExecutionError>;
    /// Grants read/write on tables, execution on functions and use of
    /// sequences, now and for objects created later.
    fn grant_data_privileges(&mut self, schema: &str, roles: &[String])
    -> Result<(), ExecutionError>;

    fn current_role(&mut self) -> Result<String, ExecutionError>;
    fn is_superuser(&mut self) -> Result<bool, ExecutionError>;
}
