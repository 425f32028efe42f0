use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use dbpm_core::{DeploymentMode, Encoding, ObjectKind, TableOrder, Version};
use dbpm_engine::{
    DeployRequest, DeploymentResult, DeploymentStatus, EngineError, EngineSettings,
    ExecutionError, InstallOptions, InstallOutcome, PgSession, RemoveRequest,
    DEFAULT_METADATA_SCHEMA,
};
use dbpm_source::{ConfigOverrides, Git, ScriptSource, SourceError, VcsInfo, load_descriptor};
use tracing::{debug, warn};

mod logging;

/// Exit code for failures detected before anything changed.
const EXIT_PRECONDITION: i32 = 1;
/// Exit code for failures while statements were running.
const EXIT_EXECUTION: i32 = 2;

/// CLI-specific deployment mode enum with clap argument parsing support.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliMode {
    Safe,
    Moderate,
    Unsafe,
    Overwrite,
}

impl From<CliMode> for DeploymentMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Safe => Self::Safe,
            CliMode::Moderate => Self::Moderate,
            CliMode::Unsafe => Self::Unsafe,
            CliMode::Overwrite => Self::Overwrite,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliTableOrder {
    Lexicographic,
    Integer,
}

impl From<CliTableOrder> for TableOrder {
    fn from(order: CliTableOrder) -> Self {
        match order {
            CliTableOrder::Lexicographic => Self::Lexicographic,
            CliTableOrder::Integer => Self::Integer,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "dbpm", version)]
#[command(about = "Deploy versioned database packages into PostgreSQL schemas")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Connection string (`postgres://user@host/db` or `host=... user=...`).
    #[arg(long, short = 'c', global = true, env = "DBPM_CONNECTION")]
    connection: Option<String>,
    /// Log at debug level (every executed statement).
    #[arg(long, global = true)]
    debug: bool,
    /// Write the log to this file; warnings still go to stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    /// Name of the metadata schema.
    #[arg(long, global = true, default_value = DEFAULT_METADATA_SCHEMA)]
    metadata_schema: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the metadata schema, or upgrade it with --upgrade.
    Install(InstallArgs),
    /// Drop the metadata schema. Deployed packages stay in place.
    Uninstall,
    /// Deploy the package at PATH.
    Deploy(DeployArgs),
    /// Run a statement in auto-commit mode.
    Execute(ExecuteArgs),
    /// Remove a deployed package version.
    Remove(RemoveArgs),
}

#[derive(Debug, Args)]
struct InstallArgs {
    /// Migrate an existing metadata schema to this version.
    #[arg(long)]
    upgrade: bool,
    /// Roles granted access to the metadata schema (comma-separated).
    #[arg(long, value_delimiter = ',')]
    usage: Vec<String>,
}

#[derive(Debug, Args)]
struct DeployArgs {
    /// Package root directory (holds config.json or config.yaml).
    path: PathBuf,
    /// What to do with an existing target schema.
    #[arg(long, default_value = "safe")]
    mode: CliMode,
    /// Deploy only these files (relative to the package root); repeatable.
    #[arg(long = "file")]
    files: Vec<String>,
    /// How table scripts are ordered.
    #[arg(long, default_value = "lexicographic")]
    table_order: CliTableOrder,
    /// Commit every statement on its own (safe mode with --file only).
    #[arg(long)]
    auto_commit: bool,
    /// Extra configuration file whose keys replace the package config.
    #[arg(long)]
    add_config: Option<PathBuf>,
    /// Owner role of the schema and its objects.
    #[arg(long)]
    owner: Option<String>,
    /// Roles granted usage on the schema (comma-separated).
    #[arg(long, value_delimiter = ',')]
    usage: Vec<String>,
    /// Revision of the package source; defaults to the git HEAD.
    #[arg(long)]
    vcs_ref: Option<String>,
    /// Link to the package source; defaults to the git remote.
    #[arg(long)]
    vcs_link: Option<String>,
    /// Issue or ticket reference.
    #[arg(long)]
    issue_ref: Option<String>,
    /// Link to the issue or ticket.
    #[arg(long)]
    issue_link: Option<String>,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    /// Statement to run.
    query: String,
    /// Repeat until the first column of the result is 0.
    #[arg(long)]
    until_zero: bool,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    /// Package name.
    name: String,
    /// Package version (`1_2_0`).
    version: String,
    /// Remove only this superseded revision.
    #[arg(long)]
    old_rev: Option<u32>,
}

/// A message plus the exit code it ends the process with.
#[derive(Debug)]
struct Failure {
    code: i32,
    message: String,
}

impl Failure {
    fn precondition(message: impl Into<String>) -> Self {
        Self {
            code: EXIT_PRECONDITION,
            message: message.into(),
        }
    }
}

impl From<EngineError> for Failure {
    fn from(err: EngineError) -> Self {
        let message = match &err {
            EngineError::Script {
                script,
                partial,
                source,
            } => {
                let mut message = format!("script '{script}' failed\n{}", source.describe());
                if *partial {
                    message.push_str("\nstatements executed before the failure stay committed");
                }
                message
            }
            EngineError::Execution(source) => source.describe(),
            other => other.to_string(),
        };
        Self {
            code: err.exit_code(),
            message,
        }
    }
}

impl From<ExecutionError> for Failure {
    fn from(err: ExecutionError) -> Self {
        Self {
            code: EXIT_EXECUTION,
            message: err.describe(),
        }
    }
}

impl From<SourceError> for Failure {
    fn from(err: SourceError) -> Self {
        Self::precondition(err.to_string())
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = logging::init(cli.global.debug, cli.global.log_file.as_deref()) {
        eprintln!("error: {err}");
        std::process::exit(EXIT_PRECONDITION);
    }

    let result = match cli.command {
        Command::Install(args) => run_install(&cli.global, args),
        Command::Uninstall => run_uninstall(&cli.global),
        Command::Deploy(args) => run_deploy(&cli.global, args),
        Command::Execute(args) => run_execute(&cli.global, args),
        Command::Remove(args) => run_remove(&cli.global, args),
    };

    if let Err(failure) = result {
        eprintln!("error: {}", failure.message);
        std::process::exit(failure.code);
    }
}

fn settings(global: &GlobalArgs) -> EngineSettings {
    EngineSettings::default().with_metadata_schema(global.metadata_schema.clone())
}

fn connect(global: &GlobalArgs) -> Result<PgSession, Failure> {
    let url = global.connection.as_deref().ok_or_else(|| {
        Failure::precondition("no connection string given (use --connection or DBPM_CONNECTION)")
    })?;
    Ok(PgSession::connect(url, &global.metadata_schema)?)
}

fn run_install(global: &GlobalArgs, args: InstallArgs) -> Result<(), Failure> {
    let settings = settings(global);
    let mut session = connect(global)?;
    let options = InstallOptions {
        upgrade: args.upgrade,
        usage_roles: args.usage,
    };
    match dbpm_engine::install(&mut session, &settings, &options)? {
        InstallOutcome::Installed(version) => {
            println!("Installed dbpm {version} into schema '{}'.", settings.metadata_schema);
        }
        InstallOutcome::Upgraded { from, to, steps } => {
            println!(
                "Upgraded schema '{}' from {from} to {to} ({} migration step(s)).",
                settings.metadata_schema,
                steps.len()
            );
        }
    }
    Ok(())
}

fn run_uninstall(global: &GlobalArgs) -> Result<(), Failure> {
    let settings = settings(global);
    let mut session = connect(global)?;
    dbpm_engine::uninstall(&mut session, &settings)?;
    println!("Dropped schema '{}'.", settings.metadata_schema);
    Ok(())
}

fn run_deploy(global: &GlobalArgs, args: DeployArgs) -> Result<(), Failure> {
    let overrides = ConfigOverrides {
        owner_role: args.owner,
        usage_roles: (!args.usage.is_empty()).then_some(args.usage),
    };
    let descriptor = load_descriptor(&args.path, args.add_config.as_deref(), &overrides)?;
    let collected = ScriptSource::new(&args.path).collect_package(&descriptor, &args.files)?;

    let (vcs_ref, vcs_link) = detect_vcs(&args.path, args.vcs_ref, args.vcs_link);
    let request = DeployRequest {
        mode: args.mode.into(),
        files: args.files,
        missing_files: collected.unmatched,
        table_order: args.table_order.into(),
        auto_commit: args.auto_commit,
        vcs_ref,
        vcs_link,
        issue_ref: args.issue_ref,
        issue_link: args.issue_link,
    };
    request.validate()?;
    dbpm_engine::order_table_scripts(collected.scripts.get(ObjectKind::Tables), request.table_order)?;

    let package = dbpm_core::Package {
        descriptor,
        scripts: collected.scripts,
    };
    let settings = settings(global);
    let mut session = connect(global)?;
    let result = dbpm_engine::deploy(&mut session, &package, &request, &settings)?;
    print_deployment(&package.descriptor.name, &package.descriptor.version, &result);
    Ok(())
}

/// Fills in revision and remote from git when the caller gave none.
fn detect_vcs(
    root: &Path,
    vcs_ref: Option<String>,
    vcs_link: Option<String>,
) -> (Option<String>, Option<String>) {
    if vcs_ref.is_some() {
        return (vcs_ref, vcs_link);
    }
    let git = Git::new();
    if !git.is_repository(root) {
        debug!(path = %root.display(), "Package is not in a git work tree");
        return (None, vcs_link);
    }
    let revision = git
        .revision_hash(root)
        .map_err(|err| warn!(error = %err, "Could not read git revision"))
        .ok();
    let link = vcs_link.or_else(|| {
        git.remote_url(root)
            .map_err(|err| debug!(error = %err, "No git remote"))
            .ok()
    });
    (revision, link)
}

fn print_deployment(name: &str, version: &Version, result: &DeploymentResult) {
    match &result.schema {
        Some(schema) => println!("Deployed {name} {version} into schema '{schema}'."),
        None => println!("Deployed {name} {version} into the database."),
    }
    for (kind, report) in &result.kinds {
        if report.requested.is_empty() {
            continue;
        }
        if report.skipped.is_empty() {
            println!("  {kind}: {}/{}", report.deployed.len(), report.requested.len());
        } else {
            println!(
                "  {kind}: {}/{} ({} already executed)",
                report.deployed.len(),
                report.requested.len(),
                report.skipped.len()
            );
        }
    }
    for file in &result.missing {
        println!("  missing: {file}");
    }
    if result.status == DeploymentStatus::NotAllDeployed {
        println!(
            "Not all requested scripts were deployed ({} of {}).",
            result.deployed(),
            result.requested()
        );
    }
}

fn run_execute(global: &GlobalArgs, args: ExecuteArgs) -> Result<(), Failure> {
    let settings = settings(global);
    let mut session = connect(global)?;
    let outcome = dbpm_engine::execute_query(&mut session, &args.query, args.until_zero, &settings)?;
    for row in &outcome.rows {
        let fields: Vec<String> = row.iter().map(ToString::to_string).collect();
        println!("{}", fields.join("\t"));
    }
    if args.until_zero {
        eprintln!("Statement ran {} time(s).", outcome.runs);
    }
    if outcome.limit_reached {
        warn!(runs = outcome.runs, "Statement did not reach zero");
    }
    Ok(())
}

fn run_remove(global: &GlobalArgs, args: RemoveArgs) -> Result<(), Failure> {
    let version = Version::parse(&args.version, Encoding::Package)
        .map_err(|err| Failure::precondition(err.to_string()))?;
    let request = RemoveRequest {
        name: args.name,
        version,
        revision: args.old_rev,
    };
    let settings = settings(global);
    let mut session = connect(global)?;
    let removed = dbpm_engine::remove(&mut session, &request, &settings)?;
    for row in &removed {
        println!("Removed {} {} (schema '{}').", row.name, row.version, row.schema_name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_deploy_arguments() {
        let cli = Cli::try_parse_from([
            "dbpm",
            "deploy",
            "pkg",
            "--mode",
            "moderate",
            "--file",
            "functions/a.sql",
            "--file",
            "views/b.sql",
            "--usage",
            "reader,writer",
            "--table-order",
            "integer",
            "-c",
            "host=localhost",
        ])
        .unwrap();
        assert_eq!(cli.global.connection.as_deref(), Some("host=localhost"));
        let Command::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert!(matches!(args.mode, CliMode::Moderate));
        assert_eq!(args.files, ["functions/a.sql", "views/b.sql"]);
        assert_eq!(args.usage, ["reader", "writer"]);
        assert!(matches!(args.table_order, CliTableOrder::Integer));
    }

    #[test]
    fn test_script_failure_message_includes_database_detail() {
        let failure = Failure::from(EngineError::Script {
            script: "views/v.sql".into(),
            partial: true,
            source: ExecutionError::Statement {
                message: "relation \"x\" does not exist".into(),
                code: Some("42P01".into()),
                detail: None,
                hint: Some("check the search path".into()),
            },
        });
        assert_eq!(failure.code, EXIT_EXECUTION);
        assert!(failure.message.starts_with("script 'views/v.sql' failed\ndatabase error: relation"));
        assert!(failure.message.contains("  Hint: check the search path"));
        assert!(failure.message.contains("  Code: 42P01"));
        assert!(failure.message.ends_with("stay committed"));
    }

    #[test]
    fn test_precondition_failures_exit_with_one() {
        let failure = Failure::from(EngineError::SchemaAlreadyExists("billing".into()));
        assert_eq!(failure.code, EXIT_PRECONDITION);
        assert_eq!(Failure::from(SourceError::MissingField("name")).code, EXIT_PRECONDITION);
    }
}
