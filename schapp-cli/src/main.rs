//! schapp CLI - bring a SQLite database up to a target schema.

use clap::Parser;
use rusqlite::Connection;
use schapp::{Error, SchemaMigrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schapp")]
#[command(about = "Apply a declarative target schema to a SQLite database")]
#[command(version)]
struct Cli {
    /// Path to the target schema script
    #[arg(short, long)]
    schema: PathBuf,

    /// Path to the SQLite database, created if missing
    #[arg(short, long)]
    db: PathBuf,

    /// Resolve and print the upgrade plan without changing the database
    #[arg(long)]
    dry_run: bool,

    /// Run the upgrade without wrapping it in a transaction
    #[arg(long)]
    no_transaction: bool,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Upgrade scripts, the first one upgrading major version 1 to the target schema
    upgrade_scripts: Vec<PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity);

    let mut conn = Connection::open(&cli.db)?;
    let migrator = SchemaMigrator::new(&cli.schema, cli.upgrade_scripts);
    let plan = migrator.plan(&conn)?;

    if cli.dry_run {
        println!(
            "current version: {}\ntarget version: {}\nupgrade required: {}",
            plan.current_version(),
            plan.target_version(),
            plan.requires_upgrade()
        );
        match plan.upgrade_file() {
            Some(path) => println!("upgrade script: {}", path.display()),
            None => println!("upgrade script: none"),
        }
        return Ok(());
    }

    let report = if cli.no_transaction {
        plan.perform_upgrade(&conn)?
    } else {
        plan.perform_upgrade_atomic(&mut conn)?
    };

    match report {
        Some(report) => info!(
            from = %report.from_version,
            to = %report.to_version,
            created = ?report.tables_created,
            dropped = ?report.tables_dropped,
            "Database {} upgraded",
            cli.db.display()
        ),
        None => info!(
            version = %plan.current_version(),
            "Database {} is up to date",
            cli.db.display()
        ),
    }
    Ok(())
}

fn setup_logging(verbosity: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
