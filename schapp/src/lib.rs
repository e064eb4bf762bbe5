#![cfg_attr(docsrs, feature(doc_cfg))]
//! `schapp` applies a declarative target schema to a SQLite database while preserving its data.
//!
//! Core concepts:
//! - The target schema is a single SQL script describing the complete desired end state:
//!   tables, views, indexes and `create triggers` definitions. It carries its version in a
//!   `-- schapp schema version X.Y` comment.
//! - Existing tables are rebuilt towards the target schema rather than altered in place, so
//!   columns, constraints and types can change freely between versions.
//! - Data transformations between major versions live in upgrade scripts. The `n`-th script
//!   upgrades a database at major version `n` directly to the target schema and runs while the
//!   old and new columns are both available.
//! - The database records its version in the single-row `_database_version` table.
//!
//! # Example
//!
//! ```no_run
//! use rusqlite::Connection;
//! use schapp::SchemaMigrator;
//!
//! # fn run() -> Result<(), schapp::Error> {
//! let mut conn = Connection::open("inventory.db")?;
//! let migrator = SchemaMigrator::new("schema.sql", ["upgrade_from_1.sql"]);
//!
//! let plan = migrator.plan(&conn)?;
//! if plan.requires_upgrade() {
//!     let report = plan.perform_upgrade_atomic(&mut conn)?;
//!     println!("{:?}", report);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - Tracing integration - available with the `tracing` feature flag.
//! - Testing utilities - available with the `testing` feature flag.

mod core;
pub use core::{LegacyVersionFn, UpgradeReport};

mod ddl;

mod error;
pub use error::Error;

mod migrator;
pub use migrator::{SchemaMigrator, UpgradePlan};

mod reader;
pub use reader::{
    parse_schema, read_clean_statements, read_new_schema, tabledef_from_statement_lines,
    CleanStatements, SchemaObject, TableDefinition, TargetSchema, TriggerDefinition,
};

mod structure;
pub use structure::HIDDEN_TABLE_PREFIX;

mod verify;
pub use verify::foreign_key_violations;

mod version;
pub use version::{recorded_version, SchemaVersion, VERSION_TABLE_NAME};

#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
