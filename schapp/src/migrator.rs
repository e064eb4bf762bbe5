use crate::core::{LegacyVersionFn, UpgradeReport};
use crate::error::Error;
use crate::reader::read_new_schema;
use crate::structure;
use crate::verify;
use crate::version::{recorded_version, SchemaVersion};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The entrypoint for applying a target schema to a database.
///
/// Construct it with the schema script and the upgrade scripts, then call [SchemaMigrator::plan]
/// to find out what a given database needs. The `n`-th upgrade script (counting from 1)
/// migrates a database at major version `n` directly to the target schema, so there must be
/// exactly `target_major - 1` of them.
pub struct SchemaMigrator {
    schema_path: PathBuf,
    upgrade_paths: Vec<PathBuf>,
    legacy_version: Option<Box<LegacyVersionFn>>,
    busy_timeout: Duration,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigrator")
            .field("schema_path", &self.schema_path)
            .field("upgrade_paths", &self.upgrade_paths)
            .field("legacy_version", &self.legacy_version.is_some())
            .field("busy_timeout", &self.busy_timeout)
            .finish()
    }
}

impl SchemaMigrator {
    pub fn new<P>(schema_path: impl Into<PathBuf>, upgrade_paths: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            schema_path: schema_path.into(),
            upgrade_paths: upgrade_paths.into_iter().map(Into::into).collect(),
            legacy_version: None,
            busy_timeout: Duration::from_secs(30),
        }
    }

    /// Set a function that determines the version of a database without a version table,
    /// e.g. one created before it was managed by schapp.
    /// Without it, such a database counts as blank (version "0").
    ///
    /// # Example
    /// ```
    /// use schapp::SchemaMigrator;
    ///
    /// let migrator = SchemaMigrator::new("schema.sql", ["upgrade_from_1.sql"])
    ///     .with_legacy_version(|conn| {
    ///         let user_version: i64 = conn.query_row("pragma user_version", [], |r| r.get(0))?;
    ///         Ok(user_version.to_string())
    ///     });
    /// ```
    pub fn with_legacy_version<F>(mut self, legacy_version: F) -> Self
    where
        F: Fn(&Connection) -> Result<String, Error> + Send + Sync + 'static,
    {
        self.legacy_version = Some(Box::new(legacy_version));
        self
    }

    /// Set the busy timeout applied to connections before reading or changing them.
    /// Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn schema_path(&self) -> &Path {
        &self.schema_path
    }

    pub fn upgrade_paths(&self) -> &[PathBuf] {
        &self.upgrade_paths
    }

    /// Compare the database's current version with the target schema and decide which upgrade
    /// script, if any, has to run. Nothing is written to the database.
    pub fn plan(&self, conn: &Connection) -> Result<UpgradePlan, Error> {
        conn.busy_timeout(self.busy_timeout)?;

        let script = std::fs::read_to_string(&self.schema_path)
            .map_err(|e| Error::io(&self.schema_path, e))?;
        let target_version = SchemaVersion::from_schema_script(&script)?;
        if target_version.major() == 0 {
            return Err(Error::Config(format!(
                "target schema version {} must have a major version of at least 1",
                target_version
            )));
        }

        let expected_scripts = (target_version.major() - 1) as usize;
        if self.upgrade_paths.len() != expected_scripts {
            return Err(Error::Config(format!(
                "Expected exactly {} upgrade scripts, first one to upgrade schema 1 to schema {}, etc. but got {}",
                expected_scripts,
                target_version.major(),
                self.upgrade_paths.len()
            )));
        }

        let current_version = match recorded_version(conn)? {
            Some(version) => SchemaVersion::parse(&version)?,
            None => match &self.legacy_version {
                Some(legacy_version) => SchemaVersion::parse(&legacy_version(conn)?)?,
                None => SchemaVersion::blank(),
            },
        };

        if current_version.major() > target_version.major() {
            return Err(Error::Config(format!(
                "Current database version {} is greater than target schema version {}",
                current_version, target_version
            )));
        }

        let current_major = current_version.major();
        let upgrade_file = if 0 < current_major && current_major < target_version.major() {
            Some(self.upgrade_paths[(current_major - 1) as usize].clone())
        } else {
            None
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            current_version = %current_version,
            target_version = %target_version,
            upgrade_file = ?upgrade_file,
            "Resolved upgrade plan"
        );

        Ok(UpgradePlan {
            schema_path: self.schema_path.clone(),
            target_version,
            current_version,
            upgrade_file,
            busy_timeout: self.busy_timeout,
        })
    }
}

/// What it takes to bring one database to the target schema.
///
/// A plan is resolved against one database by [SchemaMigrator::plan]; performing it against a
/// different database gives undefined results.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradePlan {
    schema_path: PathBuf,
    target_version: SchemaVersion,
    current_version: SchemaVersion,
    upgrade_file: Option<PathBuf>,
    busy_timeout: Duration,
}

impl UpgradePlan {
    /// Whether the recorded version differs from the target version.
    pub fn requires_upgrade(&self) -> bool {
        self.current_version.as_str() != self.target_version.as_str()
    }

    pub fn preupgrade_major_version(&self) -> u32 {
        self.current_version.major()
    }

    pub fn current_version(&self) -> &SchemaVersion {
        &self.current_version
    }

    pub fn target_version(&self) -> &SchemaVersion {
        &self.target_version
    }

    /// The upgrade script selected for the current major version.
    /// `None` for blank databases and databases already at the target major version.
    pub fn upgrade_file(&self) -> Option<&Path> {
        self.upgrade_file.as_deref()
    }

    pub fn schema_path(&self) -> &Path {
        &self.schema_path
    }

    /// Bring the database to the target schema on the given connection.
    ///
    /// Returns `Ok(None)` without touching the database when no upgrade is required.
    /// No transaction is opened: on failure the database is left wherever the failing step
    /// stopped, unless the caller wrapped the call in a transaction of its own. Note that
    /// SQLite ignores `pragma foreign_keys` inside a transaction, see
    /// [UpgradePlan::perform_upgrade_atomic] for the combination that works.
    pub fn perform_upgrade(&self, conn: &Connection) -> Result<Option<UpgradeReport>, Error> {
        if !self.requires_upgrade() {
            #[cfg(feature = "tracing")]
            tracing::debug!(version = %self.current_version, "Database already at target version");
            return Ok(None);
        }
        conn.busy_timeout(self.busy_timeout)?;
        self.upgrade(conn).map(Some)
    }

    /// Like [UpgradePlan::perform_upgrade], but inside a single transaction that is rolled back
    /// if any step fails. Foreign key enforcement is switched off around the transaction and
    /// restored to its previous setting afterwards.
    pub fn perform_upgrade_atomic(
        &self,
        conn: &mut Connection,
    ) -> Result<Option<UpgradeReport>, Error> {
        if !self.requires_upgrade() {
            #[cfg(feature = "tracing")]
            tracing::debug!(version = %self.current_version, "Database already at target version");
            return Ok(None);
        }
        conn.busy_timeout(self.busy_timeout)?;
        let foreign_keys: bool = conn.query_row("pragma foreign_keys", [], |row| row.get(0))?;
        conn.execute_batch("pragma foreign_keys = off;")?;
        let result = self.upgrade_in_transaction(conn);
        let restored = conn.execute_batch(if foreign_keys {
            "pragma foreign_keys = on;"
        } else {
            "pragma foreign_keys = off;"
        });

        let report = result?;
        restored?;
        Ok(Some(report))
    }

    fn upgrade_in_transaction(&self, conn: &mut Connection) -> Result<UpgradeReport, Error> {
        // Transaction will be automatically rolled back when dropped
        let tx = conn.transaction()?;
        let report = self.upgrade(&tx)?;
        tx.commit()?;
        Ok(report)
    }

    fn upgrade(&self, conn: &Connection) -> Result<UpgradeReport, Error> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "schema_upgrade",
            from = %self.current_version,
            to = %self.target_version
        )
        .entered();

        #[cfg(feature = "tracing")]
        tracing::info!("Starting schema upgrade");

        let schema = read_new_schema(&self.schema_path)?;
        let changes = structure::apply(conn, schema, self.upgrade_file.as_deref())?;
        verify::verify_and_stamp(conn, &self.target_version)?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            tables_created = changes.tables_created.len(),
            tables_rebuilt = changes.tables_rebuilt.len(),
            tables_dropped = changes.tables_dropped.len(),
            triggers_created = changes.triggers_created.len(),
            "Schema upgrade completed"
        );

        Ok(UpgradeReport {
            from_version: self.current_version.to_string(),
            to_version: self.target_version.to_string(),
            upgrade_script: self.upgrade_file.clone(),
            tables_created: changes.tables_created,
            tables_rebuilt: changes.tables_rebuilt,
            tables_dropped: changes.tables_dropped,
            triggers_created: changes.triggers_created,
        })
    }
}
