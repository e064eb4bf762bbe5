//! Testing utilities for schema development and verification.
//!
//! [SchemaTestHarness] keeps a database and the scripts applied to it together, so a test can
//! set up an old schema with data, switch the schema script, upgrade, and assert on the result.

use crate::{Error, SchemaMigrator, UpgradePlan, UpgradeReport};
use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;

/// A test harness for schema upgrades that provides state control and assertion helpers.
///
/// # Example
///
/// ```
/// use schapp::testing::SchemaTestHarness;
/// use schapp::Error;
///
/// # fn test() -> Result<(), Error> {
/// let mut harness = SchemaTestHarness::new();
/// harness.set_schema("-- schapp schema version 1.0\ncreate table users(\n  id integer primary key,\n  name text);")?;
/// harness.upgrade()?;
///
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
/// harness.assert_table_exists("users")?;
///
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, "alice");
/// # Ok(())
/// # }
/// # test().unwrap();
/// ```
pub struct SchemaTestHarness {
    conn: Connection,
    dir: TempDir,
    upgrade_scripts: usize,
}

/// Represents a captured database schema for comparison and snapshotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Map of table name to table definitions
    pub tables: BTreeMap<String, TableSchema>,
    pub views: Vec<String>,
    pub triggers: Vec<String>,
}

/// Represents a table's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

/// Information about a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Information about an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub sql: String,
}

impl SchemaTestHarness {
    /// Create a harness around an in-memory database.
    pub fn new() -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory test database");
        Self::with_connection(conn)
    }

    /// Create a test harness with a custom connection.
    /// Useful for testing with file-based databases or custom settings.
    pub fn with_connection(conn: Connection) -> Self {
        let dir = TempDir::new().expect("Failed to create directory for test scripts");
        Self {
            conn,
            dir,
            upgrade_scripts: 0,
        }
    }

    fn schema_path(&self) -> PathBuf {
        self.dir.path().join("schema.sql")
    }

    fn upgrade_path(&self, from_major: usize) -> PathBuf {
        self.dir.path().join(format!("upgrade_from_{}.sql", from_major))
    }

    /// Replace the target schema script.
    pub fn set_schema(&mut self, script: &str) -> Result<(), Error> {
        let path = self.schema_path();
        std::fs::write(&path, script).map_err(|e| Error::io(path, e))
    }

    /// Replace the upgrade scripts; the first one upgrades major version 1, and so on.
    pub fn set_upgrade_scripts(&mut self, scripts: &[&str]) -> Result<(), Error> {
        for (i, script) in scripts.iter().enumerate() {
            let path = self.upgrade_path(i + 1);
            std::fs::write(&path, script).map_err(|e| Error::io(path, e))?;
        }
        self.upgrade_scripts = scripts.len();
        Ok(())
    }

    /// A migrator for the current schema and upgrade scripts.
    pub fn migrator(&self) -> SchemaMigrator {
        SchemaMigrator::new(
            self.schema_path(),
            (1..=self.upgrade_scripts).map(|i| self.upgrade_path(i)),
        )
    }

    pub fn plan(&mut self) -> Result<UpgradePlan, Error> {
        self.migrator().plan(&self.conn)
    }

    /// Plan and perform the upgrade inside a transaction.
    pub fn upgrade(&mut self) -> Result<Option<UpgradeReport>, Error> {
        let plan = self.plan()?;
        plan.perform_upgrade_atomic(&mut self.conn)
    }

    /// Plan and perform the upgrade without a transaction.
    pub fn upgrade_in_place(&mut self) -> Result<Option<UpgradeReport>, Error> {
        let plan = self.plan()?;
        plan.perform_upgrade(&self.conn)
    }

    /// Execute SQL (for setting up test data). May contain several statements.
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&mut self, sql: &str) -> Result<T, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let result = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(result)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&mut self, sql: &str) -> Result<Vec<T>, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    /// Query with a custom row mapper.
    pub fn query_map<T, F>(&mut self, sql: &str, f: F) -> Result<Vec<T>, Error>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    fn count_objects(&mut self, object_type: &str, name: &str) -> Result<i64, Error> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type=?1 AND name=?2",
            [object_type, name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Assert that a table exists in the database.
    pub fn assert_table_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.count_objects("table", table_name)? == 0 {
            return Err(Error::Generic(format!(
                "Table '{}' does not exist",
                table_name
            )));
        }
        Ok(())
    }

    /// Assert that a table does not exist in the database.
    pub fn assert_table_not_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.count_objects("table", table_name)? > 0 {
            return Err(Error::Generic(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    /// Assert that a trigger exists.
    pub fn assert_trigger_exists(&mut self, trigger_name: &str) -> Result<(), Error> {
        if self.count_objects("trigger", trigger_name)? == 0 {
            return Err(Error::Generic(format!(
                "Trigger '{}' does not exist",
                trigger_name
            )));
        }
        Ok(())
    }

    /// Assert that an index exists.
    pub fn assert_index_exists(&mut self, index_name: &str) -> Result<(), Error> {
        if self.count_objects("index", index_name)? == 0 {
            return Err(Error::Generic(format!(
                "Index '{}' does not exist",
                index_name
            )));
        }
        Ok(())
    }

    /// Assert that a column exists in a table.
    pub fn assert_column_exists(
        &mut self,
        table_name: &str,
        column_name: &str,
    ) -> Result<(), Error> {
        let columns = self.table_columns(table_name)?;
        if !columns.iter().any(|c| c.name == column_name) {
            return Err(Error::Generic(format!(
                "Column '{}' does not exist in table '{}'",
                column_name, table_name
            )));
        }
        Ok(())
    }

    /// Assert that a column does not exist in a table.
    pub fn assert_column_not_exists(
        &mut self,
        table_name: &str,
        column_name: &str,
    ) -> Result<(), Error> {
        let columns = self.table_columns(table_name)?;
        if columns.iter().any(|c| c.name == column_name) {
            return Err(Error::Generic(format!(
                "Column '{}' exists in table '{}' but should not",
                column_name, table_name
            )));
        }
        Ok(())
    }

    /// Get column information for a table.
    pub fn table_columns(&mut self, table_name: &str) -> Result<Vec<ColumnInfo>, Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info(\"{}\")", table_name.replace('"', "\"\"")))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    type_name: row.get(2)?,
                    not_null: row.get::<_, i32>(3)? != 0,
                    default_value: row.get(4)?,
                    primary_key: row.get::<_, i32>(5)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn object_names(&mut self, object_type: &str) -> Result<Vec<String>, Error> {
        self.conn
            .prepare("SELECT name FROM sqlite_master WHERE type=?1 AND name NOT LIKE 'sqlite_%' ORDER BY name")?
            .query_map([object_type], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn table_indexes(&mut self, table_name: &str) -> Result<Vec<IndexInfo>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name, sql FROM sqlite_master WHERE type='index' AND tbl_name=?1 AND sql IS NOT NULL ORDER BY name",
        )?;
        let index_names_and_sql: Vec<(String, String)> = stmt
            .query_map([table_name], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(index_names_and_sql
            .into_iter()
            .map(|(name, sql)| IndexInfo {
                name,
                unique: sql.to_uppercase().starts_with("CREATE UNIQUE"),
                sql,
            })
            .collect())
    }

    /// Capture the current database schema as a snapshot.
    pub fn capture_schema(&mut self) -> Result<SchemaSnapshot, Error> {
        let mut tables = BTreeMap::new();
        for table_name in self.object_names("table")? {
            let columns = self.table_columns(&table_name)?;
            let indexes = self.table_indexes(&table_name)?;
            tables.insert(table_name, TableSchema { columns, indexes });
        }
        Ok(SchemaSnapshot {
            tables,
            views: self.object_names("view")?,
            triggers: self.object_names("trigger")?,
        })
    }

    /// Get a reference to the underlying connection for advanced usage.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Default for SchemaTestHarness {
    fn default() -> Self {
        Self::new()
    }
}
