use crate::error::Error;
use rusqlite::types::ValueRef;
use rusqlite::Row;
use std::path::PathBuf;

/// A report of the changes made by a performed upgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeReport {
    pub from_version: String,
    pub to_version: String,
    /// The upgrade script that was run, if the database changed major version.
    pub upgrade_script: Option<PathBuf>,
    /// Target tables that did not exist before the upgrade.
    pub tables_created: Vec<String>,
    /// Tables that existed before the upgrade and are part of the target schema.
    pub tables_rebuilt: Vec<String>,
    /// Tables that existed before the upgrade but are not part of the target schema.
    pub tables_dropped: Vec<String>,
    /// Names of the triggers generated from `create triggers` definitions, in creation order.
    pub triggers_created: Vec<String>,
}

/// Returns the version of a database that predates the version table.
pub type LegacyVersionFn = dyn Fn(&rusqlite::Connection) -> Result<String, Error> + Send + Sync;

/// Render a result row the way it is reported in integrity errors, e.g. `(1, 'orphan', NULL)`.
pub(crate) fn format_row(row: &Row<'_>, column_count: usize) -> Result<String, Error> {
    let mut values = Vec::with_capacity(column_count);
    for i in 0..column_count {
        let value = match row.get_ref(i)? {
            ValueRef::Null => "NULL".to_string(),
            ValueRef::Integer(v) => v.to_string(),
            ValueRef::Real(v) => v.to_string(),
            ValueRef::Text(v) => format!("'{}'", String::from_utf8_lossy(v).replace('\'', "''")),
            ValueRef::Blob(v) => format!(
                "x'{}'",
                v.iter().map(|b| format!("{:02x}", b)).collect::<String>()
            ),
        };
        values.push(value);
    }
    Ok(format!("({})", values.join(", ")))
}
