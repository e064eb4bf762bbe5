use crate::core::format_row;
use crate::error::Error;
use crate::version::{SchemaVersion, VERSION_TABLE_NAME};
use rusqlite::{params, Connection};

/// Rows reported by `pragma foreign_key_check`, rendered as text.
pub fn foreign_key_violations(conn: &Connection) -> Result<Vec<String>, Error> {
    let mut stmt = conn.prepare("pragma foreign_key_check;")?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query([])?;
    let mut violations = Vec::new();
    while let Some(row) = rows.next()? {
        violations.push(format_row(row, column_count)?);
    }
    Ok(violations)
}

/// Record `version` in the single row of the version table.
pub(crate) fn stamp_version(conn: &Connection, version: &SchemaVersion) -> Result<(), Error> {
    let rows: i64 = conn.query_row(
        &format!("select count(*) from {}", VERSION_TABLE_NAME),
        [],
        |row| row.get(0),
    )?;
    if rows > 0 {
        conn.execute(
            &format!("update {} set current_version = ?1", VERSION_TABLE_NAME),
            params![version.as_str()],
        )?;
    } else {
        conn.execute(
            &format!("insert into {}(current_version) values(?1)", VERSION_TABLE_NAME),
            params![version.as_str()],
        )?;
    }
    Ok(())
}

/// Switch foreign key enforcement back on, fail on any violation and stamp the new version.
pub(crate) fn verify_and_stamp(conn: &Connection, version: &SchemaVersion) -> Result<(), Error> {
    conn.execute_batch("pragma foreign_keys = on;")?;
    let violations = foreign_key_violations(conn)?;
    if !violations.is_empty() {
        #[cfg(feature = "tracing")]
        tracing::error!(violations = ?violations, "Foreign key check failed");
        return Err(Error::ForeignKeyViolations(violations));
    }
    stamp_version(conn, version)
}
