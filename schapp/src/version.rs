use crate::error::Error;
use regex::Regex;
use rusqlite::Connection;
use std::fmt;
use std::sync::OnceLock;

/// Name of the table recording which schema version a database is at.
pub const VERSION_TABLE_NAME: &str = "_database_version";

/// Statement lines defining the version table; it is rebuilt together with the target schema.
pub(crate) const VERSION_TABLE_LINES: [&str; 3] = [
    "create table _database_version(",
    "  current_version text not null,",
    "  constraint only_one_row check(rowid==1));",
];

/// A schema version string together with its major component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersion {
    raw: String,
    major: u32,
}

impl SchemaVersion {
    /// Version of a database that has never been touched.
    pub fn blank() -> Self {
        Self {
            raw: "0".to_string(),
            major: 0,
        }
    }

    /// Parse a version as recorded in a database, where only the part before the first `.`
    /// has to be numeric.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let major_part = raw.split_once('.').map_or(raw, |(major, _)| major);
        let major = major_part.trim().parse::<u32>().map_err(|_| {
            Error::Config(format!(
                "database version {:?} does not start with a numeric major version",
                raw
            ))
        })?;
        Ok(Self {
            raw: raw.to_string(),
            major,
        })
    }

    /// Find the `-- schapp schema version <version>` comment in a schema script.
    pub fn from_schema_script(script: &str) -> Result<Self, Error> {
        static VERSION_COMMENT: OnceLock<Regex> = OnceLock::new();
        let regex = VERSION_COMMENT.get_or_init(|| {
            Regex::new(r"-- schapp schema version ((\d+)([.]\d+)?)").expect("valid regex")
        });
        let captures = regex.captures(script).ok_or_else(|| {
            Error::Config(
                "Could not find schapp schema version in schema file - expect line of form \"-- schapp schema version 0.0\""
                    .to_string(),
            )
        })?;
        let major = captures[2].parse::<u32>().map_err(|e| {
            Error::Config(format!("invalid major version {:?}: {}", &captures[2], e))
        })?;
        Ok(Self {
            raw: captures[1].to_string(),
            major,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn major(&self) -> u32 {
        self.major
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool, Error> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
    let exists = stmt.query([name])?.next()?.is_some();
    Ok(exists)
}

/// Read the version recorded in the version table, if the table exists and holds a row.
pub fn recorded_version(conn: &Connection) -> Result<Option<String>, Error> {
    if !table_exists(conn, VERSION_TABLE_NAME)? {
        return Ok(None);
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT current_version FROM {} LIMIT 1",
        VERSION_TABLE_NAME
    ))?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}
