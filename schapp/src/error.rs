use std::path::PathBuf;

/// Error type for the schapp crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The schema file, the upgrade script list or the recorded versions do not fit together.
    #[error("{0}")]
    Config(String),
    /// A schema or upgrade script could not be split into statements or classified.
    #[error("{0}")]
    Parse(String),
    /// The live database holds something the migrator cannot handle.
    #[error("{0}")]
    Database(String),
    /// The upgrade script returned rows, which it uses to report problems with the data.
    #[error("there was integrity checking output:\n  {}", .0.join("\n  "))]
    IntegrityCheck(Vec<String>),
    #[error("FK violations:\n  {}", .0.join("\n  "))]
    ForeignKeyViolations(Vec<String>),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because std::io::Error doesn't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Rusqlite(a), Self::Rusqlite(b)) => a == b,
            (
                Self::Io {
                    path: a,
                    source: a_source,
                },
                Self::Io {
                    path: b,
                    source: b_source,
                },
            ) => a == b && a_source.kind() == b_source.kind(),
            (Self::Config(a), Self::Config(b)) => a == b,
            (Self::Parse(a), Self::Parse(b)) => a == b,
            (Self::Database(a), Self::Database(b)) => a == b,
            (Self::IntegrityCheck(a), Self::IntegrityCheck(b)) => a == b,
            (Self::ForeignKeyViolations(a), Self::ForeignKeyViolations(b)) => a == b,
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}
