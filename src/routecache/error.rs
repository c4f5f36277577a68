use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteCacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to process migrations directory {dir}: {source}")]
    MigrationsDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("migration {id} ({name}) failed: {source}")]
    Migration {
        id: i64,
        name: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("migrations {first} and {second} share id {id}")]
    DuplicateMigration {
        id: i64,
        first: String,
        second: String,
    },
    #[error("route cache lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, RouteCacheError>;
