use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use rusqlite::{params, Connection};

use super::error::{Result, RouteCacheError};

const CREATE_MIGRATIONS: &str = r"
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER NOT NULL,
    name TEXT NOT NULL,
    applied DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
}

/// Lists the numbered scripts in `dir`, ordered by id.
///
/// Only regular files whose name starts with decimal digits take part;
/// anything else is skipped with a warning.
pub fn discover(dir: &Path) -> Result<Vec<MigrationScript>> {
    let dir_err = |source| RouteCacheError::MigrationsDir {
        dir: dir.to_path_buf(),
        source,
    };

    let mut scripts = Vec::new();
    for entry in fs::read_dir(dir).map_err(dir_err)? {
        let path = entry.map_err(dir_err)?.path();
        if !path.is_file() {
            continue;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse::<i64>() {
            Ok(id) => scripts.push(MigrationScript { id, name, path }),
            Err(_) => warn!("Ignoring migration file without numeric prefix: {}", name),
        }
    }

    scripts.sort_by_key(|s| s.id);
    for pair in scripts.windows(2) {
        if pair[0].id == pair[1].id {
            return Err(RouteCacheError::DuplicateMigration {
                id: pair[0].id,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }
    Ok(scripts)
}

/// Highest recorded migration id, or 0 when none has run yet.
pub fn applied_version(conn: &Connection) -> Result<i64> {
    let max: Option<i64> =
        conn.query_row("SELECT max(id) FROM migrations", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0))
}

/// Creates the bookkeeping table if needed, then applies every script newer
/// than the highest recorded id. Each script and its bookkeeping row commit
/// together. Returns how many scripts ran.
pub fn migrate(conn: &mut Connection, dir: &Path) -> Result<usize> {
    conn.execute_batch(CREATE_MIGRATIONS)?;
    let current = applied_version(conn)?;

    let mut applied = 0;
    for script in discover(dir)?.into_iter().filter(|s| s.id > current) {
        info!("Running migration {}: {}", script.id, script.name);
        let sql = fs::read_to_string(&script.path)?;

        let fail = |source| RouteCacheError::Migration {
            id: script.id,
            name: script.name.clone(),
            source,
        };
        let tx = conn.transaction().map_err(fail)?;
        tx.execute_batch(&sql).map_err(fail)?;
        tx.execute(
            "INSERT INTO migrations (id, name) VALUES (?1, ?2)",
            params![script.id, script.name],
        )
        .map_err(fail)?;
        tx.commit().map_err(fail)?;
        applied += 1;
    }
    Ok(applied)
}
