//! Durable queue of radar-target observations waiting to be delivered.
//!
//! Observations are grouped per track in SQLite. The connector repeatedly
//! takes the oldest run of unsent points of one track, submits it, and marks
//! the covered time range as sent once the service has acknowledged it.

mod error;
pub mod migrations;
pub mod types;

pub use error::RouteCacheError;
pub use types::{Observation, PendingBatch, PendingStats};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, error, info};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::protocol::RoutePoint;
use error::Result;

/// Largest number of points submitted in one batch.
pub const BATCH_SIZE: usize = 100;

/// Course values arrive referenced to true north.
const COURSE_UNIT: &str = "T";

const SELECT_OLDEST_BATCH: &str = r"
SELECT target.uuid, target_position.timestamp_ms,
       target_position.target_latitude, target_position.target_longitude
FROM target_position
JOIN target ON target.target_id = target_position.target_id
WHERE target_position.target_id = (
        SELECT target_id FROM target_position
        WHERE NOT sent
          AND target_id IN (
                SELECT target_id FROM target_position
                WHERE NOT sent
                GROUP BY target_id
                HAVING count(*) > 1)
        ORDER BY timestamp_ms ASC, position_id ASC
        LIMIT 1)
  AND NOT target_position.sent
ORDER BY target_position.timestamp_ms ASC, target_position.position_id ASC
LIMIT ?1
";

/// SQLite-backed store of observations.
///
/// The connection sits behind a mutex so host inserts and connector reads can
/// share one handle; every statement is atomic at the SQLite level.
pub struct RouteCache {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl RouteCache {
    /// Opens the database at `path` and brings its schema up to date with the
    /// scripts in `migrations_dir`.
    ///
    /// A database that cannot be opened or migrated is treated as lost: the
    /// file is deleted and the original error returned.
    pub fn init(path: &Path, migrations_dir: &Path) -> Result<Self> {
        info!(
            "Opening route cache {} with migrations from {}",
            path.display(),
            migrations_dir.display()
        );

        match Self::open_and_migrate(path, migrations_dir) {
            Ok(conn) => Ok(Self {
                path: path.to_path_buf(),
                conn: Mutex::new(conn),
            }),
            Err(e) => {
                error!("{}. Deleting route cache {}", e, path.display());
                if let Err(rm) = std::fs::remove_file(path) {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        error!("Unable to delete {}: {}", path.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }

    fn open_and_migrate(path: &Path, migrations_dir: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let applied = migrations::migrate(&mut conn, migrations_dir)?;
        if applied > 0 {
            info!("Applied {} migration(s)", applied);
        }
        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RouteCacheError::LockPoisoned)
    }

    /// Stores one observation, creating its track on first sight.
    pub fn insert(&self, observation: &Observation) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let uuid = observation.target_id.to_string();

        tx.execute(
            "INSERT OR IGNORE INTO target (uuid) VALUES (?1)",
            params![uuid],
        )?;
        let target_id: i64 = tx.query_row(
            "SELECT target_id FROM target WHERE uuid = ?1",
            params![uuid],
            |row| row.get(0),
        )?;

        let relative = observation.relative.as_ref();
        tx.execute(
            "INSERT INTO target_position (
                target_id, timestamp_ms,
                target_distance, target_bearing, target_bearing_unit, target_distance_unit,
                target_speed, target_course, target_course_unit,
                target_name, target_status,
                latitude, longitude,
                target_latitude, target_longitude
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                target_id,
                observation.timestamp.timestamp_millis(),
                relative.map(|r| r.distance),
                relative.map(|r| r.bearing),
                relative.map(|r| r.bearing_unit.as_str()),
                relative.map(|r| r.distance_unit.as_str()),
                observation.speed_over_ground,
                observation.course_over_ground_true,
                COURSE_UNIT,
                observation.name,
                observation.status,
                relative.map(|r| r.origin.latitude),
                relative.map(|r| r.origin.longitude),
                observation.position.latitude,
                observation.position.longitude,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Oldest run of unsent points for one track, skipping tracks that have
    /// fewer than two unsent points.
    pub fn retrieve_oldest_pending_batch(&self) -> Result<Option<PendingBatch>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare_cached(SELECT_OLDEST_BATCH)?;
        let rows = stmt
            .query_map(params![BATCH_SIZE as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let Some((uuid, start_ms, _, _)) = rows.first().cloned() else {
            return Ok(None);
        };
        let track = Uuid::parse_str(&uuid).map_err(|e| {
            let column = rusqlite::types::Type::Text;
            rusqlite::Error::FromSqlConversionFailure(0, column, Box::new(e))
        })?;

        let points = rows
            .into_iter()
            .map(|(_, timestamp_ms, lat, lon)| RoutePoint {
                timestamp: timestamp_ms - start_ms,
                lat,
                lon,
            })
            .collect();

        Ok(Some(PendingBatch {
            track,
            start_ms,
            points,
        }))
    }

    /// Marks every point of the batch's track up to its last timestamp as
    /// sent. Returns the number of rows that changed, so a repeated call
    /// returns 0.
    pub fn mark_sent(&self, batch: &PendingBatch) -> Result<usize> {
        let end = batch.end_ms();
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE target_position SET sent = 1
             WHERE target_id = (SELECT target_id FROM target WHERE uuid = ?1)
               AND timestamp_ms <= ?2
               AND NOT sent",
            params![batch.track.to_string(), end],
        )?;
        debug!("Updated {} rows for {} @ {}", changed, batch.track, end);
        Ok(changed)
    }

    pub fn pending_stats(&self) -> Result<PendingStats> {
        let conn = self.lock_conn()?;
        let (datapoints, tracks): (i64, i64) = conn.query_row(
            "SELECT count(*), count(DISTINCT target_id) FROM target_position WHERE NOT sent",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PendingStats {
            unsent_datapoints: datapoints.max(0) as u64,
            unsent_tracks: tracks.max(0) as u64,
        })
    }

    /// Number of points stored for a track, sent or not.
    #[cfg(test)]
    fn track_len(&self, track: &Uuid) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM target_position
             JOIN target ON target.target_id = target_position.target_id
             WHERE target.uuid = ?1",
            params![track.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}
