//! SQLite-backed store for the automation engine.
//!
//! The database lives at `~/.reengage/reengage.db` and holds both the
//! engine's own tables (rules, per-user state, audit log, run locks) and the
//! collaborator tables it reads (user directory, signal event tables) or
//! writes (in-app notifications). In production those collaborator tables are
//! maintained by the wider platform; the engine treats them as read-only
//! inputs and a write-only sink respectively.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

pub mod types;
pub use types::*;

pub mod audit;
mod state;

/// Name of the single advisory lock guarding an evaluation pass.
const RUN_LOCK_NAME: &str = "evaluation_pass";

/// Lock expiry; a crashed runner's stale lock is reclaimed after this long.
const RUN_LOCK_TTL_MINUTES: i64 = 30;

pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce(&Self) -> Result<T, String>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| format!("Failed to begin transaction: {e}"))?;
        match f(self) {
            Ok(val) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| format!("Failed to commit transaction: {e}"))?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.reengage/reengage.db` and apply
    /// the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Used by tests and the
    /// `--db <path>` config override.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL mode for concurrent dashboard reads while a pass is writing
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.reengage/reengage.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".reengage").join("reengage.db"))
    }

    // -----------------------------------------------------------------------
    // Run lock
    // -----------------------------------------------------------------------

    /// Try to acquire the advisory run lock.
    ///
    /// Check-and-insert runs inside one `BEGIN IMMEDIATE` transaction so two
    /// overlapping invocations against the same database cannot both acquire
    /// it. A lock older than its expiry is treated as abandoned and reclaimed.
    pub fn try_acquire_run_lock(&self, holder: &str, now: DateTime<Utc>) -> Result<bool, String> {
        let now_iso = now.to_rfc3339();
        let expires = (now + chrono::Duration::minutes(RUN_LOCK_TTL_MINUTES)).to_rfc3339();
        self.with_transaction(|db| {
            let existing: Option<String> = db
                .conn
                .query_row(
                    "SELECT expires_at FROM run_locks WHERE name = ?1",
                    params![RUN_LOCK_NAME],
                    |row| row.get(0),
                )
                .ok();

            if let Some(expires_at) = existing {
                let still_held = parse_timestamp(&expires_at)
                    .map(|exp| exp > now)
                    .unwrap_or(false);
                if still_held {
                    return Ok(false);
                }
                db.conn
                    .execute(
                        "DELETE FROM run_locks WHERE name = ?1",
                        params![RUN_LOCK_NAME],
                    )
                    .map_err(|e| format!("Failed to reclaim stale run lock: {}", e))?;
                log::warn!("Reclaimed stale run lock (expired {})", expires_at);
            }

            db.conn
                .execute(
                    "INSERT INTO run_locks (name, holder, acquired_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![RUN_LOCK_NAME, holder, now_iso, expires],
                )
                .map_err(|e| format!("Failed to acquire run lock: {}", e))?;
            Ok(true)
        })
    }

    /// Release the advisory run lock if this holder owns it.
    pub fn release_run_lock(&self, holder: &str) -> Result<(), String> {
        self.conn
            .execute(
                "DELETE FROM run_locks WHERE name = ?1 AND holder = ?2",
                params![RUN_LOCK_NAME, holder],
            )
            .map_err(|e| format!("Failed to release run lock: {}", e))?;
        Ok(())
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use chrono::{Duration, Utc};

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM automation_rules", [], |row| {
                row.get(0)
            })
            .expect("automation_rules table should exist");
        assert_eq!(count, 0);

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM user_automation_state", [], |row| {
                row.get(0)
            })
            .expect("user_automation_state table should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_idempotent_schema_application() {
        // Opening the same DB twice should not error (IF NOT EXISTS)
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("idempotent.db");

        let _db1 = super::EngineDb::open_at(path.clone()).expect("first open");
        let _db2 = super::EngineDb::open_at(path).expect("second open should not fail");
    }

    #[test]
    fn test_run_lock_mutual_exclusion() {
        let db = test_db();
        let now = Utc::now();

        assert!(db.try_acquire_run_lock("runner-a", now).expect("acquire"));
        assert!(
            !db.try_acquire_run_lock("runner-b", now).expect("contend"),
            "second holder must be refused while the lock is live"
        );

        db.release_run_lock("runner-a").expect("release");
        assert!(
            db.try_acquire_run_lock("runner-b", now).expect("reacquire"),
            "lock must be available after release"
        );
    }

    #[test]
    fn test_run_lock_stale_reclaim() {
        let db = test_db();
        let long_ago = Utc::now() - Duration::hours(2);

        assert!(db
            .try_acquire_run_lock("crashed-runner", long_ago)
            .expect("acquire"));

        // TTL has elapsed relative to the new caller's clock
        assert!(
            db.try_acquire_run_lock("runner-b", Utc::now())
                .expect("reclaim"),
            "expired lock must be reclaimable"
        );
    }

    #[test]
    fn test_release_requires_matching_holder() {
        let db = test_db();
        let now = Utc::now();

        assert!(db.try_acquire_run_lock("runner-a", now).expect("acquire"));
        db.release_run_lock("runner-b").expect("no-op release");

        assert!(
            !db.try_acquire_run_lock("runner-c", now).expect("contend"),
            "lock must survive a release attempt by a non-holder"
        );
    }
}
