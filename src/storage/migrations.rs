//! Database migrations for medsync.
//!
//! Each migration is a function that upgrades the schema by one version.
//! Migrations are run automatically when the database is opened.

use rusqlite::Connection;

use crate::error::SyncError;

/// Current schema version.
const CURRENT_VERSION: i32 = 2;

/// Get the current schema version from the database.
///
/// Returns 0 if no version has been set (new database).
pub fn get_version(conn: &Connection) -> Result<i32, SyncError> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| SyncError::Database(format!("Failed to get schema version: {e}")))?;

    Ok(version)
}

/// Set the schema version in the database.
fn set_version(conn: &Connection, version: i32) -> Result<(), SyncError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| SyncError::Database(format!("Failed to set schema version: {e}")))
}

/// Run all pending migrations.
pub fn run(conn: &Connection) -> Result<(), SyncError> {
    let current = get_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        run_migration(conn, version)?;
        set_version(conn, version)?;
    }

    Ok(())
}

/// Run a specific migration.
fn run_migration(conn: &Connection, version: i32) -> Result<(), SyncError> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => Err(SyncError::Database(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: Initial schema.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        r"
        -- Keyed JSON documents
        CREATE TABLE IF NOT EXISTS documents (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Operation queue. seq breaks ties between equal priority and timestamp.
        CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT,
            next_attempt_at TEXT,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_order
        ON sync_queue(status, priority DESC, created_at, seq);

        -- Last known synchronized state per entity
        CREATE TABLE IF NOT EXISTS entity_state (
            entity_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            checksum TEXT NOT NULL,
            version INTEGER NOT NULL
        );

        -- Latest local state per entity awaiting upload
        CREATE TABLE IF NOT EXISTS pending_changes (
            entity_id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            held INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_pending_changes_timestamp
        ON pending_changes(timestamp);

        -- Uploads that failed, with attempt counts
        CREATE TABLE IF NOT EXISTS failed_syncs (
            entity_id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            error TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            failed_at TEXT NOT NULL
        );

        -- Conflicts awaiting resolution
        CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            conflict TEXT NOT NULL,
            detected_at TEXT NOT NULL
        );

        -- Audit log of resolved conflicts
        CREATE TABLE IF NOT EXISTS conflict_resolutions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conflict_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            strategy TEXT NOT NULL,
            resolved_data TEXT,
            reasoning TEXT,
            resolved_at TEXT NOT NULL
        );

        -- Completed sync cycles, most recent retained
        CREATE TABLE IF NOT EXISTS sync_history (
            id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            result TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_history_started
        ON sync_history(started_at);
        ",
    )
    .map_err(|e| SyncError::Database(format!("Migration v1 failed: {e}")))
}

/// Migration v2: Priority on tracked entity changes.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        r"
        ALTER TABLE pending_changes ADD COLUMN priority INTEGER NOT NULL DEFAULT 5;
        ALTER TABLE failed_syncs ADD COLUMN priority INTEGER NOT NULL DEFAULT 5;
        ",
    )
    .map_err(|e| SyncError::Database(format!("Migration v2 failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_v1() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);

        conn.execute(
            "INSERT INTO sync_queue (id, kind, entity_type, entity_id, payload, priority, created_at)
             VALUES ('op-1', 'update', 'medication', 'm1', '{}', 9, '2024-01-01T10:00:00.000000Z')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO entity_state (entity_id, entity_type, timestamp, checksum, version)
             VALUES ('m1', 'medication', '2024-01-01T10:00:00.000000Z', 'abc', 1)",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO documents (key, value, updated_at) VALUES ('sync_status', '{}', 'now')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_conflict_unique_per_entity() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        let insert = "INSERT INTO sync_conflicts (id, entity_id, entity_type, conflict, detected_at)
                      VALUES (?1, 'm1', 'medication', '{}', 'now')";
        conn.execute(insert, ["c1"]).unwrap();
        assert!(conn.execute(insert, ["c2"]).is_err());
    }

    #[test]
    fn test_v1_database_upgrades_with_default_priority() {
        let conn = Connection::open_in_memory().unwrap();
        migrate_v1(&conn).unwrap();
        set_version(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO pending_changes (entity_id, entity, timestamp) VALUES ('m1', '{}', 'now')",
            [],
        )
        .unwrap();

        run(&conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), 2);
        let priority: u8 = conn
            .query_row("SELECT priority FROM pending_changes WHERE entity_id = 'm1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(priority, 5);
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        run(&conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_get_version_new_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_version(&conn).unwrap(), 0);
    }
}
