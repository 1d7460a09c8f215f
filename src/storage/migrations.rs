//! Schema versioning for the SQLite medium.
//!
//! The database carries a single-row `schema_version` table. On open, every
//! entry of [`MIGRATIONS`] with a version above the stored one is applied in
//! order inside one transaction, and the stored version is bumped after each.
//!
//! To change the schema, append a migration with the next version number:
//!
//! ```text
//! Migration {
//!     version: 2,
//!     up: "ALTER TABLE kv ADD COLUMN updated_at TEXT;",
//! },
//! ```
//!
//! Never edit a migration that has shipped.

use super::StorageError;
use rusqlite::{Connection, Transaction};

/// A forward-only schema change.
#[derive(Debug)]
pub struct Migration {
    pub version: i32,
    pub up: &'static str,
}

/// All migrations in order of application.
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up: r#"
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
    "#,
}];

fn ensure_version_table(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StorageError::Storage(format!("Failed to create schema_version table: {}", e)))?;
    conn.execute(
        "INSERT INTO schema_version (version)
         SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
        [],
    )
    .map_err(|e| StorageError::Storage(format!("Failed to seed schema version: {}", e)))?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_current_version(conn: &Connection) -> Result<i32, StorageError> {
    let version: i32 = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .map_err(|e| StorageError::Storage(format!("Failed to get schema version: {}", e)))?;
    Ok(version)
}

/// Apply any pending migrations to the database
pub fn apply_migrations(conn: &mut Connection) -> Result<(), StorageError> {
    ensure_version_table(conn)?;
    let current_version = get_current_version(conn)?;
    let latest_version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current_version < latest_version {
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Storage(format!("Failed to start transaction: {}", e)))?;

        for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
            apply_migration(&tx, migration)?;
        }

        tx.commit()
            .map_err(|e| StorageError::Storage(format!("Failed to commit transaction: {}", e)))?;
        log::info!("migrated schema from version {} to {}", current_version, latest_version);
    }

    Ok(())
}

fn apply_migration(tx: &Transaction, migration: &Migration) -> Result<(), StorageError> {
    tx.execute_batch(migration.up).map_err(|e| {
        StorageError::Storage(format!(
            "Failed to apply migration {}: {}",
            migration.version, e
        ))
    })?;

    tx.execute(
        "UPDATE schema_version SET version = ?1",
        [migration.version],
    )
    .map_err(|e| {
        StorageError::Storage(format!(
            "Failed to update schema version to {}: {}",
            migration.version, e
        ))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_migration_system() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();

        apply_migrations(&mut conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 1);

        // Running again is a no-op
        apply_migrations(&mut conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 1);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        conn.execute("INSERT INTO kv (key, value) VALUES ('tasks', '[]')", [])
            .unwrap();
    }

    #[test]
    fn test_single_migration_bumps_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn).unwrap();

        const TEST_MIGRATION: Migration = Migration {
            version: 2,
            up: "CREATE TABLE test (id INTEGER PRIMARY KEY);",
        };

        let tx = conn.transaction().unwrap();
        apply_migration(&tx, &TEST_MIGRATION).unwrap();
        tx.commit().unwrap();

        assert_eq!(get_current_version(&conn).unwrap(), 2);
    }
}
