//! Outreach store schema versions.
//!
//! Each numbered script under `migrations/` is compiled into the binary and
//! applied at most once per database file; `schema_version` records which
//! scripts a file has seen.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Could not create schema_version: {}", e))
}

/// Latest script version recorded for this file; 0 for an empty store.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Could not read schema_version: {}", e))
}

/// Snapshot an existing store to `<path>.v<version>.bak` so a failed upgrade
/// leaves the queue and prospect history recoverable.
///
/// In-memory stores and stores with no applied version have nothing to keep.
fn snapshot_store(conn: &Connection, version: i32) -> Result<(), String> {
    if version == 0 {
        return Ok(());
    }

    let path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Could not locate the store file: {}", e))?;
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }

    let snapshot_path = format!("{}.v{}.bak", path, version);
    let mut snapshot = Connection::open(&snapshot_path)
        .map_err(|e| format!("Could not open snapshot {}: {}", snapshot_path, e))?;
    rusqlite::backup::Backup::new(conn, &mut snapshot)
        .and_then(|backup| backup.step(-1).map(|_| ()))
        .map_err(|e| format!("Snapshot of schema v{} failed: {}", version, e))?;

    log::info!("Migrations: saved schema v{} snapshot to {}", version, snapshot_path);
    Ok(())
}

/// Bring the store up to the newest schema this build carries.
///
/// Each script commits together with its `schema_version` row. Returns how
/// many scripts ran. A store written by a newer build is refused rather than
/// downgraded.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let newest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if current > newest {
        return Err(format!(
            "Store is at schema v{} but outreach-engine only knows up to v{}; \
             upgrade outreach-engine before pointing it at this file.",
            current, newest
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    snapshot_store(conn, current)?;

    for migration in &pending {
        let script = format!(
            "BEGIN;\n{}\nINSERT INTO schema_version (version) VALUES ({});\nCOMMIT;",
            migration.sql, migration.version
        );
        if let Err(e) = conn.execute_batch(&script) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(format!("Schema v{} could not be applied: {}", migration.version, e));
        }
        log::info!("Migrations: store now at schema v{}", migration.version);
    }

    Ok(pending.len())
}
