//! SQLite schema and versioned migrations.

use rusqlite::Connection;

use crate::types::error::StorageError;

/// Ordered migrations. Version N is `MIGRATIONS[N-1]`; a fresh database runs
/// all of them, an existing one only those beyond its recorded version.
const MIGRATIONS: &[&str] = &[
    // v1: core tables.
    "CREATE TABLE IF NOT EXISTS reports (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        query           TEXT NOT NULL,
        params_json     TEXT NOT NULL,
        final_report    TEXT NOT NULL,
        metadata_json   TEXT NOT NULL,
        based_on_json   TEXT NOT NULL DEFAULT '[]',
        feedback_json   TEXT NOT NULL DEFAULT '[]',
        accuracy_score  REAL,
        fact_check_json TEXT,
        query_embedding BLOB,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_reports_created ON reports(created_at);

    CREATE TABLE IF NOT EXISTS jobs (
        job_id           TEXT PRIMARY KEY,
        job_type         TEXT NOT NULL,
        params_json      TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'queued',
        progress_percent REAL,
        progress_message TEXT,
        result_json      TEXT,
        canceled         INTEGER NOT NULL DEFAULT 0,
        idempotency_key  TEXT UNIQUE,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL,
        started_at       TEXT,
        finished_at      TEXT,
        heartbeat_at     TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);

    CREATE TABLE IF NOT EXISTS job_events (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id       TEXT NOT NULL,
        created_at   TEXT NOT NULL,
        event_type   TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        FOREIGN KEY (job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id, id);",
    // v2: hybrid index tables.
    "CREATE TABLE IF NOT EXISTS index_documents (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        source_type   TEXT NOT NULL,
        source_id     TEXT NOT NULL,
        title         TEXT NOT NULL,
        content       TEXT NOT NULL,
        doc_len       INTEGER NOT NULL,
        doc_embedding BLOB,
        created_at    TEXT NOT NULL,
        UNIQUE (source_type, source_id)
    );

    CREATE TABLE IF NOT EXISTS index_terms (
        term TEXT PRIMARY KEY,
        df   INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS index_postings (
        term   TEXT NOT NULL,
        doc_id INTEGER NOT NULL,
        tf     INTEGER NOT NULL,
        PRIMARY KEY (term, doc_id)
    );

    CREATE INDEX IF NOT EXISTS idx_postings_doc ON index_postings(doc_id);",
    // v3: usage counters, tool observations, metadata.
    "CREATE TABLE IF NOT EXISTS usage_counters (
        entity_type  TEXT NOT NULL,
        entity_id    TEXT NOT NULL,
        uses         INTEGER NOT NULL DEFAULT 0,
        last_used_at TEXT NOT NULL,
        PRIMARY KEY (entity_type, entity_id)
    );

    CREATE TABLE IF NOT EXISTS tool_observations (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        tool_name      TEXT NOT NULL,
        input_hash     TEXT NOT NULL,
        output_hash    TEXT,
        success        INTEGER NOT NULL,
        latency_ms     INTEGER NOT NULL,
        error_category TEXT,
        error_code     TEXT,
        request_id     TEXT,
        created_at     TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_observations_created ON tool_observations(created_at);

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );",
];

/// Apply pragmas and bring the schema up to the current version.
pub fn initialize_schema(conn: &Connection, relaxed_durability: bool) -> Result<(), StorageError> {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    if relaxed_durability {
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(migration)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            [version],
        )?;
        tracing::debug!(version, "applied schema migration");
    }

    Ok(())
}

/// Current schema version of an open connection.
pub fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_reaches_latest_version() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, false).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, false).unwrap();
        initialize_schema(&conn, true).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn core_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, false).unwrap();
        for table in [
            "reports",
            "jobs",
            "job_events",
            "index_documents",
            "index_terms",
            "index_postings",
            "usage_counters",
            "tool_observations",
            "meta",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
