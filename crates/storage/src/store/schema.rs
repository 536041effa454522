#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::{OptionalExtension, Transaction, params};

pub(crate) const SCHEMA_VERSION: &str = "jobs_v1";

const SQL: &str = r#"
        CREATE TABLE IF NOT EXISTS store_meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          job_id TEXT NOT NULL UNIQUE,
          job_type TEXT NOT NULL,
          params_json TEXT NOT NULL,
          metadata_json TEXT NOT NULL,
          state TEXT NOT NULL CHECK (state IN ('QUEUED','RUNNING','SUCCEEDED','FAILED','REJECTED','ABORTED')),
          revision INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          started_at_ms INTEGER,
          finished_at_ms INTEGER,
          pid INTEGER,
          progress REAL NOT NULL DEFAULT 0,
          phase TEXT,
          heartbeat_at_ms INTEGER,
          abort_requested INTEGER NOT NULL DEFAULT 0,
          state_reason TEXT,
          rejection_json TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_state_seq ON jobs(state, seq);
"#;

/// Creates tables on first open and refuses a file written by another
/// schema generation.
pub(crate) fn install(tx: &Transaction<'_>) -> Result<(), StoreError> {
    tx.execute_batch(SQL)?;

    let found: Option<String> = tx
        .query_row(
            "SELECT value FROM store_meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        None => {
            tx.execute(
                "INSERT INTO store_meta(key, value) VALUES (?1, ?2)",
                params!["schema_version", SCHEMA_VERSION],
            )?;
        }
        Some(found) if found == SCHEMA_VERSION => {}
        Some(found) => {
            return Err(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }
    }
    Ok(())
}
