//! SQLite connection setup and the shared storage error type.

use rollcall_core::DimensionMismatch;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot open database {path}: {source}")]
    Open {
        path: String,
        source: tokio_rusqlite::Error,
    },
    #[error("store write failed: {0}")]
    Write(tokio_rusqlite::Error),
    #[error("store read failed: {0}")]
    Read(tokio_rusqlite::Error),
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("identity {0} has no embeddings")]
    NoEmbeddings(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id           TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    synthetic    INTEGER NOT NULL DEFAULT 0,
    enrolled_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    row_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id   TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    dim           INTEGER NOT NULL,
    vector        BLOB NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_id);

CREATE TABLE IF NOT EXISTS attendance_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id      TEXT NOT NULL,
    recorded_at     TEXT NOT NULL,
    outcome         TEXT NOT NULL,
    identity_id     TEXT,
    identity_name   TEXT,
    similarity      REAL,
    liveness_score  REAL,
    liveness_reason TEXT,
    latency_ms      REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_recorded_at ON attendance_log(recorded_at);
CREATE INDEX IF NOT EXISTS idx_attendance_outcome ON attendance_log(outcome);
CREATE INDEX IF NOT EXISTS idx_attendance_identity ON attendance_log(identity_id, recorded_at);
";

/// Open (creating if needed) the database file and apply the schema.
pub async fn open(path: &Path) -> Result<Connection, StoreError> {
    let display_path = path.display().to_string();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                path: display_path.clone(),
                source: tokio_rusqlite::Error::Other(Box::new(e)),
            })?;
        }
    }

    let conn = Connection::open(path)
        .await
        .map_err(|source| StoreError::Open {
            path: display_path.clone(),
            source,
        })?;
    init(&conn).await.map_err(|source| StoreError::Open {
        path: display_path.clone(),
        source,
    })?;

    tracing::info!(path = %display_path, "database opened");
    Ok(conn)
}

/// Private in-memory database with the schema applied.
#[cfg(test)]
pub async fn open_in_memory() -> Result<Connection, StoreError> {
    let open_err = |source| StoreError::Open {
        path: ":memory:".to_string(),
        source,
    };
    let conn = Connection::open_in_memory().await.map_err(open_err)?;
    init(&conn).await.map_err(open_err)?;
    Ok(conn)
}

async fn init(conn: &Connection) -> Result<(), tokio_rusqlite::Error> {
    conn.call(|conn| {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(journal_mode = %mode, "schema ready");
        Ok(())
    })
    .await
}

/// Little-endian `f32` encoding used for the `vector` column.
pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Current UTC time in the fixed-width RFC 3339 form stored in every table.
///
/// Fixed width keeps lexicographic order equal to time order.
pub fn now_rfc3339() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_blob_layout() {
        let bytes = encode_vector(&[1.0, -0.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_vector(&bytes), Some(vec![1.0, -0.5]));
        assert_eq!(decode_vector(&bytes[..7]), None);
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        use chrono::TimeZone;
        let early = format_timestamp(chrono::Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
        let late = format_timestamp(chrono::Utc.with_ymd_and_hms(2026, 11, 2, 3, 4, 5).unwrap());
        assert_eq!(early, "2026-01-02T03:04:05.000000Z");
        assert!(early < late);
    }

    #[tokio::test]
    async fn test_schema_applies_to_memory_db() {
        let conn = open_in_memory().await.unwrap();
        let tables: Vec<String> = conn
            .call(|c| {
                let mut stmt =
                    c.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
                let names = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();
        assert!(tables.contains(&"identities".to_string()));
        assert!(tables.contains(&"embeddings".to_string()));
        assert!(tables.contains(&"attendance_log".to_string()));
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = std::env::temp_dir().join(format!("rollcall-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested/attendance.db");
        open(&path).await.unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
