use rusqlite::{Connection, Result};

/// Initialise the memory table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memory_rows (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            content            TEXT NOT NULL,
            vector             BLOB NOT NULL,
            tags               TEXT NOT NULL DEFAULT '[]',
            created_at         TEXT NOT NULL,
            source_session_key TEXT,
            pending_reindex    INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_memory_pending
            ON memory_rows(pending_reindex)
            WHERE pending_reindex = 1;",
    )
}

/// Encode an f32 vector as little-endian bytes for the BLOB column.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode a BLOB column back into an f32 vector.
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.75, 0.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)), v);
    }
}
