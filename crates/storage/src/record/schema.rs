//! Record store schema.
//!
//! Tables are created with `IF NOT EXISTS`; structural indexes live in
//! [`ensure_indexes`] so they can be rebuilt on every startup independently of
//! table creation.

use rusqlite::Connection;

/// Create the record tables.
pub fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS session (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Parts live in their own table so a message write can replace them
        -- atomically. They are keyed by position; ids need not be unique.
        CREATE TABLE IF NOT EXISTS message (
            session_id TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (session_id, id)
        );

        CREATE TABLE IF NOT EXISTS part (
            session_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            id TEXT,
            part_type TEXT,
            data TEXT NOT NULL,
            PRIMARY KEY (session_id, message_id, position)
        );

        CREATE TABLE IF NOT EXISTS session_diff (
            session_id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
}

/// Create the structural indexes used by listing and part-type lookups.
pub fn ensure_indexes(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_session_project ON session(project_id, id);
        CREATE INDEX IF NOT EXISTS idx_message_session ON message(session_id, id);
        CREATE INDEX IF NOT EXISTS idx_part_message ON part(session_id, message_id);
        CREATE INDEX IF NOT EXISTS idx_part_type ON part(part_type);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_and_indexes_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&mut conn).unwrap();
        init_schema(&mut conn).unwrap();
        ensure_indexes(&mut conn).unwrap();
        ensure_indexes(&mut conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }
}
