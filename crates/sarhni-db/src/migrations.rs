use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                role        TEXT NOT NULL DEFAULT 'USER'
                            CHECK (role IN ('USER', 'ADMIN', 'OWNER')),
                is_banned   INTEGER NOT NULL DEFAULT 0,
                bio         TEXT,
                image       TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE confessions (
                id            TEXT PRIMARY KEY,
                content       TEXT NOT NULL,
                sender_id     TEXT REFERENCES users(id) ON DELETE SET NULL,
                receiver_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                is_anonymous  INTEGER NOT NULL DEFAULT 1,
                is_pinned     INTEGER NOT NULL DEFAULT 0,
                reply         TEXT,
                reply_at      TEXT,
                created_at    TEXT NOT NULL,
                edited_at     TEXT
            );

            CREATE INDEX idx_confessions_feed
                ON confessions(receiver_id, is_pinned, created_at);

            CREATE TABLE reports (
                id             TEXT PRIMARY KEY,
                confession_id  TEXT NOT NULL REFERENCES confessions(id) ON DELETE CASCADE,
                reporter_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                reason         TEXT NOT NULL,
                description    TEXT,
                status         TEXT NOT NULL DEFAULT 'PENDING'
                               CHECK (status IN ('PENDING', 'REVIEWED', 'DISMISSED')),
                reviewed_by    TEXT REFERENCES users(id) ON DELETE SET NULL,
                reviewed_at    TEXT,
                created_at     TEXT NOT NULL
            );

            CREATE INDEX idx_reports_dedupe
                ON reports(confession_id, reporter_id, status);

            CREATE INDEX idx_reports_created
                ON reports(created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
