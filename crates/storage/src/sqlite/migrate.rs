use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

const SCHEMA_V1: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS chapters (
        id INTEGER PRIMARY KEY,
        course_id INTEGER NOT NULL,
        chapter_number INTEGER NOT NULL CHECK (chapter_number >= 1),
        title TEXT NOT NULL,
        description TEXT,
        is_published INTEGER NOT NULL CHECK (is_published IN (0, 1)),
        total_estimated_minutes INTEGER NOT NULL CHECK (total_estimated_minutes >= 0),
        version INTEGER NOT NULL CHECK (version >= 1),
        revision INTEGER NOT NULL CHECK (revision >= 1),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (course_id, chapter_number)
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS chapter_sections (
        chapter_id INTEGER NOT NULL,
        section_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        kind TEXT NOT NULL,
        is_required INTEGER NOT NULL CHECK (is_required IN (0, 1)),
        estimated_read_time_minutes INTEGER NOT NULL CHECK (estimated_read_time_minutes >= 0),
        PRIMARY KEY (chapter_id, section_id),
        FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS chapter_prerequisites (
        chapter_id INTEGER NOT NULL,
        prerequisite_id INTEGER NOT NULL,
        PRIMARY KEY (chapter_id, prerequisite_id),
        FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE,
        FOREIGN KEY (prerequisite_id) REFERENCES chapters(id) ON DELETE CASCADE
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS reading_progress (
        id INTEGER PRIMARY KEY,
        student_id INTEGER NOT NULL,
        chapter_id INTEGER NOT NULL,
        course_id INTEGER NOT NULL,
        current_section_id TEXT,
        time_spent_minutes INTEGER NOT NULL DEFAULT 0 CHECK (time_spent_minutes >= 0),
        is_completed INTEGER NOT NULL DEFAULT 0 CHECK (is_completed IN (0, 1)),
        completed_at TEXT,
        quiz_generated INTEGER NOT NULL DEFAULT 0 CHECK (quiz_generated IN (0, 1)),
        quiz_score INTEGER CHECK (quiz_score BETWEEN 0 AND 100),
        last_accessed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (student_id, chapter_id),
        CHECK ((is_completed = 0) = (completed_at IS NULL)),
        FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE RESTRICT
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS progress_completed_sections (
        progress_id INTEGER NOT NULL,
        section_id TEXT NOT NULL,
        completed_at TEXT NOT NULL,
        PRIMARY KEY (progress_id, section_id),
        FOREIGN KEY (progress_id) REFERENCES reading_progress(id) ON DELETE CASCADE
    );
    ",
    r"
    CREATE TABLE IF NOT EXISTS progress_bookmarks (
        progress_id INTEGER NOT NULL,
        section_id TEXT NOT NULL,
        note TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (progress_id, section_id),
        FOREIGN KEY (progress_id) REFERENCES reading_progress(id) ON DELETE CASCADE
    );
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_reading_progress_course
        ON reading_progress (course_id, student_id);
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_reading_progress_chapter
        ON reading_progress (chapter_id);
    ",
];

/// Applies versioned schema migrations, each inside its own transaction.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    for (version, statements) in [(1_i64, SCHEMA_V1)] {
        if is_applied(pool, version).await? {
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(version)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(version, "applied schema migration");
    }

    Ok(())
}
