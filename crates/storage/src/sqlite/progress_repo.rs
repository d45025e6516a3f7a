use std::collections::HashMap;

use chrono::{DateTime, Utc};
use course_core::model::{
    Bookmark, ChapterId, CourseId, ProgressKey, QuizScore, ReadingProgress, SectionId, StudentId,
};
use sqlx::{Row, SqliteConnection};

use super::SqliteRepository;
use super::mapping::{db_err, id_to_i64, key_params, map_progress_row, ser};
use crate::repository::{ProgressRepository, StorageError};

const PROGRESS_COLUMNS: &str = r"
    id, student_id, chapter_id, course_id, current_section_id, time_spent_minutes,
    is_completed, completed_at, quiz_generated, quiz_score, last_accessed_at,
    created_at, updated_at
";

/// Loads every record matching `filter` (a `WHERE` clause over
/// `reading_progress` using `?1..?n`), with completed sections and bookmarks.
async fn fetch_records(
    conn: &mut SqliteConnection,
    filter: &str,
    params: &[i64],
) -> Result<Vec<ReadingProgress>, StorageError> {
    let sql = format!("SELECT {PROGRESS_COLUMNS} FROM reading_progress WHERE {filter} ORDER BY id ASC");
    let mut query = sqlx::query(&sql);
    for param in params {
        query = query.bind(*param);
    }
    let rows = query.fetch_all(&mut *conn).await.map_err(db_err)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r"
        SELECT progress_id, section_id
        FROM progress_completed_sections
        WHERE progress_id IN (SELECT id FROM reading_progress WHERE {filter})
        "
    );
    let mut query = sqlx::query(&sql);
    for param in params {
        query = query.bind(*param);
    }
    let mut completed: HashMap<i64, Vec<SectionId>> = HashMap::new();
    for row in query.fetch_all(&mut *conn).await.map_err(db_err)? {
        let progress_id: i64 = row.try_get("progress_id").map_err(ser)?;
        let section: String = row.try_get("section_id").map_err(ser)?;
        completed
            .entry(progress_id)
            .or_default()
            .push(SectionId::new(section));
    }

    let sql = format!(
        r"
        SELECT progress_id, section_id, note, created_at
        FROM progress_bookmarks
        WHERE progress_id IN (SELECT id FROM reading_progress WHERE {filter})
        "
    );
    let mut query = sqlx::query(&sql);
    for param in params {
        query = query.bind(*param);
    }
    type BookmarkParts = (SectionId, Option<String>, DateTime<Utc>);
    let mut bookmarks: HashMap<i64, Vec<BookmarkParts>> = HashMap::new();
    for row in query.fetch_all(&mut *conn).await.map_err(db_err)? {
        let progress_id: i64 = row.try_get("progress_id").map_err(ser)?;
        let section: String = row.try_get("section_id").map_err(ser)?;
        bookmarks.entry(progress_id).or_default().push((
            SectionId::new(section),
            row.try_get("note").map_err(ser)?,
            row.try_get("created_at").map_err(ser)?,
        ));
    }

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.try_get("id").map_err(ser)?;
        let mut parts = map_progress_row(&row)?;
        parts.sections_completed = completed.remove(&id).unwrap_or_default();
        parts.bookmarks = bookmarks.remove(&id).unwrap_or_default();
        records.push(ReadingProgress::from_persisted(parts).map_err(ser)?);
    }
    Ok(records)
}

async fn fetch_by_id(conn: &mut SqliteConnection, id: i64) -> Result<ReadingProgress, StorageError> {
    fetch_records(conn, "id = ?1", &[id])
        .await?
        .pop()
        .ok_or(StorageError::NotFound)
}

async fn fetch_by_key(
    conn: &mut SqliteConnection,
    key: ProgressKey,
) -> Result<Option<ReadingProgress>, StorageError> {
    let (student, chapter) = key_params(key)?;
    Ok(fetch_records(conn, "student_id = ?1 AND chapter_id = ?2", &[student, chapter])
        .await?
        .pop())
}

/// The only foreign key a progress insert can break is the chapter reference.
fn missing_chapter(e: sqlx::Error) -> StorageError {
    match db_err(e) {
        StorageError::Conflict => StorageError::NotFound,
        other => other,
    }
}

/// Creates the record for `key` if absent and returns its row id.
///
/// Concurrent first interactions converge on the same row through the
/// `(student_id, chapter_id)` unique key.
async fn ensure_row(
    conn: &mut SqliteConnection,
    key: ProgressKey,
    course_id: CourseId,
    at: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let (student, chapter) = key_params(key)?;
    let row = sqlx::query(
        r"
        INSERT INTO reading_progress (student_id, chapter_id, course_id, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ON CONFLICT(student_id, chapter_id) DO UPDATE SET course_id = reading_progress.course_id
        RETURNING id
        ",
    )
    .bind(student)
    .bind(chapter)
    .bind(id_to_i64("course_id", course_id.value())?)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .map_err(missing_chapter)?;
    row.try_get("id").map_err(ser)
}

async fn touch(conn: &mut SqliteConnection, id: i64, at: DateTime<Utc>) -> Result<(), StorageError> {
    sqlx::query("UPDATE reading_progress SET updated_at = ?2 WHERE id = ?1")
        .bind(id)
        .bind(at)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[async_trait::async_trait]
impl ProgressRepository for SqliteRepository {
    async fn get_progress(
        &self,
        key: ProgressKey,
    ) -> Result<Option<ReadingProgress>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_by_key(&mut conn, key).await
    }

    async fn record_visit(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: Option<&SectionId>,
        time_spent_minutes: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        let (student, chapter) = key_params(key)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // A missing time binds as 0, which MAX leaves untouched.
        let row = sqlx::query(
            r"
            INSERT INTO reading_progress (
                student_id, chapter_id, course_id, current_section_id,
                time_spent_minutes, last_accessed_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
            ON CONFLICT(student_id, chapter_id) DO UPDATE SET
                current_section_id = COALESCE(excluded.current_section_id, reading_progress.current_section_id),
                time_spent_minutes = MAX(reading_progress.time_spent_minutes, excluded.time_spent_minutes),
                last_accessed_at = excluded.last_accessed_at,
                updated_at = excluded.updated_at
            RETURNING id
            ",
        )
        .bind(student)
        .bind(chapter)
        .bind(id_to_i64("course_id", course_id.value())?)
        .bind(section.map(SectionId::as_str))
        .bind(i64::from(time_spent_minutes.unwrap_or(0)))
        .bind(at)
        .fetch_one(&mut *tx)
        .await
        .map_err(missing_chapter)?;
        let id: i64 = row.try_get("id").map_err(ser)?;

        let record = fetch_by_id(&mut tx, id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn add_completed_section(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: &SectionId,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let id = ensure_row(&mut tx, key, course_id, at).await?;

        let res = sqlx::query(
            r"
            INSERT INTO progress_completed_sections (progress_id, section_id, completed_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(progress_id, section_id) DO NOTHING
            ",
        )
        .bind(id)
        .bind(section.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if res.rows_affected() > 0 {
            touch(&mut tx, id, at).await?;
        }

        let record = fetch_by_id(&mut tx, id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn mark_completed(
        &self,
        key: ProgressKey,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        let (student, chapter) = key_params(key)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Only the first transition writes; completed_at is never overwritten.
        sqlx::query(
            r"
            UPDATE reading_progress
            SET is_completed = 1, completed_at = ?3, updated_at = ?3
            WHERE student_id = ?1 AND chapter_id = ?2 AND is_completed = 0
            ",
        )
        .bind(student)
        .bind(chapter)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let record = fetch_by_key(&mut tx, key)
            .await?
            .ok_or(StorageError::NotFound)?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn upsert_bookmark(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: &SectionId,
        bookmark: &Bookmark,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let id = ensure_row(&mut tx, key, course_id, at).await?;

        sqlx::query(
            r"
            INSERT INTO progress_bookmarks (progress_id, section_id, note, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(progress_id, section_id) DO UPDATE SET
                note = excluded.note,
                created_at = excluded.created_at
            ",
        )
        .bind(id)
        .bind(section.as_str())
        .bind(bookmark.note())
        .bind(bookmark.created_at())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        touch(&mut tx, id, at).await?;

        let record = fetch_by_id(&mut tx, id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn remove_bookmark(
        &self,
        key: ProgressKey,
        section: &SectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let (student, chapter) = key_params(key)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let res = sqlx::query(
            r"
            DELETE FROM progress_bookmarks
            WHERE section_id = ?3
              AND progress_id = (
                  SELECT id FROM reading_progress WHERE student_id = ?1 AND chapter_id = ?2
              )
            ",
        )
        .bind(student)
        .bind(chapter)
        .bind(section.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if res.rows_affected() > 0 {
            sqlx::query(
                r"
                UPDATE reading_progress SET updated_at = ?3
                WHERE student_id = ?1 AND chapter_id = ?2
                ",
            )
            .bind(student)
            .bind(chapter)
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn mark_quiz_generated(
        &self,
        key: ProgressKey,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        let (student, chapter) = key_params(key)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r"
            UPDATE reading_progress SET quiz_generated = 1, updated_at = ?3
            WHERE student_id = ?1 AND chapter_id = ?2 AND quiz_generated = 0
            ",
        )
        .bind(student)
        .bind(chapter)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let record = fetch_by_key(&mut tx, key)
            .await?
            .ok_or(StorageError::NotFound)?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn record_quiz_score(
        &self,
        key: ProgressKey,
        score: QuizScore,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        let (student, chapter) = key_params(key)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let res = sqlx::query(
            r"
            UPDATE reading_progress SET quiz_score = ?3, updated_at = ?4
            WHERE student_id = ?1 AND chapter_id = ?2
            ",
        )
        .bind(student)
        .bind(chapter)
        .bind(i64::from(score.value()))
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        let record = fetch_by_key(&mut tx, key)
            .await?
            .ok_or(StorageError::NotFound)?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn list_course_progress(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<ReadingProgress>, StorageError> {
        let course = id_to_i64("course_id", course_id.value())?;
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_records(&mut conn, "course_id = ?1", &[course]).await
    }

    async fn list_student_progress(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Vec<ReadingProgress>, StorageError> {
        let course = id_to_i64("course_id", course_id.value())?;
        let student = id_to_i64("student_id", student_id.value())?;
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_records(&mut conn, "course_id = ?1 AND student_id = ?2", &[course, student]).await
    }

    async fn count_chapter_progress(&self, chapter_id: ChapterId) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reading_progress WHERE chapter_id = ?1")
            .bind(id_to_i64("chapter_id", chapter_id.value())?)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(ser)?;
        u64::try_from(n).map_err(ser)
    }
}
