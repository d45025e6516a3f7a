use chrono::{DateTime, Utc};
use course_core::model::{
    ChapterId, CourseId, PersistedProgress, ProgressId, ProgressKey, SectionDraft, SectionId,
    SectionKind, StudentId,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Driver errors: constraint violations become `Conflict`, everything else
/// is surfaced as a connection-level failure for the caller to retry.
pub(crate) fn db_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
            StorageError::Conflict
        }
        sqlx::Error::RowNotFound => StorageError::NotFound,
        _ => StorageError::Connection(e.to_string()),
    }
}

pub(crate) fn id_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(crate) fn u32_from_i64(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn chapter_id_from_i64(v: i64) -> Result<ChapterId, StorageError> {
    Ok(ChapterId::new(i64_to_u64("chapter_id", v)?))
}

pub(crate) fn course_id_from_i64(v: i64) -> Result<CourseId, StorageError> {
    Ok(CourseId::new(i64_to_u64("course_id", v)?))
}

pub(crate) fn key_params(key: ProgressKey) -> Result<(i64, i64), StorageError> {
    Ok((
        id_to_i64("student_id", key.student_id.value())?,
        id_to_i64("chapter_id", key.chapter_id.value())?,
    ))
}

pub(crate) fn bool_to_i64(v: bool) -> i64 {
    i64::from(v)
}

fn bool_from_i64(field: &'static str, v: i64) -> Result<bool, StorageError> {
    match v {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StorageError::Serialization(format!(
            "invalid {field}: {other}"
        ))),
    }
}

pub(crate) fn get_bool(row: &SqliteRow, field: &'static str) -> Result<bool, StorageError> {
    bool_from_i64(field, row.try_get::<i64, _>(field).map_err(ser)?)
}

/// Maps a `chapter_sections` row. Rows must be fetched in `position` order.
pub(crate) fn map_section_row(row: &SqliteRow) -> Result<SectionDraft, StorageError> {
    let kind: String = row.try_get("kind").map_err(ser)?;
    Ok(SectionDraft {
        id: row.try_get("section_id").map_err(ser)?,
        title: row.try_get("title").map_err(ser)?,
        content: row.try_get("content").map_err(ser)?,
        kind: SectionKind::parse(&kind).map_err(ser)?,
        is_required: get_bool(row, "is_required")?,
        estimated_read_time_minutes: u32_from_i64(
            "estimated_read_time_minutes",
            row.try_get::<i64, _>("estimated_read_time_minutes")
                .map_err(ser)?,
        )?,
    })
}

/// Scalar columns of a `reading_progress` row; the completed set and
/// bookmarks are filled in by the caller.
pub(crate) fn map_progress_row(row: &SqliteRow) -> Result<PersistedProgress, StorageError> {
    let id = ProgressId::new(i64_to_u64("id", row.try_get::<i64, _>("id").map_err(ser)?)?);
    let student_id = StudentId::new(i64_to_u64(
        "student_id",
        row.try_get::<i64, _>("student_id").map_err(ser)?,
    )?);
    let chapter_id = chapter_id_from_i64(row.try_get::<i64, _>("chapter_id").map_err(ser)?)?;
    let course_id = course_id_from_i64(row.try_get::<i64, _>("course_id").map_err(ser)?)?;

    let is_completed = get_bool(row, "is_completed")?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(ser)?;
    if is_completed != completed_at.is_some() {
        return Err(StorageError::Serialization(
            "is_completed disagrees with completed_at".into(),
        ));
    }

    let quiz_score = row
        .try_get::<Option<i64>, _>("quiz_score")
        .map_err(ser)?
        .map(|s| u32_from_i64("quiz_score", s))
        .transpose()?;

    Ok(PersistedProgress {
        id,
        key: ProgressKey::new(student_id, chapter_id),
        course_id,
        current_section_id: row
            .try_get::<Option<String>, _>("current_section_id")
            .map_err(ser)?
            .map(SectionId::new),
        sections_completed: Vec::new(),
        time_spent_minutes: u32_from_i64(
            "time_spent_minutes",
            row.try_get::<i64, _>("time_spent_minutes").map_err(ser)?,
        )?,
        completed_at,
        bookmarks: Vec::new(),
        quiz_generated: get_bool(row, "quiz_generated")?,
        quiz_score,
        last_accessed_at: row.try_get("last_accessed_at").map_err(ser)?,
        created_at: row.try_get("created_at").map_err(ser)?,
        updated_at: row.try_get("updated_at").map_err(ser)?,
    })
}
