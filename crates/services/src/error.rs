//! Shared error types for the services crate.

use thiserror::Error;

use course_core::model::{ChapterError, ChapterId, CourseId, ProgressError, SectionId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted by `ChapterService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChapterServiceError {
    #[error("course {course_id} already has a chapter {chapter_number}")]
    DuplicateChapter {
        course_id: CourseId,
        chapter_number: u32,
    },
    #[error("chapter {0} not found")]
    ChapterNotFound(ChapterId),
    #[error("chapter {0} has reading progress and cannot be deleted")]
    ChapterInUse(ChapterId),
    #[error("prerequisite {0} is not another chapter of the same course")]
    UnknownPrerequisite(ChapterId),
    #[error(transparent)]
    Chapter(#[from] ChapterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `ProgressTracker`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressServiceError {
    #[error("chapter {0} not found")]
    ChapterNotFound(ChapterId),
    #[error("section {section_id} does not belong to chapter {chapter_id}")]
    SectionNotFound {
        chapter_id: ChapterId,
        section_id: SectionId,
    },
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures reported by a `QuizGenerator` or while reading its output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuizGenerationError {
    #[error("quiz service failed: {0}")]
    Service(String),
    #[error("quiz service returned no questions")]
    Empty,
    #[error("quiz service returned malformed questions: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors emitted by `QuizGate`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuizGateError {
    /// Expected rejection; the message is meant for the student.
    #[error("{0}")]
    PrerequisiteNotMet(String),
    #[error("chapter {0} not found")]
    ChapterNotFound(ChapterId),
    #[error(transparent)]
    Score(#[from] ProgressError),
    #[error(transparent)]
    Generation(#[from] QuizGenerationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `StatsService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StatsError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
