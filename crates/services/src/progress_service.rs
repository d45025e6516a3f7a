use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use course_core::model::{
    Bookmark, Chapter, ChapterId, CourseId, ProgressKey, ReadingProgress, SectionId, StudentId,
};
use course_core::policy::{self, ChapterRef};
use course_core::quiz::can_generate_quiz;
use course_core::stats::completion_rate;
use storage::repository::{ChapterLookup, ProgressRepository, StorageError};

use crate::Clock;
use crate::error::ProgressServiceError;

//
// ─── VIEWS ─────────────────────────────────────────────────────────────────────
//

/// One chapter as a student sees it, with their progress merged in.
#[derive(Debug, Clone, Serialize)]
pub struct ChapterProgressView {
    pub chapter: Chapter,
    pub progress: ReadingProgress,
    pub progress_percent: u8,
    pub can_generate_quiz: bool,
    pub next_chapter: Option<ChapterRef>,
    pub previous_chapter: Option<ChapterRef>,
    /// Advisory only; access is never refused because of these.
    pub unmet_prerequisites: Vec<ChapterRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterProgressSummary {
    pub chapter: ChapterRef,
    pub progress: ReadingProgress,
    pub progress_percent: u8,
}

/// A student's standing across the published chapters of a course.
#[derive(Debug, Clone, Serialize)]
pub struct CourseProgressView {
    pub course_id: CourseId,
    pub student_id: StudentId,
    pub chapters: Vec<ChapterProgressSummary>,
    pub completed_chapters: u64,
    pub total_chapters: u64,
    pub completion_rate: u8,
}

//
// ─── TRACKER ───────────────────────────────────────────────────────────────────
//

/// Records student interactions and derives chapter completion.
///
/// Each command touches one progress record through the repository's atomic
/// upserts, then re-evaluates the completion predicate against the returned
/// state. Drafts are invisible to students and answer as not found.
#[derive(Clone)]
pub struct ProgressTracker {
    clock: Clock,
    chapters: Arc<dyn ChapterLookup>,
    progress: Arc<dyn ProgressRepository>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(
        clock: Clock,
        chapters: Arc<dyn ChapterLookup>,
        progress: Arc<dyn ProgressRepository>,
    ) -> Self {
        Self {
            clock,
            chapters,
            progress,
        }
    }

    /// Upsert the record, move the current section, and ratchet time spent.
    ///
    /// A chapter without required sections completes on its first visit.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ChapterNotFound` for missing or unpublished chapters.
    /// Returns `ProgressServiceError::SectionNotFound` if `section` is not in the chapter.
    pub async fn record_visit(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
        section: Option<SectionId>,
        time_spent_minutes: Option<u32>,
    ) -> Result<ReadingProgress, ProgressServiceError> {
        let chapter = self.visible_chapter(chapter_id).await?;
        if let Some(section) = &section {
            ensure_section(&chapter, section)?;
        }

        let now = self.clock.now();
        let key = ProgressKey::new(student_id, chapter_id);
        let record = self
            .progress
            .record_visit(
                key,
                chapter.course_id(),
                section.as_ref(),
                time_spent_minutes,
                now,
            )
            .await
            .map_err(|e| upsert_error(e, chapter_id))?;
        tracing::debug!(%student_id, %chapter_id, minutes = record.time_spent_minutes(), "visit recorded");

        self.settle_completion(&chapter, record, now).await
    }

    /// Union `section` into the completed set and flip completion if now satisfied.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ChapterNotFound` for missing or unpublished chapters.
    /// Returns `ProgressServiceError::SectionNotFound` if `section` is not in the chapter.
    pub async fn complete_section(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
        section: SectionId,
    ) -> Result<ReadingProgress, ProgressServiceError> {
        let chapter = self.visible_chapter(chapter_id).await?;
        ensure_section(&chapter, &section)?;

        let now = self.clock.now();
        let key = ProgressKey::new(student_id, chapter_id);
        let record = self
            .progress
            .add_completed_section(key, chapter.course_id(), &section, now)
            .await
            .map_err(|e| upsert_error(e, chapter_id))?;
        tracing::debug!(%student_id, %chapter_id, %section, "section completed");

        self.settle_completion(&chapter, record, now).await
    }

    /// Create or replace the bookmark on `section`.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::Progress` if the note is too long.
    /// Returns `ProgressServiceError::SectionNotFound` if `section` is not in the chapter.
    pub async fn set_bookmark(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
        section: SectionId,
        note: Option<String>,
    ) -> Result<ReadingProgress, ProgressServiceError> {
        let chapter = self.visible_chapter(chapter_id).await?;
        ensure_section(&chapter, &section)?;

        let now = self.clock.now();
        let bookmark = Bookmark::new(note, now)?;
        let record = self
            .progress
            .upsert_bookmark(
                ProgressKey::new(student_id, chapter_id),
                chapter.course_id(),
                &section,
                &bookmark,
                now,
            )
            .await
            .map_err(|e| upsert_error(e, chapter_id))?;
        Ok(record)
    }

    /// Remove the bookmark on `section`. A missing bookmark is not an error.
    ///
    /// The section is not checked against the chapter, so bookmarks on
    /// sections that were since removed can still be cleared.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ChapterNotFound` for missing or unpublished chapters.
    pub async fn remove_bookmark(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
        section: SectionId,
    ) -> Result<(), ProgressServiceError> {
        self.visible_chapter(chapter_id).await?;
        self.progress
            .remove_bookmark(
                ProgressKey::new(student_id, chapter_id),
                &section,
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// The student's record, or an unsaved empty one if they never opened the chapter.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ChapterNotFound` for missing or unpublished chapters.
    pub async fn get_progress(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
    ) -> Result<ReadingProgress, ProgressServiceError> {
        let chapter = self.visible_chapter(chapter_id).await?;
        self.progress_or_default(&chapter, student_id).await
    }

    /// A chapter with the student's progress, neighbours, and unmet prerequisites.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::ChapterNotFound` for missing or unpublished chapters.
    pub async fn chapter_view(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
    ) -> Result<ChapterProgressView, ProgressServiceError> {
        let chapter = self.visible_chapter(chapter_id).await?;
        let chapters = self.chapters.list_chapters(chapter.course_id()).await?;
        let records = self
            .progress
            .list_student_progress(student_id, chapter.course_id())
            .await?;

        let completed: BTreeSet<ChapterId> = records
            .iter()
            .filter(|r| r.is_completed())
            .map(ReadingProgress::chapter_id)
            .collect();
        let progress = records
            .into_iter()
            .find(|r| r.chapter_id() == chapter_id)
            .unwrap_or_else(|| {
                ReadingProgress::new(
                    ProgressKey::new(student_id, chapter_id),
                    chapter.course_id(),
                    self.clock.now(),
                )
            });

        Ok(ChapterProgressView {
            progress_percent: policy::progress_percent(&chapter, &progress),
            can_generate_quiz: can_generate_quiz(Some(&progress)),
            next_chapter: policy::next_chapter(&chapters, &chapter).map(ChapterRef::from),
            previous_chapter: policy::previous_chapter(&chapters, &chapter).map(ChapterRef::from),
            unmet_prerequisites: policy::unmet_prerequisites(&chapter, &chapters, &completed),
            chapter,
            progress,
        })
    }

    /// The student's progress across every published chapter of a course.
    ///
    /// # Errors
    ///
    /// Returns `ProgressServiceError::Storage` if repository access fails.
    pub async fn course_progress(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<CourseProgressView, ProgressServiceError> {
        let chapters = self.chapters.list_chapters(course_id).await?;
        let mut records = self
            .progress
            .list_student_progress(student_id, course_id)
            .await?;
        let now = self.clock.now();

        let mut summaries = Vec::new();
        for chapter in chapters.iter().filter(|c| c.is_published()) {
            let progress = match records.iter().position(|r| r.chapter_id() == chapter.id()) {
                Some(idx) => records.swap_remove(idx),
                None => ReadingProgress::new(
                    ProgressKey::new(student_id, chapter.id()),
                    course_id,
                    now,
                ),
            };
            summaries.push(ChapterProgressSummary {
                chapter: ChapterRef::from(chapter),
                progress_percent: policy::progress_percent(chapter, &progress),
                progress,
            });
        }

        let total_chapters = summaries.len() as u64;
        let completed_chapters = summaries
            .iter()
            .filter(|s| s.progress.is_completed())
            .count() as u64;

        Ok(CourseProgressView {
            course_id,
            student_id,
            chapters: summaries,
            completed_chapters,
            total_chapters,
            completion_rate: completion_rate(completed_chapters, total_chapters),
        })
    }

    async fn visible_chapter(&self, id: ChapterId) -> Result<Chapter, ProgressServiceError> {
        self.chapters
            .get_chapter(id)
            .await?
            .filter(Chapter::is_published)
            .ok_or(ProgressServiceError::ChapterNotFound(id))
    }

    async fn progress_or_default(
        &self,
        chapter: &Chapter,
        student_id: StudentId,
    ) -> Result<ReadingProgress, ProgressServiceError> {
        let key = ProgressKey::new(student_id, chapter.id());
        Ok(self
            .progress
            .get_progress(key)
            .await?
            .unwrap_or_else(|| ReadingProgress::new(key, chapter.course_id(), self.clock.now())))
    }

    /// Flip the record to completed when the predicate holds on `record`.
    async fn settle_completion(
        &self,
        chapter: &Chapter,
        record: ReadingProgress,
        now: DateTime<Utc>,
    ) -> Result<ReadingProgress, ProgressServiceError> {
        if record.is_completed() || !policy::completion_satisfied(chapter, &record) {
            return Ok(record);
        }

        let record = self.progress.mark_completed(record.key(), now).await?;
        tracing::info!(
            student_id = %record.student_id(),
            chapter_id = %record.chapter_id(),
            "chapter completed"
        );
        Ok(record)
    }
}

/// A chapter deleted between the lookup and the upsert surfaces as `NotFound`.
fn upsert_error(e: StorageError, chapter_id: ChapterId) -> ProgressServiceError {
    match e {
        StorageError::NotFound => ProgressServiceError::ChapterNotFound(chapter_id),
        other => other.into(),
    }
}

fn ensure_section(chapter: &Chapter, section: &SectionId) -> Result<(), ProgressServiceError> {
    if chapter.has_section(section) {
        Ok(())
    } else {
        Err(ProgressServiceError::SectionNotFound {
            chapter_id: chapter.id(),
            section_id: section.clone(),
        })
    }
}
