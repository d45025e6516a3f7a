use std::sync::Arc;

use course_core::model::{Chapter, ChapterDraft, ChapterId, CourseId, SectionDraft};
use course_core::policy::{self, ChapterOutline};
use storage::repository::{ChapterRepository, StorageError};

use crate::Clock;
use crate::error::ChapterServiceError;

/// Instructor-side chapter management and student-facing chapter ordering.
#[derive(Clone)]
pub struct ChapterService {
    clock: Clock,
    chapters: Arc<dyn ChapterRepository>,
}

impl ChapterService {
    #[must_use]
    pub fn new(clock: Clock, chapters: Arc<dyn ChapterRepository>) -> Self {
        Self { clock, chapters }
    }

    /// Validate and persist a new chapter.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::DuplicateChapter` if the course already has the number.
    /// Returns `ChapterServiceError::UnknownPrerequisite` for a prerequisite outside the course.
    /// Returns `ChapterServiceError::Chapter` for validation failures.
    pub async fn create_chapter(&self, draft: ChapterDraft) -> Result<Chapter, ChapterServiceError> {
        let chapter = draft.validate(self.clock.now())?;
        self.check_prerequisites(chapter.course_id(), chapter.prerequisites().iter().copied())
            .await?;

        let id = self
            .chapters
            .insert_chapter(&chapter)
            .await
            .map_err(|e| match e {
                StorageError::Conflict => ChapterServiceError::DuplicateChapter {
                    course_id: chapter.course_id(),
                    chapter_number: chapter.chapter_number(),
                },
                other => other.into(),
            })?;

        tracing::info!(
            chapter_id = %id,
            course_id = %chapter.course_id(),
            chapter_number = chapter.chapter_number(),
            "chapter created"
        );
        Ok(chapter.assign_id(id))
    }

    /// Replace the section list. Estimated time and version are recomputed.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::ChapterNotFound` if the chapter does not exist.
    /// Returns `ChapterServiceError::Chapter` if a section is invalid.
    /// Returns `ChapterServiceError::Storage` with `Conflict` if the chapter was edited concurrently.
    pub async fn replace_sections(
        &self,
        id: ChapterId,
        sections: Vec<SectionDraft>,
    ) -> Result<Chapter, ChapterServiceError> {
        let mut chapter = self.load(id).await?;
        let expected = chapter.revision();
        chapter.replace_sections(sections, self.clock.now())?;
        self.save(&chapter, expected).await?;

        tracing::debug!(
            chapter_id = %id,
            version = chapter.version(),
            total_minutes = chapter.total_estimated_minutes(),
            "chapter sections replaced"
        );
        Ok(chapter)
    }

    /// # Errors
    ///
    /// Returns `ChapterServiceError::ChapterNotFound` if the chapter does not exist.
    /// Returns `ChapterServiceError::Chapter` if the title is blank.
    pub async fn rename_chapter(
        &self,
        id: ChapterId,
        title: String,
        description: Option<String>,
    ) -> Result<Chapter, ChapterServiceError> {
        let mut chapter = self.load(id).await?;
        let expected = chapter.revision();
        chapter.rename(title, description, self.clock.now())?;
        self.save(&chapter, expected).await?;
        Ok(chapter)
    }

    /// Replace the prerequisite set. Every id must be another chapter of the same course.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::UnknownPrerequisite` for ids outside the course.
    /// Returns `ChapterServiceError::Chapter` if the chapter lists itself.
    pub async fn replace_prerequisites(
        &self,
        id: ChapterId,
        prerequisites: Vec<ChapterId>,
    ) -> Result<Chapter, ChapterServiceError> {
        let mut chapter = self.load(id).await?;
        let expected = chapter.revision();
        chapter.replace_prerequisites(prerequisites, self.clock.now())?;
        self.check_prerequisites(chapter.course_id(), chapter.prerequisites().iter().copied())
            .await?;
        self.save(&chapter, expected).await?;
        Ok(chapter)
    }

    /// Show or hide a chapter from students.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::ChapterNotFound` if the chapter does not exist.
    pub async fn set_published(
        &self,
        id: ChapterId,
        published: bool,
    ) -> Result<Chapter, ChapterServiceError> {
        let mut chapter = self.load(id).await?;
        let expected = chapter.revision();
        chapter.set_published(published, self.clock.now());
        self.save(&chapter, expected).await?;

        tracing::info!(chapter_id = %id, published, "chapter visibility changed");
        Ok(chapter)
    }

    /// Delete a chapter no student has interacted with.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::ChapterInUse` if any progress record references it.
    /// Returns `ChapterServiceError::ChapterNotFound` if the chapter does not exist.
    pub async fn delete_chapter(&self, id: ChapterId) -> Result<(), ChapterServiceError> {
        self.chapters.delete_chapter(id).await.map_err(|e| match e {
            StorageError::NotFound => ChapterServiceError::ChapterNotFound(id),
            StorageError::Conflict => ChapterServiceError::ChapterInUse(id),
            other => other.into(),
        })?;
        tracing::info!(chapter_id = %id, "chapter deleted");
        Ok(())
    }

    /// Fetch a chapter by ID, published or not.
    ///
    /// Returns `Ok(None)` when the chapter does not exist.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::Storage` if repository access fails.
    pub async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, ChapterServiceError> {
        Ok(self.chapters.get_chapter(id).await?)
    }

    /// Every chapter of the course, drafts included, ascending by number.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::Storage` if repository access fails.
    pub async fn list_chapters(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<Chapter>, ChapterServiceError> {
        Ok(self.chapters.list_chapters(course_id).await?)
    }

    /// Published chapters with their prerequisites resolved, ascending by number.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::Storage` if repository access fails.
    pub async fn progressive_order(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<ChapterOutline>, ChapterServiceError> {
        let chapters = self.chapters.list_chapters(course_id).await?;
        Ok(policy::progressive_order(&chapters))
    }

    /// The following published chapter, or `None` at the end of the course.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::ChapterNotFound` if `id` does not exist.
    pub async fn next_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, ChapterServiceError> {
        let current = self.load(id).await?;
        let chapters = self.chapters.list_chapters(current.course_id()).await?;
        Ok(policy::next_chapter(&chapters, &current).cloned())
    }

    /// The preceding published chapter, or `None` at the start of the course.
    ///
    /// # Errors
    ///
    /// Returns `ChapterServiceError::ChapterNotFound` if `id` does not exist.
    pub async fn previous_chapter(
        &self,
        id: ChapterId,
    ) -> Result<Option<Chapter>, ChapterServiceError> {
        let current = self.load(id).await?;
        let chapters = self.chapters.list_chapters(current.course_id()).await?;
        Ok(policy::previous_chapter(&chapters, &current).cloned())
    }

    async fn load(&self, id: ChapterId) -> Result<Chapter, ChapterServiceError> {
        self.chapters
            .get_chapter(id)
            .await?
            .ok_or(ChapterServiceError::ChapterNotFound(id))
    }

    async fn save(&self, chapter: &Chapter, expected_revision: u32) -> Result<(), ChapterServiceError> {
        self.chapters
            .update_chapter(chapter, expected_revision)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => ChapterServiceError::ChapterNotFound(chapter.id()),
                other => other.into(),
            })
    }

    async fn check_prerequisites(
        &self,
        course_id: CourseId,
        prerequisites: impl Iterator<Item = ChapterId>,
    ) -> Result<(), ChapterServiceError> {
        for prerequisite in prerequisites {
            let known = self
                .chapters
                .get_chapter(prerequisite)
                .await?
                .is_some_and(|c| c.course_id() == course_id);
            if !known {
                return Err(ChapterServiceError::UnknownPrerequisite(prerequisite));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use course_core::time::fixed_now;
    use storage::repository::{ChapterLookup, InMemoryRepository};

    fn service() -> ChapterService {
        ChapterService::new(Clock::fixed(fixed_now()), Arc::new(InMemoryRepository::new()))
    }

    fn draft(course: u64, number: u32) -> ChapterDraft {
        ChapterDraft::new(CourseId::new(course), number, format!("Chapter {number}"))
            .with_sections(vec![
                SectionDraft::text("s1", true, 5),
                SectionDraft::text("s2", false, 7),
            ])
    }

    #[tokio::test]
    async fn duplicate_number_is_rejected() {
        let service = service();
        service.create_chapter(draft(1, 1)).await.unwrap();

        let err = service.create_chapter(draft(1, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            ChapterServiceError::DuplicateChapter {
                chapter_number: 1,
                ..
            }
        ));

        // Same number in another course is fine.
        service.create_chapter(draft(2, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn replacing_sections_recomputes_total_and_version() {
        let service = service();
        let chapter = service.create_chapter(draft(1, 1)).await.unwrap();
        assert_eq!(chapter.total_estimated_minutes(), 12);
        assert_eq!(chapter.version(), 1);

        let updated = service
            .replace_sections(chapter.id(), vec![SectionDraft::text("only", true, 3)])
            .await
            .unwrap();
        assert_eq!(updated.total_estimated_minutes(), 3);
        assert_eq!(updated.version(), 2);

        let stored = service.get_chapter(chapter.id()).await.unwrap().unwrap();
        assert_eq!(stored.version(), 2);
    }

    #[tokio::test]
    async fn prerequisites_must_be_in_the_same_course() {
        let service = service();
        let first = service.create_chapter(draft(1, 1)).await.unwrap();
        let second = service.create_chapter(draft(1, 2)).await.unwrap();
        let foreign = service.create_chapter(draft(2, 1)).await.unwrap();

        let err = service
            .replace_prerequisites(second.id(), vec![foreign.id()])
            .await
            .unwrap_err();
        assert!(matches!(err, ChapterServiceError::UnknownPrerequisite(id) if id == foreign.id()));

        let err = service
            .replace_prerequisites(second.id(), vec![second.id()])
            .await
            .unwrap_err();
        assert!(matches!(err, ChapterServiceError::Chapter(_)));

        let updated = service
            .replace_prerequisites(second.id(), vec![first.id()])
            .await
            .unwrap();
        assert!(updated.prerequisites().contains(&first.id()));
    }

    #[tokio::test]
    async fn progressive_order_skips_drafts_and_resolves_prerequisites() {
        let service = service();
        let first = service
            .create_chapter(draft(1, 1).published())
            .await
            .unwrap();
        service.create_chapter(draft(1, 2)).await.unwrap();
        service
            .create_chapter(
                draft(1, 3)
                    .with_prerequisites(vec![first.id()])
                    .published(),
            )
            .await
            .unwrap();

        let outline = service.progressive_order(CourseId::new(1)).await.unwrap();
        let numbers: Vec<u32> = outline.iter().map(|o| o.chapter.chapter_number()).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(outline[1].prerequisites[0].id, first.id());

        assert_eq!(service.list_chapters(CourseId::new(1)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn sequencing_returns_none_at_the_edges() {
        let service = service();
        let first = service
            .create_chapter(draft(1, 1).published())
            .await
            .unwrap();
        let last = service
            .create_chapter(draft(1, 4).published())
            .await
            .unwrap();

        let next = service.next_chapter(first.id()).await.unwrap().unwrap();
        assert_eq!(next.id(), last.id());
        assert!(service.next_chapter(last.id()).await.unwrap().is_none());
        assert!(service.previous_chapter(first.id()).await.unwrap().is_none());

        let err = service.next_chapter(ChapterId::new(99)).await.unwrap_err();
        assert!(matches!(err, ChapterServiceError::ChapterNotFound(_)));
    }

    #[tokio::test]
    async fn publish_toggle_persists() {
        let service = service();
        let chapter = service.create_chapter(draft(1, 1)).await.unwrap();
        assert!(!chapter.is_published());

        service.set_published(chapter.id(), true).await.unwrap();
        let stored = service.get_chapter(chapter.id()).await.unwrap().unwrap();
        assert!(stored.is_published());
    }

    #[tokio::test]
    async fn edit_from_a_stale_copy_is_rejected() {
        let repo = InMemoryRepository::new();
        let service = ChapterService::new(Clock::fixed(fixed_now()), Arc::new(repo.clone()));
        let created = service.create_chapter(draft(1, 1)).await.unwrap();

        let mut renamed = repo.get_chapter(created.id()).await.unwrap().unwrap();
        let mut published = renamed.clone();
        let base = renamed.revision();

        renamed.rename("Renamed".into(), None, fixed_now()).unwrap();
        repo.update_chapter(&renamed, base).await.unwrap();

        published.set_published(true, fixed_now());
        let err = repo.update_chapter(&published, base).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict));

        let stored = service.get_chapter(created.id()).await.unwrap().unwrap();
        assert_eq!(stored.title(), "Renamed");
        assert!(!stored.is_published());

        // Edits that reload first keep both changes.
        service.set_published(created.id(), true).await.unwrap();
        let stored = service.get_chapter(created.id()).await.unwrap().unwrap();
        assert_eq!(stored.title(), "Renamed");
        assert!(stored.is_published());
        assert_eq!(stored.version(), 1);
    }

    #[tokio::test]
    async fn deleting_missing_chapter_reports_not_found() {
        let service = service();
        let err = service.delete_chapter(ChapterId::new(5)).await.unwrap_err();
        assert!(matches!(err, ChapterServiceError::ChapterNotFound(_)));
    }
}
