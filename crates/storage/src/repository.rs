use async_trait::async_trait;
use chrono::{DateTime, Utc};
use course_core::model::{
    Bookmark, Chapter, ChapterId, CourseId, ProgressId, ProgressKey, QuizScore, ReadingProgress,
    SectionId, StudentId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── CHAPTERS ──────────────────────────────────────────────────────────────────
//

/// Read-only view of chapters, handed to components that must not edit them.
#[async_trait]
pub trait ChapterLookup: Send + Sync {
    /// Fetch a chapter by ID. Returns `Ok(None)` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, StorageError>;

    /// All chapters of a course, drafts included, ascending by chapter number.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn list_chapters(&self, course_id: CourseId) -> Result<Vec<Chapter>, StorageError>;
}

#[async_trait]
pub trait ChapterRepository: ChapterLookup {
    /// Persist a new chapter and return its issued ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the course already has that chapter number.
    async fn insert_chapter(&self, chapter: &Chapter) -> Result<ChapterId, StorageError>;

    /// Overwrite a chapter if its stored revision still equals `expected_revision`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, `StorageError::Conflict` on a stale revision.
    async fn update_chapter(
        &self,
        chapter: &Chapter,
        expected_revision: u32,
    ) -> Result<(), StorageError>;

    /// Delete a chapter that no progress record references.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, `StorageError::Conflict` if referenced.
    async fn delete_chapter(&self, id: ChapterId) -> Result<(), StorageError>;
}

//
// ─── PROGRESS ──────────────────────────────────────────────────────────────────
//

/// Per-record atomic commands over reading progress.
///
/// Every method that may create a record does so by unique-key upsert on
/// `(student_id, chapter_id)`; none of them read-then-overwrite the record.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn get_progress(&self, key: ProgressKey)
    -> Result<Option<ReadingProgress>, StorageError>;

    /// Upsert the record, set the current section, and ratchet time spent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the chapter does not exist.
    async fn record_visit(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: Option<&SectionId>,
        time_spent_minutes: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError>;

    /// Upsert the record and union `section` into its completed set.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the chapter does not exist.
    async fn add_completed_section(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: &SectionId,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError>;

    /// Set the completed flag if it is not already set.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if there is no record.
    async fn mark_completed(
        &self,
        key: ProgressKey,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError>;

    /// Upsert the record and replace-or-create the bookmark for `section`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the chapter does not exist.
    async fn upsert_bookmark(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: &SectionId,
        bookmark: &Bookmark,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError>;

    /// Delete the bookmark if present. Missing record or bookmark is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn remove_bookmark(
        &self,
        key: ProgressKey,
        section: &SectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if there is no record.
    async fn mark_quiz_generated(
        &self,
        key: ProgressKey,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if there is no record.
    async fn record_quiz_score(
        &self,
        key: ProgressKey,
        score: QuizScore,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError>;

    /// Every record of a course, for statistics.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn list_course_progress(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<ReadingProgress>, StorageError>;

    /// One student's records within a course.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn list_student_progress(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Vec<ReadingProgress>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn count_chapter_progress(&self, chapter_id: ChapterId) -> Result<u64, StorageError>;
}

//
// ─── IN-MEMORY BACKEND ─────────────────────────────────────────────────────────
//

#[derive(Default)]
struct ChapterTable {
    next_id: u64,
    rows: HashMap<ChapterId, Chapter>,
}

#[derive(Default)]
struct ProgressTable {
    next_id: u64,
    rows: HashMap<ProgressKey, ReadingProgress>,
}

/// In-memory repository for tests and prototyping.
///
/// Each command runs under a single lock acquisition. When both tables are
/// needed, the chapter lock is taken first.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    chapters: Arc<Mutex<ChapterTable>>,
    progress: Arc<Mutex<ProgressTable>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    m.lock().map_err(|e| StorageError::Connection(e.to_string()))
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert_progress(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        at: DateTime<Utc>,
        apply: impl FnOnce(&mut ReadingProgress),
    ) -> Result<ReadingProgress, StorageError> {
        // Held until the upsert is done so a concurrent delete cannot orphan the record.
        let chapters = lock(&self.chapters)?;
        if !chapters.rows.contains_key(&key.chapter_id) {
            return Err(StorageError::NotFound);
        }
        let mut guard = lock(&self.progress)?;
        let ProgressTable { next_id, rows } = &mut *guard;
        let record = rows.entry(key).or_insert_with(|| {
            *next_id += 1;
            ReadingProgress::new(key, course_id, at).assign_id(ProgressId::new(*next_id))
        });
        apply(record);
        Ok(record.clone())
    }

    fn update_existing(
        &self,
        key: ProgressKey,
        apply: impl FnOnce(&mut ReadingProgress),
    ) -> Result<ReadingProgress, StorageError> {
        let mut guard = lock(&self.progress)?;
        let record = guard.rows.get_mut(&key).ok_or(StorageError::NotFound)?;
        apply(record);
        Ok(record.clone())
    }
}

#[async_trait]
impl ChapterLookup for InMemoryRepository {
    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, StorageError> {
        Ok(lock(&self.chapters)?.rows.get(&id).cloned())
    }

    async fn list_chapters(&self, course_id: CourseId) -> Result<Vec<Chapter>, StorageError> {
        let guard = lock(&self.chapters)?;
        let mut chapters: Vec<Chapter> = guard
            .rows
            .values()
            .filter(|c| c.course_id() == course_id)
            .cloned()
            .collect();
        chapters.sort_by_key(Chapter::chapter_number);
        Ok(chapters)
    }
}

#[async_trait]
impl ChapterRepository for InMemoryRepository {
    async fn insert_chapter(&self, chapter: &Chapter) -> Result<ChapterId, StorageError> {
        let mut guard = lock(&self.chapters)?;
        let taken = guard.rows.values().any(|c| {
            c.course_id() == chapter.course_id() && c.chapter_number() == chapter.chapter_number()
        });
        if taken {
            return Err(StorageError::Conflict);
        }
        guard.next_id += 1;
        let id = ChapterId::new(guard.next_id);
        guard.rows.insert(id, chapter.clone().assign_id(id));
        Ok(id)
    }

    async fn update_chapter(
        &self,
        chapter: &Chapter,
        expected_revision: u32,
    ) -> Result<(), StorageError> {
        let mut guard = lock(&self.chapters)?;
        let stored = guard
            .rows
            .get_mut(&chapter.id())
            .ok_or(StorageError::NotFound)?;
        if stored.revision() != expected_revision {
            return Err(StorageError::Conflict);
        }
        *stored = chapter.clone();
        Ok(())
    }

    async fn delete_chapter(&self, id: ChapterId) -> Result<(), StorageError> {
        let mut chapters = lock(&self.chapters)?;
        if !chapters.rows.contains_key(&id) {
            return Err(StorageError::NotFound);
        }
        let referenced = lock(&self.progress)?
            .rows
            .keys()
            .any(|k| k.chapter_id == id);
        if referenced {
            return Err(StorageError::Conflict);
        }
        chapters.rows.remove(&id);

        // Drop the deleted chapter from other chapters' prerequisite sets.
        for other in chapters.rows.values_mut() {
            if other.prerequisites().contains(&id) {
                let kept: Vec<ChapterId> = other
                    .prerequisites()
                    .iter()
                    .copied()
                    .filter(|p| *p != id)
                    .collect();
                let at = other.updated_at();
                other
                    .replace_prerequisites(kept, at)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressRepository for InMemoryRepository {
    async fn get_progress(
        &self,
        key: ProgressKey,
    ) -> Result<Option<ReadingProgress>, StorageError> {
        Ok(lock(&self.progress)?.rows.get(&key).cloned())
    }

    async fn record_visit(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: Option<&SectionId>,
        time_spent_minutes: Option<u32>,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        self.upsert_progress(key, course_id, at, |p| {
            p.record_visit(section.cloned(), time_spent_minutes, at);
        })
    }

    async fn add_completed_section(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: &SectionId,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        self.upsert_progress(key, course_id, at, |p| {
            p.complete_section(section.clone(), at);
        })
    }

    async fn mark_completed(
        &self,
        key: ProgressKey,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        self.update_existing(key, |p| {
            p.mark_completed(at);
        })
    }

    async fn upsert_bookmark(
        &self,
        key: ProgressKey,
        course_id: CourseId,
        section: &SectionId,
        bookmark: &Bookmark,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        self.upsert_progress(key, course_id, at, |p| {
            p.set_bookmark(section.clone(), bookmark.clone(), at);
        })
    }

    async fn remove_bookmark(
        &self,
        key: ProgressKey,
        section: &SectionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut guard = lock(&self.progress)?;
        if let Some(record) = guard.rows.get_mut(&key) {
            record.remove_bookmark(section, at);
        }
        Ok(())
    }

    async fn mark_quiz_generated(
        &self,
        key: ProgressKey,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        self.update_existing(key, |p| p.mark_quiz_generated(at))
    }

    async fn record_quiz_score(
        &self,
        key: ProgressKey,
        score: QuizScore,
        at: DateTime<Utc>,
    ) -> Result<ReadingProgress, StorageError> {
        self.update_existing(key, |p| p.record_quiz_score(score, at))
    }

    async fn list_course_progress(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<ReadingProgress>, StorageError> {
        let guard = lock(&self.progress)?;
        let mut records: Vec<ReadingProgress> = guard
            .rows
            .values()
            .filter(|p| p.course_id() == course_id)
            .cloned()
            .collect();
        records.sort_by_key(ReadingProgress::id);
        Ok(records)
    }

    async fn list_student_progress(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Vec<ReadingProgress>, StorageError> {
        let guard = lock(&self.progress)?;
        let mut records: Vec<ReadingProgress> = guard
            .rows
            .values()
            .filter(|p| p.course_id() == course_id && p.student_id() == student_id)
            .cloned()
            .collect();
        records.sort_by_key(ReadingProgress::id);
        Ok(records)
    }

    async fn count_chapter_progress(&self, chapter_id: ChapterId) -> Result<u64, StorageError> {
        let guard = lock(&self.progress)?;
        Ok(guard
            .rows
            .keys()
            .filter(|k| k.chapter_id == chapter_id)
            .count() as u64)
    }
}

//
// ─── AGGREGATE ─────────────────────────────────────────────────────────────────
//

/// Repositories behind trait objects so backends can be swapped.
///
/// `chapter_lookup` and `chapters` point at the same backend; the lookup is
/// what read-only consumers receive.
#[derive(Clone)]
pub struct Storage {
    pub chapters: Arc<dyn ChapterRepository>,
    pub chapter_lookup: Arc<dyn ChapterLookup>,
    pub progress: Arc<dyn ProgressRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        Self {
            chapters: Arc::new(repo.clone()),
            chapter_lookup: Arc::new(repo.clone()),
            progress: Arc::new(repo),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use course_core::model::{ChapterDraft, SectionDraft};
    use course_core::time::fixed_now;

    fn draft(number: u32) -> Chapter {
        ChapterDraft::new(CourseId::new(1), number, format!("Chapter {number}"))
            .with_sections(vec![SectionDraft::text("s1", true, 5)])
            .validate(fixed_now())
            .unwrap()
    }

    fn key(student: u64, chapter: ChapterId) -> ProgressKey {
        ProgressKey::new(StudentId::new(student), chapter)
    }

    #[tokio::test]
    async fn duplicate_chapter_number_conflicts() {
        let repo = InMemoryRepository::new();
        repo.insert_chapter(&draft(1)).await.unwrap();
        let err = repo.insert_chapter(&draft(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict));
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let repo = InMemoryRepository::new();
        let id = repo.insert_chapter(&draft(1)).await.unwrap();
        let mut chapter = repo.get_chapter(id).await.unwrap().unwrap();
        chapter
            .replace_sections(vec![SectionDraft::text("x", true, 1)], fixed_now())
            .unwrap();
        repo.update_chapter(&chapter, 1).await.unwrap();

        let err = repo.update_chapter(&chapter, 1).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict));
    }

    #[tokio::test]
    async fn upsert_creates_one_record_per_key() {
        let repo = InMemoryRepository::new();
        let id = repo.insert_chapter(&draft(1)).await.unwrap();
        let k = key(1, id);

        let a = repo
            .record_visit(k, CourseId::new(1), None, Some(3), fixed_now())
            .await
            .unwrap();
        let b = repo
            .add_completed_section(k, CourseId::new(1), &"s1".into(), fixed_now())
            .await
            .unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(repo.list_course_progress(CourseId::new(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_is_blocked_by_progress() {
        let repo = InMemoryRepository::new();
        let id = repo.insert_chapter(&draft(1)).await.unwrap();
        repo.record_visit(key(1, id), CourseId::new(1), None, None, fixed_now())
            .await
            .unwrap();

        let err = repo.delete_chapter(id).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict));
        assert_eq!(repo.count_chapter_progress(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_strips_prerequisite_edges() {
        let repo = InMemoryRepository::new();
        let first = repo.insert_chapter(&draft(1)).await.unwrap();
        let second_id = repo.insert_chapter(&draft(2)).await.unwrap();
        let mut stored = repo.get_chapter(second_id).await.unwrap().unwrap();
        stored.replace_prerequisites([first], fixed_now()).unwrap();
        repo.update_chapter(&stored, 1).await.unwrap();

        repo.delete_chapter(first).await.unwrap();
        let stored = repo.get_chapter(second_id).await.unwrap().unwrap();
        assert!(stored.prerequisites().is_empty());
    }

    #[tokio::test]
    async fn upserts_require_an_existing_chapter() {
        let repo = InMemoryRepository::new();
        let k = key(1, ChapterId::new(42));
        let err = repo
            .add_completed_section(k, CourseId::new(1), &"s1".into(), fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));

        let id = repo.insert_chapter(&draft(1)).await.unwrap();
        repo.delete_chapter(id).await.unwrap();
        let err = repo
            .record_visit(key(1, id), CourseId::new(1), None, Some(2), fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
        assert_eq!(repo.count_chapter_progress(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commands_on_missing_records_report_not_found() {
        let repo = InMemoryRepository::new();
        let k = key(1, ChapterId::new(5));
        assert!(matches!(
            repo.mark_quiz_generated(k, fixed_now()).await.unwrap_err(),
            StorageError::NotFound
        ));
        repo.remove_bookmark(k, &"s1".into(), fixed_now())
            .await
            .unwrap();
        assert!(repo.get_progress(k).await.unwrap().is_none());
    }
}
