use std::sync::Arc;

use storage::repository::Storage;

use crate::Clock;
use crate::chapter_service::ChapterService;
use crate::error::AppServicesError;
use crate::progress_service::ProgressTracker;
use crate::quiz_gate::{QuizGate, QuizGenerator};
use crate::stats_service::StatsService;

/// Assembles every service over one storage backend.
#[derive(Clone)]
pub struct AppServices {
    chapters: Arc<ChapterService>,
    progress: Arc<ProgressTracker>,
    quiz: Arc<QuizGate>,
    stats: Arc<StatsService>,
}

impl AppServices {
    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if connecting or migrating fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        generator: Arc<dyn QuizGenerator>,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::from_storage(&storage, clock, generator))
    }

    /// Build services over the in-memory backend.
    #[must_use]
    pub fn in_memory(clock: Clock, generator: Arc<dyn QuizGenerator>) -> Self {
        Self::from_storage(&Storage::in_memory(), clock, generator)
    }

    #[must_use]
    pub fn from_storage(storage: &Storage, clock: Clock, generator: Arc<dyn QuizGenerator>) -> Self {
        let chapters = Arc::new(ChapterService::new(clock, Arc::clone(&storage.chapters)));
        let progress = Arc::new(ProgressTracker::new(
            clock,
            Arc::clone(&storage.chapter_lookup),
            Arc::clone(&storage.progress),
        ));
        let quiz = Arc::new(QuizGate::new(
            clock,
            Arc::clone(&storage.chapter_lookup),
            Arc::clone(&storage.progress),
            generator,
        ));
        let stats = Arc::new(StatsService::new(
            Arc::clone(&storage.chapter_lookup),
            Arc::clone(&storage.progress),
        ));

        Self {
            chapters,
            progress,
            quiz,
            stats,
        }
    }

    #[must_use]
    pub fn chapters(&self) -> Arc<ChapterService> {
        Arc::clone(&self.chapters)
    }

    #[must_use]
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    #[must_use]
    pub fn quiz(&self) -> Arc<QuizGate> {
        Arc::clone(&self.quiz)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<StatsService> {
        Arc::clone(&self.stats)
    }
}
