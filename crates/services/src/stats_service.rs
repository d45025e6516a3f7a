use std::sync::Arc;

use course_core::model::CourseId;
use course_core::stats::CourseStats;
use storage::repository::{ChapterLookup, ProgressRepository};

use crate::error::StatsError;

/// Instructor statistics, computed on demand from stored progress.
///
/// Reads only; a concurrent progress write may or may not be reflected.
#[derive(Clone)]
pub struct StatsService {
    chapters: Arc<dyn ChapterLookup>,
    progress: Arc<dyn ProgressRepository>,
}

impl StatsService {
    #[must_use]
    pub fn new(chapters: Arc<dyn ChapterLookup>, progress: Arc<dyn ProgressRepository>) -> Self {
        Self { chapters, progress }
    }

    /// Course totals plus a per-chapter breakdown ordered by chapter number.
    ///
    /// # Errors
    ///
    /// Returns `StatsError::Storage` if repository access fails.
    pub async fn course_stats(&self, course_id: CourseId) -> Result<CourseStats, StatsError> {
        let chapters = self.chapters.list_chapters(course_id).await?;
        let records = self.progress.list_course_progress(course_id).await?;
        let stats = CourseStats::compute(course_id, &chapters, &records);

        tracing::debug!(
            %course_id,
            records = records.len(),
            completion_rate = stats.completion_rate,
            "course stats computed"
        );
        Ok(stats)
    }
}
