use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use course_core::model::{Chapter, ChapterId, ProgressKey, QuizScore, ReadingProgress, StudentId};
use course_core::quiz::{self, QuizParams, QuizQuestion};
use storage::repository::{ChapterLookup, ProgressRepository};

use crate::Clock;
use crate::error::{QuizGateError, QuizGenerationError};

/// What the content service receives for one quiz.
#[derive(Debug, Clone, Serialize)]
pub struct QuizRequest {
    pub chapter_id: ChapterId,
    pub chapter_title: String,
    /// Concatenated section text of the chapter.
    pub notes: String,
    pub params: QuizParams,
}

/// External content service that writes quiz questions.
#[async_trait]
pub trait QuizGenerator: Send + Sync {
    /// Return the service's raw answer: a JSON array of questions.
    ///
    /// # Errors
    ///
    /// Returns `QuizGenerationError::Service` when the service call fails.
    async fn generate(&self, request: &QuizRequest) -> Result<String, QuizGenerationError>;
}

/// Stand-in used when no content service is wired up; every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredQuizGenerator;

#[async_trait]
impl QuizGenerator for UnconfiguredQuizGenerator {
    async fn generate(&self, _request: &QuizRequest) -> Result<String, QuizGenerationError> {
        Err(QuizGenerationError::Service(
            "quiz generation is not configured".to_owned(),
        ))
    }
}

/// Parse a JSON array of questions, keeping at most `limit`.
///
/// # Errors
///
/// Returns `QuizGenerationError::Malformed` for invalid JSON and
/// `QuizGenerationError::Empty` for an empty array.
pub fn parse_questions(raw: &str, limit: u8) -> Result<Vec<QuizQuestion>, QuizGenerationError> {
    let mut questions: Vec<QuizQuestion> = serde_json::from_str(raw.trim())?;
    if questions.is_empty() {
        return Err(QuizGenerationError::Empty);
    }
    questions.truncate(usize::from(limit));
    Ok(questions)
}

/// Allows quiz generation only for chapters the student has completed.
#[derive(Clone)]
pub struct QuizGate {
    clock: Clock,
    chapters: Arc<dyn ChapterLookup>,
    progress: Arc<dyn ProgressRepository>,
    generator: Arc<dyn QuizGenerator>,
}

impl QuizGate {
    #[must_use]
    pub fn new(
        clock: Clock,
        chapters: Arc<dyn ChapterLookup>,
        progress: Arc<dyn ProgressRepository>,
        generator: Arc<dyn QuizGenerator>,
    ) -> Self {
        Self {
            clock,
            chapters,
            progress,
            generator,
        }
    }

    /// Whether the student has a completed record for the chapter.
    ///
    /// # Errors
    ///
    /// Returns `QuizGateError::ChapterNotFound` for missing or unpublished chapters.
    pub async fn can_generate_quiz(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
    ) -> Result<bool, QuizGateError> {
        self.visible_chapter(chapter_id).await?;
        let record = self
            .progress
            .get_progress(ProgressKey::new(student_id, chapter_id))
            .await?;
        Ok(quiz::can_generate_quiz(record.as_ref()))
    }

    /// Generate a quiz for a completed chapter and stamp `quiz_generated`.
    ///
    /// Repeated requests after completion succeed again; the flag stays set.
    ///
    /// # Errors
    ///
    /// Returns `QuizGateError::PrerequisiteNotMet` if the chapter is not completed.
    /// Returns `QuizGateError::Generation` if the content service fails or answers badly.
    pub async fn generate_quiz(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
        params: QuizParams,
    ) -> Result<Vec<QuizQuestion>, QuizGateError> {
        let chapter = self.visible_chapter(chapter_id).await?;
        let key = ProgressKey::new(student_id, chapter_id);
        let record = self.progress.get_progress(key).await?;

        if !quiz::can_generate_quiz(record.as_ref()) {
            tracing::warn!(%student_id, %chapter_id, "quiz requested before chapter completion");
            return Err(QuizGateError::PrerequisiteNotMet(format!(
                "Finish reading chapter {} (\"{}\") before generating a quiz.",
                chapter.chapter_number(),
                chapter.title()
            )));
        }

        let request = QuizRequest {
            chapter_id,
            chapter_title: chapter.title().to_owned(),
            notes: chapter.reading_text(),
            params,
        };
        let raw = self.generator.generate(&request).await?;
        let questions = parse_questions(&raw, params.question_count())?;

        self.progress.mark_quiz_generated(key, self.clock.now()).await?;
        tracing::info!(
            %student_id,
            %chapter_id,
            questions = questions.len(),
            difficulty = params.difficulty().as_str(),
            "quiz generated"
        );
        Ok(questions)
    }

    /// Store the student's score for a generated quiz.
    ///
    /// # Errors
    ///
    /// Returns `QuizGateError::Score` for a score above 100.
    /// Returns `QuizGateError::PrerequisiteNotMet` if no quiz was generated yet.
    pub async fn record_quiz_score(
        &self,
        student_id: StudentId,
        chapter_id: ChapterId,
        score: u32,
    ) -> Result<ReadingProgress, QuizGateError> {
        let score = QuizScore::new(score)?;
        let chapter = self.visible_chapter(chapter_id).await?;
        let key = ProgressKey::new(student_id, chapter_id);

        let generated = self
            .progress
            .get_progress(key)
            .await?
            .is_some_and(|r| r.quiz_generated());
        if !generated {
            return Err(QuizGateError::PrerequisiteNotMet(format!(
                "No quiz has been generated for chapter {} yet.",
                chapter.chapter_number()
            )));
        }

        let record = self
            .progress
            .record_quiz_score(key, score, self.clock.now())
            .await?;
        tracing::info!(%student_id, %chapter_id, score = score.value(), "quiz score recorded");
        Ok(record)
    }

    async fn visible_chapter(&self, id: ChapterId) -> Result<Chapter, QuizGateError> {
        self.chapters
            .get_chapter(id)
            .await?
            .filter(Chapter::is_published)
            .ok_or(QuizGateError::ChapterNotFound(id))
    }
}
