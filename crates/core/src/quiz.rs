use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ReadingProgress;

pub const DEFAULT_QUESTION_COUNT: u8 = 10;
pub const MAX_QUESTION_COUNT: u8 = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuizParamsError {
    #[error("question count must be between 1 and {MAX_QUESTION_COUNT}, got {0}")]
    InvalidQuestionCount(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuizDifficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl QuizDifficulty {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QuizDifficulty::Easy => "easy",
            QuizDifficulty::Medium => "medium",
            QuizDifficulty::Hard => "hard",
        }
    }
}

/// Knobs passed through to the quiz generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuizParams {
    difficulty: QuizDifficulty,
    question_count: u8,
}

impl Default for QuizParams {
    fn default() -> Self {
        Self {
            difficulty: QuizDifficulty::default(),
            question_count: DEFAULT_QUESTION_COUNT,
        }
    }
}

impl QuizParams {
    /// # Errors
    ///
    /// Returns `QuizParamsError::InvalidQuestionCount` outside `1..=MAX_QUESTION_COUNT`.
    pub fn new(difficulty: QuizDifficulty, question_count: u32) -> Result<Self, QuizParamsError> {
        let count = u8::try_from(question_count)
            .ok()
            .filter(|c| (1..=MAX_QUESTION_COUNT).contains(c))
            .ok_or(QuizParamsError::InvalidQuestionCount(question_count))?;
        Ok(Self {
            difficulty,
            question_count: count,
        })
    }

    #[must_use]
    pub fn difficulty(&self) -> QuizDifficulty {
        self.difficulty
    }

    #[must_use]
    pub fn question_count(&self) -> u8 {
        self.question_count
    }
}

/// A multiple-choice question as returned by the content generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub explanation: Option<String>,
    pub difficulty: QuizDifficulty,
}

/// The quiz gate: a quiz may be requested only for a completed chapter.
///
/// `None` means the student has no progress record for the chapter.
#[must_use]
pub fn can_generate_quiz(progress: Option<&ReadingProgress>) -> bool {
    progress.is_some_and(ReadingProgress::is_completed)
}
