#![forbid(unsafe_code)]

pub mod app_services;
pub mod chapter_service;
pub mod error;
pub mod progress_service;
pub mod quiz_gate;
pub mod stats_service;

pub use course_core::Clock;

pub use app_services::AppServices;
pub use chapter_service::ChapterService;
pub use error::{
    AppServicesError, ChapterServiceError, ProgressServiceError, QuizGateError,
    QuizGenerationError, StatsError,
};
pub use progress_service::{
    ChapterProgressSummary, ChapterProgressView, CourseProgressView, ProgressTracker,
};
pub use quiz_gate::{QuizGate, QuizGenerator, QuizRequest, UnconfiguredQuizGenerator};
pub use stats_service::StatsService;
