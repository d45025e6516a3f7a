mod chapter;
mod ids;
mod progress;

pub use chapter::{Chapter, ChapterDraft, ChapterError, Section, SectionDraft, SectionKind};
pub use ids::{ChapterId, CourseId, ParseIdError, ProgressId, SectionId, StudentId};
pub use progress::{
    Bookmark, MAX_BOOKMARK_NOTE_CHARS, PersistedProgress, ProgressError, ProgressKey, QuizScore,
    ReadingProgress,
};
