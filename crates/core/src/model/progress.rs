use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::ids::{ChapterId, CourseId, ProgressId, SectionId, StudentId};

/// Upper bound for a bookmark note, counted in characters.
pub const MAX_BOOKMARK_NOTE_CHARS: usize = 500;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("bookmark note is {len} characters, the limit is {MAX_BOOKMARK_NOTE_CHARS}")]
    NoteTooLong { len: usize },

    #[error("quiz score must be between 0 and 100, got {0}")]
    InvalidQuizScore(u32),
}

//
// ─── VALUE TYPES ───────────────────────────────────────────────────────────────
//

/// Identity of a progress record: one per (student, chapter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProgressKey {
    pub student_id: StudentId,
    pub chapter_id: ChapterId,
}

impl ProgressKey {
    #[must_use]
    pub fn new(student_id: StudentId, chapter_id: ChapterId) -> Self {
        Self {
            student_id,
            chapter_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bookmark {
    note: Option<String>,
    created_at: DateTime<Utc>,
}

impl Bookmark {
    /// Blank notes are stored as `None`.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::NoteTooLong` past [`MAX_BOOKMARK_NOTE_CHARS`].
    pub fn new(note: Option<String>, created_at: DateTime<Utc>) -> Result<Self, ProgressError> {
        let note = note.map(|n| n.trim().to_owned()).filter(|n| !n.is_empty());
        if let Some(n) = note.as_ref() {
            let len = n.chars().count();
            if len > MAX_BOOKMARK_NOTE_CHARS {
                return Err(ProgressError::NoteTooLong { len });
            }
        }
        Ok(Self { note, created_at })
    }

    #[must_use]
    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QuizScore(u8);

impl QuizScore {
    /// # Errors
    ///
    /// Returns `ProgressError::InvalidQuizScore` above 100.
    pub fn new(score: u32) -> Result<Self, ProgressError> {
        match u8::try_from(score) {
            Ok(s) if s <= 100 => Ok(Self(s)),
            _ => Err(ProgressError::InvalidQuizScore(score)),
        }
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

//
// ─── READING PROGRESS ──────────────────────────────────────────────────────────
//

/// Per-student, per-chapter reading state.
///
/// `id` is `None` until the record has been written; read paths hand out
/// unsaved records for chapters the student has not opened yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingProgress {
    id: Option<ProgressId>,
    key: ProgressKey,
    course_id: CourseId,
    current_section_id: Option<SectionId>,
    sections_completed: BTreeSet<SectionId>,
    time_spent_minutes: u32,
    completed_at: Option<DateTime<Utc>>,
    bookmarks: BTreeMap<SectionId, Bookmark>,
    quiz_generated: bool,
    quiz_score: Option<QuizScore>,
    last_accessed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Raw persisted fields, handed to [`ReadingProgress::from_persisted`].
#[derive(Debug, Clone)]
pub struct PersistedProgress {
    pub id: ProgressId,
    pub key: ProgressKey,
    pub course_id: CourseId,
    pub current_section_id: Option<SectionId>,
    pub sections_completed: Vec<SectionId>,
    pub time_spent_minutes: u32,
    pub completed_at: Option<DateTime<Utc>>,
    pub bookmarks: Vec<(SectionId, Option<String>, DateTime<Utc>)>,
    pub quiz_generated: bool,
    pub quiz_score: Option<u32>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReadingProgress {
    /// A record with no interactions yet.
    #[must_use]
    pub fn new(key: ProgressKey, course_id: CourseId, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            key,
            course_id,
            current_section_id: None,
            sections_completed: BTreeSet::new(),
            time_spent_minutes: 0,
            completed_at: None,
            bookmarks: BTreeMap::new(),
            quiz_generated: false,
            quiz_score: None,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// # Errors
    ///
    /// Returns `ProgressError` if a stored note or quiz score is out of range.
    pub fn from_persisted(parts: PersistedProgress) -> Result<Self, ProgressError> {
        let mut bookmarks = BTreeMap::new();
        for (section, note, created_at) in parts.bookmarks {
            bookmarks.insert(section, Bookmark::new(note, created_at)?);
        }
        let quiz_score = parts.quiz_score.map(QuizScore::new).transpose()?;

        Ok(Self {
            id: Some(parts.id),
            key: parts.key,
            course_id: parts.course_id,
            current_section_id: parts.current_section_id,
            sections_completed: parts.sections_completed.into_iter().collect(),
            time_spent_minutes: parts.time_spent_minutes,
            completed_at: parts.completed_at,
            bookmarks,
            quiz_generated: parts.quiz_generated,
            quiz_score,
            last_accessed_at: parts.last_accessed_at,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    #[must_use]
    pub fn assign_id(mut self, id: ProgressId) -> Self {
        self.id = Some(id);
        self
    }

    //
    // ─── MUTATIONS ─────────────────────────────────────────────────────────────
    //

    /// Record that the student opened the chapter.
    ///
    /// Time only ratchets upward: a smaller `time_spent_minutes` is ignored.
    pub fn record_visit(
        &mut self,
        section: Option<SectionId>,
        time_spent_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) {
        if let Some(section) = section {
            self.current_section_id = Some(section);
        }
        if let Some(minutes) = time_spent_minutes {
            self.time_spent_minutes = self.time_spent_minutes.max(minutes);
        }
        self.last_accessed_at = Some(now);
        self.updated_at = now;
    }

    /// Add a section to the completed set. Returns `false` if it was already there.
    pub fn complete_section(&mut self, section: SectionId, now: DateTime<Utc>) -> bool {
        let inserted = self.sections_completed.insert(section);
        if inserted {
            self.updated_at = now;
        }
        inserted
    }

    /// Flip the record to completed. Returns `false` if it already was.
    pub fn mark_completed(&mut self, at: DateTime<Utc>) -> bool {
        if self.completed_at.is_some() {
            return false;
        }
        self.completed_at = Some(at);
        self.updated_at = at;
        true
    }

    pub fn set_bookmark(&mut self, section: SectionId, bookmark: Bookmark, now: DateTime<Utc>) {
        self.bookmarks.insert(section, bookmark);
        self.updated_at = now;
    }

    /// Returns `false` when there was nothing to remove.
    pub fn remove_bookmark(&mut self, section: &SectionId, now: DateTime<Utc>) -> bool {
        let removed = self.bookmarks.remove(section).is_some();
        if removed {
            self.updated_at = now;
        }
        removed
    }

    pub fn mark_quiz_generated(&mut self, now: DateTime<Utc>) {
        if !self.quiz_generated {
            self.quiz_generated = true;
            self.updated_at = now;
        }
    }

    pub fn record_quiz_score(&mut self, score: QuizScore, now: DateTime<Utc>) {
        self.quiz_score = Some(score);
        self.updated_at = now;
    }

    //
    // ─── ACCESSORS ─────────────────────────────────────────────────────────────
    //

    #[must_use]
    pub fn id(&self) -> Option<ProgressId> {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> ProgressKey {
        self.key
    }

    #[must_use]
    pub fn student_id(&self) -> StudentId {
        self.key.student_id
    }

    #[must_use]
    pub fn chapter_id(&self) -> ChapterId {
        self.key.chapter_id
    }

    #[must_use]
    pub fn course_id(&self) -> CourseId {
        self.course_id
    }

    #[must_use]
    pub fn current_section_id(&self) -> Option<&SectionId> {
        self.current_section_id.as_ref()
    }

    #[must_use]
    pub fn sections_completed(&self) -> &BTreeSet<SectionId> {
        &self.sections_completed
    }

    #[must_use]
    pub fn time_spent_minutes(&self) -> u32 {
        self.time_spent_minutes
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn bookmarks(&self) -> &BTreeMap<SectionId, Bookmark> {
        &self.bookmarks
    }

    #[must_use]
    pub fn quiz_generated(&self) -> bool {
        self.quiz_generated
    }

    #[must_use]
    pub fn quiz_score(&self) -> Option<QuizScore> {
        self.quiz_score
    }

    #[must_use]
    pub fn last_accessed_at(&self) -> Option<DateTime<Utc>> {
        self.last_accessed_at
    }

    /// True once `record_visit` has been applied at least once.
    #[must_use]
    pub fn has_been_visited(&self) -> bool {
        self.last_accessed_at.is_some()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
