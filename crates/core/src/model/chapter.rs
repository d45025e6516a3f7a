use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{ChapterId, CourseId, SectionId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChapterError {
    #[error("chapter number must be >= 1")]
    InvalidChapterNumber,

    #[error("chapter title cannot be empty")]
    EmptyTitle,

    #[error("section id cannot be empty")]
    EmptySectionId,

    #[error("section id `{0}` appears more than once in the chapter")]
    DuplicateSectionId(SectionId),

    #[error("chapter cannot list itself as a prerequisite")]
    SelfPrerequisite,

    #[error("invalid section kind: {0}")]
    InvalidSectionKind(String),
}

//
// ─── SECTIONS ──────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl SectionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SectionKind::Text => "text",
            SectionKind::Image => "image",
            SectionKind::Video => "video",
            SectionKind::Audio => "audio",
            SectionKind::File => "file",
        }
    }

    /// Parse the lowercase storage form.
    ///
    /// # Errors
    ///
    /// Returns `ChapterError::InvalidSectionKind` for unknown values.
    pub fn parse(raw: &str) -> Result<Self, ChapterError> {
        match raw {
            "text" => Ok(SectionKind::Text),
            "image" => Ok(SectionKind::Image),
            "video" => Ok(SectionKind::Video),
            "audio" => Ok(SectionKind::Audio),
            "file" => Ok(SectionKind::File),
            other => Err(ChapterError::InvalidSectionKind(other.to_owned())),
        }
    }
}

/// Unvalidated section input, in display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDraft {
    pub id: String,
    pub title: String,
    pub content: String,
    pub kind: SectionKind,
    pub is_required: bool,
    pub estimated_read_time_minutes: u32,
}

impl SectionDraft {
    /// Convenience constructor for a text section.
    #[must_use]
    pub fn text(id: impl Into<String>, is_required: bool, estimated_read_time_minutes: u32) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            content: String::new(),
            kind: SectionKind::Text,
            is_required,
            estimated_read_time_minutes,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section {
    id: SectionId,
    order: u32,
    title: String,
    content: String,
    kind: SectionKind,
    is_required: bool,
    estimated_read_time_minutes: u32,
}

impl Section {
    #[must_use]
    pub fn id(&self) -> &SectionId {
        &self.id
    }

    /// 1-based position within the chapter.
    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.is_required
    }

    #[must_use]
    pub fn estimated_read_time_minutes(&self) -> u32 {
        self.estimated_read_time_minutes
    }
}

fn validate_sections(drafts: Vec<SectionDraft>) -> Result<Vec<Section>, ChapterError> {
    let mut seen = HashSet::with_capacity(drafts.len());
    let mut sections = Vec::with_capacity(drafts.len());

    for (idx, draft) in drafts.into_iter().enumerate() {
        let id = draft.id.trim();
        if id.is_empty() {
            return Err(ChapterError::EmptySectionId);
        }
        let id = SectionId::new(id);
        if !seen.insert(id.clone()) {
            return Err(ChapterError::DuplicateSectionId(id));
        }

        let order = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        let title = match draft.title.trim() {
            "" => format!("Section {order}"),
            t => t.to_owned(),
        };

        sections.push(Section {
            id,
            order,
            title,
            content: draft.content,
            kind: draft.kind,
            is_required: draft.is_required,
            estimated_read_time_minutes: draft.estimated_read_time_minutes,
        });
    }

    Ok(sections)
}

fn sum_estimated_minutes(sections: &[Section]) -> u32 {
    sections
        .iter()
        .fold(0_u32, |acc, s| acc.saturating_add(s.estimated_read_time_minutes))
}

fn normalize_title(title: String) -> Result<String, ChapterError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ChapterError::EmptyTitle);
    }
    Ok(trimmed.to_owned())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_owned())
        .filter(|d| !d.is_empty())
}

//
// ─── CHAPTER DRAFT ─────────────────────────────────────────────────────────────
//

/// Instructor input for a new chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterDraft {
    pub course_id: CourseId,
    pub chapter_number: u32,
    pub title: String,
    pub description: Option<String>,
    pub sections: Vec<SectionDraft>,
    pub prerequisites: Vec<ChapterId>,
    pub is_published: bool,
}

impl ChapterDraft {
    #[must_use]
    pub fn new(course_id: CourseId, chapter_number: u32, title: impl Into<String>) -> Self {
        Self {
            course_id,
            chapter_number,
            title: title.into(),
            description: None,
            sections: Vec::new(),
            prerequisites: Vec::new(),
            is_published: false,
        }
    }

    #[must_use]
    pub fn with_sections(mut self, sections: Vec<SectionDraft>) -> Self {
        self.sections = sections;
        self
    }

    #[must_use]
    pub fn with_prerequisites(mut self, prerequisites: Vec<ChapterId>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    #[must_use]
    pub fn published(mut self) -> Self {
        self.is_published = true;
        self
    }

    /// Validate the draft. The chapter receives its id from storage afterwards.
    ///
    /// # Errors
    ///
    /// Returns `ChapterError` for a zero chapter number, empty title, or bad sections.
    pub fn validate(self, now: DateTime<Utc>) -> Result<Chapter, ChapterError> {
        self.into_chapter(ChapterId::new(0), now)
    }

    fn into_chapter(self, id: ChapterId, now: DateTime<Utc>) -> Result<Chapter, ChapterError> {
        if self.chapter_number == 0 {
            return Err(ChapterError::InvalidChapterNumber);
        }
        let title = normalize_title(self.title)?;
        let sections = validate_sections(self.sections)?;
        let total_estimated_minutes = sum_estimated_minutes(&sections);

        Ok(Chapter {
            id,
            course_id: self.course_id,
            chapter_number: self.chapter_number,
            title,
            description: normalize_description(self.description),
            sections,
            prerequisites: self.prerequisites.into_iter().collect(),
            is_published: self.is_published,
            total_estimated_minutes,
            version: 1,
            revision: 1,
            created_at: now,
            updated_at: now,
        })
    }
}

//
// ─── CHAPTER ───────────────────────────────────────────────────────────────────
//

/// An ordered, numbered content unit within a course.
///
/// `total_estimated_minutes` and `version` are derived: they change only
/// through [`Chapter::replace_sections`]. `revision` counts every edit and is
/// what storage compares for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chapter {
    id: ChapterId,
    course_id: CourseId,
    chapter_number: u32,
    title: String,
    description: Option<String>,
    sections: Vec<Section>,
    prerequisites: BTreeSet<ChapterId>,
    is_published: bool,
    total_estimated_minutes: u32,
    version: u32,
    revision: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Chapter {
    /// Rehydrate a chapter from storage. The section total is recomputed.
    ///
    /// # Errors
    ///
    /// Returns `ChapterError` if the persisted data violates chapter invariants.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: ChapterId,
        course_id: CourseId,
        chapter_number: u32,
        title: String,
        description: Option<String>,
        sections: Vec<SectionDraft>,
        prerequisites: Vec<ChapterId>,
        is_published: bool,
        version: u32,
        revision: u32,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, ChapterError> {
        let draft = ChapterDraft {
            course_id,
            chapter_number,
            title,
            description,
            sections,
            prerequisites,
            is_published,
        };
        let mut chapter = draft.into_chapter(id, created_at)?;
        chapter.version = version.max(1);
        chapter.revision = revision.max(1);
        chapter.updated_at = updated_at;
        Ok(chapter)
    }

    /// Attach the storage-issued id to a freshly validated chapter.
    #[must_use]
    pub fn assign_id(mut self, id: ChapterId) -> Self {
        self.id = id;
        self
    }

    /// Replace the section list, recomputing the estimated time and bumping the version.
    ///
    /// # Errors
    ///
    /// Returns `ChapterError` if any section is invalid; the chapter is left untouched.
    pub fn replace_sections(
        &mut self,
        sections: Vec<SectionDraft>,
        now: DateTime<Utc>,
    ) -> Result<(), ChapterError> {
        let sections = validate_sections(sections)?;
        self.total_estimated_minutes = sum_estimated_minutes(&sections);
        self.sections = sections;
        self.version = self.version.saturating_add(1);
        self.touch(now);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ChapterError::EmptyTitle` if the title is blank.
    pub fn rename(
        &mut self,
        title: String,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ChapterError> {
        self.title = normalize_title(title)?;
        self.description = normalize_description(description);
        self.touch(now);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ChapterError::SelfPrerequisite` if the set contains this chapter.
    pub fn replace_prerequisites(
        &mut self,
        prerequisites: impl IntoIterator<Item = ChapterId>,
        now: DateTime<Utc>,
    ) -> Result<(), ChapterError> {
        let prerequisites: BTreeSet<ChapterId> = prerequisites.into_iter().collect();
        if prerequisites.contains(&self.id) {
            return Err(ChapterError::SelfPrerequisite);
        }
        self.prerequisites = prerequisites;
        self.touch(now);
        Ok(())
    }

    pub fn set_published(&mut self, published: bool, now: DateTime<Utc>) {
        if self.is_published != published {
            self.is_published = published;
            self.touch(now);
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.revision = self.revision.saturating_add(1);
        self.updated_at = now;
    }

    // Accessors
    #[must_use]
    pub fn id(&self) -> ChapterId {
        self.id
    }

    #[must_use]
    pub fn course_id(&self) -> CourseId {
        self.course_id
    }

    #[must_use]
    pub fn chapter_number(&self) -> u32 {
        self.chapter_number
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    #[must_use]
    pub fn section(&self, id: &SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| s.id() == id)
    }

    #[must_use]
    pub fn has_section(&self, id: &SectionId) -> bool {
        self.section(id).is_some()
    }

    pub fn required_section_ids(&self) -> impl Iterator<Item = &SectionId> {
        self.sections
            .iter()
            .filter(|s| s.is_required())
            .map(Section::id)
    }

    #[must_use]
    pub fn prerequisites(&self) -> &BTreeSet<ChapterId> {
        &self.prerequisites
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        self.is_published
    }

    #[must_use]
    pub fn total_estimated_minutes(&self) -> u32 {
        self.total_estimated_minutes
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Edit counter checked by storage on update.
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.revision
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Concatenated section text, in order. This is what the quiz generator reads.
    #[must_use]
    pub fn reading_text(&self) -> String {
        self.sections
            .iter()
            .filter(|s| !s.content().trim().is_empty())
            .map(|s| format!("## {}\n\n{}", s.title(), s.content().trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;
    use chrono::Duration;

    fn draft() -> ChapterDraft {
        ChapterDraft::new(CourseId::new(1), 1, "Ownership").with_sections(vec![
            SectionDraft::text("s1", true, 5),
            SectionDraft::text("s2", true, 7),
            SectionDraft::text("s3", false, 3),
        ])
    }

    #[test]
    fn validate_computes_total_and_starts_at_version_one() {
        let chapter = draft().validate(fixed_now()).unwrap();
        assert_eq!(chapter.total_estimated_minutes(), 15);
        assert_eq!(chapter.version(), 1);
        assert_eq!(chapter.sections()[2].order(), 3);
        assert_eq!(chapter.sections()[0].title(), "Section 1");
    }

    #[test]
    fn validate_rejects_zero_chapter_number() {
        let mut d = draft();
        d.chapter_number = 0;
        assert_eq!(
            d.validate(fixed_now()).unwrap_err(),
            ChapterError::InvalidChapterNumber
        );
    }

    #[test]
    fn validate_rejects_blank_title() {
        let mut d = draft();
        d.title = "   ".into();
        assert_eq!(d.validate(fixed_now()).unwrap_err(), ChapterError::EmptyTitle);
    }

    #[test]
    fn validate_rejects_duplicate_section_ids() {
        let d = ChapterDraft::new(CourseId::new(1), 1, "Dup").with_sections(vec![
            SectionDraft::text("a", true, 1),
            SectionDraft::text(" a ", false, 1),
        ]);
        assert_eq!(
            d.validate(fixed_now()).unwrap_err(),
            ChapterError::DuplicateSectionId(SectionId::new("a"))
        );
    }

    #[test]
    fn replace_sections_recomputes_and_bumps_version() {
        let mut chapter = draft().validate(fixed_now()).unwrap();
        let later = fixed_now() + Duration::hours(1);
        chapter
            .replace_sections(vec![SectionDraft::text("only", true, 20)], later)
            .unwrap();

        assert_eq!(chapter.total_estimated_minutes(), 20);
        assert_eq!(chapter.version(), 2);
        assert_eq!(chapter.revision(), 2);
        assert_eq!(chapter.updated_at(), later);
        assert_eq!(chapter.required_section_ids().count(), 1);
    }

    #[test]
    fn failed_section_replace_leaves_chapter_untouched() {
        let mut chapter = draft().validate(fixed_now()).unwrap();
        let before = chapter.clone();
        let err = chapter
            .replace_sections(vec![SectionDraft::text("", true, 1)], fixed_now())
            .unwrap_err();
        assert_eq!(err, ChapterError::EmptySectionId);
        assert_eq!(chapter, before);
    }

    #[test]
    fn rename_bumps_revision_only() {
        let mut chapter = draft().validate(fixed_now()).unwrap();
        chapter
            .rename("Borrowing".into(), Some("  refs  ".into()), fixed_now())
            .unwrap();
        assert_eq!(chapter.title(), "Borrowing");
        assert_eq!(chapter.description(), Some("refs"));
        assert_eq!(chapter.version(), 1);
        assert_eq!(chapter.revision(), 2);
    }

    #[test]
    fn every_edit_bumps_revision_but_not_version() {
        let mut chapter = draft()
            .validate(fixed_now())
            .unwrap()
            .assign_id(ChapterId::new(4));
        assert_eq!(chapter.revision(), 1);

        chapter.set_published(true, fixed_now());
        assert_eq!(chapter.revision(), 2);
        // Already published: nothing changes.
        chapter.set_published(true, fixed_now());
        assert_eq!(chapter.revision(), 2);

        chapter
            .replace_prerequisites([ChapterId::new(1)], fixed_now())
            .unwrap();
        assert_eq!(chapter.revision(), 3);
        assert_eq!(chapter.version(), 1);
    }

    #[test]
    fn prerequisites_cannot_include_self() {
        let mut chapter = draft()
            .validate(fixed_now())
            .unwrap()
            .assign_id(ChapterId::new(9));
        let err = chapter
            .replace_prerequisites([ChapterId::new(9)], fixed_now())
            .unwrap_err();
        assert_eq!(err, ChapterError::SelfPrerequisite);
    }

    #[test]
    fn from_persisted_keeps_version_and_recomputes_total() {
        let chapter = Chapter::from_persisted(
            ChapterId::new(3),
            CourseId::new(1),
            2,
            "Traits".into(),
            None,
            vec![SectionDraft::text("x", true, 4), SectionDraft::text("y", false, 6)],
            vec![ChapterId::new(1)],
            true,
            5,
            8,
            fixed_now(),
            fixed_now(),
        )
        .unwrap();
        assert_eq!(chapter.version(), 5);
        assert_eq!(chapter.revision(), 8);
        assert_eq!(chapter.total_estimated_minutes(), 10);
        assert!(chapter.prerequisites().contains(&ChapterId::new(1)));
    }

    #[test]
    fn reading_text_skips_empty_sections() {
        let chapter = ChapterDraft::new(CourseId::new(1), 1, "Text")
            .with_sections(vec![
                SectionDraft::text("a", true, 1)
                    .with_title("Intro")
                    .with_content("Hello"),
                SectionDraft::text("b", true, 1),
            ])
            .validate(fixed_now())
            .unwrap();
        assert_eq!(chapter.reading_text(), "## Intro\n\nHello");
    }

    #[test]
    fn section_kind_round_trips_through_str() {
        for kind in [
            SectionKind::Text,
            SectionKind::Image,
            SectionKind::Video,
            SectionKind::Audio,
            SectionKind::File,
        ] {
            assert_eq!(SectionKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(SectionKind::parse("pdf").is_err());
    }
}
