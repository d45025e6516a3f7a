//! Progression rules: completion predicate, reading percentage, and chapter sequencing.
//!
//! Prerequisites are advisory here. They are resolved for display and reported
//! as unmet, but nothing in this module refuses access to a chapter.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{Chapter, ChapterId, ReadingProgress};

/// Whether `progress` satisfies the completion predicate for `chapter`.
///
/// With required sections `R` and completed set `C` this is `R ⊆ C`. A chapter
/// with no required sections counts as complete once the student has
/// interacted with it (a visit or any completed section).
#[must_use]
pub fn completion_satisfied(chapter: &Chapter, progress: &ReadingProgress) -> bool {
    let completed = progress.sections_completed();
    let mut required = chapter.required_section_ids().peekable();

    if required.peek().is_none() {
        return progress.has_been_visited() || !completed.is_empty();
    }

    required.all(|id| completed.contains(id))
}

/// Flip `progress` to completed if the predicate now holds.
///
/// Returns `true` only on the transition. Never reverts a completed record.
pub fn apply_completion(
    chapter: &Chapter,
    progress: &mut ReadingProgress,
    now: DateTime<Utc>,
) -> bool {
    if progress.is_completed() || !completion_satisfied(chapter, progress) {
        return false;
    }
    progress.mark_completed(now)
}

/// Reading percentage shown while a chapter is in progress.
///
/// `100` once completed; otherwise the share of required sections done,
/// capped at `99`. A chapter without required sections reads `0` until complete.
#[must_use]
pub fn progress_percent(chapter: &Chapter, progress: &ReadingProgress) -> u8 {
    if progress.is_completed() {
        return 100;
    }

    let completed = progress.sections_completed();
    let (total, done) = chapter
        .required_section_ids()
        .fold((0_usize, 0_usize), |(total, done), id| {
            (total + 1, done + usize::from(completed.contains(id)))
        });

    if total == 0 {
        return 0;
    }

    // done <= total, so the ratio is in [0, 100].
    #[allow(clippy::cast_precision_loss)]
    let ratio = done as f64 / total as f64 * 100.0;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let percent = ratio.round() as u8;
    percent.min(99)
}

//
// ─── SEQUENCING ────────────────────────────────────────────────────────────────
//

/// Published chapter with the smallest number strictly greater than `current`'s.
#[must_use]
pub fn next_chapter<'a>(chapters: &'a [Chapter], current: &Chapter) -> Option<&'a Chapter> {
    chapters
        .iter()
        .filter(|c| {
            c.course_id() == current.course_id()
                && c.is_published()
                && c.chapter_number() > current.chapter_number()
        })
        .min_by_key(|c| c.chapter_number())
}

/// Published chapter with the largest number strictly smaller than `current`'s.
#[must_use]
pub fn previous_chapter<'a>(chapters: &'a [Chapter], current: &Chapter) -> Option<&'a Chapter> {
    chapters
        .iter()
        .filter(|c| {
            c.course_id() == current.course_id()
                && c.is_published()
                && c.chapter_number() < current.chapter_number()
        })
        .max_by_key(|c| c.chapter_number())
}

/// Lightweight reference to another chapter, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterRef {
    pub id: ChapterId,
    pub chapter_number: u32,
    pub title: String,
}

impl From<&Chapter> for ChapterRef {
    fn from(chapter: &Chapter) -> Self {
        Self {
            id: chapter.id(),
            chapter_number: chapter.chapter_number(),
            title: chapter.title().to_owned(),
        }
    }
}

/// A published chapter with its prerequisites resolved to published chapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterOutline {
    pub chapter: Chapter,
    pub prerequisites: Vec<ChapterRef>,
}

fn resolve_prerequisites(chapter: &Chapter, chapters: &[Chapter]) -> Vec<ChapterRef> {
    let mut resolved: Vec<ChapterRef> = chapters
        .iter()
        .filter(|c| c.is_published() && chapter.prerequisites().contains(&c.id()))
        .map(ChapterRef::from)
        .collect();
    resolved.sort_by_key(|c| c.chapter_number);
    resolved
}

/// Published chapters of one course, ascending by chapter number.
#[must_use]
pub fn progressive_order(chapters: &[Chapter]) -> Vec<ChapterOutline> {
    let mut published: Vec<&Chapter> = chapters.iter().filter(|c| c.is_published()).collect();
    published.sort_by_key(|c| c.chapter_number());

    published
        .into_iter()
        .map(|c| ChapterOutline {
            chapter: c.clone(),
            prerequisites: resolve_prerequisites(c, chapters),
        })
        .collect()
}

/// Prerequisites of `chapter` that are published and not in `completed`.
#[must_use]
pub fn unmet_prerequisites(
    chapter: &Chapter,
    chapters: &[Chapter],
    completed: &BTreeSet<ChapterId>,
) -> Vec<ChapterRef> {
    resolve_prerequisites(chapter, chapters)
        .into_iter()
        .filter(|c| !completed.contains(&c.id))
        .collect()
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
