//! Instructor-facing roll-ups over reading-progress records.
//!
//! Everything here is a pure projection: records are borrowed, never mutated.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::model::{Chapter, ChapterId, CourseId, ReadingProgress};
use crate::policy::progress_percent;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChapterStats {
    pub chapter_id: ChapterId,
    pub chapter_number: u32,
    pub title: String,
    pub total_students: u64,
    pub completed_students: u64,
    pub completion_rate: u8,
    pub average_time_spent: f64,
    pub average_progress_percent: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseStats {
    pub course_id: CourseId,
    pub total_students: u64,
    pub completed_students: u64,
    pub completion_rate: u8,
    pub average_time_spent: f64,
    pub total_time_spent: u64,
    pub chapters: Vec<ChapterStats>,
}

/// `round(completed / total * 100)`, and `0` for an empty population.
#[must_use]
pub fn completion_rate(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    #[allow(clippy::cast_precision_loss)]
    let rate = (completed as f64 / total as f64 * 100.0).round();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rate = rate.clamp(0.0, 100.0) as u8;
    rate.min(100)
}

#[allow(clippy::cast_precision_loss)]
fn mean(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

#[derive(Default)]
struct Tally {
    total: u64,
    completed: u64,
    time: u64,
    percent: u64,
}

impl Tally {
    fn add(&mut self, record: &ReadingProgress) {
        self.total += 1;
        self.completed += u64::from(record.is_completed());
        self.time += u64::from(record.time_spent_minutes());
    }
}

impl CourseStats {
    /// Roll up every record belonging to `course_id`.
    ///
    /// Records from other courses are ignored. The per-chapter breakdown lists
    /// chapters that have at least one record, ascending by chapter number.
    #[must_use]
    pub fn compute(course_id: CourseId, chapters: &[Chapter], records: &[ReadingProgress]) -> Self {
        let by_id: HashMap<ChapterId, &Chapter> = chapters
            .iter()
            .filter(|c| c.course_id() == course_id)
            .map(|c| (c.id(), c))
            .collect();

        let mut course = Tally::default();
        let mut per_chapter: BTreeMap<ChapterId, Tally> = BTreeMap::new();

        for record in records.iter().filter(|r| r.course_id() == course_id) {
            course.add(record);

            let Some(chapter) = by_id.get(&record.chapter_id()) else {
                continue;
            };
            let tally = per_chapter.entry(record.chapter_id()).or_default();
            tally.add(record);
            tally.percent += u64::from(progress_percent(chapter, record));
        }

        let mut breakdown: Vec<ChapterStats> = per_chapter
            .into_iter()
            .filter_map(|(id, tally)| {
                let chapter = by_id.get(&id)?;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let average_progress_percent = mean(tally.percent, tally.total).round() as u8;
                Some(ChapterStats {
                    chapter_id: id,
                    chapter_number: chapter.chapter_number(),
                    title: chapter.title().to_owned(),
                    total_students: tally.total,
                    completed_students: tally.completed,
                    completion_rate: completion_rate(tally.completed, tally.total),
                    average_time_spent: mean(tally.time, tally.total),
                    average_progress_percent,
                })
            })
            .collect();
        breakdown.sort_by_key(|c| c.chapter_number);

        Self {
            course_id,
            total_students: course.total,
            completed_students: course.completed,
            completion_rate: completion_rate(course.completed, course.total),
            average_time_spent: mean(course.time, course.total),
            total_time_spent: course.time,
            chapters: breakdown,
        }
    }

    #[must_use]
    pub fn chapter(&self, id: ChapterId) -> Option<&ChapterStats> {
        self.chapters.iter().find(|c| c.chapter_id == id)
    }
}
