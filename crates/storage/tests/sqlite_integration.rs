use std::path::{Path, PathBuf};

use chrono::Duration;
use course_core::model::{
    Bookmark, ChapterDraft, ChapterId, CourseId, ProgressKey, QuizScore, SectionDraft, SectionId,
    SectionKind, StudentId,
};
use course_core::time::fixed_now;
use storage::repository::{ChapterLookup, ChapterRepository, ProgressRepository, StorageError};
use storage::sqlite::SqliteRepository;

/// A fresh on-disk database, so pooled connections really run in parallel.
fn file_url(name: &str) -> (PathBuf, String) {
    let path = std::env::temp_dir().join(format!("{name}-{}.sqlite3", std::process::id()));
    remove_db(&path);
    let url = format!("sqlite://{}?mode=rwc", path.display());
    (path, url)
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

async fn connect(name: &str) -> SqliteRepository {
    let url = format!("sqlite:file:{name}?mode=memory&cache=shared");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

fn draft(number: u32) -> ChapterDraft {
    ChapterDraft::new(CourseId::new(1), number, format!("Chapter {number}")).with_sections(vec![
        SectionDraft::text("s1", true, 5).with_content("Ownership moves values."),
        SectionDraft::text("s2", true, 10),
        SectionDraft::text("extra", false, 3),
    ])
}

#[tokio::test]
async fn chapter_roundtrip_keeps_sections_in_order() {
    let repo = connect("memdb_chapter_roundtrip").await;

    let mut video = SectionDraft::text("clip", false, 4).with_title("Walkthrough");
    video.kind = SectionKind::Video;
    let chapter = draft(1)
        .with_sections(vec![
            SectionDraft::text("intro", true, 2),
            video,
            SectionDraft::text("outro", true, 1),
        ])
        .published()
        .validate(fixed_now())
        .unwrap();
    let id = repo.insert_chapter(&chapter).await.unwrap();

    let stored = repo.get_chapter(id).await.unwrap().expect("stored");
    let ids: Vec<&str> = stored.sections().iter().map(|s| s.id().as_str()).collect();
    assert_eq!(ids, vec!["intro", "clip", "outro"]);
    assert_eq!(stored.sections()[1].kind(), SectionKind::Video);
    assert_eq!(stored.sections()[1].title(), "Walkthrough");
    assert_eq!(stored.sections()[0].title(), "Section 1");
    assert_eq!(stored.total_estimated_minutes(), 7);
    assert!(stored.is_published());
    assert_eq!(stored.version(), 1);

    assert!(repo.get_chapter(ChapterId::new(999)).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_chapter_number_is_a_conflict() {
    let repo = connect("memdb_duplicate_number").await;
    repo.insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();

    let err = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict));
}

#[tokio::test]
async fn stale_chapter_update_is_rejected() {
    let repo = connect("memdb_stale_update").await;
    let id = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();

    let mut edited = repo.get_chapter(id).await.unwrap().unwrap();
    edited
        .replace_sections(vec![SectionDraft::text("only", true, 1)], fixed_now())
        .unwrap();
    repo.update_chapter(&edited, 1).await.unwrap();

    let err = repo.update_chapter(&edited, 1).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    let stored = repo.get_chapter(id).await.unwrap().unwrap();
    assert_eq!(stored.version(), 2);
    assert_eq!(stored.sections().len(), 1);
}

#[tokio::test]
async fn edit_from_a_stale_copy_is_a_conflict() {
    let repo = connect("memdb_stale_copy").await;
    let id = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();

    let mut renamed = repo.get_chapter(id).await.unwrap().unwrap();
    let mut resectioned = renamed.clone();
    let base = renamed.revision();

    renamed
        .rename("Renamed".into(), Some("new intro".into()), fixed_now())
        .unwrap();
    repo.update_chapter(&renamed, base).await.unwrap();

    resectioned
        .replace_sections(vec![SectionDraft::text("only", true, 1)], fixed_now())
        .unwrap();
    let err = repo.update_chapter(&resectioned, base).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    let stored = repo.get_chapter(id).await.unwrap().unwrap();
    assert_eq!(stored.title(), "Renamed");
    assert_eq!(stored.description(), Some("new intro"));
    assert_eq!(stored.sections().len(), 3);
    assert_eq!(stored.version(), 1);
    assert_eq!(stored.revision(), 2);
}

#[tokio::test]
async fn list_chapters_orders_by_number_and_loads_prerequisites() {
    let repo = connect("memdb_list_chapters").await;
    let third = repo
        .insert_chapter(&draft(3).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    let first = repo
        .insert_chapter(&draft(1).published().validate(fixed_now()).unwrap())
        .await
        .unwrap();

    let mut stored = repo.get_chapter(third).await.unwrap().unwrap();
    stored.replace_prerequisites([first], fixed_now()).unwrap();
    repo.update_chapter(&stored, 1).await.unwrap();

    let chapters = repo.list_chapters(CourseId::new(1)).await.unwrap();
    let numbers: Vec<u32> = chapters.iter().map(|c| c.chapter_number()).collect();
    assert_eq!(numbers, vec![1, 3]);
    assert!(chapters[1].prerequisites().contains(&first));
    assert_eq!(chapters[1].sections().len(), 3);

    assert!(repo.list_chapters(CourseId::new(2)).await.unwrap().is_empty());
}

#[tokio::test]
async fn progress_commands_merge_into_one_record() {
    let repo = connect("memdb_progress_merge").await;
    let chapter = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    let key = ProgressKey::new(StudentId::new(7), chapter);
    let course = CourseId::new(1);
    let s1 = SectionId::new("s1");

    let visited = repo
        .record_visit(key, course, Some(&s1), Some(12), fixed_now())
        .await
        .unwrap();
    assert_eq!(visited.time_spent_minutes(), 12);
    assert_eq!(visited.current_section_id(), Some(&s1));

    // Smaller time and no section leave both fields alone.
    let later = fixed_now() + Duration::minutes(5);
    let revisited = repo
        .record_visit(key, course, None, Some(4), later)
        .await
        .unwrap();
    assert_eq!(revisited.id(), visited.id());
    assert_eq!(revisited.time_spent_minutes(), 12);
    assert_eq!(revisited.current_section_id(), Some(&s1));
    assert_eq!(revisited.last_accessed_at(), Some(later));

    repo.add_completed_section(key, course, &s1, later)
        .await
        .unwrap();
    let again = repo
        .add_completed_section(key, course, &s1, later)
        .await
        .unwrap();
    assert_eq!(again.sections_completed().len(), 1);
    assert!(!again.is_completed());

    assert_eq!(repo.list_course_progress(course).await.unwrap().len(), 1);
    assert_eq!(repo.count_chapter_progress(chapter).await.unwrap(), 1);
}

#[tokio::test]
async fn completion_is_set_once() {
    let repo = connect("memdb_completion_once").await;
    let chapter = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    let key = ProgressKey::new(StudentId::new(1), chapter);

    let err = repo.mark_completed(key, fixed_now()).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound));

    repo.record_visit(key, CourseId::new(1), None, None, fixed_now())
        .await
        .unwrap();
    let first = repo.mark_completed(key, fixed_now()).await.unwrap();
    assert!(first.is_completed());

    let second = repo
        .mark_completed(key, fixed_now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(second.completed_at(), Some(fixed_now()));
}

#[tokio::test]
async fn bookmarks_and_quiz_fields_persist() {
    let repo = connect("memdb_bookmarks_quiz").await;
    let chapter = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    let key = ProgressKey::new(StudentId::new(3), chapter);
    let course = CourseId::new(1);
    let s2 = SectionId::new("s2");

    let note = Bookmark::new(Some("revisit lifetimes".into()), fixed_now()).unwrap();
    repo.upsert_bookmark(key, course, &s2, &note, fixed_now())
        .await
        .unwrap();
    let replaced = Bookmark::new(None, fixed_now()).unwrap();
    let record = repo
        .upsert_bookmark(key, course, &s2, &replaced, fixed_now())
        .await
        .unwrap();
    assert_eq!(record.bookmarks().len(), 1);
    assert_eq!(record.bookmarks()[&s2].note(), None);

    repo.remove_bookmark(key, &s2, fixed_now()).await.unwrap();
    repo.remove_bookmark(key, &s2, fixed_now()).await.unwrap();
    let record = repo.get_progress(key).await.unwrap().unwrap();
    assert!(record.bookmarks().is_empty());

    let record = repo.mark_quiz_generated(key, fixed_now()).await.unwrap();
    assert!(record.quiz_generated());
    let record = repo
        .record_quiz_score(key, QuizScore::new(85).unwrap(), fixed_now())
        .await
        .unwrap();
    assert_eq!(record.quiz_score().map(QuizScore::value), Some(85));

    let missing = ProgressKey::new(StudentId::new(4), chapter);
    let err = repo
        .record_quiz_score(missing, QuizScore::new(10).unwrap(), fixed_now())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound));
}

#[tokio::test]
async fn referenced_chapter_cannot_be_deleted() {
    let repo = connect("memdb_delete_blocked").await;
    let used = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    let unused = repo
        .insert_chapter(&draft(2).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    repo.record_visit(
        ProgressKey::new(StudentId::new(1), used),
        CourseId::new(1),
        None,
        None,
        fixed_now(),
    )
    .await
    .unwrap();

    let err = repo.delete_chapter(used).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    repo.delete_chapter(unused).await.unwrap();
    let err = repo.delete_chapter(unused).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound));
}

#[tokio::test]
async fn student_listing_filters_by_student() {
    let repo = connect("memdb_student_listing").await;
    let one = repo
        .insert_chapter(&draft(1).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    let two = repo
        .insert_chapter(&draft(2).validate(fixed_now()).unwrap())
        .await
        .unwrap();
    let course = CourseId::new(1);

    for (student, chapter) in [(1, one), (1, two), (2, one)] {
        repo.add_completed_section(
            ProgressKey::new(StudentId::new(student), chapter),
            course,
            &SectionId::new("s1"),
            fixed_now(),
        )
        .await
        .unwrap();
    }

    let mine = repo
        .list_student_progress(StudentId::new(1), course)
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|p| p.sections_completed().len() == 1));
    assert_eq!(repo.list_course_progress(course).await.unwrap().len(), 3);
}

#[tokio::test]
async fn progress_for_a_missing_chapter_is_not_found() {
    let repo = connect("memdb_missing_chapter").await;
    let key = ProgressKey::new(StudentId::new(1), ChapterId::new(77));

    let err = repo
        .record_visit(key, CourseId::new(1), None, Some(3), fixed_now())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound));

    let err = repo
        .add_completed_section(key, CourseId::new(1), &SectionId::new("s1"), fixed_now())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound));
    assert!(repo.get_progress(key).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_completions_store_each_section_once() {
    let (path, url) = file_url("course-overlapping-completions");
    let repo = SqliteRepository::connect(&url).await.expect("connect");
    repo.migrate().await.expect("migrate");

    let sections: Vec<SectionDraft> = (0..8)
        .map(|i| SectionDraft::text(format!("s{i}"), true, 1))
        .collect();
    let chapter = repo
        .insert_chapter(
            &ChapterDraft::new(CourseId::new(1), 1, "Concurrency")
                .with_sections(sections)
                .published()
                .validate(fixed_now())
                .unwrap(),
        )
        .await
        .unwrap();
    let key = ProgressKey::new(StudentId::new(1), chapter);

    // Every section is completed three times, all calls in flight together.
    let mut tasks = Vec::new();
    for round in 0..3_i64 {
        for i in 0..8_i64 {
            let repo = repo.clone();
            let at = fixed_now() + Duration::minutes(round * 8 + i);
            tasks.push(tokio::spawn(async move {
                let section = SectionId::new(format!("s{i}"));
                let record = repo
                    .add_completed_section(key, CourseId::new(1), &section, at)
                    .await?;
                if record.sections_completed().len() == 8 {
                    repo.mark_completed(key, at).await?;
                }
                Ok::<_, StorageError>(())
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let record = repo.get_progress(key).await.unwrap().unwrap();
    assert_eq!(record.sections_completed().len(), 8);
    assert!(record.is_completed());
    let completed_at = record.completed_at().unwrap();

    let again = repo
        .mark_completed(key, fixed_now() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(again.completed_at(), Some(completed_at));

    let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
    let per_section: Vec<(String, i64)> = sqlx::query_as(
        "SELECT section_id, COUNT(*) FROM progress_completed_sections GROUP BY section_id",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(per_section.len(), 8);
    assert!(per_section.iter().all(|(_, n)| *n == 1));

    let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reading_progress")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(records, 1);

    pool.close().await;
    drop(repo);
    remove_db(&path);
}
