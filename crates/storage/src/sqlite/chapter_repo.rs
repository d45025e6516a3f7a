use std::collections::HashMap;

use course_core::model::{Chapter, ChapterId, CourseId, SectionDraft};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::SqliteRepository;
use super::mapping::{
    bool_to_i64, chapter_id_from_i64, course_id_from_i64, db_err, get_bool, id_to_i64,
    map_section_row, ser, u32_from_i64,
};
use crate::repository::{ChapterLookup, ChapterRepository, StorageError};

const CHAPTER_COLUMNS: &str = r"
    id, course_id, chapter_number, title, description, is_published, version,
    revision, created_at, updated_at
";

fn chapter_from_row(
    row: &SqliteRow,
    sections: Vec<SectionDraft>,
    prerequisites: Vec<ChapterId>,
) -> Result<Chapter, StorageError> {
    Chapter::from_persisted(
        chapter_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?,
        course_id_from_i64(row.try_get::<i64, _>("course_id").map_err(ser)?)?,
        u32_from_i64(
            "chapter_number",
            row.try_get::<i64, _>("chapter_number").map_err(ser)?,
        )?,
        row.try_get("title").map_err(ser)?,
        row.try_get("description").map_err(ser)?,
        sections,
        prerequisites,
        get_bool(row, "is_published")?,
        u32_from_i64("version", row.try_get::<i64, _>("version").map_err(ser)?)?,
        u32_from_i64("revision", row.try_get::<i64, _>("revision").map_err(ser)?)?,
        row.try_get("created_at").map_err(ser)?,
        row.try_get("updated_at").map_err(ser)?,
    )
    .map_err(ser)
}

async fn write_children(
    conn: &mut SqliteConnection,
    chapter_id: i64,
    chapter: &Chapter,
) -> Result<(), StorageError> {
    for section in chapter.sections() {
        sqlx::query(
            r"
            INSERT INTO chapter_sections (
                chapter_id, section_id, position, title, content, kind,
                is_required, estimated_read_time_minutes
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(chapter_id)
        .bind(section.id().as_str())
        .bind(i64::from(section.order()))
        .bind(section.title())
        .bind(section.content())
        .bind(section.kind().as_str())
        .bind(bool_to_i64(section.is_required()))
        .bind(i64::from(section.estimated_read_time_minutes()))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }

    for prerequisite in chapter.prerequisites() {
        sqlx::query(
            r"
            INSERT INTO chapter_prerequisites (chapter_id, prerequisite_id)
            VALUES (?1, ?2)
            ",
        )
        .bind(chapter_id)
        .bind(id_to_i64("prerequisite_id", prerequisite.value())?)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }

    Ok(())
}

impl SqliteRepository {
    async fn load_children(
        &self,
        filter: &str,
        param: i64,
    ) -> Result<(HashMap<i64, Vec<SectionDraft>>, HashMap<i64, Vec<ChapterId>>), StorageError> {
        let section_sql = format!(
            r"
            SELECT chapter_id, section_id, position, title, content, kind,
                   is_required, estimated_read_time_minutes
            FROM chapter_sections
            WHERE chapter_id IN ({filter})
            ORDER BY chapter_id ASC, position ASC
            "
        );
        let rows = sqlx::query(&section_sql)
            .bind(param)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut sections: HashMap<i64, Vec<SectionDraft>> = HashMap::new();
        for row in rows {
            let chapter_id: i64 = row.try_get("chapter_id").map_err(ser)?;
            sections
                .entry(chapter_id)
                .or_default()
                .push(map_section_row(&row)?);
        }

        let prerequisite_sql = format!(
            r"
            SELECT chapter_id, prerequisite_id
            FROM chapter_prerequisites
            WHERE chapter_id IN ({filter})
            ORDER BY chapter_id ASC, prerequisite_id ASC
            "
        );
        let rows = sqlx::query(&prerequisite_sql)
            .bind(param)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut prerequisites: HashMap<i64, Vec<ChapterId>> = HashMap::new();
        for row in rows {
            let chapter_id: i64 = row.try_get("chapter_id").map_err(ser)?;
            let prerequisite = chapter_id_from_i64(row.try_get("prerequisite_id").map_err(ser)?)?;
            prerequisites.entry(chapter_id).or_default().push(prerequisite);
        }

        Ok((sections, prerequisites))
    }
}

#[async_trait::async_trait]
impl ChapterLookup for SqliteRepository {
    async fn get_chapter(&self, id: ChapterId) -> Result<Option<Chapter>, StorageError> {
        let id = id_to_i64("chapter_id", id.value())?;
        let sql = format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE id = ?1");
        let Some(row) = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };

        let (mut sections, mut prerequisites) = self.load_children("?1", id).await?;
        chapter_from_row(
            &row,
            sections.remove(&id).unwrap_or_default(),
            prerequisites.remove(&id).unwrap_or_default(),
        )
        .map(Some)
    }

    async fn list_chapters(&self, course_id: CourseId) -> Result<Vec<Chapter>, StorageError> {
        let course = id_to_i64("course_id", course_id.value())?;
        let sql = format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE course_id = ?1 ORDER BY chapter_number ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(course)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let (mut sections, mut prerequisites) = self
            .load_children("SELECT id FROM chapters WHERE course_id = ?1", course)
            .await?;

        let mut chapters = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id").map_err(ser)?;
            chapters.push(chapter_from_row(
                &row,
                sections.remove(&id).unwrap_or_default(),
                prerequisites.remove(&id).unwrap_or_default(),
            )?);
        }
        Ok(chapters)
    }
}

#[async_trait::async_trait]
impl ChapterRepository for SqliteRepository {
    async fn insert_chapter(&self, chapter: &Chapter) -> Result<ChapterId, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let res = sqlx::query(
            r"
            INSERT INTO chapters (
                course_id, chapter_number, title, description, is_published,
                total_estimated_minutes, version, revision, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(id_to_i64("course_id", chapter.course_id().value())?)
        .bind(i64::from(chapter.chapter_number()))
        .bind(chapter.title())
        .bind(chapter.description())
        .bind(bool_to_i64(chapter.is_published()))
        .bind(i64::from(chapter.total_estimated_minutes()))
        .bind(i64::from(chapter.version()))
        .bind(i64::from(chapter.revision()))
        .bind(chapter.created_at())
        .bind(chapter.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let id = res.last_insert_rowid();
        write_children(&mut tx, id, chapter).await?;
        tx.commit().await.map_err(db_err)?;

        chapter_id_from_i64(id)
    }

    async fn update_chapter(
        &self,
        chapter: &Chapter,
        expected_revision: u32,
    ) -> Result<(), StorageError> {
        let id = id_to_i64("chapter_id", chapter.id().value())?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let res = sqlx::query(
            r"
            UPDATE chapters SET
                title = ?2,
                description = ?3,
                is_published = ?4,
                total_estimated_minutes = ?5,
                version = ?6,
                revision = ?7,
                updated_at = ?8
            WHERE id = ?1 AND revision = ?9
            ",
        )
        .bind(id)
        .bind(chapter.title())
        .bind(chapter.description())
        .bind(bool_to_i64(chapter.is_published()))
        .bind(i64::from(chapter.total_estimated_minutes()))
        .bind(i64::from(chapter.version()))
        .bind(i64::from(chapter.revision()))
        .bind(chapter.updated_at())
        .bind(i64::from(expected_revision))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM chapters WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .is_some();
            return Err(if exists {
                StorageError::Conflict
            } else {
                StorageError::NotFound
            });
        }

        sqlx::query("DELETE FROM chapter_sections WHERE chapter_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chapter_prerequisites WHERE chapter_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        write_children(&mut tx, id, chapter).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_chapter(&self, id: ChapterId) -> Result<(), StorageError> {
        // `reading_progress.chapter_id` is ON DELETE RESTRICT, so a referenced
        // chapter fails here with a constraint violation (-> Conflict).
        let res = sqlx::query("DELETE FROM chapters WHERE id = ?1")
            .bind(id_to_i64("chapter_id", id.value())?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
