use std::sync::Arc;
use std::time::Duration;

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use thiserror::Error;

use crate::repository::{ChapterLookup, ChapterRepository, ProgressRepository, Storage};

mod chapter_repo;
mod mapping;
mod migrate;
mod progress_repo;

/// Chapters and reading progress in one `SQLite` database.
///
/// Progress commands rely on the `(student_id, chapter_id)` unique key for
/// their upserts and on the `RESTRICT` foreign key from `reading_progress`
/// to `chapters` to refuse deleting chapters students have touched.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqliteInitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl SqliteRepository {
    /// Open a pool on `database_url`.
    ///
    /// `SQLite` leaves foreign keys off per connection, so every pooled
    /// connection turns them on; chapter deletion and orphan-free progress
    /// depend on it. The busy timeout is set first so concurrent progress
    /// writers queue on the write lock instead of failing.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the connection or connection setup fails.
    pub async fn connect(database_url: &str) -> Result<Self, SqliteInitError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    for pragma in [
                        "PRAGMA busy_timeout = 5000;",
                        "PRAGMA foreign_keys = ON;",
                        "PRAGMA journal_mode = WAL;",
                    ] {
                        sqlx::query(pragma).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        tracing::debug!(url = database_url, "course database pool connected");
        Ok(Self { pool })
    }

    /// Create the chapter and progress tables, recording applied versions.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if a migration statement fails.
    pub async fn migrate(&self) -> Result<(), SqliteInitError> {
        migrate::run_migrations(&self.pool).await
    }
}

impl Storage {
    /// Chapter and progress repositories over one migrated `SQLite` pool.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if connection or migrations fail.
    pub async fn sqlite(database_url: &str) -> Result<Self, SqliteInitError> {
        let repo = SqliteRepository::connect(database_url).await?;
        repo.migrate().await?;
        let chapters: Arc<dyn ChapterRepository> = Arc::new(repo.clone());
        let chapter_lookup: Arc<dyn ChapterLookup> = Arc::new(repo.clone());
        let progress: Arc<dyn ProgressRepository> = Arc::new(repo);
        Ok(Self {
            chapters,
            chapter_lookup,
            progress,
        })
    }
}
