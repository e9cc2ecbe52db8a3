use crate::config::DatabaseConfig;
use crate::models::{
    Chapter, Comic, NewChapter, NewComic, ReadingHistory, ReadingProgress, UserPreferences,
};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors raised by persistence gateways
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("referenced record does not exist: {0}")]
    MissingReference(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Self::MissingReference(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
                Self::Constraint(db.message().to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Relational storage for comics, chapters, reading history and preferences
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_comic(&self, comic: &NewComic) -> Result<Comic, RepositoryError>;

    async fn find_comic(&self, id: Uuid) -> Result<Option<Comic>, RepositoryError>;

    async fn list_published_comics(&self) -> Result<Vec<Comic>, RepositoryError>;

    /// Delete a comic together with its chapters and reading history.
    /// Returns whether a row was removed.
    async fn delete_comic(&self, id: Uuid) -> Result<bool, RepositoryError>;

    async fn create_chapter(&self, chapter: &NewChapter) -> Result<Chapter, RepositoryError>;

    /// Chapters of a comic ordered by number
    async fn find_chapters(&self, comic_id: Uuid) -> Result<Vec<Chapter>, RepositoryError>;

    /// Insert or update the row keyed by `(user_id, comic_id)`
    async fn upsert_reading_history(
        &self,
        progress: &ReadingProgress,
    ) -> Result<ReadingHistory, RepositoryError>;

    /// History rows of a user, most recently updated first
    async fn find_reading_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<ReadingHistory>, RepositoryError>;

    async fn find_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPreferences>, RepositoryError>;

    /// Insert or update the row keyed by `user_id`
    async fn upsert_preferences(
        &self,
        preferences: &UserPreferences,
    ) -> Result<UserPreferences, RepositoryError>;

    /// Round-trip to the backing store, used by the readiness check
    async fn ping(&self) -> Result<(), RepositoryError>;
}

const COMIC_COLUMNS: &str = "id, title, description, author, artist, cover_image, \
                             genres, languages, status, created_at";

const CHAPTER_COLUMNS: &str = "id, number, title, file_path, comic_id, created_at";

const HISTORY_COLUMNS: &str = "id, user_id, comic_id, last_chapter, last_page, updated_at";

const PREFERENCES_COLUMNS: &str = "user_id, default_language, show_translations, \
                                   show_grammar_notes, difficulty_level, \
                                   auto_play_translations, updated_at";

/// Persistence gateway backed by PostgreSQL
pub struct PgPersistenceGateway {
    pool: PgPool,
}

impl PgPersistenceGateway {
    /// Create a new gateway with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for PgPersistenceGateway {
    #[instrument(skip(self, comic), fields(title = %comic.title))]
    async fn create_comic(&self, comic: &NewComic) -> Result<Comic, RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO comics (
                id, title, description, author, artist,
                cover_image, genres, languages, status, created_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, NOW()
            )
            RETURNING {COMIC_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<_, Comic>(&sql)
            .bind(Uuid::new_v4())
            .bind(&comic.title)
            .bind(&comic.description)
            .bind(&comic.author)
            .bind(&comic.artist)
            .bind(&comic.cover_image)
            .bind(&comic.genres)
            .bind(&comic.languages)
            .bind(comic.status)
            .fetch_one(&self.pool)
            .await?;

        debug!(comic_id = %created.id, "Comic created");
        Ok(created)
    }

    async fn find_comic(&self, id: Uuid) -> Result<Option<Comic>, RepositoryError> {
        let sql = format!("SELECT {COMIC_COLUMNS} FROM comics WHERE id = $1");

        let comic = sqlx::query_as::<_, Comic>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(comic)
    }

    async fn list_published_comics(&self) -> Result<Vec<Comic>, RepositoryError> {
        let sql = format!(
            "SELECT {COMIC_COLUMNS} FROM comics WHERE status = 'published' ORDER BY created_at DESC"
        );

        let comics = sqlx::query_as::<_, Comic>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(comics)
    }

    #[instrument(skip(self))]
    async fn delete_comic(&self, id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM comics WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!(comic_id = %id, rows = result.rows_affected(), "Comic deleted");
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, chapter), fields(comic_id = %chapter.comic_id, number = chapter.number))]
    async fn create_chapter(&self, chapter: &NewChapter) -> Result<Chapter, RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO chapters (id, comic_id, number, title, file_path, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING {CHAPTER_COLUMNS}
            "#
        );

        let created = sqlx::query_as::<_, Chapter>(&sql)
            .bind(Uuid::new_v4())
            .bind(chapter.comic_id)
            .bind(chapter.number)
            .bind(&chapter.title)
            .bind(&chapter.file_path)
            .fetch_one(&self.pool)
            .await?;

        Ok(created)
    }

    async fn find_chapters(&self, comic_id: Uuid) -> Result<Vec<Chapter>, RepositoryError> {
        let sql = format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE comic_id = $1 ORDER BY number ASC"
        );

        let chapters = sqlx::query_as::<_, Chapter>(&sql)
            .bind(comic_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(chapters)
    }

    #[instrument(skip(self, progress), fields(user_id = %progress.user_id, comic_id = %progress.comic_id))]
    async fn upsert_reading_history(
        &self,
        progress: &ReadingProgress,
    ) -> Result<ReadingHistory, RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO reading_history (
                id, user_id, comic_id, last_chapter, last_page, updated_at
            ) VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (user_id, comic_id) DO UPDATE SET
                last_chapter = EXCLUDED.last_chapter,
                last_page = EXCLUDED.last_page,
                updated_at = NOW()
            RETURNING {HISTORY_COLUMNS}
            "#
        );

        let history = sqlx::query_as::<_, ReadingHistory>(&sql)
            .bind(Uuid::new_v4())
            .bind(&progress.user_id)
            .bind(progress.comic_id)
            .bind(progress.last_chapter)
            .bind(progress.last_page)
            .fetch_one(&self.pool)
            .await?;

        Ok(history)
    }

    async fn find_reading_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<ReadingHistory>, RepositoryError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM reading_history WHERE user_id = $1 ORDER BY updated_at DESC"
        );

        let history = sqlx::query_as::<_, ReadingHistory>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(history)
    }

    async fn find_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPreferences>, RepositoryError> {
        let sql = format!("SELECT {PREFERENCES_COLUMNS} FROM user_preferences WHERE user_id = $1");

        let preferences = sqlx::query_as::<_, UserPreferences>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(preferences)
    }

    #[instrument(skip(self, preferences), fields(user_id = %preferences.user_id))]
    async fn upsert_preferences(
        &self,
        preferences: &UserPreferences,
    ) -> Result<UserPreferences, RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO user_preferences (
                user_id, default_language, show_translations, show_grammar_notes,
                difficulty_level, auto_play_translations, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                default_language = EXCLUDED.default_language,
                show_translations = EXCLUDED.show_translations,
                show_grammar_notes = EXCLUDED.show_grammar_notes,
                difficulty_level = EXCLUDED.difficulty_level,
                auto_play_translations = EXCLUDED.auto_play_translations,
                updated_at = NOW()
            RETURNING {PREFERENCES_COLUMNS}
            "#
        );

        let stored = sqlx::query_as::<_, UserPreferences>(&sql)
            .bind(&preferences.user_id)
            .bind(&preferences.default_language)
            .bind(preferences.show_translations)
            .bind(preferences.show_grammar_notes)
            .bind(preferences.difficulty_level)
            .bind(preferences.auto_play_translations)
            .fetch_one(&self.pool)
            .await?;

        Ok(stored)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
