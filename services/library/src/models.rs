//! Records persisted by the library: comics, chapters, reading history and
//! reader preferences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lowest and highest selectable difficulty level
pub const DIFFICULTY_RANGE: std::ops::RangeInclusive<i16> = 1..=5;

/// Language a new reader starts with
pub const DEFAULT_LANGUAGE: &str = "en";

/// Publication status of a comic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "comic_status", rename_all = "lowercase")]
pub enum ComicStatus {
    Draft,
    Published,
}

/// A comic series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Comic {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub author: String,
    pub artist: String,
    /// Storage path of the cover image
    pub cover_image: String,
    pub genres: Vec<String>,
    pub languages: Vec<String>,
    pub status: ComicStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields required to create a comic
#[derive(Debug, Clone, PartialEq)]
pub struct NewComic {
    pub title: String,
    pub description: String,
    pub author: String,
    pub artist: String,
    pub cover_image: String,
    pub genres: Vec<String>,
    pub languages: Vec<String>,
    pub status: ComicStatus,
}

/// One chapter of a comic, backed by a single uploaded image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: Uuid,
    /// 1-based position in upload order
    pub number: i32,
    pub title: String,
    /// Storage path of the chapter image
    pub file_path: String,
    pub comic_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Fields required to create a chapter
#[derive(Debug, Clone, PartialEq)]
pub struct NewChapter {
    pub comic_id: Uuid,
    pub number: i32,
    pub title: String,
    pub file_path: String,
}

/// Where a user stopped reading a comic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReadingHistory {
    pub id: Uuid,
    pub user_id: String,
    pub comic_id: Uuid,
    pub last_chapter: i32,
    pub last_page: i32,
    pub updated_at: DateTime<Utc>,
}

/// Reading position to record for a (user, comic) pair
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingProgress {
    pub user_id: String,
    pub comic_id: Uuid,
    pub last_chapter: i32,
    pub last_page: i32,
}

/// Reader settings stored per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    pub user_id: String,
    pub default_language: String,
    pub show_translations: bool,
    pub show_grammar_notes: bool,
    pub difficulty_level: i16,
    pub auto_play_translations: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserPreferences {
    /// Preferences of a user who never changed anything
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            default_language: DEFAULT_LANGUAGE.to_string(),
            show_translations: true,
            show_grammar_notes: true,
            difficulty_level: *DIFFICULTY_RANGE.start(),
            auto_play_translations: false,
            updated_at: Utc::now(),
        }
    }

    /// Whether the difficulty level is within [`DIFFICULTY_RANGE`]
    pub fn has_valid_difficulty(&self) -> bool {
        DIFFICULTY_RANGE.contains(&self.difficulty_level)
    }
}
