//! Local-first reader preferences with optional server sync.
//!
//! The local copy is the write-ahead copy: updates land there first and are
//! pushed to the persistence gateway only when the user is known.

use crate::models::{UserPreferences, DEFAULT_LANGUAGE, DIFFICULTY_RANGE};
use crate::persistence_gateway::{PersistenceGateway, RepositoryError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum PreferencesError {
    #[error("difficulty level {0} must be between 1 and 5")]
    InvalidDifficulty(i16),

    #[error("local preferences unavailable: {0}")]
    Local(String),

    #[error("failed to sync preferences: {0}")]
    Remote(#[from] RepositoryError),
}

/// Settings a reader can change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub default_language: String,
    pub show_translations: bool,
    pub show_grammar_notes: bool,
    pub difficulty_level: i16,
    pub auto_play_translations: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            default_language: DEFAULT_LANGUAGE.to_string(),
            show_translations: true,
            show_grammar_notes: true,
            difficulty_level: *DIFFICULTY_RANGE.start(),
            auto_play_translations: false,
        }
    }
}

impl Preferences {
    pub fn into_record(self, user_id: impl Into<String>) -> UserPreferences {
        UserPreferences {
            user_id: user_id.into(),
            default_language: self.default_language,
            show_translations: self.show_translations,
            show_grammar_notes: self.show_grammar_notes,
            difficulty_level: self.difficulty_level,
            auto_play_translations: self.auto_play_translations,
            updated_at: Utc::now(),
        }
    }
}

impl From<&UserPreferences> for Preferences {
    fn from(record: &UserPreferences) -> Self {
        Self {
            default_language: record.default_language.clone(),
            show_translations: record.show_translations,
            show_grammar_notes: record.show_grammar_notes,
            difficulty_level: record.difficulty_level,
            auto_play_translations: record.auto_play_translations,
        }
    }
}

/// A partial change; absent fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesUpdate {
    pub default_language: Option<String>,
    pub show_translations: Option<bool>,
    pub show_grammar_notes: Option<bool>,
    pub difficulty_level: Option<i16>,
    pub auto_play_translations: Option<bool>,
}

impl PreferencesUpdate {
    /// Merge onto `base`, rejecting an out-of-range difficulty
    pub fn apply(&self, base: &Preferences) -> Result<Preferences, PreferencesError> {
        let merged = Preferences {
            default_language: self
                .default_language
                .clone()
                .unwrap_or_else(|| base.default_language.clone()),
            show_translations: self.show_translations.unwrap_or(base.show_translations),
            show_grammar_notes: self.show_grammar_notes.unwrap_or(base.show_grammar_notes),
            difficulty_level: self.difficulty_level.unwrap_or(base.difficulty_level),
            auto_play_translations: self
                .auto_play_translations
                .unwrap_or(base.auto_play_translations),
        };

        if !DIFFICULTY_RANGE.contains(&merged.difficulty_level) {
            return Err(PreferencesError::InvalidDifficulty(merged.difficulty_level));
        }
        Ok(merged)
    }
}

/// Device-local persistence for a single preferences value
#[async_trait]
pub trait LocalPreferenceStorage: Send + Sync {
    async fn read(&self) -> Result<Option<Preferences>, PreferencesError>;

    async fn write(&self, preferences: &Preferences) -> Result<(), PreferencesError>;

    async fn clear(&self) -> Result<(), PreferencesError>;
}

/// Preferences kept as a JSON document on disk
pub struct JsonFilePreferences {
    path: PathBuf,
}

impl JsonFilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LocalPreferenceStorage for JsonFilePreferences {
    async fn read(&self) -> Result<Option<Preferences>, PreferencesError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PreferencesError::Local(e.to_string())),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PreferencesError::Local(format!("{}: {e}", self.path.display())))
    }

    async fn write(&self, preferences: &Preferences) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PreferencesError::Local(e.to_string()))?;
        }

        let json = serde_json::to_vec_pretty(preferences)
            .map_err(|e| PreferencesError::Local(e.to_string()))?;

        // Write then rename so readers never see a half-written file
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| PreferencesError::Local(e.to_string()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| PreferencesError::Local(e.to_string()))
    }

    async fn clear(&self) -> Result<(), PreferencesError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PreferencesError::Local(e.to_string())),
        }
    }
}

/// Preferences held in process memory
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    slot: RwLock<Option<Preferences>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalPreferenceStorage for MemoryPreferences {
    async fn read(&self) -> Result<Option<Preferences>, PreferencesError> {
        Ok(self.slot.read().await.clone())
    }

    async fn write(&self, preferences: &Preferences) -> Result<(), PreferencesError> {
        *self.slot.write().await = Some(preferences.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), PreferencesError> {
        *self.slot.write().await = None;
        Ok(())
    }
}

/// Where the current preferences came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferencesSource {
    Local,
    Remote,
    Default,
}

/// Local-first preferences of one reader
pub struct PreferencesStore {
    local: Arc<dyn LocalPreferenceStorage>,
    remote: Arc<dyn PersistenceGateway>,
    user_id: Option<String>,
    current: Preferences,
    source: PreferencesSource,
    last_error: Option<String>,
}

impl PreferencesStore {
    /// `user_id` is `None` for anonymous readers, who never sync
    pub fn new(
        local: Arc<dyn LocalPreferenceStorage>,
        remote: Arc<dyn PersistenceGateway>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            local,
            remote,
            user_id,
            current: Preferences::default(),
            source: PreferencesSource::Default,
            last_error: None,
        }
    }

    pub fn preferences(&self) -> &Preferences {
        &self.current
    }

    pub fn source(&self) -> PreferencesSource {
        self.source
    }

    /// Message of the most recent load or sync failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Resolve preferences: local copy, then the server, then defaults
    pub async fn load(&mut self) -> &Preferences {
        match self.local.read().await {
            Ok(Some(local)) => {
                self.set(local, PreferencesSource::Local);
                return &self.current;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable local preferences");
                self.last_error = Some(e.to_string());
            }
        }

        if let Some(user_id) = self.user_id.clone() {
            match self.remote.find_preferences(&user_id).await {
                Ok(Some(record)) => {
                    self.set(Preferences::from(&record), PreferencesSource::Remote);
                    return &self.current;
                }
                Ok(None) => debug!(user_id = %user_id, "No stored preferences"),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Failed to fetch preferences");
                    self.last_error = Some(e.to_string());
                }
            }
        }

        self.set(Preferences::default(), PreferencesSource::Default);
        &self.current
    }

    /// Merge `update`, save it locally, then push it to the server when the
    /// user is known. A push failure is returned while the local write stands.
    pub async fn update(
        &mut self,
        update: &PreferencesUpdate,
    ) -> Result<Preferences, PreferencesError> {
        let merged = update.apply(&self.current)?;

        self.local.write(&merged).await?;
        self.set(merged.clone(), PreferencesSource::Local);

        if let Some(user_id) = &self.user_id {
            let record = merged.clone().into_record(user_id.as_str());
            if let Err(e) = self.remote.upsert_preferences(&record).await {
                warn!(user_id = %user_id, error = %e, "Preferences saved locally but not synced");
                self.last_error = Some(e.to_string());
                return Err(PreferencesError::Remote(e));
            }
        }

        self.last_error = None;
        Ok(merged)
    }

    /// Forget the local copy and return to defaults
    pub async fn reset(&mut self) -> Result<(), PreferencesError> {
        self.local.clear().await?;
        self.current = Preferences::default();
        self.source = PreferencesSource::Default;
        self.last_error = None;
        Ok(())
    }

    fn set(&mut self, preferences: Preferences, source: PreferencesSource) {
        self.current = preferences;
        self.source = source;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPersistence;
    use crate::persistence_gateway::MockPersistenceGateway;

    fn spanish() -> Preferences {
        Preferences {
            default_language: "es".to_string(),
            ..Preferences::default()
        }
    }

    #[tokio::test]
    async fn test_local_copy_wins() {
        let local = Arc::new(MemoryPreferences::new());
        local.write(&spanish()).await.unwrap();
        // Any remote call would panic
        let mut store = PreferencesStore::new(
            local,
            Arc::new(MockPersistenceGateway::new()),
            Some("user-1".to_string()),
        );

        assert_eq!(store.load().await, &spanish());
        assert_eq!(store.source(), PreferencesSource::Local);
    }

    #[tokio::test]
    async fn test_remote_used_when_no_local_copy() {
        let remote = Arc::new(InMemoryPersistence::new());
        let mut record = UserPreferences::defaults_for("user-1");
        record.difficulty_level = 4;
        remote.upsert_preferences(&record).await.unwrap();

        let mut store = PreferencesStore::new(
            Arc::new(MemoryPreferences::new()),
            remote,
            Some("user-1".to_string()),
        );

        assert_eq!(store.load().await.difficulty_level, 4);
        assert_eq!(store.source(), PreferencesSource::Remote);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_defaults() {
        let remote = Arc::new(InMemoryPersistence::new());
        remote.set_unavailable(true);
        let mut store = PreferencesStore::new(
            Arc::new(MemoryPreferences::new()),
            remote,
            Some("user-1".to_string()),
        );

        assert_eq!(store.load().await, &Preferences::default());
        assert_eq!(store.source(), PreferencesSource::Default);
        assert!(store.last_error().is_some());
    }

    #[tokio::test]
    async fn test_anonymous_update_stays_local() {
        let local = Arc::new(MemoryPreferences::new());
        let mut store = PreferencesStore::new(
            local.clone(),
            Arc::new(MockPersistenceGateway::new()),
            None,
        );

        let update = PreferencesUpdate {
            auto_play_translations: Some(true),
            ..PreferencesUpdate::default()
        };
        let merged = store.update(&update).await.unwrap();

        assert!(merged.auto_play_translations);
        assert_eq!(merged.default_language, "en");
        assert_eq!(local.read().await.unwrap(), Some(merged));
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_local_write() {
        let local = Arc::new(MemoryPreferences::new());
        let remote = Arc::new(InMemoryPersistence::new());
        remote.set_unavailable(true);
        let mut store =
            PreferencesStore::new(local.clone(), remote, Some("user-1".to_string()));

        let update = PreferencesUpdate {
            difficulty_level: Some(3),
            ..PreferencesUpdate::default()
        };
        let err = store.update(&update).await.unwrap_err();

        assert!(matches!(err, PreferencesError::Remote(_)));
        assert_eq!(local.read().await.unwrap().unwrap().difficulty_level, 3);
        assert_eq!(store.preferences().difficulty_level, 3);
        assert!(store.last_error().is_some());
    }

    #[tokio::test]
    async fn test_update_syncs_merged_preferences() {
        let remote = Arc::new(InMemoryPersistence::new());
        let mut store = PreferencesStore::new(
            Arc::new(MemoryPreferences::new()),
            remote.clone(),
            Some("user-1".to_string()),
        );

        store
            .update(&PreferencesUpdate {
                default_language: Some("ja".to_string()),
                ..PreferencesUpdate::default()
            })
            .await
            .unwrap();

        let stored = remote.find_preferences("user-1").await.unwrap().unwrap();
        assert_eq!(stored.default_language, "ja");
        assert!(stored.show_grammar_notes);
    }

    #[tokio::test]
    async fn test_invalid_difficulty_writes_nothing() {
        let local = Arc::new(MemoryPreferences::new());
        let mut store = PreferencesStore::new(
            local.clone(),
            Arc::new(MockPersistenceGateway::new()),
            Some("user-1".to_string()),
        );

        let err = store
            .update(&PreferencesUpdate {
                difficulty_level: Some(9),
                ..PreferencesUpdate::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PreferencesError::InvalidDifficulty(9)));
        assert_eq!(local.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_file_round_trip_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(JsonFilePreferences::new(
            dir.path().join("reader").join("preferences.json"),
        ));
        let mut store = PreferencesStore::new(
            file.clone(),
            Arc::new(MockPersistenceGateway::new()),
            None,
        );

        store
            .update(&PreferencesUpdate {
                show_translations: Some(false),
                ..PreferencesUpdate::default()
            })
            .await
            .unwrap();

        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(raw.contains("\"showTranslations\": false"));

        let mut reopened = PreferencesStore::new(
            file.clone(),
            Arc::new(MockPersistenceGateway::new()),
            None,
        );
        assert!(!reopened.load().await.show_translations);

        reopened.reset().await.unwrap();
        assert!(!file.path().exists());
        assert_eq!(reopened.preferences(), &Preferences::default());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");
        std::fs::write(&path, "{not json").unwrap();

        let mut store = PreferencesStore::new(
            Arc::new(JsonFilePreferences::new(path)),
            Arc::new(MockPersistenceGateway::new()),
            None,
        );

        assert_eq!(store.load().await, &Preferences::default());
        assert!(store.last_error().unwrap().contains("preferences.json"));
    }
}
