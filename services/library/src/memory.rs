//! In-memory gateways for local development (`service.in_memory`) and tests.
//!
//! Both gateways keep their state behind `tokio::sync::RwLock` and expose
//! failure injection hooks so callers can exercise error paths.

use crate::models::{
    Chapter, Comic, NewChapter, NewComic, ReadingHistory, ReadingProgress, UserPreferences,
};
use crate::persistence_gateway::{PersistenceGateway, RepositoryError};
use crate::storage_gateway::{
    expiry_from_now, is_allowed_content_type, SignedUrl, StorageError, StorageGateway,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryBucket {
    allowed_content_types: Vec<String>,
    objects: HashMap<String, Vec<u8>>,
}

/// Object storage held in process memory
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    buckets: RwLock<HashMap<String, MemoryBucket>>,
    failing_upload_markers: RwLock<Vec<String>>,
    fail_signing: AtomicBool,
    fail_deletes: AtomicBool,
    upload_attempts: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upload whose path contains `marker` fail
    pub async fn fail_uploads_containing(&self, marker: impl Into<String>) {
        self.failing_upload_markers.write().await.push(marker.into());
    }

    /// Make signed URL generation fail
    pub fn fail_signed_urls(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }

    /// Make deletes fail
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Number of upload calls received, successful or not
    pub fn upload_attempts(&self) -> usize {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, bucket: &str, path: &str) -> bool {
        self.buckets
            .read()
            .await
            .get(bucket)
            .map(|b| b.objects.contains_key(path))
            .unwrap_or(false)
    }

    /// Stored object paths in a bucket, sorted
    pub async fn paths(&self, bucket: &str) -> Vec<String> {
        let buckets = self.buckets.read().await;
        let mut paths: Vec<String> = buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    pub async fn bucket_exists(&self, bucket: &str) -> bool {
        self.buckets.read().await.contains_key(bucket)
    }

    /// Stored bytes of an object
    pub async fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.buckets
            .read()
            .await
            .get(bucket)
            .and_then(|b| b.objects.get(path).cloned())
    }
}

#[async_trait]
impl StorageGateway for InMemoryStorage {
    async fn ensure_bucket(
        &self,
        bucket: &str,
        allowed_content_types: &[String],
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_insert_with(|| MemoryBucket {
                allowed_content_types: allowed_content_types.to_vec(),
                objects: HashMap::new(),
            });
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failing_upload_markers
            .read()
            .await
            .iter()
            .any(|marker| path.contains(marker.as_str()));
        if injected {
            return Err(StorageError::Provider(format!("injected failure for {path}")));
        }

        let mut buckets = self.buckets.write().await;
        let target = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::Provider(format!("bucket {bucket} does not exist")))?;

        if !is_allowed_content_type(&target.allowed_content_types, content_type) {
            return Err(StorageError::ContentTypeNotAllowed {
                bucket: bucket.to_string(),
                content_type: content_type.to_string(),
            });
        }

        if target.objects.contains_key(path) {
            return Err(StorageError::AlreadyExists {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        target.objects.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<SignedUrl, StorageError> {
        if self.fail_signing.load(Ordering::SeqCst) {
            return Err(StorageError::Provider("injected signing failure".to_string()));
        }

        if !self.contains(bucket, path).await {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }

        let expires_at = expiry_from_now(ttl)?;
        Ok(SignedUrl {
            url: format!(
                "memory://{}/{}?expires={}",
                bucket,
                path,
                expires_at.timestamp()
            ),
            expires_at,
        })
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Provider("injected delete failure".to_string()));
        }

        if let Some(target) = self.buckets.write().await.get_mut(bucket) {
            target.objects.remove(path);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Tables {
    comics: HashMap<Uuid, Comic>,
    chapters: Vec<Chapter>,
    history: Vec<ReadingHistory>,
    preferences: HashMap<String, UserPreferences>,
}

/// Relational store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    tables: RwLock<Tables>,
    failing_chapters: RwLock<HashSet<i32>>,
    fail_comic_creation: AtomicBool,
    unavailable: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creation of chapters with this number fail
    pub async fn fail_chapter(&self, number: i32) {
        self.failing_chapters.write().await.insert(number);
    }

    /// Make comic creation fail
    pub fn fail_comic_creation(&self, fail: bool) {
        self.fail_comic_creation.store(fail, Ordering::SeqCst);
    }

    /// Make every operation fail as if the database were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All comics regardless of status
    pub async fn comics(&self) -> Vec<Comic> {
        self.tables.read().await.comics.values().cloned().collect()
    }

    /// All chapters regardless of comic
    pub async fn chapters(&self) -> Vec<Chapter> {
        self.tables.read().await.chapters.clone()
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Database("database unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryPersistence {
    async fn create_comic(&self, comic: &NewComic) -> Result<Comic, RepositoryError> {
        self.check_available()?;
        if self.fail_comic_creation.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database("injected comic failure".to_string()));
        }

        let created = Comic {
            id: Uuid::new_v4(),
            title: comic.title.clone(),
            description: comic.description.clone(),
            author: comic.author.clone(),
            artist: comic.artist.clone(),
            cover_image: comic.cover_image.clone(),
            genres: comic.genres.clone(),
            languages: comic.languages.clone(),
            status: comic.status,
            created_at: Utc::now(),
        };
        self.tables
            .write()
            .await
            .comics
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_comic(&self, id: Uuid) -> Result<Option<Comic>, RepositoryError> {
        self.check_available()?;
        Ok(self.tables.read().await.comics.get(&id).cloned())
    }

    async fn list_published_comics(&self) -> Result<Vec<Comic>, RepositoryError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        let mut comics: Vec<Comic> = tables
            .comics
            .values()
            .filter(|c| c.status == crate::models::ComicStatus::Published)
            .cloned()
            .collect();
        comics.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(comics)
    }

    async fn delete_comic(&self, id: Uuid) -> Result<bool, RepositoryError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let removed = tables.comics.remove(&id).is_some();
        tables.chapters.retain(|c| c.comic_id != id);
        tables.history.retain(|h| h.comic_id != id);
        Ok(removed)
    }

    async fn create_chapter(&self, chapter: &NewChapter) -> Result<Chapter, RepositoryError> {
        self.check_available()?;
        if self.failing_chapters.read().await.contains(&chapter.number) {
            return Err(RepositoryError::Database(format!(
                "injected failure for chapter {}",
                chapter.number
            )));
        }

        let mut tables = self.tables.write().await;
        if !tables.comics.contains_key(&chapter.comic_id) {
            return Err(RepositoryError::MissingReference(format!(
                "comic {}",
                chapter.comic_id
            )));
        }
        let duplicate = tables
            .chapters
            .iter()
            .any(|c| c.comic_id == chapter.comic_id && c.number == chapter.number);
        if duplicate {
            return Err(RepositoryError::Constraint(format!(
                "chapter {} already exists for comic {}",
                chapter.number, chapter.comic_id
            )));
        }

        let created = Chapter {
            id: Uuid::new_v4(),
            number: chapter.number,
            title: chapter.title.clone(),
            file_path: chapter.file_path.clone(),
            comic_id: chapter.comic_id,
            created_at: Utc::now(),
        };
        tables.chapters.push(created.clone());
        Ok(created)
    }

    async fn find_chapters(&self, comic_id: Uuid) -> Result<Vec<Chapter>, RepositoryError> {
        self.check_available()?;
        let mut chapters: Vec<Chapter> = self
            .tables
            .read()
            .await
            .chapters
            .iter()
            .filter(|c| c.comic_id == comic_id)
            .cloned()
            .collect();
        chapters.sort_by_key(|c| c.number);
        Ok(chapters)
    }

    async fn upsert_reading_history(
        &self,
        progress: &ReadingProgress,
    ) -> Result<ReadingHistory, RepositoryError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        if !tables.comics.contains_key(&progress.comic_id) {
            return Err(RepositoryError::MissingReference(format!(
                "comic {}",
                progress.comic_id
            )));
        }

        let now = Utc::now();
        let existing = tables
            .history
            .iter_mut()
            .find(|h| h.user_id == progress.user_id && h.comic_id == progress.comic_id);

        let row = match existing {
            Some(row) => {
                row.last_chapter = progress.last_chapter;
                row.last_page = progress.last_page;
                row.updated_at = now;
                row.clone()
            }
            None => {
                let row = ReadingHistory {
                    id: Uuid::new_v4(),
                    user_id: progress.user_id.clone(),
                    comic_id: progress.comic_id,
                    last_chapter: progress.last_chapter,
                    last_page: progress.last_page,
                    updated_at: now,
                };
                tables.history.push(row.clone());
                row
            }
        };
        Ok(row)
    }

    async fn find_reading_history(
        &self,
        user_id: &str,
    ) -> Result<Vec<ReadingHistory>, RepositoryError> {
        self.check_available()?;
        let mut rows: Vec<ReadingHistory> = self
            .tables
            .read()
            .await
            .history
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn find_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<UserPreferences>, RepositoryError> {
        self.check_available()?;
        Ok(self.tables.read().await.preferences.get(user_id).cloned())
    }

    async fn upsert_preferences(
        &self,
        preferences: &UserPreferences,
    ) -> Result<UserPreferences, RepositoryError> {
        self.check_available()?;
        if !preferences.has_valid_difficulty() {
            return Err(RepositoryError::Constraint(format!(
                "difficulty_level {} out of range",
                preferences.difficulty_level
            )));
        }

        let mut stored = preferences.clone();
        stored.updated_at = Utc::now();
        self.tables
            .write()
            .await
            .preferences
            .insert(stored.user_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        self.check_available()
    }
}
