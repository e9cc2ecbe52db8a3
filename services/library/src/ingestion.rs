//! Comic ingestion pipeline.
//!
//! Turns one submission (metadata, a cover image and N chapter images) into a
//! published comic with its chapters, or leaves nothing behind:
//!
//! 1. validate the submission (no gateway calls on failure)
//! 2. ensure the bucket exists
//! 3. upload the cover
//! 4. create the comic record (from here on every failure rolls back)
//! 5. upload each chapter image and create its record, concurrently
//! 6. sign a read URL for the cover
//!
//! Rollback deletes the comic (chapters cascade), the chapter images uploaded
//! so far (unless disabled) and the cover image. Rollback failures are logged
//! and never replace the error that caused them.

use crate::config::Config;
use crate::error::{IngestError, IngestStage, ValidationError};
use crate::models::{Chapter, Comic, ComicStatus, NewChapter, NewComic};
use crate::persistence_gateway::PersistenceGateway;
use crate::storage_gateway::{is_allowed_content_type, ObjectPaths, SignedUrl, StorageGateway};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A file received with a submission
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// One chapter of a submission
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterSubmission {
    pub title: String,
    pub file: Option<UploadedFile>,
}

/// Everything an admin submits to create a comic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComicSubmission {
    pub title: String,
    pub description: String,
    pub author: String,
    pub artist: String,
    pub genres: Vec<String>,
    pub languages: Vec<String>,
    pub cover_image: Option<UploadedFile>,
    pub chapters: Vec<ChapterSubmission>,
}

/// A successfully ingested comic
#[derive(Debug, Clone)]
pub struct IngestedComic {
    pub comic: Comic,
    /// Ordered by chapter number
    pub chapters: Vec<Chapter>,
    pub cover_image_url: SignedUrl,
}

/// Knobs of the pipeline, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct IngestionSettings {
    pub bucket: String,
    pub allowed_content_types: Vec<String>,
    pub signed_url_ttl: Duration,
    pub chapter_concurrency: usize,
    pub cleanup_chapter_blobs: bool,
}

impl IngestionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bucket: config.storage.bucket.clone(),
            allowed_content_types: config.storage.allowed_content_types.clone(),
            signed_url_ttl: config.signed_url_expiry(),
            chapter_concurrency: config.ingestion.chapter_concurrency.max(1),
            cleanup_chapter_blobs: config.ingestion.cleanup_chapter_blobs,
        }
    }
}

#[derive(Debug)]
struct ValidChapter {
    number: i32,
    title: String,
    file: UploadedFile,
}

#[derive(Debug)]
struct ValidSubmission {
    title: String,
    description: String,
    author: String,
    artist: String,
    genres: Vec<String>,
    languages: Vec<String>,
    cover: UploadedFile,
    chapters: Vec<ValidChapter>,
}

enum ChapterOutcome {
    Created(Chapter),
    Failed {
        error: IngestError,
        uploaded_path: Option<String>,
    },
    /// Not started because another chapter already failed
    Skipped,
}

struct ChapterBatchFailure {
    error: IngestError,
    uploaded_paths: Vec<String>,
}

/// Orchestrates storage and persistence gateways to ingest comics
pub struct IngestionPipeline {
    storage: Arc<dyn StorageGateway>,
    persistence: Arc<dyn PersistenceGateway>,
    paths: ObjectPaths,
    settings: IngestionSettings,
}

impl IngestionPipeline {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        persistence: Arc<dyn PersistenceGateway>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            storage,
            persistence,
            paths: ObjectPaths::new(),
            settings,
        }
    }

    /// Ingest one submission. Not idempotent: every call that succeeds
    /// creates a new comic under new storage paths.
    #[instrument(skip(self, submission), fields(title = %submission.title, chapters = submission.chapters.len()))]
    pub async fn ingest(&self, submission: ComicSubmission) -> Result<IngestedComic, IngestError> {
        let started = Instant::now();
        let result = self.run(submission).await;

        match &result {
            Ok(ingested) => {
                metrics::counter!("library.comics.ingested").increment(1);
                metrics::histogram!("library.ingest.duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(
                    comic_id = %ingested.comic.id,
                    chapters = ingested.chapters.len(),
                    "Comic ingested"
                );
            }
            Err(e) => {
                let stage = e.stage().map(|s| s.label()).unwrap_or("validation");
                metrics::counter!("library.ingest.failures", "stage" => stage).increment(1);
                warn!(error = %e, stage = stage, "Comic ingestion failed");
            }
        }

        result
    }

    async fn run(&self, submission: ComicSubmission) -> Result<IngestedComic, IngestError> {
        let submission = validate(submission, &self.settings.allowed_content_types)?;
        let bucket = self.settings.bucket.as_str();

        self.storage
            .ensure_bucket(bucket, &self.settings.allowed_content_types)
            .await
            .map_err(|cause| IngestError::Upload {
                stage: IngestStage::Bucket,
                cause,
            })?;

        let cover_path = self.paths.cover(&submission.cover.file_name);
        self.storage
            .upload(
                bucket,
                &cover_path,
                submission.cover.bytes,
                &submission.cover.content_type,
            )
            .await
            .map_err(|cause| IngestError::Upload {
                stage: IngestStage::Cover,
                cause,
            })?;
        debug!(path = %cover_path, "Cover uploaded");

        let new_comic = NewComic {
            title: submission.title,
            description: submission.description,
            author: submission.author,
            artist: submission.artist,
            cover_image: cover_path.clone(),
            genres: submission.genres,
            languages: submission.languages,
            status: ComicStatus::Published,
        };

        let comic = match self.persistence.create_comic(&new_comic).await {
            Ok(comic) => comic,
            Err(cause) => {
                self.rollback(None, &cover_path, &[]).await;
                return Err(IngestError::Persistence {
                    stage: IngestStage::Comic,
                    cause,
                });
            }
        };

        let chapters = match self.ingest_chapters(comic.id, submission.chapters).await {
            Ok(chapters) => chapters,
            Err(failure) => {
                self.rollback(Some(comic.id), &cover_path, &failure.uploaded_paths)
                    .await;
                return Err(failure.error);
            }
        };

        let cover_image_url = match self
            .storage
            .signed_url(bucket, &cover_path, self.settings.signed_url_ttl)
            .await
        {
            Ok(url) => url,
            Err(cause) => {
                let chapter_paths: Vec<String> =
                    chapters.iter().map(|c| c.file_path.clone()).collect();
                self.rollback(Some(comic.id), &cover_path, &chapter_paths)
                    .await;
                return Err(IngestError::Upload {
                    stage: IngestStage::CoverUrl,
                    cause,
                });
            }
        };

        Ok(IngestedComic {
            comic,
            chapters,
            cover_image_url,
        })
    }

    /// Upload and record chapters concurrently. The first failure stops
    /// scheduling; in-flight chapters are drained so every uploaded path is
    /// known to the rollback.
    async fn ingest_chapters(
        &self,
        comic_id: Uuid,
        chapters: Vec<ValidChapter>,
    ) -> Result<Vec<Chapter>, ChapterBatchFailure> {
        let aborted = AtomicBool::new(false);

        let mut outcomes = stream::iter(chapters)
            .map(|chapter| self.ingest_chapter(comic_id, chapter, &aborted))
            .buffer_unordered(self.settings.chapter_concurrency);

        let mut created = Vec::new();
        let mut uploaded_paths = Vec::new();
        let mut first_error: Option<IngestError> = None;

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                ChapterOutcome::Created(chapter) => {
                    uploaded_paths.push(chapter.file_path.clone());
                    created.push(chapter);
                }
                ChapterOutcome::Failed {
                    error,
                    uploaded_path,
                } => {
                    aborted.store(true, Ordering::SeqCst);
                    uploaded_paths.extend(uploaded_path);
                    if first_error.is_none() {
                        first_error = Some(error);
                    } else {
                        debug!(error = %error, "Ignoring subsequent chapter failure");
                    }
                }
                ChapterOutcome::Skipped => {}
            }
        }

        if let Some(error) = first_error {
            return Err(ChapterBatchFailure {
                error,
                uploaded_paths,
            });
        }

        created.sort_by_key(|c| c.number);
        Ok(created)
    }

    async fn ingest_chapter(
        &self,
        comic_id: Uuid,
        chapter: ValidChapter,
        aborted: &AtomicBool,
    ) -> ChapterOutcome {
        if aborted.load(Ordering::SeqCst) {
            return ChapterOutcome::Skipped;
        }

        let stage = IngestStage::Chapter(chapter.number as usize);
        let path = self.paths.chapter(comic_id, &chapter.file.file_name);

        if let Err(cause) = self
            .storage
            .upload(
                &self.settings.bucket,
                &path,
                chapter.file.bytes,
                &chapter.file.content_type,
            )
            .await
        {
            return ChapterOutcome::Failed {
                error: IngestError::Upload { stage, cause },
                uploaded_path: None,
            };
        }

        let new_chapter = NewChapter {
            comic_id,
            number: chapter.number,
            title: chapter.title,
            file_path: path.clone(),
        };

        match self.persistence.create_chapter(&new_chapter).await {
            Ok(created) => {
                debug!(number = created.number, path = %created.file_path, "Chapter stored");
                ChapterOutcome::Created(created)
            }
            Err(cause) => ChapterOutcome::Failed {
                error: IngestError::Persistence { stage, cause },
                uploaded_path: Some(path),
            },
        }
    }

    /// Compensate for a failure after the cover upload
    async fn rollback(&self, comic_id: Option<Uuid>, cover_path: &str, chapter_paths: &[String]) {
        metrics::counter!("library.ingest.rollbacks").increment(1);
        warn!(
            comic_id = ?comic_id,
            chapter_blobs = chapter_paths.len(),
            "Rolling back comic ingestion"
        );

        let bucket = self.settings.bucket.as_str();

        if let Some(id) = comic_id {
            if let Err(e) = self.persistence.delete_comic(id).await {
                error!(comic_id = %id, error = %e, "Rollback failed to delete comic");
            }
        }

        if self.settings.cleanup_chapter_blobs {
            for path in chapter_paths {
                if let Err(e) = self.storage.delete(bucket, path).await {
                    error!(path = %path, error = %e, "Rollback failed to delete chapter image");
                }
            }
        } else if !chapter_paths.is_empty() {
            warn!(
                count = chapter_paths.len(),
                "Chapter image cleanup disabled, leaving uploaded chapter images"
            );
        }

        if let Err(e) = self.storage.delete(bucket, cover_path).await {
            error!(path = %cover_path, error = %e, "Rollback failed to delete cover image");
        }
    }
}

/// Check a submission before anything touches storage or the database
fn validate(
    submission: ComicSubmission,
    allowed_content_types: &[String],
) -> Result<ValidSubmission, ValidationError> {
    let title = required(submission.title, "title")?;
    let description = required(submission.description, "description")?;
    let author = required(submission.author, "author")?;
    let artist = required(submission.artist, "artist")?;

    let genres = normalize_tags(submission.genres);
    if genres.is_empty() {
        return Err(ValidationError::NoGenres);
    }

    let languages = normalize_tags(submission.languages);
    if languages.is_empty() {
        return Err(ValidationError::NoLanguages);
    }

    let cover = submission
        .cover_image
        .ok_or(ValidationError::MissingCoverImage)?;
    check_content_type(&cover, "coverImage", allowed_content_types)?;

    if submission.chapters.is_empty() {
        return Err(ValidationError::NoChapters);
    }

    let mut chapters = Vec::with_capacity(submission.chapters.len());
    for (index, chapter) in submission.chapters.into_iter().enumerate() {
        let number = index + 1;

        let title = chapter.title.trim().to_string();
        if title.is_empty() {
            return Err(ValidationError::MissingChapterTitle { chapter: number });
        }

        let file = chapter
            .file
            .ok_or(ValidationError::MissingChapterFile { chapter: number })?;
        check_content_type(&file, &format!("chapter-{index}"), allowed_content_types)?;

        let number = i32::try_from(number).map_err(|_| ValidationError::Malformed {
            field: "chapters".to_string(),
            reason: "too many chapters".to_string(),
        })?;

        chapters.push(ValidChapter {
            number,
            title,
            file,
        });
    }

    Ok(ValidSubmission {
        title,
        description,
        author,
        artist,
        genres,
        languages,
        cover,
        chapters,
    })
}

fn required(value: String, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::MissingField { field })
    } else {
        Ok(trimmed.to_string())
    }
}

/// Trim, drop empty entries and deduplicate while keeping first-seen order
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !normalized.iter().any(|t| t == tag) {
            normalized.push(tag.to_string());
        }
    }
    normalized
}

fn check_content_type(
    file: &UploadedFile,
    field: &str,
    allowed_content_types: &[String],
) -> Result<(), ValidationError> {
    if is_allowed_content_type(allowed_content_types, &file.content_type) {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedContentType {
            field: field.to_string(),
            content_type: file.content_type.clone(),
        })
    }
}
