//! Decoding of the multipart comic submission form.
//!
//! Text fields: `title`, `description`, `author`, `artist`. JSON fields:
//! `genres` and `languages` (arrays of strings), `chapters` (array of
//! `{title}`). Files: `coverImage` and `chapter-0` .. `chapter-N`.

use crate::error::{ApiError, ValidationError};
use crate::ingestion::{ChapterSubmission, ComicSubmission, UploadedFile};
use crate::storage_gateway::content_type_for_file_name;
use axum::extract::multipart::{Field, Multipart};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const CHAPTER_FILE_PREFIX: &str = "chapter-";

#[derive(Debug, Deserialize)]
struct ChapterDescriptor {
    #[serde(default)]
    title: String,
}

/// Read every part of the form into a submission. Missing parts are left
/// empty so the pipeline reports them with its own validation errors.
pub async fn read_submission(mut multipart: Multipart) -> Result<ComicSubmission, ApiError> {
    let mut submission = ComicSubmission::default();
    let mut descriptors: Vec<ChapterDescriptor> = Vec::new();
    let mut chapter_files: BTreeMap<usize, UploadedFile> = BTreeMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "title" => submission.title = read_text(field).await?,
            "description" => submission.description = read_text(field).await?,
            "author" => submission.author = read_text(field).await?,
            "artist" => submission.artist = read_text(field).await?,
            "genres" => submission.genres = parse_json_field("genres", &read_text(field).await?)?,
            "languages" => {
                submission.languages = parse_json_field("languages", &read_text(field).await?)?
            }
            "chapters" => descriptors = parse_json_field("chapters", &read_text(field).await?)?,
            "coverImage" => submission.cover_image = read_file(field).await?,
            other => match chapter_index(other) {
                Some(index) => {
                    if let Some(file) = read_file(field).await? {
                        chapter_files.insert(index, file);
                    }
                }
                None => debug!(field = other, "Ignoring unknown form field"),
            },
        }
    }

    submission.chapters = descriptors
        .into_iter()
        .enumerate()
        .map(|(index, descriptor)| ChapterSubmission {
            title: descriptor.title,
            file: chapter_files.remove(&index),
        })
        .collect();

    if !chapter_files.is_empty() {
        warn!(
            unmatched = chapter_files.len(),
            "Chapter files without a chapter entry were ignored"
        );
    }

    Ok(submission)
}

async fn read_text(field: Field<'_>) -> Result<String, ApiError> {
    let name = field.name().unwrap_or_default().to_string();
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read {name}: {e}")))
}

/// A file part with no file name and no content is what a browser sends
/// for an empty file input, so it counts as absent.
async fn read_file(field: Field<'_>) -> Result<Option<UploadedFile>, ApiError> {
    let name = field.name().unwrap_or_default().to_string();
    let file_name = field
        .file_name()
        .filter(|file_name| !file_name.is_empty())
        .map(str::to_string);
    let declared = field.content_type().map(str::to_string);

    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read {name}: {e}")))?;

    if file_name.is_none() && bytes.is_empty() {
        debug!(field = %name, "Skipping empty file part");
        return Ok(None);
    }

    let file_name = file_name.unwrap_or(name);
    Ok(Some(UploadedFile {
        content_type: resolve_content_type(declared.as_deref(), &file_name),
        file_name,
        bytes: bytes.to_vec(),
    }))
}

/// Declared content type, or a guess from the extension when the client
/// sent none or a generic one
fn resolve_content_type(declared: Option<&str>, file_name: &str) -> String {
    match declared {
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct.to_string(),
        _ => content_type_for_file_name(file_name).to_string(),
    }
}

fn chapter_index(field_name: &str) -> Option<usize> {
    field_name
        .strip_prefix(CHAPTER_FILE_PREFIX)
        .and_then(|index| index.parse().ok())
}

fn parse_json_field<T: serde::de::DeserializeOwned>(
    field: &str,
    raw: &str,
) -> Result<T, ApiError> {
    serde_json::from_str(raw).map_err(|e| {
        ValidationError::Malformed {
            field: field.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
