use crate::persistence_gateway::RepositoryError;
use crate::storage_gateway::StorageError;
use axum::{
    extract::multipart::MultipartRejection,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A submission problem the client can correct
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("at least one genre is required")]
    NoGenres,

    #[error("at least one language is required")]
    NoLanguages,

    #[error("cover image is required")]
    MissingCoverImage,

    #[error("at least one chapter is required")]
    NoChapters,

    #[error("title for chapter {chapter} is required")]
    MissingChapterTitle { chapter: usize },

    #[error("file for chapter {chapter} is required")]
    MissingChapterFile { chapter: usize },

    #[error("{field} has unsupported content type {content_type}")]
    UnsupportedContentType {
        field: String,
        content_type: String,
    },

    #[error("{field} is malformed: {reason}")]
    Malformed { field: String, reason: String },
}

impl ValidationError {
    /// Name of the offending submission field
    pub fn field(&self) -> String {
        match self {
            Self::MissingField { field } => field.to_string(),
            Self::NoGenres => "genres".to_string(),
            Self::NoLanguages => "languages".to_string(),
            Self::MissingCoverImage => "coverImage".to_string(),
            Self::NoChapters => "chapters".to_string(),
            Self::MissingChapterTitle { chapter } => format!("chapters[{}].title", chapter - 1),
            Self::MissingChapterFile { chapter } => format!("chapter-{}", chapter - 1),
            Self::UnsupportedContentType { field, .. } | Self::Malformed { field, .. } => {
                field.clone()
            }
        }
    }
}

/// Pipeline step at which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Bucket,
    Cover,
    Comic,
    Chapter(usize),
    CoverUrl,
}

impl IngestStage {
    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::Cover => "cover",
            Self::Comic => "comic",
            Self::Chapter(_) => "chapter",
            Self::CoverUrl => "cover_url",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bucket => write!(f, "bucket setup"),
            Self::Cover => write!(f, "cover image"),
            Self::Comic => write!(f, "comic record"),
            Self::Chapter(number) => write!(f, "chapter {number}"),
            Self::CoverUrl => write!(f, "cover image URL"),
        }
    }
}

/// Failure of a comic ingestion
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to upload {stage}: {cause}")]
    Upload { stage: IngestStage, cause: StorageError },

    #[error("failed to persist {stage}: {cause}")]
    Persistence {
        stage: IngestStage,
        cause: RepositoryError,
    },
}

impl IngestError {
    /// Stage of an upload or persistence failure
    pub fn stage(&self) -> Option<IngestStage> {
        match self {
            Self::Validation(_) => None,
            Self::Upload { stage, .. } | Self::Persistence { stage, .. } => Some(*stage),
        }
    }
}

/// Errors surfaced by the HTTP API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::Ingest(IngestError::Validation(err))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Offending submission field of a validation error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Ingest(IngestError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            Self::Ingest(IngestError::Upload { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "UPLOAD_ERROR")
            }
            Self::Ingest(IngestError::Persistence { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR")
            }
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            Self::Repository(RepositoryError::Constraint(_)) => {
                (StatusCode::BAD_REQUEST, "CONSTRAINT_VIOLATION")
            }
            Self::Repository(RepositoryError::MissingReference(_)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            Self::Repository(RepositoryError::Database(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "QUERY_ERROR")
            }
        }
    }

    fn field(&self) -> Option<String> {
        match self {
            Self::Ingest(IngestError::Validation(err)) => Some(err.field()),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(error = %self, code = code, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            field: self.field(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_field_names() {
        assert_eq!(ValidationError::NoGenres.field(), "genres");
        assert_eq!(ValidationError::MissingCoverImage.field(), "coverImage");
        assert_eq!(
            ValidationError::MissingChapterFile { chapter: 2 }.field(),
            "chapter-1"
        );
        assert_eq!(
            ValidationError::MissingField { field: "title" }.to_string(),
            "title is required"
        );
    }

    #[test]
    fn test_chapter_stage_names_the_chapter() {
        let err = IngestError::Upload {
            stage: IngestStage::Chapter(2),
            cause: StorageError::Provider("timeout".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "failed to upload chapter 2: storage provider error: timeout"
        );
        assert_eq!(err.stage(), Some(IngestStage::Chapter(2)));
    }

    #[test]
    fn test_status_codes() {
        let validation: ApiError = ValidationError::NoChapters.into();
        assert_eq!(validation.status_and_code().0, StatusCode::BAD_REQUEST);

        let upload = ApiError::Ingest(IngestError::Upload {
            stage: IngestStage::Cover,
            cause: StorageError::Provider("down".to_string()),
        });
        assert_eq!(upload.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);

        let missing = ApiError::NotFound("Preferences not found".to_string());
        assert_eq!(missing.status_and_code().0, StatusCode::NOT_FOUND);
        assert_eq!(missing.field(), None);
    }

    #[tokio::test]
    async fn test_error_body_names_validation_field() {
        let response = ApiError::from(ValidationError::MissingCoverImage).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["field"], "coverImage");

        let response = ApiError::NotFound("Comic not found".to_string()).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body.get("field").is_none());
    }
}
