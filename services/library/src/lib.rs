//! Panelingo Library Service
//!
//! Back end of a multilingual graphic-novel reader. Admins upload a comic
//! (metadata, cover and chapter images) as one submission; readers browse
//! published comics, track their reading position, keep reader preferences
//! and ask for translation overlays of a page.
//!
//! ## Features
//!
//! - **All-or-nothing ingestion**: a failed chapter rolls back the comic
//!   record and every image uploaded for it
//! - **Object storage**: S3-compatible bucket with a content-type allow-list,
//!   no-overwrite uploads and signed read URLs
//! - **Relational records**: PostgreSQL tables for comics, chapters, reading
//!   history and preferences, with idempotent upserts
//! - **Reader overlay**: target-language bubble text with native-language
//!   popups and grammar notes
//! - **Local-first preferences**: device copy first, server sync second
//!
//! ## Architecture
//!
//! ```text
//!   multipart form            S3 Bucket                 PostgreSQL
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ POST /comics │          │ covers/      │          │ comics       │
//! └──────────────┘          │ chapters/    │          │ chapters     │
//!        │                  │   {comicId}/ │          │ history      │
//!        ▼                  └──────────────┘          │ preferences  │
//! ┌──────────────┐                 ▲                  └──────────────┘
//! │ Ingestion    │                 │                         ▲
//! │ Pipeline     │──────┬──────────┘                         │
//! └──────────────┘      │                                    │
//!                       ▼                                    │
//!              ┌──────────────┐     ┌──────────────┐         │
//!              │ Storage      │     │ Persistence  │─────────┘
//!              │ Gateway      │     │ Gateway      │
//!              └──────────────┘     └──────────────┘
//!                       ▲                  ▲
//!                       └────────┬─────────┘
//!                         ┌──────────────┐
//!                         │ Reader API   │ comics, history,
//!                         │              │ preferences, overlay
//!                         └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod form;
pub mod ingestion;
pub mod memory;
pub mod models;
pub mod overlay;
pub mod persistence_gateway;
pub mod preferences;
pub mod storage_gateway;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use error::{ApiError, IngestError, IngestStage, ValidationError};
pub use ingestion::{ComicSubmission, IngestedComic, IngestionPipeline, IngestionSettings};
pub use memory::{InMemoryPersistence, InMemoryStorage};
pub use models::{Chapter, Comic, ComicStatus, ReadingHistory, UserPreferences};
pub use persistence_gateway::{PersistenceGateway, PgPersistenceGateway, RepositoryError};
pub use preferences::{PreferencesStore, PreferencesUpdate};
pub use storage_gateway::{S3StorageGateway, SignedUrl, StorageError, StorageGateway};
