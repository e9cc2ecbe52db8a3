use crate::config::{ApiConfig, Config};
use crate::error::ApiError;
use crate::form;
use crate::ingestion::{IngestedComic, IngestionPipeline, IngestionSettings};
use crate::models::{Chapter, Comic, ReadingHistory, ReadingProgress, UserPreferences};
use crate::overlay::{self, InteractionState, Page, PageLayout, ReaderSettings};
use crate::persistence_gateway::PersistenceGateway;
use crate::preferences::{Preferences, PreferencesUpdate};
use crate::storage_gateway::StorageGateway;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::WithRejection;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Concurrent lookups per listing request
const LISTING_CONCURRENCY: usize = 8;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub storage: Arc<dyn StorageGateway>,
    pub persistence: Arc<dyn PersistenceGateway>,
    pub bucket: String,
    pub allowed_content_types: Vec<String>,
    pub signed_url_ttl: Duration,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        persistence: Arc<dyn PersistenceGateway>,
        config: &Config,
    ) -> Self {
        let settings = IngestionSettings::from_config(config);
        let pipeline = IngestionPipeline::new(storage.clone(), persistence.clone(), settings);

        Self {
            pipeline: Arc::new(pipeline),
            storage,
            persistence,
            bucket: config.storage.bucket.clone(),
            allowed_content_types: config.storage.allowed_content_types.clone(),
            signed_url_ttl: config.signed_url_expiry(),
        }
    }

    /// Signed read URL for a stored object, `None` when signing fails
    async fn signed_url_or_none(&self, path: &str) -> Option<String> {
        match self
            .storage
            .signed_url(&self.bucket, path, self.signed_url_ttl)
            .await
        {
            Ok(signed) => Some(signed.url),
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to sign URL");
                None
            }
        }
    }
}

/// Chapter in API responses
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterResponse {
    #[serde(flatten)]
    pub chapter: Chapter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Comic with its chapters in API responses
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComicResponse {
    #[serde(flatten)]
    pub comic: Comic,
    pub chapters: Vec<ChapterResponse>,
    pub cover_image_url: Option<String>,
}

impl From<IngestedComic> for ComicResponse {
    fn from(ingested: IngestedComic) -> Self {
        Self {
            comic: ingested.comic,
            chapters: ingested
                .chapters
                .into_iter()
                .map(|chapter| ChapterResponse {
                    chapter,
                    image_url: None,
                })
                .collect(),
            cover_image_url: Some(ingested.cover_image_url.url),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateComicResponse {
    pub success: bool,
    pub comic: ComicResponse,
}

/// Comic summary attached to reading history
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComicSummary {
    pub id: Uuid,
    pub title: String,
    pub cover_image_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub history: ReadingHistory,
    pub comic: ComicSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: Option<String>,
}

impl UserQuery {
    fn require_user(self) -> Result<String, ApiError> {
        require("userId", self.user_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgressRequest {
    pub user_id: Option<String>,
    pub comic_id: Option<Uuid>,
    pub chapter_number: Option<i32>,
    pub page_number: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesRequest {
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub update: PreferencesUpdate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutRequest {
    pub page: Page,
    /// Explicit settings; otherwise derived from the user's preferences
    pub settings: Option<ReaderSettings>,
    pub user_id: Option<String>,
    pub target_language: Option<String>,
    #[serde(default)]
    pub state: InteractionState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSetupResponse {
    pub bucket: String,
    pub allowed_content_types: Vec<String>,
}

fn require<T>(field: &str, value: Option<T>) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}

fn non_blank(field: &str, value: Option<String>) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ApiError::BadRequest(format!("{field} is required"))),
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/comics", get(list_comics).post(create_comic))
        .route("/comics/:comic_id", get(get_comic))
        .route(
            "/reading-history",
            get(get_reading_history).post(record_reading_progress),
        )
        .route("/preferences", get(get_preferences).put(update_preferences))
        .route("/reader/layout", post(reader_layout))
        .route("/storage/setup", post(setup_storage))
        .layer(DefaultBodyLimit::max(config.ingestion.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.api))
        .with_state(state)
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    if !config.cors_enabled {
        return CorsLayer::new();
    }

    if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "library-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.persistence.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Ingest a comic from a multipart form
#[instrument(skip_all)]
async fn create_comic(
    State(state): State<AppState>,
    WithRejection(multipart, _): WithRejection<Multipart, ApiError>,
) -> Result<(StatusCode, Json<CreateComicResponse>), ApiError> {
    let submission = form::read_submission(multipart).await?;
    let ingested = state.pipeline.ingest(submission).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateComicResponse {
            success: true,
            comic: ingested.into(),
        }),
    ))
}

/// Published comics, newest first, each with chapters and a signed cover URL
#[instrument(skip(state))]
async fn list_comics(State(state): State<AppState>) -> Result<Json<Vec<ComicResponse>>, ApiError> {
    let comics = state.persistence.list_published_comics().await?;

    let responses = buffered(comics, |comic| {
        let state = state.clone();
        async move {
            let chapters = state.persistence.find_chapters(comic.id).await?;
            let cover_image_url = state.signed_url_or_none(&comic.cover_image).await;
            Ok::<_, ApiError>(ComicResponse {
                comic,
                chapters: chapters
                    .into_iter()
                    .map(|chapter| ChapterResponse {
                        chapter,
                        image_url: None,
                    })
                    .collect(),
                cover_image_url,
            })
        }
    })
    .await?;

    Ok(Json(responses))
}

/// One comic with signed cover and chapter image URLs
#[instrument(skip(state))]
async fn get_comic(
    State(state): State<AppState>,
    WithRejection(Path(comic_id), _): WithRejection<Path<Uuid>, ApiError>,
) -> Result<Json<ComicResponse>, ApiError> {
    let comic = state
        .persistence
        .find_comic(comic_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Comic {comic_id} not found")))?;

    let chapters = state.persistence.find_chapters(comic_id).await?;
    let chapters = buffered(chapters, |chapter| {
        let state = state.clone();
        async move {
            let image_url = state.signed_url_or_none(&chapter.file_path).await;
            Ok::<_, ApiError>(ChapterResponse { chapter, image_url })
        }
    })
    .await?;

    let cover_image_url = state.signed_url_or_none(&comic.cover_image).await;

    Ok(Json(ComicResponse {
        comic,
        chapters,
        cover_image_url,
    }))
}

/// A user's reading history, most recent first
#[instrument(skip(state))]
async fn get_reading_history(
    State(state): State<AppState>,
    WithRejection(Query(query), _): WithRejection<Query<UserQuery>, ApiError>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let user_id = query.require_user()?;
    let rows = state.persistence.find_reading_history(&user_id).await?;

    let entries = buffered(rows, |history| {
        let state = state.clone();
        async move {
            let comic = state.persistence.find_comic(history.comic_id).await?;
            let summary = match comic {
                Some(comic) => Some(ComicSummary {
                    id: comic.id,
                    cover_image_url: state.signed_url_or_none(&comic.cover_image).await,
                    title: comic.title,
                }),
                None => None,
            };
            Ok::<_, ApiError>(summary.map(|comic| HistoryEntry { history, comic }))
        }
    })
    .await?;

    Ok(Json(entries.into_iter().flatten().collect()))
}

/// Record where a user stopped reading
#[instrument(skip(state, request))]
async fn record_reading_progress(
    State(state): State<AppState>,
    WithRejection(Json(request), _): WithRejection<Json<ReadingProgressRequest>, ApiError>,
) -> Result<Json<ReadingHistory>, ApiError> {
    let user_id = non_blank("userId", request.user_id)?;
    let comic_id = require("comicId", request.comic_id)?;
    let last_chapter = request.chapter_number.unwrap_or(1);
    let last_page = request.page_number.unwrap_or(1);

    if last_chapter < 1 || last_page < 1 {
        return Err(ApiError::BadRequest(
            "chapterNumber and pageNumber must be at least 1".to_string(),
        ));
    }

    let chapter_count = state.persistence.find_chapters(comic_id).await?.len();
    if last_chapter as usize > chapter_count {
        warn!(
            comic_id = %comic_id,
            last_chapter = last_chapter,
            chapter_count = chapter_count,
            "Reading progress points past the last chapter"
        );
    }

    let history = state
        .persistence
        .upsert_reading_history(&ReadingProgress {
            user_id,
            comic_id,
            last_chapter,
            last_page,
        })
        .await?;

    Ok(Json(history))
}

#[instrument(skip(state))]
async fn get_preferences(
    State(state): State<AppState>,
    WithRejection(Query(query), _): WithRejection<Query<UserQuery>, ApiError>,
) -> Result<Json<UserPreferences>, ApiError> {
    let user_id = query.require_user()?;

    let preferences = state
        .persistence
        .find_preferences(&user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Preferences not found".to_string()))?;

    Ok(Json(preferences))
}

/// Merge the provided fields onto the stored (or default) preferences
#[instrument(skip(state, request))]
async fn update_preferences(
    State(state): State<AppState>,
    WithRejection(Json(request), _): WithRejection<Json<PreferencesRequest>, ApiError>,
) -> Result<Json<UserPreferences>, ApiError> {
    let user_id = non_blank("userId", request.user_id)?;

    let current = state
        .persistence
        .find_preferences(&user_id)
        .await?
        .unwrap_or_else(|| UserPreferences::defaults_for(user_id.as_str()));

    let merged = request
        .update
        .apply(&Preferences::from(&current))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let stored = state
        .persistence
        .upsert_preferences(&merged.into_record(user_id))
        .await?;

    Ok(Json(stored))
}

/// Compute the overlay layout of a page
#[instrument(skip(state, request))]
async fn reader_layout(
    State(state): State<AppState>,
    WithRejection(Json(request), _): WithRejection<Json<LayoutRequest>, ApiError>,
) -> Result<Json<PageLayout>, ApiError> {
    let settings = match request.settings {
        Some(settings) => settings,
        None => {
            let target_language = non_blank("targetLanguage", request.target_language)?;
            let preferences = match request.user_id {
                Some(user_id) => state
                    .persistence
                    .find_preferences(&user_id)
                    .await?
                    .unwrap_or_else(|| UserPreferences::defaults_for(user_id.as_str())),
                None => UserPreferences::defaults_for(""),
            };
            ReaderSettings::from_preferences(&preferences, &target_language)
        }
    };

    Ok(Json(overlay::render(&request.page, &settings, &request.state)))
}

/// Create the comics bucket if it does not exist yet
#[instrument(skip(state))]
async fn setup_storage(
    State(state): State<AppState>,
) -> Result<Json<StorageSetupResponse>, ApiError> {
    state
        .storage
        .ensure_bucket(&state.bucket, &state.allowed_content_types)
        .await?;

    Ok(Json(StorageSetupResponse {
        bucket: state.bucket.clone(),
        allowed_content_types: state.allowed_content_types.clone(),
    }))
}

/// Run `f` over `items` with bounded concurrency, keeping input order and
/// stopping at the first error
async fn buffered<T, U, F, Fut>(items: Vec<T>, f: F) -> Result<Vec<U>, ApiError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<U, ApiError>>,
{
    stream::iter(items)
        .map(f)
        .buffered(LISTING_CONCURRENCY)
        .try_collect()
        .await
}

/// Start the API server
pub async fn start_api_server(
    state: AppState,
    config: &Config,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.api.host, config.api.port);

    info!(address = %addr, "Starting library API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryPersistence, InMemoryStorage};
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    const BOUNDARY: &str = "library-test-boundary";

    struct TestApp {
        router: Router,
        storage: Arc<InMemoryStorage>,
        db: Arc<InMemoryPersistence>,
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.service.in_memory = true;
        config
    }

    fn app() -> TestApp {
        let storage = Arc::new(InMemoryStorage::new());
        let db = Arc::new(InMemoryPersistence::new());
        let config = test_config();
        let state = AppState::new(storage.clone(), db.clone(), &config);
        TestApp {
            router: create_router(state, &config),
            storage,
            db,
        }
    }

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a str),
        /// What a browser sends for a file input left empty
        EmptyFile(&'a str),
    }

    fn multipart_body(parts: &[Part<'_>]) -> String {
        let mut body = String::new();
        for part in parts {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match part {
                Part::Text(name, value) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                    ));
                }
                Part::File(name, file_name, content_type) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: {content_type}\r\n\r\nPNGDATA\r\n"
                    ));
                }
                Part::EmptyFile(name) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n\r\n"
                    ));
                }
            }
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    fn comic_form(
        chapters: &'static str,
        chapter_files: &[(&'static str, &'static str)],
    ) -> Vec<Part<'static>> {
        let mut parts = vec![
            Part::Text("title", "T"),
            Part::Text("description", "D"),
            Part::Text("author", "A"),
            Part::Text("artist", "B"),
            Part::Text("genres", r#"["Fantasy"]"#),
            Part::Text("languages", r#"["en"]"#),
            Part::File("coverImage", "cover.png", "image/png"),
            Part::Text("chapters", chapters),
        ];
        for &(field, file_name) in chapter_files {
            parts.push(Part::File(field, file_name, "image/png"));
        }
        parts
    }

    const TWO_CHAPTERS: &str = r#"[{"title":"Ch1"},{"title":"Ch2"}]"#;

    fn multipart_request(parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/comics")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_comic_via_api(app: &TestApp) -> serde_json::Value {
        let response = app
            .router
            .clone()
            .oneshot(multipart_request(&comic_form(
                TWO_CHAPTERS,
                &[("chapter-0", "one.png"), ("chapter-1", "two.png")],
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        json_body(response).await
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = app();

        let response = app.router.oneshot(get_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_readiness_reflects_database() {
        let app = app();
        app.db.set_unavailable(true);

        let response = app.router.oneshot(get_request("/ready")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_create_comic_returns_created() {
        let app = app();

        let body = create_comic_via_api(&app).await;

        assert_eq!(body["success"], true);
        assert_eq!(body["comic"]["title"], "T");
        assert_eq!(body["comic"]["status"], "published");
        assert_eq!(body["comic"]["chapters"][0]["number"], 1);
        assert_eq!(body["comic"]["chapters"][1]["title"], "Ch2");
        assert!(body["comic"]["coverImageUrl"]
            .as_str()
            .unwrap()
            .starts_with("memory://comics/covers/"));
        assert_eq!(app.storage.paths("comics").await.len(), 3);
    }

    #[tokio::test]
    async fn test_create_comic_missing_chapter_file_is_bad_request() {
        let app = app();

        let response = app
            .router
            .oneshot(multipart_request(&comic_form(
                TWO_CHAPTERS,
                &[("chapter-0", "one.png")],
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"], "file for chapter 2 is required");
        assert_eq!(body["field"], "chapter-1");
        assert_eq!(app.storage.upload_attempts(), 0);
    }

    #[tokio::test]
    async fn test_create_comic_empty_cover_part_is_missing_cover() {
        let app = app();
        let mut parts = comic_form(
            TWO_CHAPTERS,
            &[("chapter-0", "one.png"), ("chapter-1", "two.png")],
        );
        parts.retain(|part| !matches!(part, Part::File("coverImage", _, _)));
        parts.push(Part::EmptyFile("coverImage"));

        let response = app
            .router
            .oneshot(multipart_request(&parts))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["field"], "coverImage");
        assert_eq!(app.storage.upload_attempts(), 0);
    }

    #[tokio::test]
    async fn test_create_comic_empty_chapter_part_is_missing_chapter_file() {
        let app = app();
        let mut parts = comic_form(TWO_CHAPTERS, &[("chapter-1", "two.png")]);
        parts.push(Part::EmptyFile("chapter-0"));

        let response = app
            .router
            .oneshot(multipart_request(&parts))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"], "file for chapter 1 is required");
        assert_eq!(body["field"], "chapter-0");
        assert_eq!(app.storage.upload_attempts(), 0);
    }

    #[tokio::test]
    async fn test_malformed_comic_id_is_json_bad_request() {
        let app = app();

        let response = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/reading-history",
                serde_json::json!({ "userId": "user-1", "comicId": "not-a-uuid" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "BAD_REQUEST");
        assert!(body["error"].as_str().unwrap().contains("comicId"));

        let response = app
            .router
            .oneshot(get_request("/comics/not-a-uuid"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_preferences_difficulty_out_of_range_is_bad_request() {
        let app = app();

        for level in [300, 70_000] {
            let response = app
                .router
                .clone()
                .oneshot(json_request(
                    "PUT",
                    "/preferences",
                    serde_json::json!({ "userId": "user-1", "difficultyLevel": level }),
                ))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "level {level}");
            assert!(json_body(response).await["code"].is_string());
        }
        assert!(app.db.find_preferences("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_query_and_bad_json_are_json_errors() {
        let app = app();

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/preferences")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "BAD_REQUEST");

        let response = app
            .router
            .oneshot(get_request("/preferences?userId=user-1&userId=extra"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_create_comic_upload_failure_rolls_back() {
        let app = app();
        app.storage.fail_uploads_containing("two.png").await;

        let response = app
            .router
            .clone()
            .oneshot(multipart_request(&comic_form(
                TWO_CHAPTERS,
                &[("chapter-0", "one.png"), ("chapter-1", "two.png")],
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["code"], "UPLOAD_ERROR");
        assert!(body["error"].as_str().unwrap().contains("chapter 2"));
        assert!(app.db.comics().await.is_empty());

        let listing = app.router.oneshot(get_request("/comics")).await.unwrap();
        assert_eq!(json_body(listing).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_list_comics_tolerates_signing_failure() {
        let app = app();
        create_comic_via_api(&app).await;
        app.storage.fail_signed_urls(true);

        let response = app.router.oneshot(get_request("/comics")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert!(body[0]["coverImageUrl"].is_null());
        assert_eq!(body[0]["chapters"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_comic_signs_chapter_images() {
        let app = app();
        let created = create_comic_via_api(&app).await;
        let id = created["comic"]["id"].as_str().unwrap();

        let response = app
            .router
            .clone()
            .oneshot(get_request(&format!("/comics/{id}")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert!(body["chapters"][0]["imageUrl"]
            .as_str()
            .unwrap()
            .contains("/chapters/"));

        let missing = app
            .router
            .oneshot(get_request(&format!("/comics/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reading_history_upsert_and_read() {
        let app = app();
        let created = create_comic_via_api(&app).await;
        let comic_id = created["comic"]["id"].as_str().unwrap().to_string();

        let first = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/reading-history",
                serde_json::json!({ "userId": "user-1", "comicId": comic_id }),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = json_body(first).await;
        assert_eq!(first["lastChapter"], 1);
        assert_eq!(first["lastPage"], 1);

        app.router
            .clone()
            .oneshot(json_request(
                "POST",
                "/reading-history",
                serde_json::json!({
                    "userId": "user-1",
                    "comicId": comic_id,
                    "chapterNumber": 2,
                    "pageNumber": 7
                }),
            ))
            .await
            .unwrap();

        let response = app
            .router
            .oneshot(get_request("/reading-history?userId=user-1"))
            .await
            .unwrap();
        let body = json_body(response).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["lastChapter"], 2);
        assert_eq!(rows[0]["lastPage"], 7);
        assert_eq!(rows[0]["comic"]["title"], "T");
    }

    #[tokio::test]
    async fn test_reading_history_requires_ids() {
        let app = app();

        let read = app
            .router
            .clone()
            .oneshot(get_request("/reading-history"))
            .await
            .unwrap();
        assert_eq!(read.status(), StatusCode::BAD_REQUEST);

        let write = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/reading-history",
                serde_json::json!({ "userId": "user-1" }),
            ))
            .await
            .unwrap();
        assert_eq!(write.status(), StatusCode::BAD_REQUEST);

        let unknown_comic = app
            .router
            .oneshot(json_request(
                "POST",
                "/reading-history",
                serde_json::json!({ "userId": "user-1", "comicId": Uuid::new_v4() }),
            ))
            .await
            .unwrap();
        assert_eq!(unknown_comic.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_preferences_partial_update() {
        let app = app();

        let missing = app
            .router
            .clone()
            .oneshot(get_request("/preferences?userId=user-1"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let updated = app
            .router
            .clone()
            .oneshot(json_request(
                "PUT",
                "/preferences",
                serde_json::json!({ "userId": "user-1", "difficultyLevel": 3 }),
            ))
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);

        let response = app
            .router
            .oneshot(get_request("/preferences?userId=user-1"))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["difficultyLevel"], 3);
        assert_eq!(body["defaultLanguage"], "en");
        assert_eq!(body["showTranslations"], true);
    }

    #[tokio::test]
    async fn test_preferences_validation() {
        let app = app();

        let no_user = app
            .router
            .clone()
            .oneshot(json_request(
                "PUT",
                "/preferences",
                serde_json::json!({ "difficultyLevel": 2 }),
            ))
            .await
            .unwrap();
        assert_eq!(no_user.status(), StatusCode::BAD_REQUEST);

        let out_of_range = app
            .router
            .oneshot(json_request(
                "PUT",
                "/preferences",
                serde_json::json!({ "userId": "user-1", "difficultyLevel": 6 }),
            ))
            .await
            .unwrap();
        assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);
        assert!(app.db.find_preferences("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_layout_uses_stored_preferences() {
        let app = app();
        let mut stored = UserPreferences::defaults_for("user-1");
        stored.auto_play_translations = true;
        app.db.upsert_preferences(&stored).await.unwrap();

        let response = app
            .router
            .oneshot(json_request(
                "POST",
                "/reader/layout",
                serde_json::json!({
                    "userId": "user-1",
                    "targetLanguage": "es",
                    "page": {
                        "imageUrl": "p.png",
                        "bubbles": [{
                            "id": "b1", "x": 10, "y": 10, "width": 20, "height": 10,
                            "translations": [
                                {"languageCode": "en", "text": "Hello"},
                                {"languageCode": "es", "text": "Hola", "grammarNotes": "greeting"}
                            ]
                        }]
                    }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["bubbles"][0]["targetText"], "Hola");
        assert_eq!(body["bubbles"][0]["popup"]["nativeText"], "Hello");
        assert_eq!(body["bubbles"][0]["popup"]["grammarNotes"], "greeting");
    }

    #[tokio::test]
    async fn test_storage_setup_creates_bucket() {
        let app = app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/storage/setup")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(app.storage.bucket_exists("comics").await);
        let body = json_body(response).await;
        assert_eq!(body["bucket"], "comics");
    }
}
