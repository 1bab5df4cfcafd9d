use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use glucimiam_core::cache::CacheHit;
use glucimiam_core::error::AnalysisError;
use glucimiam_core::imaging::decode_base64_image;
use glucimiam_core::models::{
    CorrectionSample, LoggedEstimate, NewNutritionRecord, NutritionRecord, Provenance,
    validate_nutrition_record,
};
use glucimiam_core::nutrition::{NutritionLookupProvider, ReferenceValue};
use glucimiam_core::pipeline::{AnalysisReport, AnalysisRequest};
use glucimiam_core::providers::{LlmSettings, VisionProvider};
use glucimiam_core::service::GluciService;

const BODY_LIMIT: usize = 50 * 1024 * 1024; // 50 MB
const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<GluciService>,
    pub provider: Arc<dyn VisionProvider>,
    pub lookup: Arc<dyn NutritionLookupProvider>,
    /// `None` when no provider key is configured; analysis routes answer 503.
    pub llm: Option<Arc<LlmSettings>>,
    pub api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct AnalyzeBody {
    /// Base64 photos, optionally as data URLs.
    images: Vec<String>,
    finger_length_mm: f64,
    user_context: Option<String>,
    user_id: Option<i64>,
    taken_at: Option<NaiveDateTime>,
    #[serde(default)]
    reuse_cached: bool,
    /// Persist the estimates so they can be corrected later. Needs `user_id`.
    #[serde(default)]
    log: bool,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    #[serde(flatten)]
    report: AnalysisReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    logged: Vec<LoggedEstimate>,
}

#[derive(Deserialize)]
struct CachedBody {
    image: String,
    user_id: i64,
}

#[derive(Deserialize)]
struct CorrectionBody {
    user_id: i64,
    food_name: String,
    weight_ratio: f64,
    carbs_ratio: f64,
}

#[derive(Deserialize)]
struct NutritionQuery {
    q: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct LookupQuery {
    q: String,
}

#[derive(Deserialize)]
struct CreateNutritionBody {
    name: String,
    carbs_per_100g: f64,
    category: Option<String>,
    #[serde(default = "default_provenance")]
    provenance: Provenance,
}

fn default_provenance() -> Provenance {
    Provenance::Manual
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct EditEstimateBody {
    weight_g: Option<f64>,
    carbs_g: Option<f64>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Analysis(AnalysisError),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Analysis(err) => (analysis_status(&err), err.to_string()),
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn analysis_status(err: &AnalysisError) -> StatusCode {
    match err {
        AnalysisError::NoImages
        | AnalysisError::InvalidInput(_)
        | AnalysisError::InvalidImage { .. } => StatusCode::BAD_REQUEST,
        AnalysisError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        AnalysisError::ProviderQuota(_) => StatusCode::TOO_MANY_REQUESTS,
        AnalysisError::ModelDeclined(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AnalysisError::ProviderAuth(_)
        | AnalysisError::Provider(_)
        | AnalysisError::MalformedPayload { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<AnalysisError> for ApiError {
    fn from(err: AnalysisError) -> Self {
        Self::Analysis(err)
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

fn decode_images(images: &[String]) -> Result<Vec<Vec<u8>>, ApiError> {
    images
        .iter()
        .enumerate()
        .map(|(i, img)| {
            decode_base64_image(img)
                .map_err(|e| ApiError::BadRequest(format!("Image {i}: {e:#}")))
        })
        .collect()
}

async fn analyze(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeBody>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let llm = state.llm.as_deref().ok_or_else(|| {
        ApiError::Unavailable("No vision provider is configured on this server".to_string())
    })?;
    if req.log && req.user_id.is_none() {
        return Err(ApiError::BadRequest(
            "user_id is required when log is set".to_string(),
        ));
    }

    let request = AnalysisRequest {
        images: decode_images(&req.images)?,
        finger_length_mm: req.finger_length_mm,
        user_context: req.user_context,
        user_id: req.user_id,
        taken_at: req.taken_at.unwrap_or_else(|| Local::now().naive_local()),
        reuse_cached: req.reuse_cached,
    };

    let report = state
        .service
        .analyze(
            state.provider.as_ref(),
            Some(state.lookup.as_ref()),
            llm,
            &request,
        )
        .await
        .inspect_err(|e| warn!(error = %e, "analysis failed"))?;

    let logged = match (req.log, req.user_id) {
        (true, Some(user_id)) => state
            .service
            .log_estimates(user_id, &report.analysis_id, &report.estimates)
            .context("failed to log estimates")?,
        _ => Vec::new(),
    };

    Ok(Json(AnalyzeResponse { report, logged }))
}

async fn analyze_cached(
    State(state): State<AppState>,
    Json(req): Json<CachedBody>,
) -> Result<Json<CacheHit>, ApiError> {
    let image = decode_base64_image(&req.image)
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    state
        .service
        .find_cached_analysis(&image, req.user_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No similar earlier analysis".to_string()))
}

async fn create_correction(
    State(state): State<AppState>,
    Json(req): Json<CorrectionBody>,
) -> Result<(StatusCode, Json<CorrectionSample>), ApiError> {
    let sample = state
        .service
        .record_correction(req.user_id, &req.food_name, req.weight_ratio, req.carbs_ratio)
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    Ok((StatusCode::CREATED, Json(sample)))
}

async fn list_corrections(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<CorrectionSample>>, ApiError> {
    let samples = state
        .service
        .list_corrections(user_id)
        .context("failed to list corrections")?;
    Ok(Json(samples))
}

async fn search_nutrition(
    State(state): State<AppState>,
    Query(query): Query<NutritionQuery>,
) -> Result<Json<Vec<NutritionRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(500);
    let records = match query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => state.service.search_nutrition(q, limit),
        None => state.service.list_nutrition(None, limit),
    }
    .context("failed to search nutrition records")?;
    Ok(Json(records))
}

async fn lookup_nutrition(
    State(state): State<AppState>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<ReferenceValue>, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::BadRequest("q must not be empty".to_string()));
    }
    state
        .service
        .lookup_reference(Some(state.lookup.as_ref()), &query.q)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No carbohydrate reference for '{}'", query.q)))
}

async fn create_nutrition(
    State(state): State<AppState>,
    Json(req): Json<CreateNutritionBody>,
) -> Result<(StatusCode, Json<NutritionRecord>), ApiError> {
    let record = NewNutritionRecord {
        name: req.name,
        carbs_per_100g: req.carbs_per_100g,
        provenance: req.provenance,
        category: req.category,
    };
    validate_nutrition_record(&record).map_err(|e| ApiError::BadRequest(format!("{e}")))?;

    if let Some(existing) = state
        .service
        .find_nutrition_by_name(&record.name)
        .context("database error")?
    {
        return Err(ApiError::Conflict(format!(
            "'{}' already exists (id {})",
            existing.name, existing.id
        )));
    }

    let created = state
        .service
        .add_nutrition_record(&record)
        .context("failed to insert nutrition record")?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_estimates(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<LoggedEstimate>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(500);
    let logged = state
        .service
        .list_logged_estimates(user_id, limit)
        .context("failed to list estimates")?;
    Ok(Json(logged))
}

async fn edit_estimate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<EditEstimateBody>,
) -> Result<Json<LoggedEstimate>, ApiError> {
    if req.weight_g.is_none() && req.carbs_g.is_none() {
        return Err(ApiError::BadRequest(
            "At least one of weight_g or carbs_g must be provided".to_string(),
        ));
    }
    if [req.weight_g, req.carbs_g]
        .into_iter()
        .flatten()
        .any(|v| !v.is_finite() || v < 0.0)
    {
        return Err(ApiError::BadRequest(
            "Corrected values must be non-negative numbers".to_string(),
        ));
    }

    state
        .service
        .get_logged_estimate(id)
        .map_err(|_| ApiError::NotFound(format!("Estimate {id} not found")))?;

    let updated = state
        .service
        .correct_estimate(id, req.weight_g, req.carbs_g)
        .context("failed to correct estimate")?;
    Ok(Json(updated))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/analyze", post(analyze))
        .route("/api/analyze/cached", post(analyze_cached))
        .route("/api/corrections", post(create_correction))
        .route("/api/corrections/{user_id}", get(list_corrections))
        .route("/api/nutrition", get(search_nutrition).post(create_nutrition))
        .route("/api/nutrition/lookup", get(lookup_nutrition))
        // GET takes a user id, PUT an estimate id
        .route("/api/estimates/{id}", get(list_estimates).put(edit_estimate))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

/// First and last four characters of a key, or a mask when it is too short
/// to reveal any of it.
fn key_hint(key: &str) -> String {
    let count = key.chars().count();
    if count < 12 {
        return "*".repeat(count.max(4));
    }
    let head: String = key.chars().take(4).collect();
    let tail: String = key.chars().skip(count - 4).collect();
    format!("{head}...{tail}")
}

pub async fn start_server(state: AppState, port: u16, bind: &str) -> anyhow::Result<()> {
    if let Some(ref key) = state.api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            key_hint(key)
        );
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && state.api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    match state.llm.as_deref() {
        Some(llm) => info!(provider = %llm.provider, model = llm.model(), "vision provider ready"),
        None => warn!("no provider API key found; analysis routes will answer 503"),
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
