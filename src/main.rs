//! Intake Scribe - OCR a scanned intake form and reformat it into a clinical note.

mod analysis;
mod config;
mod endpoints;
mod error;
mod llm;
mod ocr;
mod pipeline;
mod text_extract;

#[cfg(test)]
mod test_support;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use config::{ConfigOverrides, Settings};
use endpoints::ModelMatch;
use error::{FormatError, OcrError};
use llm::ChatClient;
use ocr::document_intelligence::DocumentIntelligenceClient;
use ocr::Payload;
use pipeline::{Pipeline, ProcessingOutcome};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers. Read-only after startup.
#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    pipeline: Arc<Pipeline>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "intake_scribe=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    info!(
        "Defaults: OCR endpoint {}, LLM deployment {}",
        display_or_unset(&settings.ocr.endpoint),
        display_or_unset(&settings.llm.deployment_name)
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    let pipeline = Pipeline::new(
        DocumentIntelligenceClient::new(http.clone()),
        ChatClient::new(http),
    );

    let bind_addr = settings.bind_addr.clone();
    let state = AppState {
        settings: Arc::new(settings),
        pipeline: Arc::new(pipeline),
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, build_router(state)).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/template", get(default_template))
        .route("/process", post(process_upload))
        .route("/ocr", post(ocr_upload))
        .route("/format", post(format_text))
        .route("/models", post(list_models))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

type ApiError = (StatusCode, String);

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// The server's default prompt template.
async fn default_template(State(state): State<AppState>) -> String {
    state.settings.prompt_template.clone()
}

/// Upload a form, OCR it and format the text into a note.
async fn process_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ProcessingOutcome>, ApiError> {
    let upload = read_upload(multipart).await?;

    let ocr_config = state.settings.ocr.with_overrides(&upload.overrides);
    let llm_config = state.settings.llm.with_overrides(&upload.overrides);
    let template = upload
        .template
        .as_deref()
        .unwrap_or(&state.settings.prompt_template);

    let outcome = state
        .pipeline
        .process(
            &upload.payload,
            &ocr_config,
            llm_config.is_configured().then_some(&llm_config),
            template,
        )
        .await
        .map_err(|e| {
            error!("Processing {} failed: {}", upload.payload.filename, e);
            (ocr_status(&e), e.to_string())
        })?;

    Ok(Json(outcome))
}

#[derive(serde::Serialize)]
struct OcrResponse {
    filename: String,
    text: String,
}

/// Upload a form and return only the extracted text.
async fn ocr_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<OcrResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let ocr_config = state.settings.ocr.with_overrides(&upload.overrides);

    let text = state
        .pipeline
        .extract_text(&upload.payload, &ocr_config)
        .await
        .map_err(|e| {
            error!("OCR of {} failed: {}", upload.payload.filename, e);
            (ocr_status(&e), e.to_string())
        })?;

    Ok(Json(OcrResponse {
        filename: upload.payload.filename,
        text,
    }))
}

#[derive(serde::Deserialize)]
struct FormatRequest {
    text: String,
    #[serde(default)]
    template: Option<String>,
    #[serde(flatten)]
    overrides: ConfigOverrides,
}

#[derive(serde::Serialize)]
struct FormatResponse {
    note: String,
}

/// Format already-extracted text, e.g. after the user edited the OCR output.
async fn format_text(
    State(state): State<AppState>,
    Json(request): Json<FormatRequest>,
) -> Result<Json<FormatResponse>, ApiError> {
    let llm_config = state.settings.llm.with_overrides(&request.overrides);
    let template = non_blank(request.template.as_deref())
        .unwrap_or(&state.settings.prompt_template);

    let note = state
        .pipeline
        .format(&request.text, template, &llm_config)
        .await
        .map_err(|e| {
            error!("Formatting failed: {}", e);
            (format_status(&e), e.to_string())
        })?;

    Ok(Json(FormatResponse { note }))
}

#[derive(serde::Serialize)]
struct ModelsResponse {
    models: Vec<String>,
    requested_model: Option<String>,
    suggestion: Option<ModelMatch>,
}

/// List the models of the OCR resource and match the configured model id.
async fn list_models(
    State(state): State<AppState>,
    Json(overrides): Json<ConfigOverrides>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let ocr_config = state.settings.ocr.with_overrides(&overrides);

    let models = state
        .pipeline
        .backend()
        .list_models(&ocr_config)
        .await
        .map_err(|e| (ocr_status(&e), e.to_string()))?;

    let suggestion = ocr_config
        .model_id
        .as_deref()
        .and_then(|requested| endpoints::suggest_model(requested, &models));

    Ok(Json(ModelsResponse {
        models,
        requested_model: ocr_config.model_id,
        suggestion,
    }))
}

// ============================================================================
// Helper functions
// ============================================================================

struct Upload {
    payload: Payload,
    template: Option<String>,
    overrides: ConfigOverrides,
}

/// Read the `file` part plus optional `template` and config override fields.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut payload = None;
    let mut template = None;
    let mut overrides = ConfigOverrides::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let name = field.name().unwrap_or_default().to_string();

        if name == "file" {
            let filename = field.file_name().unwrap_or("document").to_string();
            let content_type = field.content_type().map(str::to_string);
            let data = field.bytes().await.map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
            })?;
            payload = Some(Payload::new(filename, content_type, data.to_vec()));
            continue;
        }

        let value = field.text().await.map_err(|e| {
            (StatusCode::BAD_REQUEST, format!("Failed to read field {}: {}", name, e))
        })?;
        if name == "template" {
            template = non_blank(Some(&value)).map(str::to_string);
        } else if !overrides.set(&name, value) {
            info!("Ignoring unknown form field: {}", name);
        }
    }

    let payload = payload
        .filter(|p| !p.data.is_empty())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "No file uploaded".to_string()))?;

    info!("Received file: {} ({} bytes)", payload.filename, payload.data.len());

    Ok(Upload {
        payload,
        template,
        overrides,
    })
}

fn ocr_status(e: &OcrError) -> StatusCode {
    match e {
        OcrError::ConfigIncomplete(_) | OcrError::NoCandidates => StatusCode::BAD_REQUEST,
        OcrError::NoTextFound => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn format_status(e: &FormatError) -> StatusCode {
    match e {
        FormatError::ConfigIncomplete(_) | FormatError::InvalidTemplate(_) => {
            StatusCode::BAD_REQUEST
        }
        FormatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() {
        "<unset>"
    } else {
        value
    }
}
