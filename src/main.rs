//! Review Assistant - human-in-the-loop review server for document extractions.

mod chat;
mod config;
mod documents;
mod error;
mod guidelines;
mod json_manager;
mod ocr;
mod rules;
mod schema;
mod search;
mod session;
mod viewer;
mod xml;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat::{ChatContext, ChatMessage, Role};
use config::AppConfig;
use documents::{DocumentKind, DocumentView, LoadedDocument, DEFAULT_PAGE_SIZE};
use error::{Result, ReviewError};
use guidelines::Guidelines;
use json_manager::{EditOutcome, FieldDefinitionUpdate, FieldEdit, FieldHistoryEntry};
use ocr::OcrDocument;
use rules::{FormulaCheck, ValidationWarning};
use schema::{ExtractionRecord, Field, UserInfo};
use search::{SearchMatch, SearchMode};
use session::{Session, SessionStore, SessionSummary};
use viewer::{KindFilter, PageOverlay};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    sessions: SessionStore,
    config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "review_assistant=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!(
        "Config: bind {}, max upload {} bytes, formula tolerance {}",
        config.bind_addr, config.max_upload_bytes, config.formula_tolerance
    );

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        sessions: SessionStore::new(),
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/user", put(set_user))
        .route("/sessions/:id/document", post(upload_document).get(get_document))
        .route("/sessions/:id/extraction", post(upload_extraction))
        .route("/sessions/:id/ocr", post(upload_ocr))
        .route("/sessions/:id/guidelines", post(upload_guidelines).get(get_guidelines))
        .route("/sessions/:id/record", get(get_record))
        .route("/sessions/:id/fields", post(add_field))
        .route(
            "/sessions/:id/fields/:name",
            put(update_field)
                .patch(update_field_definition)
                .delete(delete_field),
        )
        .route("/sessions/:id/fields/:name/history", get(field_history))
        .route("/sessions/:id/edits", post(batch_edit))
        .route("/sessions/:id/validation", get(get_validation))
        .route("/sessions/:id/provenance", get(get_provenance))
        .route("/sessions/:id/export", get(export_record))
        .route("/sessions/:id/search", get(search_document))
        .route("/sessions/:id/pages/:page/overlay", get(page_overlay))
        .route("/sessions/:id/chat", post(chat_turn).get(chat_history).delete(clear_chat))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Session access
// ============================================================================

fn read_session<R>(
    state: &AppState,
    id: &str,
    f: impl FnOnce(&Session) -> Result<R>,
) -> Result<R> {
    state
        .sessions
        .with(id, f)
        .unwrap_or_else(|| Err(ReviewError::SessionNotFound(id.to_string())))
}

fn write_session<R>(
    state: &AppState,
    id: &str,
    f: impl FnOnce(&mut Session) -> Result<R>,
) -> Result<R> {
    state
        .sessions
        .with_mut(id, f)
        .unwrap_or_else(|| Err(ReviewError::SessionNotFound(id.to_string())))
}

fn record_of(session: &Session) -> Result<&ExtractionRecord> {
    session
        .record
        .as_ref()
        .ok_or(ReviewError::MissingInput("extraction"))
}

/// Read the multipart `file` field.
async fn read_upload(multipart: &mut Multipart) -> Result<(String, Vec<u8>)> {
    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ReviewError::BadRequest(format!("multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload").to_string();
            file_data = field
                .bytes()
                .await
                .map_err(|e| ReviewError::BadRequest(format!("failed to read file: {}", e)))?
                .to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err(ReviewError::BadRequest("no file uploaded".into()));
    }
    info!("Received file: {} ({} bytes)", filename, file_data.len());
    Ok((filename, file_data))
}

// ============================================================================
// Handlers
// ============================================================================

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    user: Option<UserInfo>,
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionSummary>)> {
    let user = body
        .and_then(|Json(b)| b.user)
        .unwrap_or_else(|| state.config.default_user.clone());
    let id = state.sessions.create(user);
    info!("Session {} created ({} live)", id, state.sessions.len());
    let summary = read_session(&state, &id, |s| Ok(s.summary()))?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>> {
    read_session(&state, &id, |s| Ok(s.summary())).map(Json)
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if state.sessions.remove(&id) {
        info!("Session {} discarded", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ReviewError::SessionNotFound(id))
    }
}

async fn set_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(user): Json<UserInfo>,
) -> Result<Json<SessionSummary>> {
    if user.name.trim().is_empty() {
        return Err(ReviewError::BadRequest("user name must not be empty".into()));
    }
    write_session(&state, &id, |s| {
        s.user = user;
        Ok(s.summary())
    })
    .map(Json)
}

// Uploads are parsed before the session is touched, so a bad file leaves the
// previous state in place.

async fn upload_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<SessionSummary>> {
    let (filename, data) = read_upload(&mut multipart).await?;
    let document = LoadedDocument::load(&filename, data)?;
    write_session(&state, &id, |s| {
        s.set_document(document);
        Ok(s.summary())
    })
    .map(Json)
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>> {
    read_session(&state, &id, |s| {
        s.document
            .as_ref()
            .map(LoadedDocument::view)
            .ok_or(ReviewError::MissingInput("document"))
    })
    .map(Json)
}

async fn upload_extraction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<SessionSummary>> {
    let (filename, data) = read_upload(&mut multipart).await?;
    let record = ExtractionRecord::from_slice(&filename, &data)?;
    info!(
        "Loaded extraction '{}': {} fields, {} provenance entries",
        filename,
        record.fields().len(),
        record.provenance().len()
    );
    write_session(&state, &id, |s| {
        s.set_record(&filename, record);
        Ok(s.summary())
    })
    .map(Json)
}

async fn upload_ocr(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<SessionSummary>> {
    let (filename, data) = read_upload(&mut multipart).await?;
    let ocr = OcrDocument::parse(&filename, &data)?;
    write_session(&state, &id, |s| {
        s.ocr = Some(ocr);
        Ok(s.summary())
    })
    .map(Json)
}

async fn upload_guidelines(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<SessionSummary>> {
    let (filename, data) = read_upload(&mut multipart).await?;
    let guidelines = Guidelines::load(&filename, data)?;
    write_session(&state, &id, |s| {
        s.guidelines = Some(guidelines);
        Ok(s.summary())
    })
    .map(Json)
}

#[derive(Deserialize)]
struct GuidelinesQuery {
    #[serde(default)]
    raw: bool,
}

async fn get_guidelines(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GuidelinesQuery>,
) -> Result<Response> {
    read_session(&state, &id, |s| {
        let g = s
            .guidelines
            .as_ref()
            .ok_or(ReviewError::MissingInput("guidelines"))?;
        Ok(if query.raw {
            (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                g.source.clone(),
            )
                .into_response()
        } else {
            Html(g.render_html()).into_response()
        })
    })
}

#[derive(Serialize)]
struct RecordView {
    source_document: String,
    fields: Vec<Field>,
    provenance_count: usize,
    warnings: Vec<ValidationWarning>,
    formulas: Vec<FormulaCheck>,
}

async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecordView>> {
    let tolerance = state.config.formula_tolerance;
    read_session(&state, &id, |s| {
        let record = record_of(s)?;
        Ok(RecordView {
            source_document: record.source_document.clone(),
            fields: record.fields().to_vec(),
            provenance_count: record.provenance().len(),
            warnings: rules::validate_record(record, tolerance),
            formulas: rules::check_formulas(record, tolerance),
        })
    })
    .map(Json)
}

#[derive(Deserialize)]
struct AddFieldRequest {
    field: Field,
    #[serde(default)]
    note: String,
}

async fn add_field(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddFieldRequest>,
) -> Result<(StatusCode, Json<EditOutcome>)> {
    let opts = state.config.edit_options();
    let outcome = write_session(&state, &id, |s| {
        let record = s
            .record
            .as_mut()
            .ok_or(ReviewError::MissingInput("extraction"))?;
        json_manager::add_field(record, req.field, &s.user, &req.note, opts)
    })?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Deserialize)]
struct UpdateFieldRequest {
    value: Value,
    #[serde(default)]
    note: String,
}

async fn update_field(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(req): Json<UpdateFieldRequest>,
) -> Result<Json<EditOutcome>> {
    let opts = state.config.edit_options();
    write_session(&state, &id, |s| {
        let record = s
            .record
            .as_mut()
            .ok_or(ReviewError::MissingInput("extraction"))?;
        json_manager::apply_edit(record, &name, req.value, &s.user, &req.note, opts)
    })
    .map(Json)
}

#[derive(Deserialize)]
struct DefinitionRequest {
    #[serde(flatten)]
    update: FieldDefinitionUpdate,
    #[serde(default)]
    note: String,
}

async fn update_field_definition(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Json(req): Json<DefinitionRequest>,
) -> Result<Json<EditOutcome>> {
    let opts = state.config.edit_options();
    write_session(&state, &id, |s| {
        let record = s
            .record
            .as_mut()
            .ok_or(ReviewError::MissingInput("extraction"))?;
        json_manager::update_field_definition(record, &name, req.update, &s.user, &req.note, opts)
    })
    .map(Json)
}

#[derive(Deserialize, Default)]
struct NoteQuery {
    #[serde(default)]
    note: String,
}

async fn delete_field(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    Query(query): Query<NoteQuery>,
) -> Result<Json<EditOutcome>> {
    let opts = state.config.edit_options();
    write_session(&state, &id, |s| {
        let record = s
            .record
            .as_mut()
            .ok_or(ReviewError::MissingInput("extraction"))?;
        json_manager::delete_field(record, &name, &s.user, &query.note, opts)
    })
    .map(Json)
}

async fn field_history(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Json<Vec<FieldHistoryEntry>>> {
    read_session(&state, &id, |s| {
        let record = record_of(s)?;
        let history = json_manager::field_history(record, &name);
        if history.is_empty() && record.field(&name).is_none() {
            return Err(ReviewError::UnknownField(name));
        }
        Ok(history)
    })
    .map(Json)
}

#[derive(Deserialize)]
struct BatchEditRequest {
    edits: Vec<FieldEdit>,
    #[serde(default)]
    note: String,
}

async fn batch_edit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BatchEditRequest>,
) -> Result<Json<EditOutcome>> {
    if req.edits.is_empty() {
        return Err(ReviewError::BadRequest("no edits given".into()));
    }
    let opts = state.config.edit_options();
    write_session(&state, &id, |s| {
        let record = s
            .record
            .as_mut()
            .ok_or(ReviewError::MissingInput("extraction"))?;
        json_manager::apply_edits(record, req.edits, &s.user, &req.note, opts)
    })
    .map(Json)
}

#[derive(Serialize)]
struct ValidationReport {
    warnings: Vec<ValidationWarning>,
    formulas: Vec<FormulaCheck>,
}

async fn get_validation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ValidationReport>> {
    let tolerance = state.config.formula_tolerance;
    read_session(&state, &id, |s| {
        let record = record_of(s)?;
        Ok(ValidationReport {
            warnings: rules::validate_record(record, tolerance),
            formulas: rules::check_formulas(record, tolerance),
        })
    })
    .map(Json)
}

#[derive(Deserialize)]
struct FormatQuery {
    format: Option<String>,
}

async fn get_provenance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FormatQuery>,
) -> Result<Response> {
    read_session(&state, &id, |s| {
        let record = record_of(s)?;
        match query.format.as_deref() {
            None | Some("json") => Ok((
                [(header::CONTENT_TYPE, "application/json")],
                json_manager::provenance_report(record)?,
            )
                .into_response()),
            Some("csv") => Ok((
                [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
                json_manager::provenance_csv(record)?,
            )
                .into_response()),
            Some(other) => Err(ReviewError::BadRequest(format!(
                "unsupported provenance format '{}'",
                other
            ))),
        }
    })
}

async fn export_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    read_session(&state, &id, |s| {
        let record = record_of(s)?;
        let body = json_manager::export(record)?;
        let filename = json_manager::export_filename(
            s.extraction_filename.as_deref().unwrap_or("extraction.json"),
        );
        info!("Exporting session {} as {}", s.id, filename);
        Ok((
            [
                (header::CONTENT_TYPE, "application/json".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", filename),
                ),
            ],
            body,
        )
            .into_response())
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SearchSource {
    /// OCR tokens when present, otherwise document text.
    #[default]
    Auto,
    Text,
    Ocr,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(default)]
    mode: SearchMode,
    #[serde(default)]
    source: SearchSource,
    kind: Option<KindFilter>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    mode: SearchMode,
    source: &'static str,
    total: usize,
    matches: Vec<SearchMatch>,
}

async fn search_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>> {
    if query.q.trim().is_empty() {
        return Err(ReviewError::BadRequest("search query must not be empty".into()));
    }
    let kind = query.kind.unwrap_or(KindFilter::Word);

    read_session(&state, &id, |s| {
        let (source, matches) = match (query.source, &s.ocr, &s.document) {
            (SearchSource::Auto | SearchSource::Ocr, Some(ocr), _) => (
                "ocr",
                search::search_tokens(
                    ocr.tokens.iter().filter(|t| kind.accepts(t.kind)),
                    &query.q,
                    query.mode,
                ),
            ),
            (SearchSource::Ocr, None, _) => return Err(ReviewError::MissingInput("OCR file")),
            (_, _, Some(doc)) => (
                "text",
                search::search_text(&doc.page_texts(), &query.q, query.mode),
            ),
            (_, _, None) => return Err(ReviewError::MissingInput("document")),
        };
        Ok(SearchResponse {
            query: query.q.clone(),
            mode: query.mode,
            source,
            total: matches.len(),
            matches,
        })
    })
    .map(Json)
}

#[derive(Deserialize)]
struct OverlayQuery {
    format: Option<String>,
    #[serde(default)]
    kind: KindFilter,
}

async fn page_overlay(
    State(state): State<AppState>,
    Path((id, page)): Path<(String, u32)>,
    Query(query): Query<OverlayQuery>,
) -> Result<Response> {
    read_session(&state, &id, |s| {
        let ocr = s.ocr.as_ref().ok_or(ReviewError::MissingInput("OCR file"))?;
        let (width, height) = s
            .document
            .as_ref()
            .and_then(|d| d.page_size(page))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let overlay: PageOverlay =
            viewer::page_overlay(ocr.page_tokens(page), page, width, height, query.kind);

        match query.format.as_deref() {
            None | Some("json") => Ok(Json(overlay).into_response()),
            Some("svg") => {
                let background = s
                    .document
                    .as_ref()
                    .filter(|d| d.kind == DocumentKind::Image)
                    .map(LoadedDocument::data_url);
                Ok((
                    [(header::CONTENT_TYPE, "image/svg+xml")],
                    viewer::render_svg(&overlay, background.as_deref()),
                )
                    .into_response())
            }
            Some(other) => Err(ReviewError::BadRequest(format!(
                "unsupported overlay format '{}'",
                other
            ))),
        }
    })
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

async fn chat_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatMessage>> {
    let question = req.message.trim().to_string();
    if question.is_empty() {
        return Err(ReviewError::BadRequest("message must not be empty".into()));
    }
    let tolerance = state.config.formula_tolerance;
    write_session(&state, &id, |s| {
        let ctx = ChatContext {
            document: s.document.as_ref(),
            record: s.record.as_ref(),
            ocr: s.ocr.as_ref(),
            formula_tolerance: tolerance,
        };
        let reply = ChatMessage {
            role: Role::Assistant,
            content: chat::respond(&question, &ctx),
        };
        s.chat_history.push(ChatMessage {
            role: Role::User,
            content: question,
        });
        s.chat_history.push(reply.clone());
        Ok(reply)
    })
    .map(Json)
}

async fn chat_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>> {
    read_session(&state, &id, |s| Ok(s.chat_history.clone())).map(Json)
}

async fn clear_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    write_session(&state, &id, |s| {
        s.chat_history.clear();
        Ok(StatusCode::NO_CONTENT)
    })
}
