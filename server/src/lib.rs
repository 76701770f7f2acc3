use anyhow::Result;
use axum::{extract::{Path, Query, State}, http::{HeaderMap, StatusCode}, routing::{get, post}, Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use visearch_core::engine::{Engine, EngineManager, EngineOptions, NamedHit, QueryRequest, Region};
use visearch_core::progress::{ProgressLine, StageState, StageStatus, StatusBoard, StatusEvent, StatusQueue, StatusUpdate, INDEX_STAGES};
use visearch_core::Error;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub indexer_bin: PathBuf,
    pub options: EngineOptions,
    pub admin_token: Option<String>,
    /// Load an engine on its first query.
    pub auto_load: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EngineManager>,
    pub config: Arc<ServerConfig>,
    pub status: Arc<Mutex<StatusBoard>>,
    pub updates: Arc<StatusQueue<StatusEvent>>,
    pub indexing: Arc<AtomicBool>,
    pub indexing_engine: Arc<Mutex<Option<String>>>,
}

#[derive(Deserialize)]
pub struct QueryParams {
    pub doc_id: u32,
    pub region: Option<String>,
    #[serde(default)]
    pub from: usize,
    #[serde(default = "default_to")]
    pub to: usize,
    #[serde(default)]
    pub score_threshold: f64,
}
fn default_to() -> usize { 20 }

#[derive(Serialize)]
pub struct QueryResponse {
    pub engine: String,
    pub took_s: f64,
    pub total_hits: usize,
    pub from: usize,
    pub results: Vec<NamedHit>,
}

#[derive(Deserialize)]
pub struct IndexStartBody {
    pub input: String,
}

pub fn build_app(config: ServerConfig) -> Result<Router> {
    Ok(build_app_with_state(config)?.0)
}

/// The router plus its shared state, for callers that preload engines.
pub fn build_app_with_state(config: ServerConfig) -> Result<(Router, AppState)> {
    let manager = Arc::new(EngineManager::new(&config.data_dir, config.options));
    let status = Arc::new(Mutex::new(StatusBoard::new(&INDEX_STAGES)));
    let updates: Arc<StatusQueue<StatusEvent>> = Arc::new(StatusQueue::new());

    // Single consumer: moves indexer updates onto the board.
    {
        let (status, updates) = (status.clone(), updates.clone());
        std::thread::Builder::new().name("index-status".into()).spawn(move || {
            while let Some(event) = updates.pop() {
                if !status.lock().handle(event.clone()) {
                    tracing::warn!(?event, "status for unknown stage");
                }
            }
        })?;
    }

    let app_state = AppState {
        manager,
        config: Arc::new(config),
        status,
        updates,
        indexing: Arc::new(AtomicBool::new(false)),
        indexing_engine: Arc::new(Mutex::new(None)),
    };

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/index_status", get(index_status))
        .route("/engines/:name/:version/exists", get(engine_exists))
        .route("/engines/:name/:version/load", post(engine_load))
        .route("/engines/:name/:version/unload", post(engine_unload))
        .route("/engines/:name/:version/query", get(query_handler))
        .route("/engines/:name/:version/index_start", post(index_start))
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);
    Ok((app, app_state))
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": msg.into() })))
}

fn core_error(e: Error) -> ApiError {
    let status = match e {
        Error::NotFound(_) | Error::OutOfRange { .. } | Error::UnknownEngine(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

async fn blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> visearch_core::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res.map_err(core_error),
        Err(e) => Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn engine_exists(State(state): State<AppState>, Path((name, version)): Path<(String, String)>) -> Json<Value> {
    Json(json!({ "exists": state.manager.exists(&name, &version) }))
}

async fn engine_load(State(state): State<AppState>, headers: HeaderMap, Path((name, version)): Path<(String, String)>) -> ApiResult<Value> {
    authorize(&state, &headers)?;
    let manager = state.manager.clone();
    let engine = blocking(move || manager.load(&name, &version)).await?;
    Ok(Json(json!({ "ok": "engine loaded", "engine": engine.id(), "num_docs": engine.meta().num_docs })))
}

async fn engine_unload(State(state): State<AppState>, headers: HeaderMap, Path((name, version)): Path<(String, String)>) -> ApiResult<Value> {
    authorize(&state, &headers)?;
    Ok(Json(json!({ "unloaded": state.manager.unload(&name, &version) })))
}

pub async fn query_handler(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Query(params): Query<QueryParams>,
) -> ApiResult<QueryResponse> {
    let start = std::time::Instant::now();
    let region = match params.region.as_deref() {
        Some(r) => Some(Region::parse(r).ok_or_else(|| error_response(StatusCode::BAD_REQUEST, format!("bad region {r:?}, expected x,y,w,h")))?),
        None => None,
    };
    let engine = find_engine(&state, name, version).await?;
    let req = QueryRequest { doc_id: params.doc_id, region, from: params.from, to: params.to, score_threshold: params.score_threshold };
    let id = engine.id().to_string();
    let page = blocking(move || engine.query(&req)).await?;

    let elapsed = start.elapsed();
    tracing::debug!(engine = %id, doc_id = params.doc_id, total_hits = page.total_hits, took_s = elapsed.as_secs_f64(), "query served");
    Ok(Json(QueryResponse { engine: id, took_s: elapsed.as_secs_f64(), total_hits: page.total_hits, from: params.from, results: page.hits }))
}

async fn find_engine(state: &AppState, name: String, version: String) -> std::result::Result<Arc<Engine>, ApiError> {
    match state.manager.get(&name, &version) {
        Ok(engine) => Ok(engine),
        Err(Error::UnknownEngine(_)) if state.config.auto_load && state.manager.exists(&name, &version) => {
            let manager = state.manager.clone();
            blocking(move || manager.load(&name, &version)).await
        }
        Err(e) => Err(core_error(e)),
    }
}

async fn index_status(State(state): State<AppState>) -> ApiResult<Vec<StageStatus>> {
    let board = state.status.lock();
    if !board.is_started() {
        return Err(error_response(StatusCode::BAD_REQUEST, "indexing not started yet!"));
    }
    Ok(Json(board.stages().to_vec()))
}

async fn index_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((name, version)): Path<(String, String)>,
    Json(body): Json<IndexStartBody>,
) -> ApiResult<Value> {
    authorize(&state, &headers)?;
    let output = state.manager.engine_dir(&name, &version).map_err(core_error)?;
    if state.indexing.swap(true, Ordering::SeqCst) {
        let current = state.indexing_engine.lock().clone().unwrap_or_default();
        return Err(error_response(StatusCode::BAD_REQUEST, format!("indexing ongoing for {current}")));
    }
    *state.indexing_engine.lock() = Some(visearch_core::engine::engine_id(&name, &version));
    state.updates.push(StatusEvent::Reset);

    let mut child = match tokio::process::Command::new(&state.config.indexer_bin)
        .arg("build")
        .arg("--input")
        .arg(&body.input)
        .arg("--output")
        .arg(&output)
        .stdout(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            state.updates.push(StatusUpdate::new(INDEX_STAGES[0].0, StageState::Error).into());
            finish_indexing(&state);
            return Err(error_response(StatusCode::BAD_REQUEST, format!("cannot start indexer: {e}")));
        }
    };
    let stdout = child.stdout.take();

    tokio::spawn(async move {
        let mut last_stage = INDEX_STAGES[0].0.to_string();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(progress) = ProgressLine::parse(&line) {
                    if progress.stage != last_stage {
                        state.updates.push(StatusUpdate::new(last_stage.clone(), StageState::Done).into());
                        last_stage = progress.stage.clone();
                    }
                    state.updates.push(progress.into_update().into());
                }
            }
        }
        match child.wait().await {
            Ok(status) if status.success() => {
                for (stage, _) in INDEX_STAGES {
                    state.updates.push(StatusUpdate::new(stage, StageState::Done).into());
                }
                tracing::info!(output = %output.display(), "indexing finished");
            }
            other => {
                state.updates.push(StatusUpdate::new(last_stage.clone(), StageState::Error).into());
                tracing::warn!(stage = %last_stage, result = ?other, "indexing failed");
            }
        }
        finish_indexing(&state);
    });

    Ok(Json(json!({ "ok": "indexing started" })))
}

fn finish_indexing(state: &AppState) {
    *state.indexing_engine.lock() = None;
    state.indexing.store(false, Ordering::SeqCst);
}

fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), ApiError> {
    let required = match &state.config.admin_token {
        Some(t) => t,
        None => return Err(error_response(StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set")),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid admin token"))
    }
}
