//! JSON HTTP API. Thin axum handlers delegating to `Store`/`Scanner`/`Supervisor` state —
//! the rich visual UI is an external collaborator and is not rendered here.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::ShryncError;
use crate::profiles;
use crate::supervisor::AppState;

impl IntoResponse for ShryncError {
    fn into_response(self) -> Response {
        let status = match &self {
            ShryncError::LibraryNotFound(_) | ShryncError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ShryncError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ShryncError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/stats", get(stats))
        .route("/api/recent", get(recent))
        .route("/api/savings", get(savings))
        .route("/api/libraries", get(list_libraries).post(create_library))
        .route("/api/libraries/:id", put(update_library).delete(delete_library))
        .route("/api/libraries/:id/scan", post(scan_library_route))
        .route("/api/libraries/:id/scan-status", get(library_scan_status))
        .route("/api/scan-status", get(all_scan_status))
        .route("/api/queue", get(list_queue))
        .route("/api/queue/:id", delete(delete_queue_job))
        .route("/api/queue/add", post(add_queue_job))
        .route("/api/settings", get(get_settings).post(post_settings))
        .route("/api/workers/pause", post(pause_workers))
        .route("/api/workers/resume", post(resume_workers))
        .route("/api/workers/status", get(workers_status))
        .route("/api/profiles", get(list_profiles))
        .route("/api/config", get(get_config))
        .route("/api/diagnostics", get(diagnostics))
        .route("/api/history", get(get_history).delete(clear_history))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html("<html><body><h1>shrync</h1><p>API server running.</p></body></html>")
}

async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let pending = state.store.count_by_status("pending").await?;
    let processing = state.store.count_by_status("processing").await?;
    let done_today = state.store.count_successes_today().await?;
    let errors = state.store.count_errors().await?;
    let saved_bytes = state.store.total_bytes_saved().await?;
    let active_libraries = state.store.active_library_count().await?;
    Ok(Json(json!({
        "pending": pending,
        "processing": processing,
        "done_today": done_today,
        "errors": errors,
        "saved_bytes": saved_bytes,
        "active_libraries": active_libraries,
    })))
}

async fn recent(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let entries = state.store.recent_successes(5).await?;
    Ok(Json(json!(entries)))
}

async fn savings(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let successes = state.store.all_successes().await?;
    let total_original: i64 = successes.iter().map(|h| h.original_size).sum();
    let total_new: i64 = successes.iter().map(|h| h.new_size).sum();

    let mut per_library: HashMap<String, i64> = HashMap::new();
    let mut per_day: HashMap<String, i64> = HashMap::new();
    for h in &successes {
        let saved = h.original_size - h.new_size;
        *per_library.entry(h.library_id.clone().unwrap_or_default()).or_insert(0) += saved;
        let day = h.finished_at.get(0..10).unwrap_or("").to_string();
        *per_day.entry(day).or_insert(0) += saved;
    }

    Ok(Json(json!({
        "total_saved_bytes": total_original - total_new,
        "total_original_bytes": total_original,
        "total_new_bytes": total_new,
        "per_library": per_library,
        "per_day": per_day,
    })))
}

async fn list_libraries(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.store.list_libraries().await?)))
}

#[derive(Deserialize)]
struct LibraryPayload {
    name: String,
    path: String,
    #[serde(default = "default_scan_interval")]
    scan_interval: i64,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_scan_interval() -> i64 {
    3600
}

fn default_enabled() -> bool {
    true
}

async fn create_library(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LibraryPayload>,
) -> ApiResult<Json<Value>> {
    let library = state
        .store
        .create_library(&payload.name, &payload.path, payload.scan_interval)
        .await?;

    let store = state.store.clone();
    let config = state.config.clone();
    let statuses = state.scan_statuses.clone();
    let lib_for_scan = library.clone();
    tokio::spawn(async move {
        let _ = crate::scanner::scan_library(&store, &config, &statuses, &lib_for_scan).await;
    });

    let watchers = state.watchers.clone();
    let store2 = state.store.clone();
    let config2 = state.config.clone();
    tokio::spawn(async move {
        let _ = crate::watcher::start_watchers(store2, config2, watchers).await;
    });

    Ok(Json(json!({ "id": library.id })))
}

async fn update_library(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(payload): Json<LibraryPayload>,
) -> ApiResult<Json<Value>> {
    let library = state
        .store
        .update_library(&id, &payload.name, &payload.path, payload.enabled, payload.scan_interval)
        .await?;

    let watchers = state.watchers.clone();
    let store = state.store.clone();
    let config = state.config.clone();
    tokio::spawn(async move {
        let _ = crate::watcher::start_watchers(store, config, watchers).await;
    });

    Ok(Json(json!(library)))
}

async fn delete_library(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_library(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn scan_library_route(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let library = state.store.get_library(&id).await?;
    let store = state.store.clone();
    let config = state.config.clone();
    let statuses = state.scan_statuses.clone();
    tokio::spawn(async move {
        let _ = crate::scanner::scan_library(&store, &config, &statuses, &library).await;
    });
    Ok(Json(json!({ "started": true })))
}

async fn library_scan_status(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Json<Value> {
    let snap = state.scan_statuses.lock().unwrap().get(&id).cloned();
    Json(json!(snap))
}

async fn all_scan_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snap = state.scan_statuses.lock().unwrap().clone();
    Json(json!(snap))
}

#[derive(Deserialize)]
struct QueueQuery {
    status: Option<String>,
}

async fn list_queue(
    State(state): State<Arc<AppState>>,
    Query(q): Query<QueueQuery>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!(state.store.list_queue(q.status.as_deref()).await?)))
}

async fn delete_queue_job(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<StatusCode> {
    let job = state.store.get_job(&id).await?;
    if job.status == "processing" {
        state.cancel_handles.cancel(&id);
    }
    state.store.delete_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AddQueuePayload {
    file_path: String,
}

async fn add_queue_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddQueuePayload>,
) -> ApiResult<Json<Value>> {
    if !std::path::Path::new(&payload.file_path).exists() {
        return Err(ShryncError::BadRequest("Bestand niet gevonden".to_string()));
    }
    if state.store.path_has_active_job(&payload.file_path).await? {
        return Err(ShryncError::BadRequest("Al in wachtrij".to_string()));
    }
    let size = std::fs::metadata(&payload.file_path).map(|m| m.len() as i64).unwrap_or(0);
    let job = state.store.enqueue_job(None, &payload.file_path, size).await?;
    Ok(Json(json!({ "id": job.id })))
}

async fn get_settings(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let settings: HashMap<String, String> = state.store.all_settings().await?.into_iter().collect();
    Ok(Json(json!(settings)))
}

async fn post_settings(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let mut restart_workers = false;
    for (key, value) in &payload {
        state.store.set_setting(key, value).await?;
        if key == "max_workers" {
            restart_workers = true;
        }
    }
    if restart_workers {
        let _ = state.restart_worker_pool().await;
    }
    Ok(Json(json!({ "ok": true })))
}

async fn pause_workers(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.paused.store(true, Ordering::SeqCst);
    Json(json!({ "paused": true }))
}

async fn resume_workers(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.paused.store(false, Ordering::SeqCst);
    Json(json!({ "paused": false }))
}

async fn workers_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "paused": state.paused.load(Ordering::SeqCst),
        "running": state.running.load(Ordering::SeqCst),
    }))
}

async fn list_profiles() -> Json<Value> {
    let profiles: Vec<Value> = profiles::PROFILES
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "label": p.label,
                "video_codec": p.video_codec,
                "gpu": p.video_codec.contains("nvenc"),
            })
        })
        .collect();
    Json(json!(profiles))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "gpu_available": state.config.gpu_available(),
        "gpu_mode": state.config.gpu_mode,
        "cache_dir": state.config.cache_dir.clone().unwrap_or_else(|| "(naast bronbestand)".to_string()),
        "version": state.config.version,
    }))
}

async fn diagnostics(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let libraries = state.store.list_libraries().await?;
    let mut per_library = Vec::new();
    for lib in &libraries {
        let path = std::path::Path::new(&lib.path);
        let exists = path.is_dir();
        let sample: Vec<String> = if exists {
            walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .take(5)
                .map(|e| e.path().display().to_string())
                .collect()
        } else {
            Vec::new()
        };
        per_library.push(json!({
            "id": lib.id,
            "name": lib.name,
            "path": lib.path,
            "exists": exists,
            "sample_files": sample,
        }));
    }

    let media_root = std::path::Path::new("/media");
    let media_listing: Vec<String> = if media_root.is_dir() {
        std::fs::read_dir(media_root)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().to_string()).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    Ok(Json(json!({
        "libraries": per_library,
        "media_root_listing": media_listing,
    })))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_per_page")]
    per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let (items, total) = state.store.history_page(q.page, q.per_page).await?;
    Ok(Json(json!({ "items": items, "total": total, "page": q.page, "per_page": q.per_page })))
}

async fn clear_history(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    state.store.clear_history().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_state() -> Arc<AppState> {
        let store = crate::store::Store::in_memory().await.unwrap();
        Arc::new(AppState {
            store: Arc::new(store),
            config: Arc::new(crate::config::AppConfig::default()),
            scan_statuses: crate::scanner::new_scan_status_map(),
            watchers: crate::watcher::WatcherSet::new(),
            active_slots: crate::worker_pool::ActiveSlots::new(),
            cancel_handles: crate::transcode::CancelHandles::new(),
            paused: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            worker_pool: std::sync::Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn stats_reflects_empty_store() {
        let state = test_state().await;
        let Json(value) = stats(State(state)).await.unwrap();
        assert_eq!(value["pending"], 0);
        assert_eq!(value["saved_bytes"], 0);
    }

    #[tokio::test]
    async fn add_queue_job_rejects_missing_file() {
        let state = test_state().await;
        let err = add_queue_job(
            State(state),
            Json(AddQueuePayload { file_path: "/no/such/file.mkv".to_string() }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShryncError::BadRequest(_)));
    }

    #[tokio::test]
    async fn add_queue_job_rejects_duplicate_pending_path() {
        let state = test_state().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("movie.mkv");
        std::fs::write(&file, b"data").unwrap();
        let path = file.to_str().unwrap().to_string();

        add_queue_job(State(state.clone()), Json(AddQueuePayload { file_path: path.clone() }))
            .await
            .unwrap();

        let err = add_queue_job(State(state), Json(AddQueuePayload { file_path: path }))
            .await
            .unwrap_err();
        assert!(matches!(err, ShryncError::BadRequest(_)));
    }
}
