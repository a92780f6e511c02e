//! HTTP surface.
//!
//! Thin: every handler delegates to one runtime-core method and maps its
//! error to a status via `EngineError::into_response`. The UI (when present)
//! is static files under `web/`, served as the fallback.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::error::EngineError;
use crate::model::{NewService, Service, ServicePatch};
use crate::settings::SettingsPatch;
use crate::state::AppState;
use crate::storage::ensure_dir;

type ApiResult<T> = std::result::Result<T, EngineError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/state", get(api_state))
        .route("/api/status", get(api_status))
        .route("/api/presets", get(api_presets))
        .route("/api/settings", get(api_settings_get).patch(api_settings_patch))
        .route("/api/services", post(api_service_add))
        .route(
            "/api/services/:id",
            axum::routing::patch(api_service_set).delete(api_service_delete),
        )
        .route("/api/mux/start", post(api_mux_start))
        .route("/api/mux/stop", post(api_mux_stop))
        .route("/api/logs", get(api_logs))
        .route(
            "/api/mot/:svc_id/logo",
            get(api_logo_get).post(api_logo_set).delete(api_logo_clear),
        )
        .fallback_service(ServeDir::new("web"))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "MuxPilot engine is running. Try /api/state"
}

async fn api_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.get_state().await)
}

async fn api_presets(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "presets": state.list_presets() }))
}

async fn api_settings_get(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "settings": state.settings().await }))
}

async fn api_settings_patch(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<serde_json::Value>> {
    let settings = state.patch_settings(patch).await?;
    Ok(Json(json!({ "ok": true, "settings": settings })))
}

async fn api_service_add(
    State(state): State<AppState>,
    Json(spec): Json<NewService>,
) -> ApiResult<(StatusCode, Json<Service>)> {
    let svc = state.add_service(spec).await?;
    Ok((StatusCode::CREATED, Json(svc)))
}

async fn api_service_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ServicePatch>,
) -> ApiResult<Json<Service>> {
    let svc = state.set_service(&id, patch).await?;
    Ok(Json(svc))
}

async fn api_service_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.delete_service(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_mux_start(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.start_mux().await?;
    Ok(Json(json!({ "ok": true })))
}

async fn api_mux_stop(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.stop_mux().await?;
    Ok(Json(json!({ "ok": true })))
}

async fn api_logs(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.sink.read_all(),
    )
        .into_response()
}

// --- Engine/host status ----------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EngineStatus {
    version: String,
    uptime_sec: u64,
    mux_running: bool,
    processes: Vec<String>,
    hostname: Option<String>,
    cpu_cores: usize,
    load_1m: f32,
    mem_total_mb: u64,
    mem_used_mb: u64,
}

async fn api_status(State(state): State<AppState>) -> Json<EngineStatus> {
    let mut sys = state.sys.lock().await;
    sys.refresh_all();
    let load = sysinfo::System::load_average();

    Json(EngineStatus {
        version: state.version.clone(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        mux_running: state.mux_running().await,
        processes: state.supervisor.running_keys(),
        hostname: sysinfo::System::host_name(),
        cpu_cores: sys.cpus().len(),
        load_1m: load.one as f32,
        mem_total_mb: sys.total_memory() / (1024 * 1024),
        mem_used_mb: sys.used_memory() / (1024 * 1024),
    })
}

// --- Station logo upload/serve/clear ---------------------------------------

const LOGO_NAMES: [&str; 3] = ["logo.jpg", "logo.png", "logo.webp"];

fn logo_content_type(name: &str) -> &'static str {
    if name.ends_with(".png") {
        "image/png"
    } else if name.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

async fn api_logo_get(
    State(state): State<AppState>,
    Path(svc_id): Path<String>,
) -> Response {
    let dir = state.paths.slide_dir_for(&svc_id);
    for name in LOGO_NAMES {
        let path = dir.join(name);
        if let Ok(bytes) = std::fs::read(&path) {
            return ([(header::CONTENT_TYPE, logo_content_type(name))], bytes).into_response();
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogoUpload {
    data_url: String,
}

/// Accepts the `data:image/...;base64,` URL the UI produces from a file
/// picker and stages it as the service's station logo.
async fn api_logo_set(
    State(state): State<AppState>,
    Path(svc_id): Path<String>,
    Json(body): Json<LogoUpload>,
) -> ApiResult<Json<serde_json::Value>> {
    let data_url = body.data_url;
    if !data_url.starts_with("data:image/") {
        return Err(EngineError::InvalidField(
            "dataUrl must be a data:image/* URL".into(),
        ));
    }
    let (mime, b64) = data_url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .ok_or_else(|| EngineError::InvalidField("invalid dataUrl".into()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|_| EngineError::InvalidField("invalid dataUrl".into()))?;

    let mime = mime.to_lowercase();
    let ext = if mime.contains("jpeg") || mime.contains("jpg") {
        "jpg"
    } else if mime.contains("webp") {
        "webp"
    } else {
        "png"
    };

    let dir = state.paths.slide_dir_for(&svc_id);
    ensure_dir(&dir)?;
    std::fs::write(dir.join(format!("logo.{ext}")), bytes)?;
    Ok(Json(json!({ "ok": true })))
}

async fn api_logo_clear(
    State(state): State<AppState>,
    Path(svc_id): Path<String>,
) -> Json<serde_json::Value> {
    let dir = state.paths.slide_dir_for(&svc_id);
    for name in LOGO_NAMES {
        let _ = std::fs::remove_file(dir.join(name));
    }
    Json(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logo_content_types() {
        assert_eq!(logo_content_type("logo.png"), "image/png");
        assert_eq!(logo_content_type("logo.webp"), "image/webp");
        assert_eq!(logo_content_type("logo.jpg"), "image/jpeg");
    }

    #[test]
    fn data_url_parsing_shape() {
        let data_url = "data:image/png;base64,aGVsbG8=";
        let (mime, b64) = data_url
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(b64).unwrap(),
            b"hello"
        );
    }
}
