//! HTTP handlers: a Nix binary cache backed by `Store` values.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use nixpeer_core::NarInfo;
use nixpeer_store::{NarStream, Store, StoreError};

const CACHE_INFO_TYPE: &str = "text/x-nix-cache-info";
const NARINFO_TYPE: &str = "text/x-nix-narinfo";
const NAR_TYPE: &str = "application/x-nix-nar";

#[derive(Clone)]
pub struct ApiState {
    /// Local store, exposed under `local/nar`.
    pub local: Arc<dyn Store>,
    /// Discovery store, exposed under `v2/remote`.
    pub remote: Arc<dyn Store>,
    /// Priority advertised in `/nix-cache-info`.
    pub priority: i32,
}

// ── /nix-cache-info ───────────────────────────────────────────────────────────

pub async fn handle_cache_info(State(state): State<ApiState>) -> Response {
    let info = state.local.cache_info().await.with_priority(state.priority);
    ([(header::CONTENT_TYPE, CACHE_INFO_TYPE)], info.to_string()).into_response()
}

// ── narinfo ───────────────────────────────────────────────────────────────────

/// `/{hash}.narinfo`: asks the network. Only this machine's Nix may ask;
/// peers must use `/local/...` so lookups never fan out further.
pub async fn handle_remote_narinfo(
    State(state): State<ApiState>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    Path(file): Path<String>,
) -> Response {
    if !caller.ip().is_loopback() {
        tracing::warn!(%caller, "refused remote lookup from non-local caller");
        return (StatusCode::FORBIDDEN, "Permission denied.").into_response();
    }
    let Some(hash) = file.strip_suffix(".narinfo") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    narinfo_response(hash, state.remote.nar_info(hash).await)
}

/// `/local/{hash}.narinfo`: what this machine has. Peers fetch this after
/// a discovery answer.
pub async fn handle_local_narinfo(
    State(state): State<ApiState>,
    Path(file): Path<String>,
) -> Response {
    let Some(hash) = file.strip_suffix(".narinfo") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    narinfo_response(hash, state.local.nar_info(hash).await)
}

fn narinfo_response(hash: &str, result: Result<Option<NarInfo>, StoreError>) -> Response {
    match result {
        Ok(Some(info)) => ([(header::CONTENT_TYPE, NARINFO_TYPE)], info.to_string()).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!(hash, error = %e, "narinfo lookup failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

// ── nar ───────────────────────────────────────────────────────────────────────

pub async fn handle_local_nar(State(state): State<ApiState>, Path(file): Path<String>) -> Response {
    let url = format!("local/nar/{file}");
    nar_response(&url, state.local.nar(&url).await)
}

pub async fn handle_remote_nar(State(state): State<ApiState>, Path(path): Path<String>) -> Response {
    let url = format!("v2/remote/{path}");
    nar_response(&url, state.remote.nar(&url).await)
}

fn nar_response(url: &str, result: Result<NarStream, StoreError>) -> Response {
    match result {
        Ok(stream) => ([(header::CONTENT_TYPE, NAR_TYPE)], Body::from_stream(stream)).into_response(),
        Err(StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::warn!(url, error = %e, "nar open failed");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
