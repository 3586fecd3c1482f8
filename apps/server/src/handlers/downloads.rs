// [apps/server/src/handlers/downloads.rs]
//! Read-only agent HTTP endpoints: timing config and file downloads with
//! digest headers. Hashlists come in three flavors: the regenerated
//! uncracked file, the original upload for association mode, and the LM
//! half listing.

use std::collections::HashMap;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use tracing::{debug, error, warn};
use uuid::Uuid;

use krakenhashes_db::repositories::settings as setting_keys;
use krakenhashes_db::repositories::{FileRepository, HashRepository, SettingsRepository};
use krakenhashes_models::{AgentTimingConfig, FileType, LM_HASH_TYPE};

use crate::state::AppState;

/// Digest header agents verify downloads against.
pub const CONTENT_MD5_HEADER: &str = "x-content-md5";

/// `GET /api/agent/config`: fetched by agents on every connect.
pub async fn timing_config(State(state): State<AppState>) -> Json<AgentTimingConfig> {
    let settings = SettingsRepository::new(state.db.clone());
    let defaults = AgentTimingConfig::default();
    Json(AgentTimingConfig {
        ping_period_seconds: settings
            .get_u64(setting_keys::AGENT_PING_PERIOD_SECONDS)
            .await
            .unwrap_or(defaults.ping_period_seconds),
        pong_wait_seconds: settings
            .get_u64(setting_keys::AGENT_PONG_WAIT_SECONDS)
            .await
            .unwrap_or(defaults.pong_wait_seconds),
        report_interval_seconds: settings
            .get_u64(setting_keys::REPORT_INTERVAL_SECONDS)
            .await
            .unwrap_or(defaults.report_interval_seconds),
    })
}

/// `GET /api/agent/files/{type}/{id}`: registered file download with the
/// digest advertised in a header.
pub async fn download_file(
    State(state): State<AppState>,
    AxumPath((type_raw, file_id)): AxumPath<(String, i64)>,
) -> Response {
    let Some(file_type) = FileType::parse(&type_raw) else {
        return (StatusCode::BAD_REQUEST, "unknown file type").into_response();
    };
    let files = FileRepository::new(state.db.clone());
    let file = match files.get(file_type, file_id).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "file not registered").into_response(),
    };

    let absolute = state.files_root.join(&file.server_path);
    match tokio::fs::read(&absolute).await {
        Ok(bytes) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&file.info.md5) {
                headers.insert(CONTENT_MD5_HEADER, value);
            }
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            (headers, bytes).into_response()
        }
        Err(io_error) => {
            error!("[DOWNLOADS]: read failed for {}: {io_error}", file.server_path);
            (StatusCode::NOT_FOUND, "file missing on disk").into_response()
        }
    }
}

/// `GET /api/agent/rules/chunks/{job_dir}/{chunk_name}`: rule chunk files
/// materialized for rule-split tasks.
pub async fn download_rule_chunk(
    State(state): State<AppState>,
    AxumPath((job_dir, chunk_name)): AxumPath<(String, String)>,
) -> Response {
    // Path segments are constrained to a uuid directory and a chunk file
    // name; anything with a separator is rejected.
    if job_dir.contains(['/', '\\']) || chunk_name.contains(['/', '\\']) {
        return (StatusCode::BAD_REQUEST, "invalid chunk path").into_response();
    }
    let absolute = state.files_root.join("rules").join("chunks").join(&job_dir).join(&chunk_name);
    match tokio::fs::read(&absolute).await {
        Ok(bytes) => bytes.into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "rule chunk not found").into_response(),
    }
}

/// `GET /api/agent/hashlists/{id}?mode=9`: the regenerated uncracked file,
/// or the original upload when the agent flags association mode.
pub async fn download_hashlist(
    State(state): State<AppState>,
    AxumPath(hashlist_id): AxumPath<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let hashes = HashRepository::new(state.db.clone());
    let hashlist = match hashes.get_hashlist(hashlist_id).await {
        Ok(hashlist) => hashlist,
        Err(_) => return (StatusCode::NOT_FOUND, "hashlist not found").into_response(),
    };

    let association_mode = params.get("mode").map(|mode| mode == "9").unwrap_or(false);
    if association_mode {
        // Mode 9 requires 1:1 line correspondence with the association
        // wordlist, so the processed dedup'd file would be wrong.
        let Some(original) = &hashlist.original_file_path else {
            warn!("[DOWNLOADS]: association request but no original for {hashlist_id}");
            return (StatusCode::NOT_FOUND, "original file unavailable").into_response();
        };
        return match tokio::fs::read(state.files_root.join(original)).await {
            Ok(bytes) => bytes.into_response(),
            Err(io_error) => {
                error!("[DOWNLOADS]: original read failed: {io_error}");
                (StatusCode::NOT_FOUND, "original file missing").into_response()
            }
        };
    }

    let path = state.files_root.join("hashlists").join(format!("{hashlist_id}.hash"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => bytes.into_response(),
        Err(_) => {
            // Not regenerated yet: serve straight from the store.
            debug!("[DOWNLOADS]: serving hashlist {hashlist_id} from the database");
            serve_uncracked(&hashes, hashlist_id, hashlist.hash_type_id).await
        }
    }
}

/// `GET /api/agent/hashlists/{id}/uncracked`: uncracked listing; LM lists
/// serve distinct 16-char halves.
pub async fn download_uncracked(
    State(state): State<AppState>,
    AxumPath(hashlist_id): AxumPath<Uuid>,
) -> Response {
    let hashes = HashRepository::new(state.db.clone());
    match hashes.get_hashlist(hashlist_id).await {
        Ok(hashlist) => serve_uncracked(&hashes, hashlist_id, hashlist.hash_type_id).await,
        Err(_) => (StatusCode::NOT_FOUND, "hashlist not found").into_response(),
    }
}

async fn serve_uncracked(
    hashes: &HashRepository,
    hashlist_id: Uuid,
    hash_type_id: u32,
) -> Response {
    let lines = if hash_type_id == LM_HASH_TYPE {
        hashes.uncracked_lm_halves(hashlist_id).await
    } else {
        hashes.uncracked_values(hashlist_id).await
    };
    match lines {
        Ok(lines) => {
            let mut body = String::with_capacity(lines.iter().map(|line| line.len() + 1).sum());
            for line in &lines {
                body.push_str(line);
                body.push('\n');
            }
            body.into_response()
        }
        Err(db_error) => {
            error!("[DOWNLOADS]: uncracked read failed: {db_error}");
            (StatusCode::INTERNAL_SERVER_ERROR, "listing failed").into_response()
        }
    }
}
