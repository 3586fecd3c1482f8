// [apps/server/src/routes.rs]
//! Router topology: the WebSocket endpoint and the agent download surface,
//! both behind the agent auth shield.

use axum::{
    middleware,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::{downloads, session};
use crate::middleware::agent_auth;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let agent_api = Router::new()
        .route("/config", get(downloads::timing_config))
        .route("/files/:file_type/:file_id", get(downloads::download_file))
        .route("/rules/chunks/:job_dir/:chunk_name", get(downloads::download_rule_chunk))
        .route("/hashlists/:hashlist_id", get(downloads::download_hashlist))
        .route("/hashlists/:hashlist_id/uncracked", get(downloads::download_uncracked));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest(
            "/api/agent",
            agent_api.layer(middleware::from_fn_with_state(state.clone(), agent_auth)),
        )
        .route(
            "/api/v1/ws/agent",
            get(session::upgrade_agent_session)
                .layer(middleware::from_fn_with_state(state.clone(), agent_auth)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
