// [apps/server/src/middleware.rs]
//! Agent authentication: API key plus agent id headers resolved against the
//! registry, with the agent record attached for downstream handlers.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use krakenhashes_db::repositories::AgentRepository;

use crate::state::AppState;

pub async fn agent_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let agent_id = headers
        .get("x-agent-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok());

    let (Some(api_key), Some(agent_id)) = (api_key, agent_id) else {
        warn!("[AUTH]: request missing agent credentials");
        return (StatusCode::UNAUTHORIZED, "agent credentials required").into_response();
    };

    let agents = AgentRepository::new(state.db.clone());
    match agents.authenticate(agent_id, &api_key).await {
        Ok(agent) => {
            debug!("[AUTH]: agent {agent_id} authenticated");
            request.extensions_mut().insert(agent);
            next.run(request).await
        }
        Err(_) => {
            warn!("[AUTH]: rejected credentials for claimed agent {agent_id}");
            (StatusCode::UNAUTHORIZED, "invalid agent credentials").into_response()
        }
    }
}
