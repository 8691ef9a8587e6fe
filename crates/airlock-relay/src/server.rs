//! HTTP surface of the relay: `/tunnel` upgrade and `/health`

use std::sync::Arc;

use airlock_monitor::{AgentHealth, HealthState, SessionHealth};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::{channel, RelayState};

/// How many live sessions the health payload lists at most.
const HEALTH_SESSION_LIMIT: usize = 10;

/// Build the relay router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route(airlock_proto::TUNNEL_PATH, get(tunnel_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Constant-time comparison of the presented credential against the
/// configured shared secret.
fn authorized(headers: &HeaderMap, token: &str) -> bool {
    let Some(presented) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };

    let expected = format!("Bearer {token}");
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

async fn tunnel_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers, state.token()) {
        tracing::warn!("Rejected tunnel upgrade: bad credentials");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let header_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    ws.max_message_size(airlock_proto::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| channel::run(state, socket, header_id))
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> Response {
    let mut clients = Vec::new();
    for agent in state.registry.list() {
        clients.push(AgentHealth {
            id: agent.agent_id().to_string(),
            connected: true,
            last_ping: agent.last_seen(),
            active_sessions: state.sessions.count_for_agent(agent.agent_id()).await,
        });
    }

    let sessions = state
        .sessions
        .list(HEALTH_SESSION_LIMIT)
        .await
        .into_iter()
        .map(|s| SessionHealth {
            id: s.id,
            client_id: s.agent_id,
            target: s.target,
            created_at: s.created_at,
        })
        .collect();

    let health = state.monitor.health(clients, sessions);
    let status = match health.status {
        HealthState::Healthy => StatusCode::OK,
        HealthState::Degraded | HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(health)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_authorized_accepts_exact_token() {
        assert!(authorized(&headers_with_auth("Bearer t"), "t"));
    }

    #[test]
    fn test_authorized_rejects_mismatches() {
        assert!(!authorized(&headers_with_auth("Bearer wrong"), "t"));
        assert!(!authorized(&headers_with_auth("Bearer tt"), "t"));
        assert!(!authorized(&headers_with_auth("t"), "t"));
        assert!(!authorized(&HeaderMap::new(), "t"));
    }
}
