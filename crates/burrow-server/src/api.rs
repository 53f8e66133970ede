//! Management API and landing routes, served when a request carries no
//! tunnel subdomain.

use std::sync::{Arc, LazyLock};

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use regex::Regex;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use burrow_core::{AgentError, ClientRegistry};

/// Subdomain labels: lowercase alphanumerics with interior hyphens, between
/// 4 and 63 characters.
static SUBDOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9][a-z0-9-]{4,63}[a-z0-9]|[a-z0-9]{4,63})$")
        .unwrap_or_else(|e| panic!("subdomain regex: {e}"))
});

pub fn is_valid_subdomain(id: &str) -> bool {
    SUBDOMAIN_RE.is_match(id)
}

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ClientRegistry>,
    /// Base domain under which tunnels are exposed.
    pub domain: String,
    /// Where bare-domain browsers are redirected.
    pub landing: String,
    /// Advertise https URLs in creation responses.
    pub secure: bool,
}

#[derive(Debug, Serialize)]
pub struct NewClientResponse {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ApiMessage {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tunnels: usize,
    pub mem: u64,
}

#[derive(Debug, Serialize)]
pub struct TunnelStatusResponse {
    pub connected_sockets: usize,
}

pub fn admin_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/status", get(status))
        .route("/api/tunnels/{id}/status", get(tunnel_status))
        .route("/api/tunnels/{id}/kill", post(kill_tunnel))
        .route("/{id}", get(new_named_client))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /` redirects to the landing page; `GET /?new` creates a tunnel with
/// a random human-readable id.
async fn root(State(state): State<ApiState>, RawQuery(query): RawQuery) -> Response {
    let wants_new = query
        .as_deref()
        .map(|q| q.split('&').any(|p| p == "new" || p.starts_with("new=")))
        .unwrap_or(false);

    if wants_new {
        create_client(&state, None).await.into_response()
    } else {
        landing_redirect(&state.landing)
    }
}

/// 302 to the landing page. Built by hand: `axum::response::Redirect` only
/// offers 303, 307 and 308.
fn landing_redirect(landing: &str) -> Response {
    match Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, landing)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, landing, "landing url is not a valid Location header");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /{id}` creates a tunnel with the requested subdomain.
async fn new_named_client(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<NewClientResponse>, (StatusCode, Json<ApiMessage>)> {
    if !is_valid_subdomain(&id) {
        debug!(requested = %id, "rejected invalid subdomain");
        return Err((
            StatusCode::FORBIDDEN,
            Json(ApiMessage {
                message: format!(
                    "Invalid subdomain {id:?}. Subdomains are lowercase alphanumerics (with interior hyphens), 4 to 63 characters."
                ),
            }),
        ));
    }
    create_client(&state, Some(&id)).await
}

async fn create_client(
    state: &ApiState,
    requested_id: Option<&str>,
) -> Result<Json<NewClientResponse>, (StatusCode, Json<ApiMessage>)> {
    match state.registry.new_client(requested_id).await {
        Ok(info) => {
            let scheme = if state.secure { "https" } else { "http" };
            let url = format!("{scheme}://{}.{}", info.id, state.domain);
            Ok(Json(NewClientResponse {
                id: info.id,
                port: info.port,
                max_conn_count: info.max_conn_count,
                url,
            }))
        }
        Err(e @ AgentError::ExhaustedRange(_)) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiMessage {
                message: e.to_string(),
            }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiMessage {
                message: e.to_string(),
            }),
        )),
    }
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tunnels: state.registry.tunnel_count(),
        mem: resident_memory_bytes(),
    })
}

async fn tunnel_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelStatusResponse>, (StatusCode, Json<ApiMessage>)> {
    match state.registry.get_client(&id) {
        Some(session) => Ok(Json(TunnelStatusResponse {
            connected_sockets: session.connected_sockets(),
        })),
        None => Err(client_not_found()),
    }
}

/// `POST /api/tunnels/{id}/kill` removes a session when the bearer token
/// carries the same `name` claim as the configured secret.
async fn kill_tunnel(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiMessage>, (StatusCode, Json<ApiMessage>)> {
    let Some(session) = state.registry.get_client(&id) else {
        return Err(client_not_found());
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if session.is_authorized(token) => {
            state.registry.remove_client(&id);
            Ok(Json(ApiMessage {
                message: "killed".to_string(),
            }))
        }
        _ => {
            debug!(client = %id, "kill request rejected");
            Err((
                StatusCode::FORBIDDEN,
                Json(ApiMessage {
                    message: "Forbidden".to_string(),
                }),
            ))
        }
    }
}

fn client_not_found() -> (StatusCode, Json<ApiMessage>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiMessage {
            message: "Client not found".to_string(),
        }),
    )
}

/// Resident set size of this process, best effort (0 where unsupported).
fn resident_memory_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Some(pages) = std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| {
                statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|v| v.parse::<u64>().ok())
            })
        {
            return pages * 4096;
        }
    }
    0
}
