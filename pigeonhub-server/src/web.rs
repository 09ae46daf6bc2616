//! WebSocket upgrade endpoint and read-only observability API.
//!
//! `GET /` and `GET /ws` both upgrade. Upgrade-time preconditions are the
//! only 4xx this server returns: an invalid peer id is 403, a missing or
//! wrong token is 401. Everything after the upgrade is handled on the
//! socket itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::message::now_ms;
use crate::registry::is_valid_peer_id;
use crate::server::SharedState;

/// Build the axum router with the WebSocket and observability endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    let cors = match state.config.cors_origin.as_str() {
        "*" => CorsLayer::permissive(),
        origin => match origin.parse::<HeaderValue>() {
            Ok(value) => CorsLayer::new().allow_origin(value),
            Err(_) => {
                tracing::warn!(origin, "Invalid CORS_ORIGIN, falling back to *");
                CorsLayer::permissive()
            }
        },
    };

    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(api_health))
        .route("/stats", get(api_stats))
        .route("/hubs", get(api_hubs))
        .route("/hubstats", get(api_hubstats))
        .route("/metrics", get(api_metrics))
        .layer(cors)
        .with_state(state)
}

// ── WebSocket handler ──────────────────────────────────────────────────

/// Upgrade-time refusals, the only errors surfaced over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("peer id must be 40 lowercase hex characters")]
    InvalidPeerId,
    #[error("missing or invalid auth token")]
    Unauthorized,
}

impl AcceptError {
    fn status(&self) -> StatusCode {
        match self {
            AcceptError::InvalidPeerId => StatusCode::FORBIDDEN,
            AcceptError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "peerId")]
    peer_id: Option<String>,
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<SharedState>>,
) -> Result<Response, StatusCode> {
    let peer_id = match accept_upgrade(&state, &query, &headers) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(%remote_addr, "Upgrade refused: {e}");
            return Err(e.status());
        }
    };

    Ok(ws
        .on_upgrade(move |socket| crate::connection::handle(socket, peer_id, remote_addr, state))
        .into_response())
}

fn accept_upgrade(
    state: &SharedState,
    query: &WsQuery,
    headers: &HeaderMap,
) -> Result<String, AcceptError> {
    let peer_id = match query.peer_id {
        Some(ref id) if is_valid_peer_id(id) => id.clone(),
        _ => return Err(AcceptError::InvalidPeerId),
    };
    if !authorized(&state.config.auth_token, headers, query.token.as_deref()) {
        return Err(AcceptError::Unauthorized);
    }
    Ok(peer_id)
}

/// Token may come as `Authorization: Bearer <t>` or as the `token` query
/// parameter. An empty configured token disables the check.
fn authorized(expected: &str, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    if expected.is_empty() {
        return true;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    bearer == Some(expected) || query_token == Some(expected)
}

// ── Observability types ────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: u64,
    uptime: u64,
    #[serde(rename = "isHub")]
    is_hub: bool,
    connections: usize,
    peers: usize,
    hubs: usize,
    networks: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    hub_peer_id: Option<String>,
    hub_mesh_namespace: String,
    max_connections: usize,
    bootstrap_hubs: BootstrapSummary,
    uptime: u64,
    host: String,
    port: u16,
    connections: usize,
    peers: usize,
    networks: usize,
    hubs: usize,
    peer_timeout_ms: u64,
}

#[derive(Serialize)]
struct BootstrapSummary {
    total: usize,
    connected: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HubInfo {
    peer_id: String,
    registered_at: u64,
    last_activity: u64,
    network_name: String,
    data: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkInfo {
    uri: String,
    connected: bool,
    last_attempt: u64,
    attempt_number: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HubStatsResponse {
    hub_peer_id: Option<String>,
    hubs: usize,
    bootstrap_hubs: Vec<LinkInfo>,
}

// ── Observability handlers ─────────────────────────────────────────────

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    let connections = state.connections.lock().len();
    let (peers, networks) = {
        let registry = state.registry.lock();
        (registry.peer_count(), registry.network_count())
    };
    let hubs = state.hubs.lock().len();
    Json(HealthResponse {
        status: "healthy",
        timestamp: now_ms(),
        uptime: state.uptime_secs(),
        is_hub: state.config.is_hub,
        connections,
        peers,
        hubs,
        networks,
    })
}

async fn api_stats(State(state): State<Arc<SharedState>>) -> Json<StatsResponse> {
    let connections = state.connections.lock().len();
    let (peers, networks) = {
        let registry = state.registry.lock();
        (registry.peer_count(), registry.network_count())
    };
    let hubs = state.hubs.lock().len();
    let (total, connected) = state.hub_state.lock().link_counts();
    let port = (*state.bound_addr.lock())
        .map(|addr| addr.port())
        .unwrap_or(state.config.port);
    Json(StatsResponse {
        hub_peer_id: state.hub_peer_id.clone(),
        hub_mesh_namespace: state.config.hub_mesh_namespace.clone(),
        max_connections: state.config.max_connections,
        bootstrap_hubs: BootstrapSummary { total, connected },
        uptime: state.uptime_secs(),
        host: state.config.host.clone(),
        port,
        connections,
        peers,
        networks,
        hubs,
        peer_timeout_ms: state.config.peer_timeout_ms,
    })
}

async fn api_hubs(State(state): State<Arc<SharedState>>) -> Json<Vec<HubInfo>> {
    let hubs = state.hubs.lock();
    let mut list: Vec<HubInfo> = hubs
        .values()
        .map(|h| HubInfo {
            peer_id: h.peer_id.clone(),
            registered_at: h.registered_at,
            last_activity: h.last_activity,
            network_name: h.network_name.clone(),
            data: h.data.clone(),
        })
        .collect();
    list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
    Json(list)
}

async fn api_hubstats(State(state): State<Arc<SharedState>>) -> Json<HubStatsResponse> {
    let hubs = state.hubs.lock().len();
    let mut links: Vec<LinkInfo> = {
        let hub_state = state.hub_state.lock();
        hub_state
            .bootstrap
            .values()
            .map(|link| LinkInfo {
                uri: link.uri.clone(),
                connected: link.connected,
                last_attempt: link.last_attempt,
                attempt_number: link.attempt_number,
            })
            .collect()
    };
    links.sort_by(|a, b| a.uri.cmp(&b.uri));
    Json(HubStatsResponse {
        hub_peer_id: state.hub_peer_id.clone(),
        hubs,
        bootstrap_hubs: links,
    })
}

/// Plain-text counters for scraping.
async fn api_metrics(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    let connections = state.connections.lock().len();
    let (peers, networks) = {
        let registry = state.registry.lock();
        (registry.peer_count(), registry.network_count())
    };
    let hubs = state.hubs.lock().len();
    let m = &state.metrics;
    let body = format!(
        "pigeonhub_connections {connections}\n\
         pigeonhub_peers {peers}\n\
         pigeonhub_networks {networks}\n\
         pigeonhub_hubs {hubs}\n\
         pigeonhub_uptime_seconds {}\n\
         pigeonhub_connections_total {}\n\
         pigeonhub_evictions_total {}\n\
         pigeonhub_messages_in_total {}\n\
         pigeonhub_messages_out_total {}\n\
         pigeonhub_relays_out_total {}\n\
         pigeonhub_relay_deduped_total {}\n\
         pigeonhub_frames_dropped_total {}\n",
        state.uptime_secs(),
        m.connections_total.load(Ordering::Relaxed),
        m.evictions.load(Ordering::Relaxed),
        m.messages_in.load(Ordering::Relaxed),
        m.messages_out.load(Ordering::Relaxed),
        m.relays_out.load(Ordering::Relaxed),
        m.relay_deduped.load(Ordering::Relaxed),
        m.frames_dropped.load(Ordering::Relaxed),
    );
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
