//! Hub mesh: outbound bootstrap links, cross-hub peer cache, relay dedup.
//!
//! In hub mode the server dials each configured bootstrap URI and keeps the
//! link alive with bounded reconnects. On open it announces itself into the
//! hub-mesh namespace and replays every announced local peer; afterwards it
//! consumes remote `peer-discovered` frames (feeding the cross-hub cache and
//! local fan-out) and relayed signaling (delivered to local targets).
//!
//! A frame travels the mesh at most one round: gossip never returns to the
//! side it arrived from except as the single acceptance echo, and the
//! cross-hub cache upsert swallows idempotent replays, so an echo of an
//! already-cached peer terminates there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::message::{Envelope, discovered_payload, now_ms};
use crate::server::SharedState;

/// Relay-dedup entries older than this are swept by housekeeping.
pub const RELAY_DEDUP_TTL_MS: u64 = 5_000;

/// Delay before the mesh client starts dialing.
const MESH_WARMUP: Duration = Duration::from_secs(1);

/// Outbound frame queue per bootstrap link.
const LINK_MAILBOX: usize = 256;

/// Where a mesh frame came from: an outbound bootstrap link, or an inbound
/// connection from a peer that announced itself as a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshOrigin {
    Link(String),
    Peer(String),
}

impl MeshOrigin {
    fn tag(&self) -> &str {
        match self {
            MeshOrigin::Link(uri) => uri,
            MeshOrigin::Peer(id) => id,
        }
    }
}

/// Per-URI state of an outbound bootstrap connection.
#[derive(Debug)]
pub struct BootstrapLink {
    pub uri: String,
    pub tx: Option<mpsc::Sender<String>>,
    pub connected: bool,
    pub last_attempt: u64,
    pub attempt_number: u32,
}

impl BootstrapLink {
    fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            tx: None,
            connected: false,
            last_attempt: 0,
            attempt_number: 0,
        }
    }
}

/// A peer learned through the mesh, kept per network as a backfill hint for
/// newly-announcing local peers.
#[derive(Debug, Clone)]
pub struct CachedPeer {
    pub data: Value,
    /// The link URI or hub peer id this entry was learned from; entries are
    /// swept when that source goes away for good.
    pub origin: String,
}

/// Bootstrap table, cross-hub cache, and relay-dedup set. One lock region.
#[derive(Debug, Default)]
pub struct HubState {
    pub bootstrap: HashMap<String, BootstrapLink>,
    /// network name → peer id → cached announce data.
    pub cross_hub: HashMap<String, HashMap<String, CachedPeer>>,
    /// relay fingerprint → insertion time (ms).
    pub relay_seen: HashMap<String, u64>,
}

impl HubState {
    /// Record a relay fingerprint. Returns false if it was already present
    /// (the message is a duplicate within the dedup window).
    pub fn check_and_insert_relay(&mut self, fingerprint: &str, now: u64) -> bool {
        if self.relay_seen.contains_key(fingerprint) {
            return false;
        }
        self.relay_seen.insert(fingerprint.to_string(), now);
        true
    }

    /// Drop dedup entries older than [`RELAY_DEDUP_TTL_MS`]. Returns how many.
    pub fn sweep_relay_dedup(&mut self, now: u64) -> usize {
        let before = self.relay_seen.len();
        self.relay_seen
            .retain(|_, inserted| now.saturating_sub(*inserted) < RELAY_DEDUP_TTL_MS);
        before - self.relay_seen.len()
    }

    /// Upsert a cross-hub cache entry. Returns true when the entry is new or
    /// its data changed; an identical replay (including the acceptance echo
    /// coming back around) is absorbed here.
    pub fn upsert_cached(&mut self, network: &str, peer_id: &str, data: Value, origin: &str) -> bool {
        let peers = self.cross_hub.entry(network.to_string()).or_default();
        match peers.get_mut(peer_id) {
            Some(entry) if entry.data == data => {
                entry.origin = origin.to_string();
                false
            }
            _ => {
                peers.insert(
                    peer_id.to_string(),
                    CachedPeer {
                        data,
                        origin: origin.to_string(),
                    },
                );
                true
            }
        }
    }

    /// Drop the cache entry for a peer in one network (local peer with the
    /// same id disconnected).
    pub fn remove_cached_peer(&mut self, network: &str, peer_id: &str) {
        if let Some(peers) = self.cross_hub.get_mut(network) {
            peers.remove(peer_id);
            if peers.is_empty() {
                self.cross_hub.remove(network);
            }
        }
    }

    /// Drop every cache entry learned from `origin` (a torn-down link or a
    /// disconnected inbound hub).
    pub fn sweep_cache_origin(&mut self, origin: &str) {
        self.cross_hub.retain(|_, peers| {
            peers.retain(|_, cached| cached.origin != origin);
            !peers.is_empty()
        });
    }

    /// (total, connected) bootstrap link counts.
    pub fn link_counts(&self) -> (usize, usize) {
        let total = self.bootstrap.len();
        let connected = self.bootstrap.values().filter(|l| l.connected).count();
        (total, connected)
    }
}

/// Start the mesh client if hub mode is enabled and bootstrap URIs are
/// configured. Each link gets its own dial/reconnect task.
pub fn spawn_mesh(state: Arc<SharedState>) {
    if !state.config.is_hub {
        return;
    }
    let uris = state.config.bootstrap_hubs();
    if uris.is_empty() {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(MESH_WARMUP).await;
        for uri in uris {
            if is_self_dial(&state, &uri) {
                tracing::info!(%uri, "Skipping bootstrap URI that points at ourselves");
                continue;
            }
            state
                .hub_state
                .lock()
                .bootstrap
                .insert(uri.clone(), BootstrapLink::new(&uri));
            let link_state = Arc::clone(&state);
            tokio::spawn(run_link(link_state, uri));
        }
    });
}

/// Dial loop for one bootstrap URI: connect, run the session until it drops,
/// retry at a fixed interval until the consecutive-failure cap is reached.
async fn run_link(state: Arc<SharedState>, uri: String) {
    let retry = Duration::from_millis(state.config.reconnect_interval_ms.max(1));
    loop {
        {
            let mut hub = state.hub_state.lock();
            let Some(link) = hub.bootstrap.get_mut(&uri) else {
                return;
            };
            link.last_attempt = now_ms();
            link.attempt_number += 1;
        }
        match connect_async(dial_url(&state, &uri)).await {
            Ok((ws, _response)) => {
                tracing::info!(%uri, "Bootstrap link established");
                run_link_session(&state, &uri, ws).await;
                tracing::warn!(%uri, "Bootstrap link dropped");
            }
            Err(e) => tracing::warn!(%uri, "Bootstrap dial failed: {e}"),
        }
        let exhausted = {
            let hub = state.hub_state.lock();
            hub.bootstrap
                .get(&uri)
                .is_none_or(|l| l.attempt_number >= state.config.max_reconnect_attempts)
        };
        if exhausted {
            tracing::warn!(%uri, "Bootstrap retry cap exceeded, dropping link");
            let mut hub = state.hub_state.lock();
            hub.bootstrap.remove(&uri);
            hub.sweep_cache_origin(&uri);
            return;
        }
        tokio::time::sleep(retry).await;
    }
}

/// One established link: writer task fed by a mailbox, greeting (announce +
/// local-peer replay), then the read loop until close.
async fn run_link_session(
    state: &Arc<SharedState>,
    uri: &str,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(LINK_MAILBOX);
    {
        let mut hub = state.hub_state.lock();
        let Some(link) = hub.bootstrap.get_mut(uri) else {
            return;
        };
        link.connected = true;
        link.attempt_number = 0;
        link.tx = Some(tx.clone());
    }

    let write_uri = uri.to_string();
    let write_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                tracing::warn!(uri = %write_uri, "Bootstrap write error: {e}");
                break;
            }
        }
    });

    for frame in greeting_frames(state) {
        if tx.send(frame).await.is_err() {
            break;
        }
    }

    let origin = MeshOrigin::Link(uri.to_string());
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handle_mesh_frame(state, &origin, text.as_str()),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%uri, "Bootstrap read error: {e}");
                break;
            }
        }
    }

    {
        let mut hub = state.hub_state.lock();
        if let Some(link) = hub.bootstrap.get_mut(uri) {
            link.connected = false;
            link.tx = None;
        }
    }
    write_handle.abort();
}

/// Frames sent when a link opens: our hub announce into the mesh namespace,
/// then one `peer-discovered` per announced local peer carrying that peer's
/// own network name.
fn greeting_frames(state: &SharedState) -> Vec<String> {
    let Some(hub_id) = state.hub_peer_id.clone() else {
        return Vec::new();
    };
    let (host, port) = bind_endpoint(state);
    let mut frames = Vec::new();

    let announce = Envelope {
        kind: "announce".to_string(),
        data: Some(json!({
            "isHub": true,
            "peerId": hub_id.as_str(),
            "host": host,
            "port": port,
            "capabilities": ["signaling", "relay"],
            "timestamp": now_ms(),
        })),
        from_peer_id: Some(hub_id.clone()),
        target_peer_id: None,
        network_name: Some(state.config.hub_mesh_namespace.clone()),
        timestamp: Some(now_ms()),
    };
    frames.push(announce.encode());

    let peers = state.registry.lock().announced_peers();
    for peer in peers {
        if peer.is_hub {
            continue;
        }
        let Some(network) = peer.network_name.clone() else {
            continue;
        };
        let mut env = Envelope::system(
            "peer-discovered",
            discovered_payload(&peer.data, &peer.peer_id, false),
        )
        .with_network(&network);
        env.from_peer_id = Some(hub_id.clone());
        frames.push(env.encode());
    }
    frames
}

/// Handle a frame arriving from the mesh, either over a bootstrap link or
/// from an inbound hub connection (the connection dispatcher calls in here
/// for peers promoted to hubs).
pub fn handle_mesh_frame(state: &Arc<SharedState>, origin: &MeshOrigin, text: &str) {
    let Some(env) = Envelope::parse(text) else {
        return;
    };
    dispatch_mesh(state, origin, env);
}

pub fn dispatch_mesh(state: &Arc<SharedState>, origin: &MeshOrigin, env: Envelope) {
    match env.kind.as_str() {
        "peer-discovered" => ingest_discovered(state, origin, &env),
        "offer" | "answer" | "ice-candidate" => {
            // Relayed signaling: deliver to the local target if present.
            if let Some(target) = env.target_peer_id.clone() {
                state.send_to_peer(&target, env.encode());
            }
        }
        _ => {}
    }
}

/// Process a remote `peer-discovered`: hubs are recorded in the hub table,
/// ordinary peers are cached, fanned out to local members of the network,
/// gossiped to the rest of the mesh, and echoed back to the sender.
pub fn ingest_discovered(state: &Arc<SharedState>, origin: &MeshOrigin, env: &Envelope) {
    let Some(Value::Object(data)) = env.data.as_ref() else {
        return;
    };
    let Some(peer_id) = data.get("peerId").and_then(Value::as_str).map(str::to_string) else {
        return;
    };
    if state.hub_peer_id.as_deref() == Some(peer_id.as_str()) {
        return;
    }
    let network = env
        .network_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "global".to_string());
    let is_hub = data.get("isHub").and_then(Value::as_bool).unwrap_or(false);
    if is_hub {
        state.upsert_hub(&peer_id, &network, Value::Object(data.clone()));
        return;
    }
    if state.connections.lock().contains_key(&peer_id) {
        // One of our own peers reflected back: the far side accepted the
        // announcement. Nothing further to propagate.
        tracing::debug!(peer_id = %peer_id, "Mesh acknowledged local peer");
        return;
    }

    let fresh = state.hub_state.lock().upsert_cached(
        &network,
        &peer_id,
        Value::Object(data.clone()),
        origin.tag(),
    );
    if !fresh {
        return;
    }

    let targets = state.registry.lock().active_in_network(&network, Some(&peer_id));
    let frame = Envelope::system("peer-discovered", Value::Object(data.clone()))
        .with_network(&network)
        .encode();
    for target in &targets {
        state.send_to_peer(target, frame.clone());
    }
    broadcast_to_mesh(state, &frame, Some(origin));
    send_to_origin(state, origin, frame);
}

/// Send a frame to every mesh neighbor: connected bootstrap links plus
/// inbound hub connections, minus `exclude`. Returns how many accepted it.
pub fn broadcast_to_mesh(state: &SharedState, frame: &str, exclude: Option<&MeshOrigin>) -> usize {
    let mut sent = 0;

    let link_txs: Vec<mpsc::Sender<String>> = {
        let hub = state.hub_state.lock();
        hub.bootstrap
            .values()
            .filter(|link| link.connected)
            .filter(|link| !matches!(exclude, Some(MeshOrigin::Link(uri)) if *uri == link.uri))
            .filter_map(|link| link.tx.clone())
            .collect()
    };
    for tx in &link_txs {
        if tx.try_send(frame.to_string()).is_ok() {
            sent += 1;
        }
    }

    let hub_peers: Vec<String> = {
        let registry = state.registry.lock();
        registry
            .announced_peers()
            .into_iter()
            .filter(|peer| peer.is_hub)
            .map(|peer| peer.peer_id)
            .filter(|id| !matches!(exclude, Some(MeshOrigin::Peer(peer)) if peer == id))
            .collect()
    };
    for id in &hub_peers {
        if state.send_to_peer(id, frame.to_string()) {
            sent += 1;
        }
    }
    sent
}

fn send_to_origin(state: &SharedState, origin: &MeshOrigin, frame: String) {
    match origin {
        MeshOrigin::Link(uri) => {
            let tx = {
                let hub = state.hub_state.lock();
                hub.bootstrap.get(uri).and_then(|link| link.tx.clone())
            };
            if let Some(tx) = tx {
                let _ = tx.try_send(frame);
            }
        }
        MeshOrigin::Peer(peer_id) => {
            state.send_to_peer(peer_id, frame);
        }
    }
}

/// Replay our inventory to a peer that just announced itself as a hub: our
/// own hub identity first, then every announced local (non-hub) peer. This is
/// the inbound counterpart of the replay a dialing hub performs on link open;
/// without it, peers announced before the link existed would stay invisible
/// to the far side.
pub fn replay_to_promoted_hub(state: &Arc<SharedState>, hub_peer: &str) {
    if let Some(ref our_id) = state.hub_peer_id {
        let (host, port) = bind_endpoint(state);
        let env = Envelope::system(
            "peer-discovered",
            json!({
                "peerId": our_id,
                "isHub": true,
                "host": host,
                "port": port,
                "capabilities": ["signaling", "relay"],
            }),
        )
        .with_network(&state.config.hub_mesh_namespace);
        state.send_to_peer(hub_peer, env.encode());
    }

    let peers = state.registry.lock().announced_peers();
    for peer in peers {
        if peer.is_hub || peer.peer_id == hub_peer {
            continue;
        }
        let Some(network) = peer.network_name.clone() else {
            continue;
        };
        let env = Envelope::system(
            "peer-discovered",
            discovered_payload(&peer.data, &peer.peer_id, false),
        )
        .with_network(&network);
        state.send_to_peer(hub_peer, env.encode());
    }
}

/// The endpoint we present to the mesh.
fn bind_endpoint(state: &SharedState) -> (String, u16) {
    let port = (*state.bound_addr.lock())
        .map(|addr| addr.port())
        .unwrap_or(state.config.port);
    (state.config.host.clone(), port)
}

/// Dial URL with our hub peer id (and auth token, if configured) appended.
fn dial_url(state: &SharedState, uri: &str) -> String {
    let Some(hub_id) = state.hub_peer_id.clone() else {
        return uri.to_string();
    };
    match Url::parse(uri) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("peerId", &hub_id);
            if !state.config.auth_token.is_empty() {
                parsed
                    .query_pairs_mut()
                    .append_pair("token", &state.config.auth_token);
            }
            parsed.to_string()
        }
        Err(_) => uri.to_string(),
    }
}

/// True when the URI's host+port is our own bind endpoint.
fn is_self_dial(state: &SharedState, uri: &str) -> bool {
    let Ok(parsed) = Url::parse(uri) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let default_port = match parsed.scheme() {
        "wss" | "https" => 443,
        _ => 80,
    };
    let port = parsed.port().unwrap_or(default_port);
    let our_port = (*state.bound_addr.lock())
        .map(|addr| addr.port())
        .unwrap_or(state.config.port);
    if port != our_port {
        return false;
    }
    host == state.config.host || (is_loopback(host) && is_loopback(&state.config.host))
}

fn is_loopback(host: &str) -> bool {
    host == "localhost" || host.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relay_dedup_rejects_within_window() {
        let mut hub = HubState::default();
        assert!(hub.check_and_insert_relay("offer:a:b:0011", 1_000));
        assert!(!hub.check_and_insert_relay("offer:a:b:0011", 1_500));
        assert!(hub.check_and_insert_relay("offer:a:b:ffee", 1_500));
    }

    #[test]
    fn relay_sweep_honors_ttl() {
        let mut hub = HubState::default();
        hub.check_and_insert_relay("old", 0);
        hub.check_and_insert_relay("young", 4_000);
        assert_eq!(hub.sweep_relay_dedup(RELAY_DEDUP_TTL_MS + 1), 1);
        assert!(!hub.relay_seen.contains_key("old"));
        assert!(hub.relay_seen.contains_key("young"));
        // the swept entry may be relayed again
        assert!(hub.check_and_insert_relay("old", RELAY_DEDUP_TTL_MS + 2));
    }

    #[test]
    fn cache_upsert_is_idempotent() {
        let mut hub = HubState::default();
        let data = json!({"peerId": "x", "name": "n"});
        assert!(hub.upsert_cached("net1", "x", data.clone(), "ws://h1"));
        assert!(!hub.upsert_cached("net1", "x", data, "ws://h2"));
        assert!(hub.upsert_cached("net1", "x", json!({"peerId": "x", "name": "m"}), "ws://h2"));
    }

    #[test]
    fn cache_sweeps_by_origin() {
        let mut hub = HubState::default();
        hub.upsert_cached("net1", "x", json!({}), "ws://h1");
        hub.upsert_cached("net1", "y", json!({}), "ws://h2");
        hub.upsert_cached("net2", "z", json!({}), "ws://h1");
        hub.sweep_cache_origin("ws://h1");
        assert!(hub.cross_hub.get("net1").is_some_and(|p| !p.contains_key("x")));
        assert!(hub.cross_hub.get("net1").is_some_and(|p| p.contains_key("y")));
        assert!(!hub.cross_hub.contains_key("net2"));
    }

    #[test]
    fn cache_removal_drops_empty_networks() {
        let mut hub = HubState::default();
        hub.upsert_cached("net1", "x", json!({}), "ws://h1");
        hub.remove_cached_peer("net1", "x");
        assert!(!hub.cross_hub.contains_key("net1"));
    }
}
