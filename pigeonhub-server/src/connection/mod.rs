//! Per-client connection handler.
//!
//! Each upgraded WebSocket gets one read task. Writes are serialized through
//! a per-connection mailbox drained by a writer task, so no two tasks ever
//! write the socket concurrently. Dispatch is by envelope `type`:
//!
//! - [`discovery`] — `announce` processing and discovery fan-out
//! - [`signaling`] — `offer` / `answer` / `ice-candidate` routing
//!
//! Faults are isolated to the offending socket: malformed frames and unknown
//! types are dropped without disconnecting, and a socket error tears down
//! only that peer.

pub mod discovery;
pub mod signaling;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use crate::hub::{self, MeshOrigin};
use crate::message::{Envelope, now_ms};
use crate::server::{ConnHandle, Outbound, SharedState};

/// Text frames beyond this are dropped without processing.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Bounded mailbox per connection; overflow disconnects the peer.
const CONN_MAILBOX: usize = 1024;

/// Drive an accepted socket for its whole lifetime.
pub async fn handle(
    socket: WebSocket,
    peer_id: String,
    remote_addr: SocketAddr,
    state: Arc<SharedState>,
) {
    // Last-writer-wins: a reconnecting peer evicts its old socket. Doing
    // this before the cap check means a reconnect still fits at capacity.
    let evicted = state.connections.lock().remove(&peer_id);
    if let Some(old) = evicted {
        let _ = old.tx.try_send(Outbound::Close {
            code: close_code::POLICY,
            reason: "superseded by reconnect",
        });
        state.registry.lock().remove(&peer_id);
        state.hubs.lock().remove(&peer_id);
        state.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(%peer_id, "Evicted previous connection for reconnecting peer");
    }

    // Connection cap: accept, then close with policy-violation. No peer
    // record is ever created for the overflow socket.
    let at_capacity = state.connections.lock().len() >= state.config.max_connections;
    if at_capacity {
        tracing::warn!(%peer_id, %remote_addr, "Connection rejected: server at capacity");
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "connection limit reached".into(),
            })))
            .await;
        return;
    }

    if let Err(e) = state
        .registry
        .lock()
        .insert(&peer_id, &remote_addr.to_string())
    {
        // Two same-id upgrades racing; the other one owns the record.
        tracing::warn!(%peer_id, "Registry insert failed: {e}");
        return;
    }

    let session = state.next_session();
    let (tx, mut rx) = mpsc::channel::<Outbound>(CONN_MAILBOX);
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
    state.connections.lock().insert(
        peer_id.clone(),
        ConnHandle {
            tx,
            session,
            healthy: Arc::clone(&healthy),
        },
    );
    state.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
    tracing::info!(%peer_id, %remote_addr, "Peer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: sole owner of the sink.
    let write_peer = peer_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                        tracing::debug!(peer_id = %write_peer, "Write error: {e}");
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    state.send_to_peer(
        &peer_id,
        Envelope::system("connected", json!({"peerId": peer_id.as_str()})).encode(),
    );

    let mut reason = "connection closed";
    while let Some(frame) = ws_rx.next().await {
        // A stuck client whose mailbox overflowed gets disconnected here.
        if !healthy.load(Ordering::Relaxed) {
            tracing::info!(%peer_id, "Send mailbox overflowed, disconnecting");
            reason = "send buffer overflow";
            break;
        }
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%peer_id, "Read error: {e}");
                reason = "socket error";
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_LEN {
                    state.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                state.metrics.messages_in.fetch_add(1, Ordering::Relaxed);
                let Some(env) = Envelope::parse(text.as_str()) else {
                    state.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                state.registry.lock().touch(&peer_id);
                match env.kind.as_str() {
                    "announce" => discovery::handle_announce(&state, &peer_id, env),
                    "offer" | "answer" | "ice-candidate" => {
                        signaling::handle_signal(&state, &peer_id, env)
                    }
                    "ping" => {
                        let pong = Envelope::system("pong", json!({"timestamp": now_ms()}));
                        state.send_to_peer(&peer_id, pong.encode());
                    }
                    "goodbye" => {
                        if let Some(handle) = state.connections.lock().get(&peer_id) {
                            let _ = handle.tx.try_send(Outbound::Close {
                                code: close_code::NORMAL,
                                reason: "goodbye",
                            });
                        }
                        reason = "goodbye";
                        break;
                    }
                    "peer-discovered" => {
                        // No-op from ordinary clients; from a hub peer this is
                        // mesh gossip arriving on the inbound side.
                        let from_hub = state
                            .registry
                            .lock()
                            .get(&peer_id)
                            .is_some_and(|r| r.is_hub);
                        if from_hub {
                            hub::dispatch_mesh(&state, &MeshOrigin::Peer(peer_id.clone()), env);
                        }
                    }
                    // cleanup and anything unknown: ignore
                    _ => {}
                }
            }
            Message::Close(_) => break,
            // Ping/Pong frames are answered by the protocol layer
            _ => {}
        }
    }

    cleanup(&state, &peer_id, session, reason);
    // Removing the connection entry dropped the last mailbox sender, so the
    // writer task drains and exits on its own.
    let _ = write_handle;
}

/// Tear down a finished connection: remove it from every region and tell the
/// rest of its network. A superseded connection (evicted by a same-id
/// reconnect) finds a newer session under its id and leaves state alone.
fn cleanup(state: &Arc<SharedState>, peer_id: &str, session: u64, reason: &str) {
    {
        let mut conns = state.connections.lock();
        match conns.get(peer_id) {
            Some(handle) if handle.session == session => {
                conns.remove(peer_id);
            }
            _ => return,
        }
    }

    let Some(record) = state.registry.lock().remove(peer_id) else {
        return;
    };
    state.hubs.lock().remove(peer_id);

    let Some(network) = record.network_name.clone() else {
        tracing::info!(%peer_id, reason, "Peer disconnected (never announced)");
        return;
    };

    {
        let mut hub = state.hub_state.lock();
        hub.remove_cached_peer(&network, peer_id);
        if record.is_hub {
            hub.sweep_cache_origin(peer_id);
        }
    }

    if record.announced {
        let targets = state.registry.lock().active_in_network(&network, Some(peer_id));
        let frame = Envelope::system(
            "peer-disconnected",
            json!({
                "peerId": peer_id,
                "reason": reason,
                "isHub": record.is_hub,
            }),
        )
        .with_network(&network)
        .encode();
        for target in &targets {
            state.send_to_peer(target, frame.clone());
        }
    }
    tracing::info!(%peer_id, reason, "Peer disconnected");
}
