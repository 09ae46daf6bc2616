//! Signaling router: `offer`, `answer`, `ice-candidate`.
//!
//! A message for a local same-network target is forwarded directly. A target
//! on another network is refused silently, preserving network isolation.
//! Anything else
//! is relayed through the hub mesh, at most once per fingerprint within the
//! dedup window. Delivery is best-effort; the source is never notified.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::hub::{self, MeshOrigin};
use crate::message::{Envelope, SYSTEM_PEER, now_ms, signal_fingerprint};
use crate::server::SharedState;

pub fn handle_signal(state: &Arc<SharedState>, sender: &str, env: Envelope) {
    let Some(target) = env.target_peer_id.clone().filter(|t| !t.is_empty()) else {
        return;
    };

    let (sender_is_hub, sender_network) = {
        let registry = state.registry.lock();
        match registry.get(sender) {
            Some(record) => (record.is_hub, record.network_name.clone()),
            None => (false, None),
        }
    };

    // A hub relays on behalf of remote peers and its frames carry the
    // original source; an ordinary client cannot spoof one.
    let from = if sender_is_hub {
        env.from_peer_id
            .clone()
            .filter(|f| !f.is_empty() && f != SYSTEM_PEER)
            .unwrap_or_else(|| sender.to_string())
    } else {
        sender.to_string()
    };

    let network = env
        .network_name
        .clone()
        .filter(|n| !n.is_empty())
        .or(sender_network)
        .unwrap_or_else(|| "global".to_string());

    let out = Envelope {
        kind: env.kind.clone(),
        data: env.data.clone(),
        from_peer_id: Some(from.clone()),
        target_peer_id: Some(target.clone()),
        network_name: Some(network.clone()),
        timestamp: Some(now_ms()),
    };

    let target_network = {
        let registry = state.registry.lock();
        registry.get(&target).map(|r| r.network_name.clone())
    };
    if let Some(target_network) = target_network {
        if target_network.as_deref() == Some(network.as_str()) {
            state.send_to_peer(&target, out.encode());
        }
        // Cross-network targets are refused silently.
        return;
    }

    // Target is not local: relay once per dedup window.
    let fingerprint = signal_fingerprint(&env.kind, &from, &target, env.data.as_ref());
    let fresh = state
        .hub_state
        .lock()
        .check_and_insert_relay(&fingerprint, now_ms());
    if !fresh {
        state.metrics.relay_deduped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let exclude = sender_is_hub.then(|| MeshOrigin::Peer(sender.to_string()));
    let sent = hub::broadcast_to_mesh(state, &out.encode(), exclude.as_ref());
    if sent > 0 {
        state.metrics.relays_out.fetch_add(sent as u64, Ordering::Relaxed);
    }
}
