//! `announce` handling: hub promotion, discovery fan-out, and backfills.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::hub::{self, MeshOrigin};
use crate::message::{Envelope, discovered_payload};
use crate::server::SharedState;

/// Process an `announce` from a connected peer.
///
/// Order is contractual for a single announce: fan out to the network, then
/// backfill the announcer with existing members, then with mesh-cached peers,
/// then propagate outward. Per-connection FIFO is the only cross-announce
/// guarantee.
pub fn handle_announce(state: &Arc<SharedState>, peer_id: &str, env: Envelope) {
    let data: Map<String, Value> = match env.data {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let network = env
        .network_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "global".to_string());
    let is_hub = data.get("isHub").and_then(Value::as_bool).unwrap_or(false)
        || network == state.config.hub_mesh_namespace;

    let was_hub = {
        let registry = state.registry.lock();
        registry.get(peer_id).is_some_and(|r| r.is_hub)
    };
    if !state
        .registry
        .lock()
        .mark_announced(peer_id, &network, is_hub, data.clone())
    {
        // The connection is already being torn down.
        return;
    }
    if is_hub {
        state.upsert_hub(peer_id, &network, Value::Object(data.clone()));
    }
    tracing::info!(%peer_id, %network, is_hub, "Peer announced");

    // Fan out to every other announced member of the network.
    let others = state.registry.lock().active_in_network(&network, Some(peer_id));
    let frame = Envelope::system("peer-discovered", discovered_payload(&data, peer_id, is_hub))
        .with_network(&network)
        .encode();
    for member in &others {
        state.send_to_peer(member, frame.clone());
    }

    // Backfill the announcer with the members that were already there.
    for member in &others {
        let payload = {
            let registry = state.registry.lock();
            registry
                .get(member)
                .map(|r| discovered_payload(&r.data, &r.peer_id, r.is_hub))
        };
        if let Some(payload) = payload {
            state.send_to_peer(
                peer_id,
                Envelope::system("peer-discovered", payload)
                    .with_network(&network)
                    .encode(),
            );
        }
    }

    // Backfill with peers learned through the hub mesh. Entries for locally
    // connected ids were already covered above.
    let cached: Vec<Value> = {
        let hub_state = state.hub_state.lock();
        hub_state
            .cross_hub
            .get(&network)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(id, _)| id.as_str() != peer_id)
                    .map(|(_, cached)| cached.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    };
    for payload in cached {
        let locally_connected = payload
            .get("peerId")
            .and_then(Value::as_str)
            .is_some_and(|id| state.connections.lock().contains_key(id));
        if locally_connected {
            continue;
        }
        state.send_to_peer(
            peer_id,
            Envelope::system("peer-discovered", payload)
                .with_network(&network)
                .encode(),
        );
    }

    // Propagate outward through the mesh.
    if is_hub {
        hub::broadcast_to_mesh(state, &frame, Some(&MeshOrigin::Peer(peer_id.to_string())));
        if !was_hub {
            // Newly promoted hub: replay our inventory so peers announced
            // before this link existed become visible on the far side.
            hub::replay_to_promoted_hub(state, peer_id);
        }
    } else {
        hub::broadcast_to_mesh(state, &frame, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::{ConnHandle, Outbound};
    use clap::Parser;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn pid(c: char) -> String {
        std::iter::repeat(c).take(40).collect()
    }

    fn test_state() -> Arc<SharedState> {
        SharedState::new(ServerConfig::parse_from(["pigeonhub-server"]))
    }

    /// Register a fake connection and return its mailbox receiver.
    fn attach(state: &Arc<SharedState>, peer_id: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(64);
        let handle = ConnHandle {
            tx,
            session: state.next_session(),
            healthy: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        };
        state.connections.lock().insert(peer_id.to_string(), handle);
        state
            .registry
            .lock()
            .insert(peer_id, "127.0.0.1:0")
            .expect("fresh peer");
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Frame(text) = out {
                frames.push(serde_json::from_str(&text).expect("valid frame"));
            }
        }
        frames
    }

    fn announce(state: &Arc<SharedState>, peer_id: &str, network: &str, data: Value) {
        handle_announce(
            state,
            peer_id,
            Envelope {
                kind: "announce".into(),
                data: Some(data),
                network_name: Some(network.into()),
                ..Default::default()
            },
        );
    }

    #[test]
    fn announce_fans_out_and_backfills() {
        let state = test_state();
        let mut rx_a = attach(&state, &pid('a'));
        let mut rx_b = attach(&state, &pid('b'));

        announce(&state, &pid('a'), "global", json!({"name": "alice"}));
        assert!(drain(&mut rx_a).is_empty(), "first peer hears nothing");

        announce(&state, &pid('b'), "global", json!({"name": "bob"}));

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["type"], "peer-discovered");
        assert_eq!(to_a[0]["data"]["peerId"], pid('b'));
        assert_eq!(to_a[0]["data"]["name"], "bob");
        assert_eq!(to_a[0]["fromPeerId"], "system");

        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1, "backfill of the existing member");
        assert_eq!(to_b[0]["data"]["peerId"], pid('a'));
        assert_eq!(to_b[0]["data"]["name"], "alice");
    }

    #[test]
    fn networks_are_isolated() {
        let state = test_state();
        let mut rx_a = attach(&state, &pid('a'));
        let mut rx_b = attach(&state, &pid('b'));

        announce(&state, &pid('a'), "net1", json!({}));
        announce(&state, &pid('b'), "net2", json!({}));

        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn missing_network_defaults_to_global() {
        let state = test_state();
        let _rx_a = attach(&state, &pid('a'));
        handle_announce(
            &state,
            &pid('a'),
            Envelope {
                kind: "announce".into(),
                ..Default::default()
            },
        );
        let registry = state.registry.lock();
        assert_eq!(
            registry.get(&pid('a')).unwrap().network_name.as_deref(),
            Some("global")
        );
    }

    #[test]
    fn hub_promotion_paths_are_equivalent() {
        let state = test_state();
        let _rx_a = attach(&state, &pid('a'));
        let _rx_b = attach(&state, &pid('b'));

        announce(&state, &pid('a'), "global", json!({"isHub": true}));
        let namespace = state.config.hub_mesh_namespace.clone();
        announce(&state, &pid('b'), &namespace, json!({}));

        let hubs = state.hubs.lock();
        let a = hubs.get(&pid('a')).expect("flag promotion");
        let b = hubs.get(&pid('b')).expect("namespace promotion");
        assert_eq!(a.network_name, "global");
        assert_eq!(b.network_name, namespace);
        assert!(state.registry.lock().get(&pid('b')).unwrap().is_hub);
    }

    #[test]
    fn cached_mesh_peers_are_backfilled() {
        let state = test_state();
        state.hub_state.lock().upsert_cached(
            "global",
            &pid('c'),
            json!({"peerId": pid('c'), "isHub": false}),
            "ws://far-hub",
        );
        let mut rx_a = attach(&state, &pid('a'));

        announce(&state, &pid('a'), "global", json!({}));

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["data"]["peerId"], pid('c'));
        assert_eq!(to_a[0]["networkName"], "global");
    }

    #[test]
    fn reannounce_notifies_again_but_membership_stays_single() {
        let state = test_state();
        let mut rx_a = attach(&state, &pid('a'));
        let _rx_b = attach(&state, &pid('b'));

        announce(&state, &pid('b'), "global", json!({}));
        announce(&state, &pid('a'), "global", json!({}));
        drain(&mut rx_a);
        announce(&state, &pid('b'), "global", json!({}));

        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 1, "one notification per re-announce");
        assert_eq!(
            state.registry.lock().active_in_network("global", None).len(),
            2
        );
    }
}
