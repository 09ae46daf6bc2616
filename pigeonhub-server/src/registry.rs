//! Peer registry: one record per live connection plus the per-network
//! membership sets.
//!
//! All mutations keep the two maps transactional with respect to a single
//! peer id: every id in a membership set has a live record whose network
//! matches the set's key, and empty sets are removed eagerly.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::now_ms;

/// A peer id is 40 lowercase hex characters.
pub fn is_valid_peer_id(id: &str) -> bool {
    id.len() == 40 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("peer id is already registered")]
    DuplicatePeer,
}

/// One record per active connection, keyed by peer id.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: String,
    pub remote_addr: String,
    pub connected_at: u64,
    pub last_activity: u64,
    pub announced_at: Option<u64>,
    pub announced: bool,
    /// Empty until the first announce; last announce wins.
    pub network_name: Option<String>,
    pub is_hub: bool,
    /// Opaque attribute bag from the announce message.
    pub data: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerRecord>,
    /// network name → announced peer ids. BTreeSet keeps the lexicographic
    /// order `active_in_network` promises.
    networks: HashMap<String, BTreeSet<String>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh record. Reconnections are resolved by the caller
    /// evicting the old connection first.
    pub fn insert(&mut self, peer_id: &str, remote_addr: &str) -> Result<(), RegistryError> {
        if self.peers.contains_key(peer_id) {
            return Err(RegistryError::DuplicatePeer);
        }
        let now = now_ms();
        self.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                remote_addr: remote_addr.to_string(),
                connected_at: now,
                last_activity: now,
                announced_at: None,
                announced: false,
                network_name: None,
                is_hub: false,
                data: Map::new(),
            },
        );
        Ok(())
    }

    /// Mark a peer announced and place it in `network`. Idempotent; a
    /// re-announce into a different network moves the membership (last
    /// announce wins). Returns false when no record exists.
    pub fn mark_announced(
        &mut self,
        peer_id: &str,
        network: &str,
        is_hub: bool,
        data: Map<String, Value>,
    ) -> bool {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return false;
        };
        if let Some(old) = record.network_name.take()
            && old != network
        {
            remove_member(&mut self.networks, &old, peer_id);
        }
        record.announced = true;
        record.announced_at = Some(now_ms());
        record.network_name = Some(network.to_string());
        record.is_hub = is_hub;
        record.data = data;
        self.networks
            .entry(network.to_string())
            .or_default()
            .insert(peer_id.to_string());
        true
    }

    pub fn touch(&mut self, peer_id: &str) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.last_activity = now_ms();
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Announced peers in `network`, ascending lexicographic, minus `exclude`.
    pub fn active_in_network(&self, network: &str, exclude: Option<&str>) -> Vec<String> {
        self.networks
            .get(network)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| exclude != Some(id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove the record and its membership entry. Returns the removed record.
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        let record = self.peers.remove(peer_id)?;
        if let Some(network) = record.network_name.as_deref() {
            remove_member(&mut self.networks, network, peer_id);
        }
        Some(record)
    }

    /// Snapshot of all announced peers (for hub-mesh replay).
    pub fn announced_peers(&self) -> Vec<PeerRecord> {
        self.peers.values().filter(|p| p.announced).cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }
}

fn remove_member(networks: &mut HashMap<String, BTreeSet<String>>, network: &str, peer_id: &str) {
    if let Some(members) = networks.get_mut(network) {
        members.remove(peer_id);
        if members.is_empty() {
            networks.remove(network);
        }
    }
}
