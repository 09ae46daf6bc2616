//! Wire envelope and relay fingerprinting.
//!
//! Every frame exchanged with clients and hubs is a single JSON object with
//! a fixed set of field names. `data` is opaque: arbitrary JSON that round-
//! trips without coercion. Unknown fields are ignored on input; unknown
//! `type` values are dropped by the dispatcher without disconnecting.

use std::hash::Hasher;
use std::time::SystemTime;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `fromPeerId` used for every server-originated message.
pub const SYSTEM_PEER: &str = "system";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The JSON envelope shared by all message types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "fromPeerId", default, skip_serializing_if = "Option::is_none")]
    pub from_peer_id: Option<String>,
    #[serde(rename = "targetPeerId", default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    #[serde(rename = "networkName", default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Envelope {
    /// A server-originated message: `fromPeerId: "system"` plus a timestamp.
    pub fn system(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data: Some(data),
            from_peer_id: Some(SYSTEM_PEER.to_string()),
            target_peer_id: None,
            network_name: None,
            timestamp: Some(now_ms()),
        }
    }

    pub fn with_network(mut self, network: &str) -> Self {
        self.network_name = Some(network.to_string());
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target_peer_id = Some(target.to_string());
        self
    }

    /// Parse a text frame. Malformed JSON yields `None`; the caller drops
    /// the frame and keeps the connection.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(text) {
            Ok(env) if !env.kind.is_empty() => Some(env),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("dropping malformed frame: {e}");
                None
            }
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization is infallible")
    }
}

/// The `data` payload of a `peer-discovered` message: the peer's announce
/// data with `peerId` and `isHub` overlaid.
pub fn discovered_payload(
    data: &serde_json::Map<String, Value>,
    peer_id: &str,
    is_hub: bool,
) -> Value {
    let mut payload = data.clone();
    payload.insert("peerId".to_string(), Value::String(peer_id.to_string()));
    payload.insert("isHub".to_string(), Value::Bool(is_hub));
    Value::Object(payload)
}

/// Fingerprint of a signaling message for relay dedup:
/// `(type, source, target, 64-bit hash of canonical body)`.
///
/// The body hash is order-insensitive over object keys so that two JSON
/// encodings of the same payload collapse to one fingerprint.
pub fn signal_fingerprint(kind: &str, from: &str, target: &str, data: Option<&Value>) -> String {
    let mut canonical = String::new();
    if let Some(value) = data {
        write_canonical(value, &mut canonical);
    }
    let mut hasher = FnvHasher::default();
    hasher.write(canonical.as_bytes());
    format!("{kind}:{from}:{target}:{:016x}", hasher.finish())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
