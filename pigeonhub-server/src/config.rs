//! Server configuration.
//!
//! Every option is available both as a CLI flag and as an environment
//! variable; the env names are contractual and match existing deployments.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "pigeonhub-server", about = "WebSocket signaling and peer-discovery server")]
pub struct ServerConfig {
    /// Bind host.
    #[arg(long, env = "HOST", default_value = "localhost")]
    pub host: String,

    /// Bind port. On conflict, the next ports are probed up to --max-port-retries.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Maximum concurrent client connections.
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 1000)]
    pub max_connections: usize,

    /// Value of the Access-Control-Allow-Origin header.
    #[arg(long, env = "CORS_ORIGIN", default_value = "*")]
    pub cors_origin: String,

    /// Run in hub mode: generate a hub peer id and join the hub mesh.
    #[arg(long, env = "IS_HUB")]
    pub is_hub: bool,

    /// Reserved network name that auto-promotes announcing peers to hubs.
    #[arg(long, env = "HUB_MESH_NAMESPACE", default_value = "pigeonhub-mesh")]
    pub hub_mesh_namespace: String,

    /// Comma-separated WebSocket URIs of bootstrap hubs to dial.
    #[arg(long, env = "BOOTSTRAP_HUBS", default_value = "")]
    pub bootstrap_hubs: String,

    /// If non-empty, clients must present this bearer token to connect.
    #[arg(long, env = "AUTH_TOKEN", default_value = "")]
    pub auth_token: String,

    /// Housekeeping period (relay-dedup sweep).
    #[arg(long, env = "CLEANUP_INTERVAL_MS", default_value_t = 30_000)]
    pub cleanup_interval_ms: u64,

    /// Advisory peer idle bound. Exposed in /stats; not enforced.
    #[arg(long, env = "PEER_TIMEOUT_MS", default_value_t = 300_000)]
    pub peer_timeout_ms: u64,

    /// Consecutive failed dials before a bootstrap link is dropped for good.
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    /// Delay between bootstrap dial attempts.
    #[arg(long, env = "RECONNECT_INTERVAL_MS", default_value_t = 5_000)]
    pub reconnect_interval_ms: u64,

    /// How many successor ports to try when the configured port is taken.
    #[arg(long, env = "MAX_PORT_RETRIES", default_value_t = 10)]
    pub max_port_retries: u16,
}

impl ServerConfig {
    /// Parsed bootstrap hub URIs, empty entries skipped.
    pub fn bootstrap_hubs(&self) -> Vec<String> {
        self.bootstrap_hubs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_list_skips_empty_entries() {
        let mut config = ServerConfig::parse_from(["pigeonhub-server"]);
        config.bootstrap_hubs = "ws://a:3000, ,ws://b:3001,".to_string();
        assert_eq!(config.bootstrap_hubs(), vec!["ws://a:3000", "ws://b:3001"]);

        config.bootstrap_hubs = String::new();
        assert!(config.bootstrap_hubs().is_empty());
    }

    #[test]
    fn defaults_match_contract() {
        let config = ServerConfig::parse_from(["pigeonhub-server"]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.hub_mesh_namespace, "pigeonhub-mesh");
        assert_eq!(config.cleanup_interval_ms, 30_000);
        assert!(!config.is_hub);
    }
}
