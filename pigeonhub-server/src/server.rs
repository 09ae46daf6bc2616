//! Server state and listener lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::hub::{self, HubState};
use crate::message::now_ms;
use crate::registry::PeerRegistry;

/// A frame queued for a client connection, or an order to close it.
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

/// Handle to a live client connection. The session number distinguishes a
/// connection from its same-id successor so that a superseded read task
/// cannot tear down the replacement's state.
pub struct ConnHandle {
    pub tx: mpsc::Sender<Outbound>,
    pub session: u64,
    /// Cleared when the mailbox overflows; the read loop disconnects the
    /// peer at its next message.
    pub healthy: Arc<AtomicBool>,
}

/// A peer promoted to hub, either by announcing `isHub` or by announcing
/// into the hub-mesh namespace.
#[derive(Debug, Clone)]
pub struct HubRecord {
    pub peer_id: String,
    pub registered_at: u64,
    pub last_activity: u64,
    pub network_name: String,
    pub data: serde_json::Value,
}

/// Counters exposed by /metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    pub evictions: AtomicU64,
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub relays_out: AtomicU64,
    pub relay_deduped: AtomicU64,
    pub frames_dropped: AtomicU64,
}

/// Shared state accessible by all connection handlers.
///
/// Three mutable regions, each behind its own lock: the connection map, the
/// peer registry (plus hub table), and the hub state. Lock order when more
/// than one is needed: connections → registry → hubs → hub_state. Target ids
/// are collected under a lock and written after release; all socket writes
/// go through the per-connection mailbox.
pub struct SharedState {
    pub config: ServerConfig,
    /// 40-hex id this server announces into the mesh (hub mode only).
    pub hub_peer_id: Option<String>,
    pub started_at: Instant,
    /// Address actually bound (the configured port may have been probed past).
    pub bound_addr: Mutex<Option<SocketAddr>>,
    /// peer id → mailbox for the connection's writer task.
    pub connections: Mutex<HashMap<String, ConnHandle>>,
    pub registry: Mutex<PeerRegistry>,
    /// hub peer id → hub record.
    pub hubs: Mutex<HashMap<String, HubRecord>>,
    /// Bootstrap links, cross-hub cache, relay dedup. Owned by the mesh
    /// client; the signaling router reads through it.
    pub hub_state: Mutex<HubState>,
    pub metrics: Metrics,
    session_counter: AtomicU64,
}

impl SharedState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let hub_peer_id = config.is_hub.then(generate_peer_id);
        if let Some(ref id) = hub_peer_id {
            tracing::info!(hub_peer_id = %id, "Generated hub peer id");
        }
        Arc::new(Self {
            config,
            hub_peer_id,
            started_at: Instant::now(),
            bound_addr: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            registry: Mutex::new(PeerRegistry::new()),
            hubs: Mutex::new(HashMap::new()),
            hub_state: Mutex::new(HubState::default()),
            metrics: Metrics::default(),
            session_counter: AtomicU64::new(0),
        })
    }

    pub fn next_session(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a frame for a connected peer. Returns false if the peer is gone
    /// or its mailbox is full; an overflowing peer is flagged for disconnect.
    pub fn send_to_peer(&self, peer_id: &str, frame: String) -> bool {
        let conns = self.connections.lock();
        let Some(handle) = conns.get(peer_id) else {
            return false;
        };
        if handle.tx.try_send(Outbound::Frame(frame)).is_err() {
            tracing::warn!(peer_id, "send buffer full or closed");
            handle.healthy.store(false, Ordering::Relaxed);
            return false;
        }
        self.metrics.messages_out.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Record (or refresh) a hub-table entry.
    pub fn upsert_hub(&self, peer_id: &str, network: &str, data: serde_json::Value) {
        let mut hubs = self.hubs.lock();
        let now = now_ms();
        hubs.entry(peer_id.to_string())
            .and_modify(|h| {
                h.last_activity = now;
                h.network_name = network.to_string();
                h.data = data.clone();
            })
            .or_insert_with(|| HubRecord {
                peer_id: peer_id.to_string(),
                registered_at: now,
                last_activity: now,
                network_name: network.to_string(),
                data,
            });
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Generate a random 40-hex peer id.
pub fn generate_peer_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind the configured port, probing successors on conflict.
    async fn bind(&self) -> Result<TcpListener> {
        let host = &self.config.host;
        let mut last_err = None;
        for offset in 0..=self.config.max_port_retries {
            let port = self.config.port.saturating_add(offset);
            match TcpListener::bind(format!("{host}:{port}")).await {
                Ok(listener) => {
                    if offset > 0 {
                        tracing::warn!(port, "Configured port taken, bound successor");
                    }
                    return Ok(listener);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("at least one bind attempt"))
            .with_context(|| format!("no free port in {}..={}", self.config.port, self.config.port.saturating_add(self.config.max_port_retries)))
    }

    /// Build state, bind, and spawn the background tasks.
    async fn launch(self) -> Result<(Arc<SharedState>, TcpListener)> {
        let listener = self.bind().await?;
        let state = SharedState::new(self.config);
        let addr = listener.local_addr()?;
        *state.bound_addr.lock() = Some(addr);
        tracing::info!("Listening on {addr}");

        spawn_housekeeping(Arc::clone(&state));
        hub::spawn_mesh(Arc::clone(&state));

        Ok((state, listener))
    }

    /// Run the server, blocking until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let (state, listener) = self.launch().await?;
        let router = crate::web::router(Arc::clone(&state));

        let shutdown_state = Arc::clone(&state);
        let shutdown = async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
            }
            // Close every client socket gracefully; bootstrap links die with
            // the process.
            let conns = shutdown_state.connections.lock();
            for handle in conns.values() {
                let _ = handle.tx.try_send(Outbound::Close {
                    code: 1000,
                    reason: "server shutting down",
                });
            }
            let count = conns.len();
            drop(conns);
            tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
            tracing::info!("Shutdown complete ({count} connections closed)");
        };

        let serve = async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        };
        tokio::select! {
            _ = shutdown => {}
            result = serve => {
                result.context("HTTP server error")?;
            }
        }
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let (state, listener) = self.launch().await?;
        let addr = listener.local_addr()?;
        let router = crate::web::router(state);

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .context("HTTP server error")
        });

        Ok((addr, handle))
    }
}

/// Periodic sweep of the relay-dedup set.
fn spawn_housekeeping(state: Arc<SharedState>) {
    tokio::spawn(async move {
        let period = tokio::time::Duration::from_millis(state.config.cleanup_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // skip first immediate tick
        loop {
            interval.tick().await;
            let swept = state.hub_state.lock().sweep_relay_dedup(now_ms());
            if swept > 0 {
                tracing::debug!(swept, "Swept stale relay-dedup entries");
            }
        }
    });
}
