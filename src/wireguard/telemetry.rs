//! C8: periodic IPC polling and online/offline/handshake edge detection.
//!
//! A peer is online iff its last handshake is non-zero and within the last
//! 3 minutes, the fixed liveness window this system uses everywhere "online"
//! is derived from a handshake timestamp.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::store::{ConnectionEventKind, Store};
use crate::wireguard::ipc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Online,
    Offline,
}

#[derive(Debug, Clone, Default)]
struct LastSeen {
    liveness: Option<Liveness>,
    handshake_sec: u64,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Polls the IPC device on an interval and journals online/offline/handshake
/// transitions plus per-peer transfer totals into the store.
pub struct TelemetryPoller {
    store: Arc<Store>,
    interface: String,
    poll_interval: Duration,
    last: RwLock<HashMap<String, LastSeen>>,
}

impl TelemetryPoller {
    pub fn new(store: Arc<Store>, interface: impl Into<String>) -> Self {
        Self::with_interval(store, interface, Duration::from_secs(30))
    }

    pub fn with_interval(
        store: Arc<Store>,
        interface: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            interface: interface.into(),
            poll_interval,
            last: RwLock::new(HashMap::new()),
        }
    }

    /// Run until `stop` resolves. Poll errors (device briefly unavailable)
    /// are logged and do not terminate the loop — this is telemetry, not a
    /// control operation, so it follows the data-plane "never surface this
    /// per-tick" convention.
    pub async fn run(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(interface = %self.interface, error = %e, "telemetry poll failed");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> crate::error::Result<()> {
        let status = ipc::get(&self.interface).await?;
        let peers = self.store.list_peers().await?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        for peer_status in &status.peers {
            let Some(peer) = peers
                .iter()
                .find(|p| hex_matches(&p.public_key, &peer_status.public_key_hex))
            else {
                continue;
            };

            let keepalive_window = 180;
            let online = peer_status.last_handshake_time_sec != 0
                && now.saturating_sub(peer_status.last_handshake_time_sec) < keepalive_window;

            let mut last = self.last.write().await;
            let entry = last.entry(peer_status.public_key_hex.clone()).or_default();

            if peer_status.last_handshake_time_sec != 0
                && peer_status.last_handshake_time_sec != entry.handshake_sec
            {
                entry.handshake_sec = peer_status.last_handshake_time_sec;
                self.store
                    .append_connection_event(
                        peer.id,
                        &peer.name,
                        &peer.public_key,
                        ConnectionEventKind::Handshake,
                        peer_status.endpoint.as_deref().unwrap_or(""),
                        peer_status.rx_bytes,
                        peer_status.tx_bytes,
                    )
                    .await?;
            }

            let new_liveness = if online {
                Liveness::Online
            } else {
                Liveness::Offline
            };
            if entry.liveness != Some(new_liveness) {
                entry.liveness = Some(new_liveness);
                let kind = match new_liveness {
                    Liveness::Online => ConnectionEventKind::Online,
                    Liveness::Offline => ConnectionEventKind::Offline,
                };
                self.store
                    .append_connection_event(
                        peer.id,
                        &peer.name,
                        &peer.public_key,
                        kind,
                        peer_status.endpoint.as_deref().unwrap_or(""),
                        peer_status.rx_bytes,
                        peer_status.tx_bytes,
                    )
                    .await?;
            }
            let rx_delta = peer_status.rx_bytes.saturating_sub(entry.rx_bytes);
            let tx_delta = peer_status.tx_bytes.saturating_sub(entry.tx_bytes);
            entry.rx_bytes = peer_status.rx_bytes;
            entry.tx_bytes = peer_status.tx_bytes;
            drop(last);

            if rx_delta > 0 || tx_delta > 0 {
                self.store
                    .accumulate_peer_bytes(peer.id, tx_delta, rx_delta)
                    .await?;
            }
        }
        debug!(interface = %self.interface, peers = status.peers.len(), "telemetry poll complete");
        Ok(())
    }
}

fn hex_matches(public_key_b64: &str, public_key_hex: &str) -> bool {
    crate::wireguard::keys::b64_to_hex(public_key_b64)
        .map(|h| h == public_key_hex)
        .unwrap_or(false)
}
