//! C7/C8: the WireGuard runtime manager. Owns the device lifecycle state
//! machine (`Uninitialized` -> `Initialized` -> `Running` -> `Stopped`) and
//! reconciles the persisted peer table against the live device over the
//! [`ipc`] client, the same two-sided split `boringtun` itself draws between
//! "device" and "UAPI caller".

pub mod device;
pub mod ipc;
pub mod keys;
pub mod platform;
pub mod telemetry;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::info;

use crate::error::{AppError, Result};
use crate::store::{ConnectionEvent, Peer, PeerInput, Store, WireGuardConfig};
use crate::wireguard::device::DeviceRuntime;
use crate::wireguard::ipc::PeerConfigUpdate;
use crate::wireguard::telemetry::TelemetryPoller;

/// WireGuard's own recommended MTU bounds (§7): anything above 1500 risks
/// fragmentation on most physical links, anything below 1280 breaks IPv6's
/// minimum MTU guarantee.
const MIN_MTU: u16 = 1280;
const MAX_MTU: u16 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Stopped = 3,
}

impl From<u8> for RuntimeState {
    fn from(v: u8) -> Self {
        match v {
            1 => RuntimeState::Initialized,
            2 => RuntimeState::Running,
            3 => RuntimeState::Stopped,
            _ => RuntimeState::Uninitialized,
        }
    }
}

/// Owns the WireGuard device lifecycle and peer reconciliation.
pub struct WireGuardManager {
    store: Arc<Store>,
    state: AtomicU8,
    telemetry_stop: RwLock<Option<watch::Sender<bool>>>,
    device: RwLock<Option<DeviceRuntime>>,
}

impl WireGuardManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            state: AtomicU8::new(RuntimeState::Uninitialized as u8),
            telemetry_stop: RwLock::new(None),
            device: RwLock::new(None),
        }
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: RuntimeState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Ensure the device has a keypair and listen port persisted, without
    /// touching the live device. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<()> {
        let cfg = self.store.get_wireguard_config().await?;
        if cfg.private_key.is_empty() || cfg.public_key.is_empty() {
            let (private_key, public_key) = keys::generate_keypair();
            let mut cfg = cfg;
            cfg.private_key = private_key;
            cfg.public_key = public_key;
            self.store.update_wireguard_config(&cfg).await?;
        }
        if self.state() == RuntimeState::Uninitialized {
            self.set_state(RuntimeState::Initialized);
        }
        Ok(())
    }

    /// Bring the device up: create the TUN + WireGuard device, configure its
    /// MTU and IP, push the device keypair and listen port, and reconcile
    /// every persisted peer onto it. Starts the background telemetry poller
    /// (§4.7 steps 1-6).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() == RuntimeState::Running {
            return Err(AppError::AlreadyRunning);
        }
        self.initialize().await?;

        let cfg = self.store.get_wireguard_config().await?;

        let runtime = DeviceRuntime::start(&cfg.interface_name)?;
        *self.device.write().await = Some(runtime);

        if let Err(e) = self.bring_device_up(&cfg).await {
            if let Some(runtime) = self.device.write().await.take() {
                runtime.stop();
            }
            return Err(e);
        }

        let (tx, rx) = watch::channel(false);
        *self.telemetry_stop.write().await = Some(tx);
        let poller = Arc::new(TelemetryPoller::new(self.store.clone(), cfg.interface_name.clone()));
        tokio::spawn(async move {
            poller.run(rx).await;
        });

        self.set_state(RuntimeState::Running);
        info!(interface = %cfg.interface_name, "wireguard runtime started");
        Ok(())
    }

    /// Steps 3-5: push keys/listen port over IPC, configure MTU/IP, reconcile
    /// peers. Split out of `start` so a failure partway through can be
    /// unwound by tearing down the device it just created.
    async fn bring_device_up(&self, cfg: &WireGuardConfig) -> Result<()> {
        platform::configure_interface_mtu(&cfg.interface_name, cfg.mtu).await?;
        platform::configure_interface_ip(&cfg.interface_name, &cfg.address).await?;

        ipc::set(
            &cfg.interface_name,
            Some(&cfg.private_key),
            Some(cfg.listen_port),
            false,
            &[],
        )
        .await?;

        self.reconcile_peers(cfg).await
    }

    /// Stop the telemetry poller, close the WireGuard device and its TUN
    /// handle (§4.7 Stop: "close the device... close the TUN handle
    /// explicitly... release").
    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.telemetry_stop.write().await.take() {
            let _ = tx.send(true);
        }
        if let Some(runtime) = self.device.write().await.take() {
            runtime.stop();
        }
        self.set_state(RuntimeState::Stopped);
        Ok(())
    }

    /// Stop then start again, picking up whatever config/peer changes were
    /// made while stopped (state machine: `Stopped -> Running`).
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    pub async fn get_config(&self) -> Result<WireGuardConfig> {
        self.store.get_wireguard_config().await
    }

    /// Persist a new config. MTU is validated against WireGuard's supported
    /// range (§7 `InvalidInput`); the caller must `restart` for interface
    /// name/listen-port/address/MTU changes to take effect on a running
    /// device.
    pub async fn update_config(&self, cfg: &WireGuardConfig) -> Result<WireGuardConfig> {
        if !(MIN_MTU..=MAX_MTU).contains(&cfg.mtu) {
            return Err(AppError::InvalidInput(format!(
                "mtu must be between {MIN_MTU} and {MAX_MTU}, got {}",
                cfg.mtu
            )));
        }
        self.store.update_wireguard_config(cfg).await?;
        self.store.get_wireguard_config().await
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.store.list_peers().await
    }

    pub async fn get_peer_config(&self, id: i64) -> Result<Peer> {
        self.store.get_peer(id).await
    }

    pub async fn get_connection_logs(
        &self,
        peer_id: Option<i64>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ConnectionEvent>> {
        self.store.list_connection_events(peer_id, page, page_size).await
    }

    /// Push every enabled persisted peer onto the device, replacing the
    /// live peer set wholesale (`replace_peers=true`), matching how the
    /// original reconciles its entire table on every config change rather
    /// than tracking an incremental diff.
    pub async fn reconcile_peers(&self, cfg: &WireGuardConfig) -> Result<()> {
        let peers = self.store.list_peers().await?;
        let updates: Vec<PeerConfigUpdate> = peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| peer_to_update(p, cfg))
            .collect::<Result<Vec<_>>>()?;

        ipc::set(&cfg.interface_name, None, None, true, &updates).await
    }

    pub async fn add_peer(&self, input: &PeerInput) -> Result<Peer> {
        let cfg = self.store.get_wireguard_config().await?;
        let peer = self.store.create_peer(input, &cfg.address).await?;
        if self.state() == RuntimeState::Running && peer.enabled {
            ipc::set(
                &cfg.interface_name,
                None,
                None,
                false,
                &[peer_to_update(&peer, &cfg)?],
            )
            .await?;
        }
        Ok(peer)
    }

    pub async fn remove_peer(&self, id: i64) -> Result<()> {
        let peer = self.store.get_peer(id).await?;
        let cfg = self.store.get_wireguard_config().await?;
        self.store.delete_peer(id).await?;
        if self.state() == RuntimeState::Running {
            let update = PeerConfigUpdate {
                public_key_hex: keys::b64_to_hex(&peer.public_key)?,
                remove: true,
                ..Default::default()
            };
            ipc::set(&cfg.interface_name, None, None, false, &[update]).await?;
        }
        Ok(())
    }

    pub async fn set_peer_enabled(&self, id: i64, enabled: bool) -> Result<Peer> {
        let existing = self.store.get_peer(id).await?;
        let input = PeerInput {
            name: existing.name.clone(),
            allowed_ips: Some(existing.allowed_ips.clone()),
            enabled,
            upload_limit: existing.upload_limit,
            download_limit: existing.download_limit,
        };
        let peer = self.store.update_peer(id, &input).await?;
        let cfg = self.store.get_wireguard_config().await?;
        if self.state() == RuntimeState::Running {
            if enabled {
                ipc::set(
                    &cfg.interface_name,
                    None,
                    None,
                    false,
                    &[peer_to_update(&peer, &cfg)?],
                )
                .await?;
            } else {
                let update = PeerConfigUpdate {
                    public_key_hex: keys::b64_to_hex(&peer.public_key)?,
                    remove: true,
                    ..Default::default()
                };
                ipc::set(&cfg.interface_name, None, None, false, &[update]).await?;
            }
        }
        Ok(peer)
    }
}

fn peer_to_update(peer: &Peer, cfg: &WireGuardConfig) -> Result<PeerConfigUpdate> {
    Ok(PeerConfigUpdate {
        public_key_hex: keys::b64_to_hex(&peer.public_key)?,
        remove: false,
        replace_allowed_ips: true,
        allowed_ips: peer
            .allowed_ips
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        endpoint: None,
        persistent_keepalive_interval: Some(cfg.persistent_keepalive),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PeerInput;

    #[tokio::test]
    async fn initialize_seeds_keys_and_advances_state() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = WireGuardManager::new(store.clone());
        assert_eq!(manager.state(), RuntimeState::Uninitialized);

        manager.initialize().await.unwrap();
        assert_eq!(manager.state(), RuntimeState::Initialized);

        let cfg = store.get_wireguard_config().await.unwrap();
        assert!(!cfg.private_key.is_empty());
    }

    #[tokio::test]
    async fn add_peer_persists_without_live_device() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = WireGuardManager::new(store.clone());
        manager.initialize().await.unwrap();

        let input = PeerInput {
            name: "laptop".into(),
            enabled: true,
            ..Default::default()
        };
        let peer = manager.add_peer(&input).await.unwrap();
        assert_eq!(peer.name, "laptop");
        assert!(!peer.public_key.is_empty());
    }

    #[tokio::test]
    async fn update_config_rejects_mtu_outside_wireguard_range() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = WireGuardManager::new(store.clone());
        manager.initialize().await.unwrap();

        let mut cfg = manager.get_config().await.unwrap();
        cfg.mtu = 9000;
        let err = manager.update_config(&cfg).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        cfg.mtu = 1420;
        let updated = manager.update_config(&cfg).await.unwrap();
        assert_eq!(updated.mtu, 1420);
    }

    #[tokio::test]
    async fn get_connection_logs_reflects_appended_events() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = WireGuardManager::new(store.clone());
        manager.initialize().await.unwrap();

        let input = PeerInput {
            name: "phone".into(),
            enabled: true,
            ..Default::default()
        };
        let peer = manager.add_peer(&input).await.unwrap();
        store
            .append_connection_event(
                peer.id,
                &peer.name,
                &peer.public_key,
                crate::store::ConnectionEventKind::Online,
                "1.2.3.4:51820",
                100,
                200,
            )
            .await
            .unwrap();

        let logs = manager.get_connection_logs(Some(peer.id), 1, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].peer_id, peer.id);
    }

    #[test]
    fn peer_to_update_splits_allowed_ips() {
        let peer = Peer {
            id: 1,
            name: "x".into(),
            public_key: keys::generate_keypair().1,
            private_key: String::new(),
            allowed_ips: "10.0.0.2/32, fd00::2/128".into(),
            enabled: true,
            upload_limit: 0,
            download_limit: 0,
            total_upload: 0,
            total_download: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let cfg = WireGuardConfig::default();
        let update = peer_to_update(&peer, &cfg).unwrap();
        assert_eq!(update.allowed_ips, vec!["10.0.0.2/32", "fd00::2/128"]);
        assert_eq!(update.persistent_keepalive_interval, Some(25));
    }
}
