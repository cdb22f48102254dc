//! Owns the actual TUN device and in-process WireGuard device (§4.7 steps
//! 1-2). Everything else in this module tree — [`super::ipc`],
//! [`super::telemetry`] — talks to the device this module creates over its
//! own UAPI socket; nothing here dials a socket it didn't open itself.

use std::sync::Mutex;

use boringtun::device::{DeviceConfig, DeviceHandle};
use tracing::{info, warn};

use crate::error::{AppError, Result};

/// Thread count handed to the device's internal worker pool. `boringtun`'s
/// own CLI defaults to the number of available cores; a small fixed count is
/// enough here since a single host rarely proxies enough peers to saturate
/// more than a couple of cores.
const DEVICE_THREADS: usize = 2;

/// Owns a live TUN + WireGuard device for one interface. `start` creates
/// both; `stop` tears both down. Peer/config pushes happen afterwards, over
/// [`super::ipc`], the same way `boringtun-cli` hands control to its own
/// UAPI socket once the device is up.
pub struct DeviceRuntime {
    handle: Mutex<Option<DeviceHandle>>,
    interface: String,
}

impl DeviceRuntime {
    /// Create a TUN device named `interface` and instantiate the WireGuard
    /// device bound to it. The device registers its own UAPI socket at
    /// `/var/run/wireguard/<interface>.sock`, which [`super::ipc`] then
    /// dials to push keys, listen port, and peers.
    pub fn start(interface: &str) -> Result<Self> {
        let config = DeviceConfig {
            n_threads: DEVICE_THREADS,
            ..Default::default()
        };
        let handle = DeviceHandle::new(interface, config)
            .map_err(|e| AppError::DeviceUnavailable(format!("{e:?}")))?;
        info!(interface, "tun device and wireguard device created");
        Ok(Self {
            handle: Mutex::new(Some(handle)),
            interface: interface.to_string(),
        })
    }

    /// Close the device (triggers peer/transport teardown) and drop the TUN
    /// handle. Idempotent: calling twice is a no-op the second time.
    pub fn stop(&self) {
        let taken = self.handle.lock().expect("device handle lock poisoned").take();
        match taken {
            Some(mut handle) => {
                handle.clean();
                info!(interface = %self.interface, "tun device and wireguard device torn down");
            }
            None => warn!(interface = %self.interface, "device runtime stopped twice"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().expect("device handle lock poisoned").is_some()
    }
}

impl Drop for DeviceRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}
