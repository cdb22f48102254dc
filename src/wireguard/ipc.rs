//! UAPI client: speaks the same `get=1` / `set=1` line protocol
//! `boringtun::device::Device::register_api_handler` serves, against the
//! Unix domain socket a running WireGuard device exposes at
//! `/var/run/wireguard/<iface>.sock`.
//!
//! This module is the protocol's client, never its server — the device
//! itself (kernel module or a userspace implementation such as boringtun)
//! owns the socket and the cryptography; this crate only reconciles peer
//! configuration over it and polls it for telemetry.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{AppError, Result};
use crate::wireguard::keys;

/// One peer's configuration as accepted by a `set=1` request.
#[derive(Debug, Clone, Default)]
pub struct PeerConfigUpdate {
    pub public_key_hex: String,
    pub remove: bool,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive_interval: Option<u16>,
}

/// One peer's live telemetry as reported by a `get=1` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerStatus {
    pub public_key_hex: String,
    pub endpoint: Option<String>,
    pub last_handshake_time_sec: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub allowed_ips: Vec<String>,
}

/// A full `get=1` snapshot of the device.
#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    pub public_key_hex: Option<String>,
    pub listen_port: u16,
    pub peers: Vec<PeerStatus>,
}

fn socket_path(interface: &str) -> PathBuf {
    PathBuf::from(format!("/var/run/wireguard/{interface}.sock"))
}

async fn dial(interface: &str) -> Result<UnixStream> {
    UnixStream::connect(socket_path(interface))
        .await
        .map_err(|e| AppError::DeviceUnavailable(format!("{interface}: {e}")))
}

/// Send a `get=1` request and parse the full device + peer telemetry snapshot.
pub async fn get(interface: &str) -> Result<DeviceStatus> {
    let stream = dial(interface).await?;
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(b"get=1\n\n")
        .await
        .map_err(AppError::Io)?;

    let mut reader = BufReader::new(reader);
    let mut status = DeviceStatus::default();
    let mut current: Option<PeerStatus> = None;
    let mut seen_own_key = false;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(AppError::Io)?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            break;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };

        if key == "errno" {
            let code: i32 = value.parse().unwrap_or(-1);
            if code != 0 {
                return Err(AppError::DeviceUnavailable(format!(
                    "{interface}: get=1 returned errno {code}"
                )));
            }
            continue;
        }

        if key == "public_key" && !seen_own_key {
            status.public_key_hex = Some(value.to_string());
            seen_own_key = true;
            continue;
        }
        if key == "listen_port" {
            status.listen_port = value.parse().unwrap_or(0);
            continue;
        }

        if key == "public_key" {
            if let Some(peer) = current.take() {
                status.peers.push(peer);
            }
            current = Some(PeerStatus {
                public_key_hex: value.to_string(),
                ..Default::default()
            });
            continue;
        }

        if let Some(peer) = current.as_mut() {
            match key {
                "endpoint" => peer.endpoint = Some(value.to_string()),
                "last_handshake_time_sec" => {
                    peer.last_handshake_time_sec = value.parse().unwrap_or(0);
                }
                "rx_bytes" => peer.rx_bytes = value.parse().unwrap_or(0),
                "tx_bytes" => peer.tx_bytes = value.parse().unwrap_or(0),
                "allowed_ip" => peer.allowed_ips.push(value.to_string()),
                _ => {}
            }
        }
    }
    if let Some(peer) = current.take() {
        status.peers.push(peer);
    }
    Ok(status)
}

/// Send a `set=1` request reconciling the device's own keys/port and a batch
/// of peer updates.
pub async fn set(
    interface: &str,
    private_key_b64: Option<&str>,
    listen_port: Option<u16>,
    replace_peers: bool,
    peers: &[PeerConfigUpdate],
) -> Result<()> {
    let stream = dial(interface).await?;
    let (reader, mut writer) = stream.into_split();

    let mut request = String::from("set=1\n");
    if let Some(pk) = private_key_b64 {
        request.push_str(&format!("private_key={}\n", keys::b64_to_hex(pk)?));
    }
    if let Some(port) = listen_port {
        request.push_str(&format!("listen_port={port}\n"));
    }
    if replace_peers {
        request.push_str("replace_peers=true\n");
    }
    for peer in peers {
        request.push_str(&format!("public_key={}\n", peer.public_key_hex));
        if peer.remove {
            request.push_str("remove=true\n");
            continue;
        }
        if let Some(endpoint) = &peer.endpoint {
            request.push_str(&format!("endpoint={endpoint}\n"));
        }
        if let Some(keepalive) = peer.persistent_keepalive_interval {
            request.push_str(&format!("persistent_keepalive_interval={keepalive}\n"));
        }
        if peer.replace_allowed_ips {
            request.push_str("replace_allowed_ips=true\n");
        }
        for ip in &peer.allowed_ips {
            request.push_str(&format!("allowed_ip={ip}\n"));
        }
    }
    request.push('\n');

    writer
        .write_all(request.as_bytes())
        .await
        .map_err(AppError::Io)?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(AppError::Io)?;
        if n == 0 {
            return Err(AppError::DeviceUnavailable(format!(
                "{interface}: connection closed before errno trailer"
            )));
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if let Some(code) = trimmed.strip_prefix("errno=") {
            let code: i32 = code.parse().unwrap_or(-1);
            return if code == 0 {
                Ok(())
            } else {
                Err(AppError::DeviceUnavailable(format!(
                    "{interface}: set=1 returned errno {code}"
                )))
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_get_response(body: &str) -> DeviceStatus {
        let mut status = DeviceStatus::default();
        let mut current: Option<PeerStatus> = None;
        let mut seen_own_key = false;
        for line in body.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key == "public_key" && !seen_own_key {
                status.public_key_hex = Some(value.to_string());
                seen_own_key = true;
                continue;
            }
            if key == "listen_port" {
                status.listen_port = value.parse().unwrap_or(0);
                continue;
            }
            if key == "public_key" {
                if let Some(peer) = current.take() {
                    status.peers.push(peer);
                }
                current = Some(PeerStatus {
                    public_key_hex: value.to_string(),
                    ..Default::default()
                });
                continue;
            }
            if let Some(peer) = current.as_mut() {
                match key {
                    "rx_bytes" => peer.rx_bytes = value.parse().unwrap_or(0),
                    "tx_bytes" => peer.tx_bytes = value.parse().unwrap_or(0),
                    "allowed_ip" => peer.allowed_ips.push(value.to_string()),
                    _ => {}
                }
            }
        }
        if let Some(peer) = current.take() {
            status.peers.push(peer);
        }
        status
    }

    #[test]
    fn parses_multi_peer_get_response() {
        let body = "private_key=aaa\nlisten_port=51820\npublic_key=peer1\nallowed_ip=10.0.0.2/32\nrx_bytes=10\ntx_bytes=20\npublic_key=peer2\nallowed_ip=10.0.0.3/32\nrx_bytes=5\ntx_bytes=6\n";
        let status = parse_get_response(body);
        assert_eq!(status.listen_port, 51820);
        assert_eq!(status.peers.len(), 2);
        assert_eq!(status.peers[0].rx_bytes, 10);
        assert_eq!(status.peers[1].allowed_ips, vec!["10.0.0.3/32"]);
    }
}
