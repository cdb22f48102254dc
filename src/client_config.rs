//! §6: renders the UTF-8 WireGuard client configuration file for a peer.

use crate::error::{AppError, Result};
use crate::store::{Peer, WireGuardConfig};

/// Render the `[Interface]`/`[Peer]` config text a client imports directly
/// into `wg-quick`. Fails with [`AppError::EndpointMissing`] if the server
/// has no externally-reachable endpoint configured.
pub fn render(peer: &Peer, server: &WireGuardConfig) -> Result<String> {
    if server.endpoint_address.trim().is_empty() {
        return Err(AppError::EndpointMissing);
    }

    Ok(format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}\n\
         DNS = {dns}\n\
         MTU = {mtu}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_public_key}\n\
         AllowedIPs = {allowed_ips}\n\
         PersistentKeepalive = {keepalive}\n\
         Endpoint = {endpoint}:{port}\n",
        private_key = peer.private_key,
        address = peer.allowed_ips,
        dns = server.dns,
        mtu = server.mtu,
        server_public_key = server.public_key,
        allowed_ips = server.client_allowed_ips,
        keepalive = server.persistent_keepalive,
        endpoint = server.endpoint_address,
        port = server.listen_port,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_peer() -> Peer {
        Peer {
            id: 1,
            name: "laptop".into(),
            public_key: "pub".into(),
            private_key: "priv".into(),
            allowed_ips: "10.66.66.2/32".into(),
            enabled: true,
            upload_limit: 0,
            download_limit: 0,
            total_upload: 0,
            total_download: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fails_without_endpoint() {
        let peer = sample_peer();
        let server = WireGuardConfig::default();
        let err = render(&peer, &server).unwrap_err();
        assert!(matches!(err, AppError::EndpointMissing));
    }

    #[test]
    fn renders_expected_sections() {
        let peer = sample_peer();
        let mut server = WireGuardConfig::default();
        server.endpoint_address = "vpn.example.com".into();
        let text = render(&peer, &server).unwrap();
        assert!(text.contains("[Interface]"));
        assert!(text.contains("PrivateKey = priv"));
        assert!(text.contains("Address = 10.66.66.2/32"));
        assert!(text.contains("[Peer]"));
        assert!(text.contains("Endpoint = vpn.example.com:51820"));
    }
}
