//! Per-OS interface IP configuration, run once after the device/TUN handle
//! exists and before peers are reconciled.
//!
//! Host-bits-zero addresses are rewritten to the first usable host
//! (`10.66.66.0/24` -> `10.66.66.1/24`) the same way
//! `original_source/server/internal/service/wgserver/ip_config_other.go` does,
//! since a network address is never a valid interface address.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Parse `address` as `ip/prefix` and rewrite a host-bits-all-zero address to
/// `.1` within the same prefix, matching the original's `netip`-based fixup.
pub fn autocorrect_host_address(address: &str) -> Result<String> {
    let (ip_part, prefix_part) = address
        .split_once('/')
        .ok_or_else(|| AppError::InvalidInput(format!("address missing prefix: {address}")))?;
    let ip: Ipv4Addr = ip_part
        .parse()
        .map_err(|e: std::net::AddrParseError| AppError::InvalidInput(e.to_string()))?;
    let prefix: u32 = prefix_part
        .parse()
        .map_err(|e: std::num::ParseIntError| AppError::InvalidInput(e.to_string()))?;
    if prefix > 32 {
        return Err(AppError::InvalidInput(format!("invalid prefix: {prefix}")));
    }

    let host_bits = 32 - prefix;
    let mask = if host_bits == 32 { 0 } else { !0u32 << host_bits };
    let as_u32 = u32::from(ip);
    let host_part = as_u32 & !mask;

    let corrected = if host_part == 0 && host_bits > 0 {
        Ipv4Addr::from((as_u32 & mask) | 1)
    } else {
        ip
    };
    Ok(format!("{corrected}/{prefix}"))
}

/// Set the tunnel interface's MTU (§4.7 step 1). Run once, right after the
/// TUN device is created and before any IP is assigned to it.
pub async fn configure_interface_mtu(interface: &str, mtu: u16) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        return run(
            "ip",
            &["link", "set", "dev", interface, "mtu", &mtu.to_string()],
            "ip link set mtu",
        )
        .await;
    }

    #[cfg(target_os = "macos")]
    {
        return run(
            "ifconfig",
            &[interface, "mtu", &mtu.to_string()],
            "ifconfig mtu",
        )
        .await;
    }

    #[cfg(target_os = "windows")]
    {
        return run(
            "netsh",
            &[
                "interface",
                "ipv4",
                "set",
                "subinterface",
                interface,
                &format!("mtu={mtu}"),
                "store=persistent",
            ],
            "netsh interface ipv4 set subinterface",
        )
        .await;
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(AppError::IpConfigFailed(format!(
            "unsupported platform for interface {interface}"
        )))
    }
}

/// Configure the interface's IP address using the platform-appropriate tool.
/// Retries are only meaningful on Windows, where the interface may not be
/// immediately ready after device creation; other platforms apply the
/// address once and surface any failure immediately.
pub async fn configure_interface_ip(interface: &str, address: &str) -> Result<()> {
    let address = autocorrect_host_address(address)?;

    #[cfg(target_os = "linux")]
    {
        run(
            "ip",
            &["addr", "add", &address, "dev", interface],
            "ip addr add",
        )
        .await?;
        run("ip", &["link", "set", interface, "up"], "ip link set up").await?;
        return Ok(());
    }

    #[cfg(target_os = "macos")]
    {
        let (ip, _) = address.split_once('/').unwrap();
        run(
            "ifconfig",
            &[interface, "inet", ip, ip, "alias"],
            "ifconfig alias",
        )
        .await?;
        run("ifconfig", &[interface, "up"], "ifconfig up").await?;
        return Ok(());
    }

    #[cfg(target_os = "windows")]
    {
        if configure_via_luid(interface, &address).await.is_ok() {
            return Ok(());
        }
        warn!(%interface, "native LUID IP configuration failed, falling back to netsh");
        return configure_via_retry_loop(interface, &address).await;
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(AppError::IpConfigFailed(format!(
            "unsupported platform for interface {interface}"
        )))
    }
}

/// Native LUID-based IP configuration (§4.7 step 4, preferred path on
/// Windows), mirroring `ip_config_windows.go`'s `configureIPWithLUID`:
/// resolve the adapter's LUID from its interface name, flush any existing
/// addresses for the family, then assign the new one, retrying up to 5
/// times with increasing backoff. The original reaches this through
/// `winipcfg.LUID.FlushIPAddresses`/`SetIPAddressesForFamily`; the `windows`
/// crate has no 1:1 binding for either, so the same flush-then-set sequence
/// is expressed here with `DeleteUnicastIpAddressEntry` (enumerated via
/// `GetUnicastIpAddressTable`) followed by `CreateUnicastIpAddressEntry`,
/// the same IP Helper family `firezone-firezone`'s Windows TUN manager uses
/// for unicast address assignment.
#[cfg(target_os = "windows")]
async fn configure_via_luid(interface: &str, address: &str) -> Result<()> {
    use windows::core::PCWSTR;
    use windows::Win32::NetworkManagement::IpHelper::{
        ConvertInterfaceAliasToLuid, CreateUnicastIpAddressEntry, DeleteUnicastIpAddressEntry,
        FreeMibTable, GetUnicastIpAddressTable, InitializeUnicastIpAddressEntry,
        MIB_UNICASTIPADDRESS_ROW, MIB_UNICASTIPADDRESS_TABLE,
    };
    use windows::Win32::Networking::WinSock::{AF_INET, SOCKADDR_IN};

    let (ip, prefix_len) = address
        .split_once('/')
        .ok_or_else(|| AppError::IpConfigFailed(format!("address missing prefix: {address}")))?;
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|e: std::net::AddrParseError| AppError::IpConfigFailed(e.to_string()))?;
    let prefix_len: u8 = prefix_len
        .parse()
        .map_err(|e: std::num::ParseIntError| AppError::IpConfigFailed(e.to_string()))?;

    let mut wide: Vec<u16> = interface.encode_utf16().chain(std::iter::once(0)).collect();
    let mut luid = windows::Win32::NetworkManagement::Ndis::NET_LUID_LH::default();
    unsafe {
        ConvertInterfaceAliasToLuid(PCWSTR(wide.as_mut_ptr()), &mut luid)
            .map_err(|e| AppError::IpConfigFailed(format!("ConvertInterfaceAliasToLuid: {e}")))?;
    }

    let mut last_err: Option<String> = None;
    for attempt in 0..5u64 {
        unsafe {
            // Flush: drop any existing IPv4 unicast entries for this LUID.
            let mut table_ptr: *mut MIB_UNICASTIPADDRESS_TABLE = std::ptr::null_mut();
            if GetUnicastIpAddressTable(AF_INET, &mut table_ptr).is_ok() {
                let table = &*table_ptr;
                let rows =
                    std::slice::from_raw_parts(table.Table.as_ptr(), table.NumEntries as usize);
                for row in rows {
                    if row.InterfaceLuid.Value == luid.Value {
                        let _ = DeleteUnicastIpAddressEntry(row);
                    }
                }
                FreeMibTable(table_ptr as *const _);
            }

            let mut row = MIB_UNICASTIPADDRESS_ROW::default();
            InitializeUnicastIpAddressEntry(&mut row);
            row.InterfaceLuid = luid;
            row.Address.Ipv4 = SOCKADDR_IN {
                sin_family: AF_INET,
                sin_addr: std::mem::transmute(ip.octets()),
                ..Default::default()
            };
            row.OnLinkPrefixLength = prefix_len;

            match CreateUnicastIpAddressEntry(&row) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        warn!(%interface, attempt, "native LUID IP configuration attempt failed, retrying");
        tokio::time::sleep(Duration::from_secs(1 + attempt)).await;
    }
    Err(AppError::IpConfigFailed(format!(
        "{interface}: {}",
        last_err.unwrap_or_else(|| "unknown error".to_string())
    )))
}

#[cfg(target_os = "windows")]
async fn configure_via_retry_loop(interface: &str, address: &str) -> Result<()> {
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut last_err = None;
    for attempt in 0..5u64 {
        match run(
            "netsh",
            &[
                "interface",
                "ip",
                "set",
                "address",
                interface,
                "static",
                address,
            ],
            "netsh interface ip set address",
        )
        .await
        {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(%interface, attempt, "failed to set interface address, retrying");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(1 + attempt)).await;
            }
        }
    }
    Err(last_err.unwrap_or(AppError::IpConfigFailed(interface.to_string())))
}

#[allow(dead_code)]
async fn run(program: &str, args: &[&str], what: &str) -> Result<()> {
    debug!(program, ?args, "running interface configuration command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| AppError::IpConfigFailed(format!("{what}: {e}")))?;
    if !output.status.success() {
        return Err(AppError::IpConfigFailed(format!(
            "{what} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autocorrects_network_address_to_first_host() {
        assert_eq!(
            autocorrect_host_address("10.66.66.0/24").unwrap(),
            "10.66.66.1/24"
        );
    }

    #[test]
    fn leaves_valid_host_address_untouched() {
        assert_eq!(
            autocorrect_host_address("10.66.66.5/24").unwrap(),
            "10.66.66.5/24"
        );
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(autocorrect_host_address("10.66.66.1").is_err());
    }

    #[test]
    fn slash_32_is_never_rewritten() {
        assert_eq!(
            autocorrect_host_address("10.66.66.1/32").unwrap(),
            "10.66.66.1/32"
        );
    }
}
