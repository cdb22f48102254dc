//! Persisted store: forward rules, WireGuard configuration, peers and the
//! connection-event journal. Backed by a single bundled SQLite file — the
//! control plane only ever performs single-row reads/writes, so one
//! serialized connection is enough (§5: "the persistent store... does not
//! require multi-row transactions in the core").

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::wireguard::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(AppError::InvalidInput(format!(
                "protocol must be 'tcp' or 'udp', got '{other}'"
            ))),
        }
    }
}

/// A persisted forward rule (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ForwardRule {
    pub id: i64,
    pub name: String,
    pub protocol: Protocol,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub enabled: bool,
    pub max_conn: u32,
    pub upload_limit: u64,
    pub download_limit: u64,
    pub total_upload: u64,
    pub total_download: u64,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for Create/Update of a forward rule.
#[derive(Debug, Clone)]
pub struct ForwardRuleInput {
    pub name: String,
    pub protocol: Protocol,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub enabled: bool,
    pub max_conn: u32,
    pub upload_limit: u64,
    pub download_limit: u64,
    pub description: String,
}

impl Default for ForwardRuleInput {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: Protocol::Tcp,
            listen_port: 0,
            target_host: String::new(),
            target_port: 0,
            enabled: true,
            max_conn: 1000,
            upload_limit: 0,
            download_limit: 0,
            description: String::new(),
        }
    }
}

impl ForwardRuleInput {
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(AppError::InvalidInput(
                "listen port must be in 1..65535".into(),
            ));
        }
        if self.target_port == 0 {
            return Err(AppError::InvalidInput(
                "target port must be in 1..65535".into(),
            ));
        }
        if self.max_conn == 0 {
            return Err(AppError::InvalidInput("max_conn must be >= 1".into()));
        }
        Ok(())
    }
}

/// Enforces "(listen port, protocol) unique among enabled rules" (§3). `exclude_id`
/// is the row being updated, so it doesn't collide with itself.
fn check_listen_port_free(
    conn: &Connection,
    protocol: Protocol,
    listen_port: u16,
    exclude_id: Option<i64>,
) -> Result<()> {
    let conflict: Option<i64> = conn
        .query_row(
            "SELECT id FROM forward_rule
             WHERE protocol = ?1 AND listen_port = ?2 AND enabled = 1 AND id != ?3",
            params![protocol.as_str(), listen_port as i64, exclude_id.unwrap_or(0)],
            |row| row.get(0),
        )
        .optional()?;
    if conflict.is_some() {
        return Err(AppError::PortInUse(listen_port));
    }
    Ok(())
}

fn row_to_forward_rule(row: &Row) -> rusqlite::Result<ForwardRule> {
    let protocol: String = row.get("protocol")?;
    Ok(ForwardRule {
        id: row.get("id")?,
        name: row.get("name")?,
        protocol: Protocol::from_str(&protocol).unwrap_or(Protocol::Tcp),
        listen_port: row.get::<_, i64>("listen_port")? as u16,
        target_host: row.get("target_addr")?,
        target_port: row.get::<_, i64>("target_port")? as u16,
        enabled: row.get::<_, i64>("enabled")? != 0,
        max_conn: row.get::<_, i64>("max_conn")? as u32,
        upload_limit: row.get::<_, i64>("upload_limit")? as u64,
        download_limit: row.get::<_, i64>("download_limit")? as u64,
        total_upload: row.get::<_, i64>("total_upload")? as u64,
        total_download: row.get::<_, i64>("total_download")? as u64,
        description: row.get::<_, Option<String>>("description")?.unwrap_or_default(),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Persisted WireGuard configuration (singleton, id=1) (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WireGuardConfig {
    pub interface_name: String,
    pub listen_port: u16,
    pub private_key: String,
    pub public_key: String,
    pub address: String,
    pub dns: String,
    pub mtu: u16,
    pub endpoint_address: String,
    pub eth_device: String,
    pub persistent_keepalive: u16,
    pub client_allowed_ips: String,
    pub proxy_address: String,
    pub log_level: String,
    pub auto_start: bool,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface_name: "omniwire".into(),
            listen_port: 51820,
            private_key: String::new(),
            public_key: String::new(),
            address: "10.66.66.1/24".into(),
            dns: "223.5.5.5".into(),
            mtu: 1420,
            endpoint_address: String::new(),
            eth_device: String::new(),
            persistent_keepalive: 25,
            client_allowed_ips: "0.0.0.0/0, ::/0".into(),
            proxy_address: ":50122".into(),
            log_level: "error".into(),
            auto_start: false,
        }
    }
}

fn row_to_wg_config(row: &Row) -> rusqlite::Result<WireGuardConfig> {
    Ok(WireGuardConfig {
        interface_name: row.get("interface_name")?,
        listen_port: row.get::<_, i64>("listen_port")? as u16,
        private_key: row.get::<_, Option<String>>("private_key")?.unwrap_or_default(),
        public_key: row.get::<_, Option<String>>("public_key")?.unwrap_or_default(),
        address: row.get("address")?,
        dns: row.get::<_, Option<String>>("dns")?.unwrap_or_default(),
        mtu: row.get::<_, i64>("mtu")? as u16,
        endpoint_address: row.get::<_, Option<String>>("endpoint_address")?.unwrap_or_default(),
        eth_device: row.get::<_, Option<String>>("eth_device")?.unwrap_or_default(),
        persistent_keepalive: row.get::<_, i64>("persistent_keepalive")? as u16,
        client_allowed_ips: row.get("client_allowed_ips")?,
        proxy_address: row.get::<_, Option<String>>("proxy_address")?.unwrap_or_default(),
        log_level: row.get("log_level")?,
        auto_start: row.get::<_, i64>("auto_start")? != 0,
    })
}

/// A persisted WireGuard peer (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub id: i64,
    pub name: String,
    pub public_key: String,
    pub private_key: String,
    pub allowed_ips: String,
    pub enabled: bool,
    pub upload_limit: u64,
    pub download_limit: u64,
    pub total_upload: u64,
    pub total_download: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PeerInput {
    pub name: String,
    pub allowed_ips: Option<String>,
    pub enabled: bool,
    pub upload_limit: u64,
    pub download_limit: u64,
}

fn row_to_peer(row: &Row) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: row.get("id")?,
        name: row.get("name")?,
        public_key: row.get("public_key")?,
        private_key: row.get("private_key")?,
        allowed_ips: row.get("allowed_ips")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        upload_limit: row.get::<_, i64>("upload_limit")? as u64,
        download_limit: row.get::<_, i64>("download_limit")? as u64,
        total_upload: row.get::<_, i64>("total_upload")? as u64,
        total_download: row.get::<_, i64>("total_download")? as u64,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionEventKind {
    Handshake,
    Online,
    Offline,
}

impl ConnectionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEventKind::Handshake => "handshake",
            ConnectionEventKind::Online => "online",
            ConnectionEventKind::Offline => "offline",
        }
    }
}

/// An append-only connection event row (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionEvent {
    pub id: i64,
    pub peer_id: i64,
    pub peer_name: String,
    pub public_key: String,
    pub event: String,
    pub endpoint: String,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
    pub created_at: DateTime<Utc>,
}

fn row_to_event(row: &Row) -> rusqlite::Result<ConnectionEvent> {
    Ok(ConnectionEvent {
        id: row.get("id")?,
        peer_id: row.get::<_, Option<i64>>("peer_id")?.unwrap_or(0),
        peer_name: row.get::<_, Option<String>>("peer_name")?.unwrap_or_default(),
        public_key: row.get::<_, Option<String>>("public_key")?.unwrap_or_default(),
        event: row.get::<_, Option<String>>("event")?.unwrap_or_default(),
        endpoint: row.get::<_, Option<String>>("endpoint")?.unwrap_or_default(),
        transfer_rx: row.get::<_, i64>("transfer_rx")? as u64,
        transfer_tx: row.get::<_, i64>("transfer_tx")? as u64,
        created_at: row.get("created_at")?,
    })
}

/// Serialized handle to the SQLite file backing all persisted state.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the store at `path`, bootstrapping schema
    /// and default rows the way `original_source`'s `InitDatabase` does.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        bootstrap_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        bootstrap_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- forward rules ----

    pub async fn list_forward_rules(&self) -> Result<Vec<ForwardRule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM forward_rule ORDER BY id")?;
        let rows = stmt
            .query_map([], row_to_forward_rule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn get_forward_rule(&self, id: i64) -> Result<ForwardRule> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM forward_rule WHERE id = ?1", params![id], row_to_forward_rule)
            .optional()?
            .ok_or(AppError::NotFound("forward rule"))
    }

    pub async fn create_forward_rule(&self, input: &ForwardRuleInput) -> Result<ForwardRule> {
        input.validate()?;
        let conn = self.conn.lock().await;
        if input.enabled {
            check_listen_port_free(&conn, input.protocol, input.listen_port, None)?;
        }
        conn.execute(
            "INSERT INTO forward_rule
                (name, protocol, listen_port, target_addr, target_port, max_conn,
                 upload_limit, download_limit, enabled, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                input.name,
                input.protocol.as_str(),
                input.listen_port as i64,
                input.target_host,
                input.target_port as i64,
                input.max_conn as i64,
                input.upload_limit as i64,
                input.download_limit as i64,
                input.enabled as i64,
                input.description,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_forward_rule(id).await
    }

    pub async fn update_forward_rule(&self, id: i64, input: &ForwardRuleInput) -> Result<ForwardRule> {
        input.validate()?;
        let conn = self.conn.lock().await;
        if input.enabled {
            check_listen_port_free(&conn, input.protocol, input.listen_port, Some(id))?;
        }
        let changed = conn.execute(
            "UPDATE forward_rule SET
                name = ?1, protocol = ?2, listen_port = ?3, target_addr = ?4, target_port = ?5,
                max_conn = ?6, upload_limit = ?7, download_limit = ?8, enabled = ?9,
                description = ?10, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?11",
            params![
                input.name,
                input.protocol.as_str(),
                input.listen_port as i64,
                input.target_host,
                input.target_port as i64,
                input.max_conn as i64,
                input.upload_limit as i64,
                input.download_limit as i64,
                input.enabled as i64,
                input.description,
                id,
            ],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(AppError::NotFound("forward rule"));
        }
        self.get_forward_rule(id).await
    }

    pub async fn delete_forward_rule(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM forward_rule WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(AppError::NotFound("forward rule"));
        }
        Ok(())
    }

    /// Add `upload`/`download` bytes to the persisted cumulative totals (Stop, §4.6).
    pub async fn accumulate_forward_bytes(&self, id: i64, upload: u64, download: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE forward_rule SET
                total_upload = total_upload + ?1,
                total_download = total_download + ?2,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![upload as i64, download as i64, id],
        )?;
        Ok(())
    }

    // ---- wireguard config ----

    pub async fn get_wireguard_config(&self) -> Result<WireGuardConfig> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM wireguard_config WHERE id = 1", [], row_to_wg_config)
            .optional()?
            .ok_or(AppError::NotFound("wireguard config"))
    }

    pub async fn update_wireguard_config(&self, cfg: &WireGuardConfig) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE wireguard_config SET
                interface_name = ?1, listen_port = ?2, private_key = ?3, public_key = ?4,
                address = ?5, dns = ?6, mtu = ?7, endpoint_address = ?8, eth_device = ?9,
                persistent_keepalive = ?10, client_allowed_ips = ?11, proxy_address = ?12,
                log_level = ?13, auto_start = ?14, updated_at = CURRENT_TIMESTAMP
             WHERE id = 1",
            params![
                cfg.interface_name,
                cfg.listen_port as i64,
                cfg.private_key,
                cfg.public_key,
                cfg.address,
                cfg.dns,
                cfg.mtu as i64,
                cfg.endpoint_address,
                cfg.eth_device,
                cfg.persistent_keepalive as i64,
                cfg.client_allowed_ips,
                cfg.proxy_address,
                cfg.log_level,
                cfg.auto_start as i64,
            ],
        )?;
        Ok(())
    }

    // ---- peers ----

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM wireguard_peer ORDER BY id")?;
        let rows = stmt
            .query_map([], row_to_peer)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn get_peer(&self, id: i64) -> Result<Peer> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM wireguard_peer WHERE id = ?1", params![id], row_to_peer)
            .optional()?
            .ok_or(AppError::NotFound("peer"))
    }

    /// Create a peer with a freshly generated keypair and next-free /32 address.
    pub async fn create_peer(&self, input: &PeerInput, subnet_cidr: &str) -> Result<Peer> {
        let (private_key, public_key) = keys::generate_keypair();
        let conn = self.conn.lock().await;
        let allowed_ips = match &input.allowed_ips {
            Some(ip) => ip.clone(),
            None => {
                let existing: Vec<String> = conn
                    .prepare("SELECT allowed_ips FROM wireguard_peer")?
                    .query_map([], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                next_free_address(subnet_cidr, &existing)?
            }
        };
        conn.execute(
            "INSERT INTO wireguard_peer
                (name, public_key, private_key, allowed_ips, enabled, upload_limit, download_limit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                input.name,
                public_key,
                private_key,
                allowed_ips,
                input.enabled as i64,
                input.upload_limit as i64,
                input.download_limit as i64,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_peer(id).await
    }

    pub async fn update_peer(&self, id: i64, input: &PeerInput) -> Result<Peer> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE wireguard_peer SET
                name = ?1, enabled = ?2, upload_limit = ?3, download_limit = ?4,
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?5",
            params![
                input.name,
                input.enabled as i64,
                input.upload_limit as i64,
                input.download_limit as i64,
                id,
            ],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(AppError::NotFound("peer"));
        }
        self.get_peer(id).await
    }

    pub async fn delete_peer(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM wireguard_peer WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(AppError::NotFound("peer"));
        }
        Ok(())
    }

    pub async fn accumulate_peer_bytes(&self, id: i64, upload: u64, download: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE wireguard_peer SET
                total_upload = total_upload + ?1,
                total_download = total_download + ?2
             WHERE id = ?3",
            params![upload as i64, download as i64, id],
        )?;
        Ok(())
    }

    // ---- connection log ----

    pub async fn append_connection_event(
        &self,
        peer_id: i64,
        peer_name: &str,
        public_key: &str,
        event: ConnectionEventKind,
        endpoint: &str,
        rx: u64,
        tx: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO wireguard_connection_log
                (peer_id, peer_name, public_key, event, endpoint, transfer_rx, transfer_tx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![peer_id, peer_name, public_key, event.as_str(), endpoint, rx as i64, tx as i64],
        )?;
        Ok(())
    }

    pub async fn list_connection_events(
        &self,
        peer_id: Option<i64>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ConnectionEvent>> {
        let offset = (page.saturating_sub(1)) as i64 * page_size as i64;
        let conn = self.conn.lock().await;
        let rows = match peer_id {
            Some(pid) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM wireguard_connection_log WHERE peer_id = ?1
                     ORDER BY id DESC LIMIT ?2 OFFSET ?3",
                )?;
                stmt.query_map(params![pid, page_size as i64, offset], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM wireguard_connection_log ORDER BY id DESC LIMIT ?1 OFFSET ?2",
                )?;
                stmt.query_map(params![page_size as i64, offset], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }
}

/// Scan `.2`..`.254` of `subnet_cidr` for a host address not already claimed
/// by `existing` peer `AllowedIPs` entries (§7 `IpSpaceExhausted`).
fn next_free_address(subnet_cidr: &str, existing: &[String]) -> Result<String> {
    let (base, _) = subnet_cidr
        .split_once('/')
        .ok_or_else(|| AppError::InvalidInput(format!("bad subnet CIDR: {subnet_cidr}")))?;
    let mut octets: [u8; 4] = base
        .parse::<std::net::Ipv4Addr>()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?
        .octets();

    let used: std::collections::HashSet<u8> = existing
        .iter()
        .filter_map(|ip| ip.split('.').last())
        .filter_map(|last| last.split('/').next())
        .filter_map(|n| n.parse::<u8>().ok())
        .collect();

    for host in 2u8..=254 {
        if !used.contains(&host) {
            octets[3] = host;
            return Ok(format!("{}.{}.{}.{}/32", octets[0], octets[1], octets[2], host));
        }
    }
    Err(AppError::IpSpaceExhausted)
}

fn bootstrap_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS user (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username VARCHAR(50) NOT NULL UNIQUE,
            password VARCHAR(255) NOT NULL,
            role VARCHAR(20) DEFAULT 'admin',
            status INTEGER DEFAULT 1,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS wireguard_peer (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name VARCHAR(100) NOT NULL,
            public_key VARCHAR(255) NOT NULL UNIQUE,
            private_key VARCHAR(255) NOT NULL,
            preshared_key VARCHAR(255),
            allowed_ips VARCHAR(255) NOT NULL,
            endpoint VARCHAR(255),
            persistent_keepalive INTEGER DEFAULT 25,
            enabled INTEGER DEFAULT 1,
            upload_limit INTEGER DEFAULT 0,
            download_limit INTEGER DEFAULT 0,
            total_upload INTEGER DEFAULT 0,
            total_download INTEGER DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS forward_rule (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name VARCHAR(100) NOT NULL,
            protocol VARCHAR(10) NOT NULL DEFAULT 'tcp',
            listen_port INTEGER NOT NULL,
            target_addr VARCHAR(255) NOT NULL,
            target_port INTEGER NOT NULL,
            max_conn INTEGER DEFAULT 1000,
            upload_limit INTEGER DEFAULT 0,
            download_limit INTEGER DEFAULT 0,
            total_upload INTEGER DEFAULT 0,
            total_download INTEGER DEFAULT 0,
            enabled INTEGER DEFAULT 1,
            description TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS operation_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            action VARCHAR(100) NOT NULL,
            target VARCHAR(100),
            detail TEXT,
            ip VARCHAR(50),
            user_agent TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS wireguard_config (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            interface_name VARCHAR(20) DEFAULT 'omniwire',
            listen_port INTEGER DEFAULT 51820,
            private_key VARCHAR(255),
            public_key VARCHAR(255),
            address VARCHAR(100) DEFAULT '10.66.66.1/24',
            dns VARCHAR(255) DEFAULT '223.5.5.5',
            mtu INTEGER DEFAULT 1420,
            endpoint_address VARCHAR(100),
            eth_device VARCHAR(20) DEFAULT '',
            persistent_keepalive INTEGER DEFAULT 25,
            client_allowed_ips VARCHAR(255) DEFAULT '0.0.0.0/0, ::/0',
            proxy_address VARCHAR(100) DEFAULT ':50122',
            log_level VARCHAR(20) DEFAULT 'error',
            auto_start INTEGER DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS wireguard_connection_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            peer_id INTEGER,
            peer_name VARCHAR(100),
            public_key VARCHAR(255),
            event VARCHAR(20),
            endpoint VARCHAR(255),
            transfer_rx INTEGER DEFAULT 0,
            transfer_tx INTEGER DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;

    let config_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM wireguard_config WHERE id = 1",
        [],
        |r| r.get(0),
    )?;
    if config_count == 0 {
        let (private_key, public_key) = keys::generate_keypair();
        conn.execute(
            "INSERT INTO wireguard_config
                (id, interface_name, listen_port, private_key, public_key, address, dns, mtu,
                 eth_device, persistent_keepalive, client_allowed_ips, proxy_address, log_level)
             VALUES (1, 'omniwire', 51820, ?1, ?2, '10.66.66.1/24', '223.5.5.5', 1420,
                     '', 25, '0.0.0.0/0, ::/0', ':50122', 'error')",
            params![private_key, public_key],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_free_address_skips_used_hosts() {
        let existing = vec!["10.66.66.2/32".to_string(), "10.66.66.3/32".to_string()];
        let addr = next_free_address("10.66.66.1/24", &existing).unwrap();
        assert_eq!(addr, "10.66.66.4/32");
    }

    #[test]
    fn next_free_address_exhausted() {
        let existing: Vec<String> = (2u8..=254).map(|n| format!("10.0.0.{n}/32")).collect();
        let err = next_free_address("10.0.0.1/24", &existing).unwrap_err();
        assert!(matches!(err, AppError::IpSpaceExhausted));
    }

    #[tokio::test]
    async fn bootstrap_seeds_default_wireguard_config() {
        let store = Store::open_in_memory().unwrap();
        let cfg = store.get_wireguard_config().await.unwrap();
        assert_eq!(cfg.interface_name, "omniwire");
        assert_eq!(cfg.listen_port, 51820);
        assert!(!cfg.public_key.is_empty());
    }

    #[tokio::test]
    async fn forward_rule_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let input = ForwardRuleInput {
            name: "web".into(),
            listen_port: 8080,
            target_host: "127.0.0.1".into(),
            target_port: 80,
            ..Default::default()
        };
        let created = store.create_forward_rule(&input).await.unwrap();
        assert_eq!(created.listen_port, 8080);

        store.accumulate_forward_bytes(created.id, 100, 200).await.unwrap();
        let reloaded = store.get_forward_rule(created.id).await.unwrap();
        assert_eq!(reloaded.total_upload, 100);
        assert_eq!(reloaded.total_download, 200);

        store.delete_forward_rule(created.id).await.unwrap();
        assert!(store.get_forward_rule(created.id).await.is_err());
    }

    #[tokio::test]
    async fn rejects_duplicate_listen_port_among_enabled_rules() {
        let store = Store::open_in_memory().unwrap();
        let first = ForwardRuleInput {
            name: "web".into(),
            listen_port: 8080,
            target_host: "127.0.0.1".into(),
            target_port: 80,
            ..Default::default()
        };
        store.create_forward_rule(&first).await.unwrap();

        let second = ForwardRuleInput {
            name: "also-web".into(),
            listen_port: 8080,
            target_host: "127.0.0.1".into(),
            target_port: 8081,
            ..Default::default()
        };
        let err = store.create_forward_rule(&second).await.unwrap_err();
        assert!(matches!(err, AppError::PortInUse(8080)));

        // a disabled rule on the same port is fine
        let disabled = ForwardRuleInput {
            enabled: false,
            ..second
        };
        store.create_forward_rule(&disabled).await.unwrap();
    }

    #[tokio::test]
    async fn update_allows_keeping_its_own_port() {
        let store = Store::open_in_memory().unwrap();
        let input = ForwardRuleInput {
            name: "web".into(),
            listen_port: 8080,
            target_host: "127.0.0.1".into(),
            target_port: 80,
            ..Default::default()
        };
        let created = store.create_forward_rule(&input).await.unwrap();

        let update = ForwardRuleInput {
            description: "renamed".into(),
            ..input
        };
        let updated = store.update_forward_rule(created.id, &update).await.unwrap();
        assert_eq!(updated.description, "renamed");
    }
}
