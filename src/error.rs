use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error kinds surfaced by control operations (§7).
///
/// The data plane never returns these to a caller per connection or packet;
/// it drops silently and updates counters instead. Only control operations
/// (Start/Stop/Create/Update/...) propagate an `AppError`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Returned both when binding a listener fails because the OS port is
    /// taken, and when a forward rule would duplicate the (port, protocol)
    /// of another enabled rule.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("cancelled while waiting for a connection")]
    Cancelled,

    #[error("pooled connection failed validation")]
    ConnInvalid,

    #[error("failed to connect to target: {0}")]
    ConnectFailed(String),

    #[error("WireGuard device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("key material invalid: {0}")]
    KeyMaterialInvalid(String),

    #[error("failed to configure interface IP: {0}")]
    IpConfigFailed(String),

    #[error("server endpoint is not configured")]
    EndpointMissing,

    #[error("no free address left in the tunnel subnet")]
    IpSpaceExhausted,

    #[error("WireGuard is already running")]
    AlreadyRunning,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
