use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CommandLine {
    #[clap(subcommand)]
    pub command: Option<ServiceConfig>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ServiceConfig {
    /// Run the forwarding + WireGuard daemon.
    Serve {
        /// Path to the SQLite store.
        #[clap(long, env = "OMNIWIRE_DB", default_value = "./data/omniwire.db")]
        db: String,

        /// WireGuard interface name.
        #[clap(long, env = "OMNIWIRE_WG_INTERFACE", default_value = "omniwire")]
        wg_interface: String,

        /// WireGuard UDP listen port.
        #[clap(long, env = "OMNIWIRE_WG_LISTEN_PORT", default_value = "51820")]
        wg_listen_port: u16,
    },
}
