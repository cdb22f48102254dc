#![recursion_limit = "512"]

pub mod bufferpool;
pub mod client_config;
pub mod config;
pub mod copier;
pub mod error;
pub mod forward;
pub mod pool;
pub mod store;
pub mod wireguard;
