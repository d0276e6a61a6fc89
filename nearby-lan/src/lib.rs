//! LAN backend for nearby sessions: UDP multicast discovery, encrypted TCP links,
//! config loading and a C ABI for native hosts.

pub mod config;
pub mod discovery;
pub mod ffi;
pub mod transport;

pub use config::{Config, ConfigError};
pub use transport::{LanOptions, LanTransport};
