//! CRC Node -- library crate for the relay chat server.
//!
//! Re-exports the internal modules so the binary and integration tests can
//! reach the event loop, relay engine, topology table and config types.

pub mod config;
pub mod connection;
pub mod relay;
pub mod server;
pub mod snapshot;
pub mod topology;

pub use config::NodeConfig;
pub use server::Server;
pub use snapshot::{HostSummary, NodeSnapshot};

use std::path::{Path, PathBuf};

pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
