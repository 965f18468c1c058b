//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions (Config, BouncerConfig)
//! - [`listen`]: Listener configuration (ListenConfig, AcceptProtocol, TlsConfig)
//! - [`limits`]: Replay buffer limits (LimitsConfig)
//! - [`access`]: Connection-origin policy (AccessConfig)

mod access;
mod limits;
mod listen;
mod types;

pub use access::AccessConfig;
pub use limits::LimitsConfig;
pub use listen::{AcceptProtocol, ListenConfig, TlsConfig};
pub use types::{BouncerConfig, Config};
