//! Downstream client sessions.
//!
//! [`client`] holds the shared per-client handle used across the
//! bouncer; [`irc`] and [`http`] drive a promoted connection after the
//! demultiplexer classifies its first line.

mod client;
pub mod http;
pub mod irc;

pub use client::{ClientCaps, ClientSession, PlaybackGuard};
pub use http::HttpSession;
pub use irc::IrcSession;
