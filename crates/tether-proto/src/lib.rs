//! # tether-proto
//!
//! IRC message framing for the tether bouncer: message and tag
//! parsing/serialization with IRCv3 tag escaping, server-time
//! formatting, deterministic batch references, and the first-line
//! protocol sniffer the listener uses to tell IRC from HTTP.
//!
//! This crate knows nothing about sockets. It is the wire-format
//! boundary shared by the bouncer core and its tests.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod batch;
pub mod error;
pub mod message;
pub mod server_time;
pub mod sniff;

pub use self::batch::batch_ref_for;
pub use self::error::ProtocolError;
pub use self::message::{Message, Tag};
pub use self::server_time::{
    format_server_time, format_timestamp, human_timestamp, parse_server_time,
};
pub use self::sniff::{sniff_first_line, SniffedProtocol};
