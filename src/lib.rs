//! tetherd - Tether IRC bouncer daemon.
//!
//! The connection-multiplexing and replay core of an IRC bouncer: one
//! upstream session per network stays alive while any number of
//! downstream clients attach, detach and reattach, replaying the
//! backlog they were eligible to see.
//!
//! The crate is a library plus a thin `tetherd` binary so the
//! integration tests can drive the core in-process.

pub mod config;
pub mod error;
pub mod jobs;
pub mod network;
pub mod replay;
pub mod session;
pub mod state;
