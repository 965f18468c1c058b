//! Listening sockets and connection classification.
//!
//! [`policy`] gates connections by source host before any bytes are
//! read; [`demux`] owns the accept loop and the first-line sniff that
//! routes a connection to an IRC or HTTP session.

pub mod demux;
pub mod policy;

pub use demux::{AsyncStream, BoxedStream, Listener, ListenerHandle, ListenerState};
pub use policy::{AccessPolicy, AnonymousSlot};
