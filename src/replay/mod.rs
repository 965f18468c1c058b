//! Replay buffering and playback.
//!
//! [`buffer`] holds the bounded per-target line store; [`engine`]
//! renders and fans buffered lines out to attached clients.

pub mod buffer;
pub mod engine;

pub use buffer::{BufferedLine, ReplayBuffer, Timestamp};
pub use engine::{PlaybackHook, ReplayEngine};
