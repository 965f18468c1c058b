//! Shared per-client session handle.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_proto::Message;
use tokio::sync::mpsc;

/// IRCv3 capabilities negotiated by a downstream client. Rendering and
/// fan-out consult these per recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCaps {
    /// `server-time`: client understands the `time` message tag.
    pub server_time: bool,
    /// `echo-message`: client wants its own messages echoed back.
    pub echo_message: bool,
    /// `tether.in/self-message`: client understands messages it sent
    /// from another attached client.
    pub self_message: bool,
    /// `batch`: client understands BATCH framing.
    pub batch: bool,
}

impl ClientCaps {
    /// Enable the capability named `cap`, returning false for names
    /// this bouncer does not offer.
    pub fn enable(&mut self, cap: &str) -> bool {
        match cap {
            "server-time" => self.server_time = true,
            "echo-message" => self.echo_message = true,
            "tether.in/self-message" => self.self_message = true,
            "batch" => self.batch = true,
            _ => return false,
        }
        true
    }

    /// Space-separated list of capabilities offered to clients.
    pub fn offered() -> &'static str {
        "server-time echo-message tether.in/self-message batch"
    }
}

/// One attached downstream client.
///
/// The session is shared between its connection task and the replay
/// engine; outgoing lines go through an unbounded channel drained by
/// the connection task, so playback never blocks on a slow socket.
#[derive(Debug)]
pub struct ClientSession {
    id: u64,
    nick: RwLock<String>,
    caps: RwLock<ClientCaps>,
    playback_active: AtomicBool,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl ClientSession {
    /// Create a session and the receiver its connection task drains.
    pub fn new(
        id: u64,
        nick: impl Into<String>,
        caps: ClientCaps,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            nick: RwLock::new(nick.into()),
            caps: RwLock::new(caps),
            playback_active: AtomicBool::new(false),
            outgoing: tx,
        });
        (session, rx)
    }

    /// Unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current nick.
    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    /// Update the nick.
    pub fn set_nick(&self, nick: impl Into<String>) {
        *self.nick.write() = nick.into();
    }

    /// Snapshot of the negotiated capabilities.
    pub fn caps(&self) -> ClientCaps {
        *self.caps.read()
    }

    /// Enable one capability by name.
    pub fn enable_cap(&self, cap: &str) -> bool {
        self.caps.write().enable(cap)
    }

    /// Queue a message for this client. Errors from a disconnected
    /// receiver are ignored; the connection task is already gone.
    pub fn send(&self, message: Message) {
        let _ = self.outgoing.send(message);
    }

    /// Whether a playback run is currently addressing this client.
    pub fn playback_active(&self) -> bool {
        self.playback_active.load(Ordering::Acquire)
    }

    /// Mark this client as receiving playback for the lifetime of the
    /// returned guard. Nested runs are allowed; each guard restores the
    /// value it observed, so the flag stays set until the outermost run
    /// ends.
    pub fn begin_playback(self: &Arc<Self>) -> PlaybackGuard {
        let was_active = self.playback_active.swap(true, Ordering::AcqRel);
        PlaybackGuard {
            session: Arc::clone(self),
            was_active,
        }
    }
}

/// Restores the playback flag when a replay run ends, on any exit path.
#[derive(Debug)]
pub struct PlaybackGuard {
    session: Arc<ClientSession>,
    was_active: bool,
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.session
            .playback_active
            .store(self.was_active, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_known_caps() {
        let mut caps = ClientCaps::default();
        assert!(caps.enable("server-time"));
        assert!(caps.enable("batch"));
        assert!(!caps.enable("draft/chathistory"));
        assert!(caps.server_time);
        assert!(caps.batch);
        assert!(!caps.echo_message);
    }

    #[test]
    fn send_queues_message() {
        let (session, mut rx) = ClientSession::new(7, "alice", ClientCaps::default());
        session.send(Message::new("PING", vec!["token".into()]));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn playback_guard_restores_previous_flag() {
        let (session, _rx) = ClientSession::new(7, "alice", ClientCaps::default());
        let outer = session.begin_playback();
        assert!(session.playback_active());
        let inner = session.begin_playback();
        drop(inner);
        // the inner guard restores to "active", not "idle"
        assert!(session.playback_active());
        drop(outer);
        assert!(!session.playback_active());
    }

    #[test]
    fn send_after_receiver_drop_is_silent() {
        let (session, rx) = ClientSession::new(7, "alice", ClientCaps::default());
        drop(rx);
        session.send(Message::new("PING", vec![]));
    }
}
