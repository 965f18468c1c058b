//! Bounded per-target replay storage.
//!
//! Each conversation target owns one [`ReplayBuffer`]: a FIFO of
//! [`BufferedLine`]s captured while clients are away. Lines are stored
//! as message templates and rendered per recipient at playback time,
//! so one captured line can produce different wire forms for clients
//! with different capability sets.

use crate::error::BufferError;
use crate::session::ClientSession;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use tether_proto::{format_timestamp, human_timestamp, Message, Tag};

/// Capture time of a buffered line, kept at microsecond resolution so
/// ordering survives bursts within one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: i64,
    /// Sub-second microseconds.
    pub micros: u32,
}

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            secs: now.timestamp(),
            micros: now.timestamp_subsec_micros(),
        }
    }
}

/// One captured line: a message template plus its capture time and any
/// tags the line carried on the wire.
#[derive(Debug, Clone)]
pub struct BufferedLine {
    prefix: Option<String>,
    command: String,
    params: Vec<String>,
    text: Option<String>,
    time: Timestamp,
    tags: Vec<Tag>,
}

impl BufferedLine {
    /// Create a line template. `params` may contain the placeholders
    /// `{nick}`, `{target}` and `{text}`, substituted at render time.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
            text: None,
            time: Timestamp::now(),
            tags: Vec::new(),
        }
    }

    /// Set the sender prefix (`nick!user@host`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the raw payload substituted for `{text}`.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Override the capture time.
    pub fn with_time(mut self, time: Timestamp) -> Self {
        self.time = time;
        self
    }

    /// Attach a tag captured from the wire. Keys are unique: a repeat
    /// replaces the stored value in place, keeping insertion order.
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        let key = key.into();
        if let Some(existing) = self.tags.iter_mut().find(|t| t.key == key) {
            existing.value = value;
        } else {
            self.tags.push(Tag { key, value });
        }
        self
    }

    /// Sender prefix, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Command of the template.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Raw payload, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Capture time.
    pub fn time(&self) -> Timestamp {
        self.time
    }

    /// Nick portion of the prefix, up to the first `!`.
    pub fn sender_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split('!').next().unwrap_or(p))
    }

    /// Identity key for deduplication: the rendered wire form with the
    /// raw payload in place and tags ignored.
    fn distinct_key(&self) -> String {
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            let _ = write!(out, ":{prefix} ");
        }
        out.push_str(&self.command);
        for param in &self.params {
            let _ = write!(out, " {param}");
        }
        if let Some(text) = &self.text {
            let _ = write!(out, " :{text}");
        }
        out
    }
}

/// Bounded FIFO of captured lines for one conversation target.
#[derive(Debug)]
pub struct ReplayBuffer {
    lines: VecDeque<BufferedLine>,
    capacity: usize,
    ceiling: usize,
}

impl ReplayBuffer {
    /// Create a buffer with the given capacity and resize ceiling.
    pub fn new(capacity: usize, ceiling: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
            ceiling,
        }
    }

    /// Number of stored lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a line, evicting the oldest while at capacity. A
    /// zero-capacity buffer drops the line. Returns the stored count.
    pub fn append(&mut self, line: BufferedLine) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.lines.len()
    }

    /// Replace the first line (insertion order) whose command matches
    /// `command` (ASCII-case-insensitive), or append if none matches.
    /// Used for state lines (topic, away) where only the latest value
    /// matters.
    pub fn replace_matching_command(&mut self, command: &str, line: BufferedLine) -> usize {
        for existing in self.lines.iter_mut() {
            if existing.command.eq_ignore_ascii_case(command) {
                *existing = line;
                return self.lines.len();
            }
        }
        self.append(line)
    }

    /// Append unless a stored line already renders to the same wire
    /// content (tags ignored), in which case the buffer is untouched.
    /// Keeps idempotent server notices from piling up.
    pub fn replace_if_distinct(&mut self, line: BufferedLine) -> usize {
        let key = line.distinct_key();
        if self.lines.iter().any(|existing| existing.distinct_key() == key) {
            return self.lines.len();
        }
        self.append(line)
    }

    /// Resize the buffer. Without `force` the request is checked
    /// against the ceiling; shrinking evicts oldest lines first.
    pub fn set_capacity(&mut self, capacity: usize, force: bool) -> Result<(), BufferError> {
        if !force && capacity > self.ceiling {
            return Err(BufferError::CapacityRejected {
                requested: capacity,
                ceiling: self.ceiling,
            });
        }
        self.capacity = capacity;
        while self.lines.len() > capacity {
            self.lines.pop_front();
        }
        Ok(())
    }

    /// Drop all stored lines.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Line at `index` (0 is oldest), for inspection.
    pub fn get(&self, index: usize) -> Result<&BufferedLine, BufferError> {
        self.lines.get(index).ok_or(BufferError::IndexOutOfRange {
            index,
            len: self.lines.len(),
        })
    }

    /// Iterate stored lines oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedLine> {
        self.lines.iter()
    }

    /// Render the line at `index` for one recipient.
    ///
    /// Placeholders in the template params are substituted from
    /// `params`, with `{nick}` defaulting to the sender nick and
    /// `{text}` to the raw payload. Recipients with `server-time` get
    /// a `time` tag and the bare payload; others get the payload
    /// prefixed with a human-readable `[HH:MM:SS]` clock. No other
    /// captured tag survives rendering.
    pub fn render(
        &self,
        index: usize,
        recipient: &ClientSession,
        params: &HashMap<&str, String>,
    ) -> Result<Message, BufferError> {
        let line = self.get(index)?;
        let caps = recipient.caps();

        let text = line.text.clone().unwrap_or_default();
        let text = if caps.server_time {
            text
        } else {
            format!("{} {}", human_timestamp(line.time.secs), text)
        };

        let substitute = |param: &str| -> String {
            let mut out = param.to_string();
            if out.contains("{nick}") {
                let nick = params
                    .get("nick")
                    .cloned()
                    .or_else(|| line.sender_nick().map(str::to_string))
                    .unwrap_or_default();
                out = out.replace("{nick}", &nick);
            }
            for (key, value) in params {
                let placeholder = format!("{{{key}}}");
                if out.contains(&placeholder) {
                    out = out.replace(&placeholder, value);
                }
            }
            out.replace("{text}", &text)
        };

        let mut message = Message::new(
            line.command.clone(),
            line.params.iter().map(|p| substitute(p)).collect(),
        );
        if let Some(prefix) = &line.prefix {
            message = message.with_prefix(prefix.clone());
        }
        if caps.server_time {
            let value = line
                .tags
                .iter()
                .find(|t| t.key == "time")
                .and_then(|t| t.value.clone())
                .unwrap_or_else(|| format_timestamp(line.time.secs, line.time.micros));
            message = message.with_tag("time", Some(value));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientCaps;

    fn privmsg(nick: &str, text: &str) -> BufferedLine {
        BufferedLine::new("PRIVMSG", vec!["{target}".into(), "{text}".into()])
            .with_prefix(format!("{nick}!user@host"))
            .with_text(text)
    }

    fn session(caps: ClientCaps) -> std::sync::Arc<ClientSession> {
        let (session, _rx) = ClientSession::new(1, "reader", caps);
        session
    }

    #[test]
    fn append_evicts_oldest_at_capacity() {
        let mut buf = ReplayBuffer::new(3, 500);
        for i in 0..5 {
            buf.append(privmsg("alice", &format!("msg {i}")));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.get(0).unwrap().text(), Some("msg 2"));
        assert_eq!(buf.get(2).unwrap().text(), Some("msg 4"));
    }

    #[test]
    fn zero_capacity_buffer_drops_appends() {
        let mut buf = ReplayBuffer::new(0, 500);
        assert_eq!(buf.append(privmsg("alice", "dropped")), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn replace_matching_command_swaps_whole_entry_in_place() {
        let mut buf = ReplayBuffer::new(10, 500);
        buf.append(privmsg("alice", "one"));
        buf.append(
            BufferedLine::new("TOPIC", vec!["{target}".into(), "{text}".into()])
                .with_prefix("alice!user@host")
                .with_text("old topic"),
        );
        buf.append(privmsg("bob", "two"));
        buf.replace_matching_command(
            "topic",
            BufferedLine::new("TOPIC", vec!["{target}".into(), "{text}".into()])
                .with_prefix("bob!user@host")
                .with_text("new topic"),
        );
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.get(1).unwrap().text(), Some("new topic"));
        assert_eq!(buf.get(1).unwrap().prefix(), Some("bob!user@host"));
    }

    #[test]
    fn replace_matching_command_appends_when_absent() {
        let mut buf = ReplayBuffer::new(10, 500);
        buf.append(privmsg("alice", "one"));
        buf.replace_matching_command(
            "TOPIC",
            BufferedLine::new("TOPIC", vec!["{target}".into(), "{text}".into()])
                .with_text("fresh"),
        );
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn replace_if_distinct_appends_identical_content_once() {
        let mut buf = ReplayBuffer::new(10, 500);
        let early = Timestamp {
            secs: 1_000,
            micros: 0,
        };
        buf.append(privmsg("alice", "same").with_time(early));
        let late = Timestamp {
            secs: 2_000,
            micros: 0,
        };
        // identical rendered content, different capture time and tags:
        // still a duplicate
        buf.replace_if_distinct(
            privmsg("alice", "same")
                .with_time(late)
                .with_tag("account", Some("alice".into())),
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.get(0).unwrap().time(), early);
    }

    #[test]
    fn replace_if_distinct_appends_different_line() {
        let mut buf = ReplayBuffer::new(10, 500);
        buf.append(privmsg("alice", "one"));
        buf.replace_if_distinct(privmsg("alice", "two"));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn set_capacity_honors_ceiling() {
        let mut buf = ReplayBuffer::new(50, 500);
        assert!(matches!(
            buf.set_capacity(501, false),
            Err(BufferError::CapacityRejected {
                requested: 501,
                ceiling: 500
            })
        ));
        buf.set_capacity(501, true).unwrap();
        assert_eq!(buf.capacity(), 501);
    }

    #[test]
    fn shrinking_capacity_evicts_oldest() {
        let mut buf = ReplayBuffer::new(10, 500);
        for i in 0..5 {
            buf.append(privmsg("alice", &format!("msg {i}")));
        }
        buf.set_capacity(2, false).unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.get(0).unwrap().text(), Some("msg 3"));
    }

    #[test]
    fn render_adds_time_tag_for_server_time_client() {
        let mut buf = ReplayBuffer::new(10, 500);
        buf.append(
            privmsg("alice", "hello").with_time(Timestamp {
                secs: 1_600_000_000,
                micros: 250_000,
            }),
        );
        let caps = ClientCaps {
            server_time: true,
            ..Default::default()
        };
        let recipient = session(caps);
        let mut params = HashMap::new();
        params.insert("target", "#rust".to_string());
        let rendered = buf.render(0, &recipient, &params).unwrap();
        assert_eq!(rendered.tag("time"), Some("2020-09-13T12:26:40.250Z"));
        assert_eq!(rendered.params, vec!["#rust", "hello"]);
    }

    #[test]
    fn render_prefixes_clock_for_plain_client() {
        let mut buf = ReplayBuffer::new(10, 500);
        buf.append(
            privmsg("alice", "hello").with_time(Timestamp {
                secs: 1_600_000_000,
                micros: 0,
            }),
        );
        let recipient = session(ClientCaps::default());
        let mut params = HashMap::new();
        params.insert("target", "#rust".to_string());
        let rendered = buf.render(0, &recipient, &params).unwrap();
        assert!(rendered.tags.is_none());
        assert_eq!(rendered.params[1], "[12:26:40] hello");
    }

    #[test]
    fn with_tag_replaces_duplicate_key_in_place() {
        let line = privmsg("alice", "hello")
            .with_tag("time", Some("t1".into()))
            .with_tag("account", Some("alice".into()))
            .with_tag("time", Some("t2".into()));
        assert_eq!(line.tags.len(), 2);
        assert_eq!(line.tags[0].key, "time");
        assert_eq!(line.tags[0].value.as_deref(), Some("t2"));
        assert_eq!(line.tags[1].key, "account");
    }

    #[test]
    fn render_narrows_captured_tags_to_time() {
        let mut buf = ReplayBuffer::new(10, 500);
        buf.append(
            privmsg("alice", "tagged")
                .with_tag("time", Some("2023-01-01T00:00:00.000Z".to_string()))
                .with_tag("account", Some("alice".to_string())),
        );
        let caps = ClientCaps {
            server_time: true,
            ..Default::default()
        };
        let recipient = session(caps);
        let mut params = HashMap::new();
        params.insert("target", "#rust".to_string());
        let rendered = buf.render(0, &recipient, &params).unwrap();
        assert_eq!(rendered.tag("time"), Some("2023-01-01T00:00:00.000Z"));
        assert!(rendered.tag("account").is_none());
    }

    #[test]
    fn render_rejects_out_of_range_index() {
        let buf = ReplayBuffer::new(10, 500);
        let recipient = session(ClientCaps::default());
        assert!(matches!(
            buf.render(3, &recipient, &HashMap::new()),
            Err(BufferError::IndexOutOfRange { index: 3, len: 0 })
        ));
    }
}
