//! IRC message type: tags, prefix, command and parameters.
//!
//! A deliberately small surface compared to a full IRC library: the
//! bouncer core only needs to frame lines, carry tags through replay,
//! and pull the sender nick out of a prefix.

use crate::error::ProtocolError;
use std::fmt::{self, Write as _};
use std::str::FromStr;

// IRCv3 message-tags value escaping. Only these five characters are
// special; everything else passes through unchanged.
fn tag_escape(c: char) -> Option<&'static str> {
    Some(match c {
        ';' => "\\:",
        ' ' => "\\s",
        '\\' => "\\\\",
        '\r' => "\\r",
        '\n' => "\\n",
        _ => return None,
    })
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            // Unknown escapes keep the character, a dangling trailing
            // backslash is dropped.
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// A single IRCv3 message tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key (unique within a message).
    pub key: String,
    /// Tag value; `None` serializes as a bare key.
    pub value: Option<String>,
}

impl Tag {
    /// Create a new tag.
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A parsed IRC protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, insertion order preserved.
    pub tags: Option<Vec<Tag>>,
    /// Sender prefix without the leading `:` (`nick!user@host` or a server name).
    pub prefix: Option<String>,
    /// Command or numeric, as written on the wire.
    pub command: String,
    /// Positional parameters; the last one may contain spaces.
    pub params: Vec<String>,
}

impl Message {
    /// Create a message with no tags or prefix.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            tags: None,
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Builder-style prefix setter.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Builder-style tag setter. Replaces the value of an existing key
    /// in place, otherwise appends, so insertion order stays stable.
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        let key = key.into();
        let tags = self.tags.get_or_insert_with(Vec::new);
        if let Some(existing) = tags.iter_mut().find(|t| t.key == key) {
            existing.value = value;
        } else {
            tags.push(Tag::new(key, value));
        }
        self
    }

    /// Look up a tag value by key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .as_ref()?
            .iter()
            .find(|t| t.key == key)
            .and_then(|t| t.value.as_deref())
    }

    /// The nick portion of the prefix (up to `!`), if any.
    pub fn sender_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }

    /// Parse a wire line (CRLF optional) into a message.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.trim().is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        // Tags
        let mut tags = None;
        if let Some(stripped) = rest.strip_prefix('@') {
            let (tag_part, remainder) = stripped
                .split_once(' ')
                .ok_or_else(|| ProtocolError::MalformedTags(line.to_string()))?;
            let mut parsed = Vec::new();
            for item in tag_part.split(';') {
                if item.is_empty() {
                    continue;
                }
                match item.split_once('=') {
                    Some((k, v)) => parsed.push(Tag::new(k, Some(unescape_tag_value(v)))),
                    None => parsed.push(Tag::new(item, None)),
                }
            }
            tags = Some(parsed);
            rest = remainder.trim_start();
        }

        // Prefix
        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (pfx, remainder) = stripped
                .split_once(' ')
                .ok_or_else(|| ProtocolError::MissingCommand(line.to_string()))?;
            prefix = Some(pfx.to_string());
            rest = remainder.trim_start();
        }

        // Command + params, with the trailing `:` parameter swallowing spaces
        let mut params = Vec::new();
        let command;
        match rest.split_once(' ') {
            None => {
                if rest.is_empty() {
                    return Err(ProtocolError::MissingCommand(line.to_string()));
                }
                command = rest.to_string();
            }
            Some((cmd, mut args)) => {
                command = cmd.to_string();
                loop {
                    args = args.trim_start();
                    if args.is_empty() {
                        break;
                    }
                    if let Some(trailing) = args.strip_prefix(':') {
                        params.push(trailing.to_string());
                        break;
                    }
                    match args.split_once(' ') {
                        Some((arg, remainder)) => {
                            params.push(arg.to_string());
                            args = remainder;
                        }
                        None => {
                            params.push(args.to_string());
                            break;
                        }
                    }
                }
            }
        }

        Ok(Self {
            tags,
            prefix,
            command,
            params,
        })
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            if !tags.is_empty() {
                f.write_str("@")?;
                for (i, tag) in tags.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    f.write_str(&tag.key)?;
                    if let Some(value) = &tag.value {
                        f.write_str("=")?;
                        for c in value.chars() {
                            match tag_escape(c) {
                                Some(escaped) => f.write_str(escaped)?,
                                None => f.write_char(c)?,
                            }
                        }
                    }
                }
                f.write_str(" ")?;
            }
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            let last = i == self.params.len() - 1;
            if last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_command() {
        let msg = Message::parse("PING :irc.example.net\r\n").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.net"]);
        assert!(msg.tags.is_none());
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parse_full_message() {
        let raw = "@time=2023-01-01T12:00:00.000Z;msgid=abc :nick!user@host PRIVMSG #chan :hello world";
        let msg = Message::parse(raw).unwrap();
        assert_eq!(msg.tag("time"), Some("2023-01-01T12:00:00.000Z"));
        assert_eq!(msg.tag("msgid"), Some("abc"));
        assert_eq!(msg.prefix.as_deref(), Some("nick!user@host"));
        assert_eq!(msg.sender_nick(), Some("nick"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello world"]);
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(Message::parse("\r\n"), Err(ProtocolError::EmptyMessage));
        assert_eq!(Message::parse("   "), Err(ProtocolError::EmptyMessage));
    }

    #[test]
    fn display_roundtrip() {
        let raw = ":nick!user@host PRIVMSG #chan :hello world";
        let msg = Message::parse(raw).unwrap();
        assert_eq!(msg.to_string(), raw);
        let reparsed = Message::parse(&msg.to_string()).unwrap();
        assert_eq!(reparsed, msg);
    }

    #[test]
    fn display_escapes_tag_values() {
        let msg = Message::new("PRIVMSG", vec!["#c".into(), "hi".into()])
            .with_tag("note", Some("a b;c".into()));
        assert_eq!(msg.to_string(), "@note=a\\sb\\:c PRIVMSG #c hi");
    }

    #[test]
    fn parse_unescapes_tag_values() {
        let msg = Message::parse("@note=a\\sb\\:c;flag PRIVMSG #c :hi").unwrap();
        assert_eq!(msg.tag("note"), Some("a b;c"));
        let tags = msg.tags.as_ref().unwrap();
        assert!(tags.iter().any(|t| t.key == "flag" && t.value.is_none()));
    }

    #[test]
    fn tag_value_with_every_special_char_survives_roundtrip() {
        let msg = Message::new("TAGMSG", vec!["#c".into()])
            .with_tag("note", Some("semi;colon space\\slash\r\nctl".into()));
        let reparsed = Message::parse(&msg.to_string()).unwrap();
        assert_eq!(reparsed.tag("note"), msg.tag("note"));
    }

    #[test]
    fn lenient_tag_value_unescaping() {
        // Unknown escape keeps the character, a dangling backslash at
        // the end of the value is dropped.
        let msg = Message::parse("@a=x\\yz;b=end\\ PRIVMSG #c :hi").unwrap();
        assert_eq!(msg.tag("a"), Some("xyz"));
        assert_eq!(msg.tag("b"), Some("end"));
    }

    #[test]
    fn with_tag_replaces_existing_key_in_place() {
        let msg = Message::new("NOTICE", vec!["x".into()])
            .with_tag("time", Some("t1".into()))
            .with_tag("batch", Some("b".into()))
            .with_tag("time", Some("t2".into()));
        let tags = msg.tags.as_ref().unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].key, "time");
        assert_eq!(tags[0].value.as_deref(), Some("t2"));
        assert_eq!(tags[1].key, "batch");
    }

    #[test]
    fn sender_nick_handles_bare_server_prefix() {
        let msg = Message::parse(":irc.example.net NOTICE * :hi").unwrap();
        assert_eq!(msg.sender_nick(), Some("irc.example.net"));
    }

    #[test]
    fn trailing_param_with_colon_inside() {
        let msg = Message::parse("TOPIC #chan :topic: with colon").unwrap();
        assert_eq!(msg.params, vec!["#chan", "topic: with colon"]);
    }
}
