//! IRC session driver.
//!
//! Runs a promoted downstream connection: capability negotiation,
//! attach/detach on JOIN and PART, live fan-out on PRIVMSG. All
//! outgoing traffic funnels through the session's queue so replay and
//! live delivery share one ordered path to the socket.

use crate::network::BoxedStream;
use crate::replay::BufferedLine;
use crate::session::{ClientCaps, ClientSession};
use crate::state::{Bouncer, Network};
use bytes::BytesMut;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tether_proto::Message;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};

const MAX_LINE_LENGTH: usize = 4096;

/// One attached IRC client connection.
pub struct IrcSession {
    bouncer: Arc<Bouncer>,
    network: Arc<Network>,
    session: Arc<ClientSession>,
}

impl IrcSession {
    /// Drive a classified IRC connection until it closes. `first_line`
    /// was consumed during classification and is replayed through the
    /// normal command path; `residual` holds bytes read past it.
    #[tracing::instrument(skip_all, fields(%peer))]
    pub async fn run(
        bouncer: Arc<Bouncer>,
        stream: BoxedStream,
        peer: SocketAddr,
        first_line: String,
        residual: BytesMut,
    ) -> anyhow::Result<()> {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        );
        reader.read_buffer_mut().extend_from_slice(&residual);

        let id = bouncer.next_session_id();
        let (session, mut outgoing) = ClientSession::new(id, "*", ClientCaps::default());
        let network = bouncer.default_network();
        network.add_client(session.clone());
        info!(session = id, %peer, "irc client attached");

        let driver = Self {
            bouncer,
            network: network.clone(),
            session,
        };

        let mut alive = driver.handle_line(&first_line);
        while alive {
            tokio::select! {
                queued = outgoing.recv() => match queued {
                    Some(message) => {
                        writer
                            .write_all(format!("{message}\r\n").as_bytes())
                            .await?;
                    }
                    None => break,
                },
                line = reader.next() => match line {
                    Some(Ok(line)) => alive = driver.handle_line(&line),
                    Some(Err(err)) => {
                        debug!(session = id, %err, "read error");
                        break;
                    }
                    None => break,
                },
            }
        }
        // Flush lines queued by the final command before closing.
        while let Ok(message) = outgoing.try_recv() {
            writer
                .write_all(format!("{message}\r\n").as_bytes())
                .await?;
        }
        network.remove_client(id);
        info!(session = id, %peer, "irc client detached");
        Ok(())
    }

    fn server(&self) -> &str {
        self.bouncer.server_name()
    }

    fn user_prefix(&self) -> String {
        let nick = self.session.nick();
        format!("{nick}!{nick}@{}", self.server())
    }

    fn reply(&self, command: &str, params: Vec<String>) {
        self.session
            .send(Message::new(command, params).with_prefix(self.server().to_string()));
    }

    /// Returns false when the connection should close.
    fn handle_line(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }
        let message = match Message::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                debug!(session = self.session.id(), %err, "unparseable line");
                return true;
            }
        };
        match message.command.to_ascii_uppercase().as_str() {
            "CAP" => self.handle_cap(&message),
            "NICK" => {
                if let Some(nick) = message.params.first() {
                    self.session.set_nick(nick.clone());
                }
            }
            "USER" => {
                let nick = self.session.nick();
                self.reply(
                    "001",
                    vec![nick, format!("Welcome to {}", self.server())],
                );
            }
            "PING" => {
                let token = message
                    .params
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.server().to_string());
                self.reply("PONG", vec![self.server().to_string(), token]);
            }
            "JOIN" => {
                if let Some(channels) = message.params.first() {
                    for channel in channels.split(',').filter(|c| !c.is_empty()) {
                        self.session.send(
                            Message::new("JOIN", vec![channel.to_string()])
                                .with_prefix(self.user_prefix()),
                        );
                        self.bouncer.attach(&self.network, channel, &self.session);
                    }
                }
            }
            "PART" => {
                if let Some(channels) = message.params.first() {
                    for channel in channels.split(',').filter(|c| !c.is_empty()) {
                        self.session.send(
                            Message::new("PART", vec![channel.to_string()])
                                .with_prefix(self.user_prefix()),
                        );
                        self.bouncer.detach(&self.network, channel);
                    }
                }
            }
            "PRIVMSG" | "NOTICE" => self.handle_privmsg(&message),
            "QUIT" => return false,
            command => {
                let nick = self.session.nick();
                self.reply(
                    "421",
                    vec![nick, command.to_string(), "Unknown command".to_string()],
                );
            }
        }
        true
    }

    fn handle_cap(&self, message: &Message) {
        let sub = message
            .params
            .first()
            .map(|s| s.to_ascii_uppercase())
            .unwrap_or_default();
        match sub.as_str() {
            "LS" => self.reply(
                "CAP",
                vec![
                    "*".to_string(),
                    "LS".to_string(),
                    ClientCaps::offered().to_string(),
                ],
            ),
            "REQ" => {
                let requested = message.params.get(1).cloned().unwrap_or_default();
                let mut trial = self.session.caps();
                let all_known = requested.split_whitespace().all(|cap| trial.enable(cap));
                let verdict = if all_known {
                    for cap in requested.split_whitespace() {
                        self.session.enable_cap(cap);
                    }
                    "ACK"
                } else {
                    "NAK"
                };
                self.reply(
                    "CAP",
                    vec!["*".to_string(), verdict.to_string(), requested],
                );
            }
            // END needs no reply
            _ => {}
        }
    }

    fn handle_privmsg(&self, message: &Message) {
        let Some(target) = message.params.first().cloned() else {
            return;
        };
        let text = message.params.get(1).cloned().unwrap_or_default();
        let prefix = self.user_prefix();
        let line = BufferedLine::new(
            message.command.to_ascii_uppercase(),
            vec!["{target}".to_string(), "{text}".to_string()],
        )
        .with_prefix(prefix.clone())
        .with_text(text.clone());
        let wire = Message::new(message.command.to_ascii_uppercase(), vec![target.clone(), text])
            .with_prefix(prefix);
        self.bouncer.record_and_fanout(
            &self.network,
            &target,
            line,
            &wire,
            Some(self.session.id()),
        );
    }
}
