//! Playback fan-out.
//!
//! The engine walks a target's replay buffer oldest-first and delivers
//! each line to attached clients, rendered per recipient. Capability
//! differences between recipients never change what is stored, only
//! what each one sees on the wire.

use crate::session::ClientSession;
use crate::state::{TargetKind, TargetState};
use std::collections::HashMap;
use std::sync::Arc;
use tether_proto::{batch_ref_for, Message};
use tracing::{debug, trace};

/// Per-line playback filter. Implementations can veto delivery of a
/// rendered line to one recipient; vetoed lines are dropped silently
/// and stay in the buffer.
pub trait PlaybackHook: Send + Sync {
    /// Return `false` to suppress delivery of `message` to `recipient`.
    fn on_playback_line(
        &self,
        recipient: &ClientSession,
        target: &str,
        message: &Message,
    ) -> bool;
}

/// Renders and fans out buffered lines to attached clients.
pub struct ReplayEngine {
    server_name: String,
    hook: Option<Box<dyn PlaybackHook>>,
}

impl ReplayEngine {
    /// Create an engine that stamps server-originated lines with
    /// `server_name`.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            hook: None,
        }
    }

    /// Install a playback filter hook.
    pub fn with_hook(mut self, hook: Box<dyn PlaybackHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Replay `state`'s buffer to `clients`, or to the single session
    /// identified by `only`. Returns how many clients received
    /// playback.
    ///
    /// The caller holds the target's state lock for the whole call, so
    /// lines appended concurrently are ordered strictly after this
    /// playback run.
    pub fn send_buffer(
        &self,
        target_name: &str,
        kind: TargetKind,
        state: &mut TargetState,
        clients: &[Arc<ClientSession>],
        only: Option<u64>,
    ) -> usize {
        if clients.is_empty() || state.buffer.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        for recipient in clients {
            if let Some(id) = only {
                if recipient.id() != id {
                    continue;
                }
            }
            let _guard = recipient.begin_playback();
            self.replay_to(target_name, kind, state, recipient);
            delivered += 1;
            if only.is_some() {
                break;
            }
        }
        if delivered > 0 && state.auto_clear && kind == TargetKind::Channel {
            trace!(target = target_name, "auto-clearing channel buffer");
            state.buffer.clear();
        }
        delivered
    }

    fn replay_to(
        &self,
        target_name: &str,
        kind: TargetKind,
        state: &TargetState,
        recipient: &Arc<ClientSession>,
    ) {
        let caps = recipient.caps();
        let recipient_nick = recipient.nick();
        let rendered_target = match kind {
            TargetKind::Channel => target_name.to_string(),
            TargetKind::Query => recipient_nick.clone(),
        };
        let mut params = HashMap::new();
        params.insert("target", rendered_target.clone());

        let batch_ref = caps.batch.then(|| batch_ref_for(target_name));
        if let Some(batch_ref) = &batch_ref {
            recipient.send(
                Message::new(
                    "BATCH",
                    vec![
                        format!("+{batch_ref}"),
                        "tether.in/playback".to_string(),
                        rendered_target.clone(),
                    ],
                )
                .with_prefix(self.server_name.clone()),
            );
        }
        if !caps.server_time {
            recipient.send(self.status_line(
                &rendered_target,
                "Buffer Playback...",
                batch_ref.as_deref(),
            ));
        }

        for index in 0..state.buffer.len() {
            let own_line = match state.buffer.get(index) {
                Ok(line) => line.sender_nick() == Some(recipient_nick.as_str()),
                Err(_) => false,
            };
            if own_line && !caps.echo_message && !caps.self_message {
                continue;
            }
            let mut message = match state.buffer.render(index, recipient, &params) {
                Ok(message) => message,
                Err(err) => {
                    debug!(target = target_name, index, %err, "skipping unrenderable line");
                    continue;
                }
            };
            if let Some(hook) = &self.hook {
                if !hook.on_playback_line(recipient, target_name, &message) {
                    trace!(
                        session = recipient.id(),
                        target = target_name,
                        "playback line vetoed by hook"
                    );
                    continue;
                }
            }
            if let Some(batch_ref) = &batch_ref {
                message = message.with_tag("batch", Some(batch_ref.clone()));
            }
            recipient.send(message);
        }

        if !caps.server_time {
            recipient.send(self.status_line(
                &rendered_target,
                "Playback Complete.",
                batch_ref.as_deref(),
            ));
        }
        if let Some(batch_ref) = &batch_ref {
            recipient.send(
                Message::new("BATCH", vec![format!("-{batch_ref}")])
                    .with_prefix(self.server_name.clone()),
            );
        }
    }

    /// Deliver a live line to attached clients. `sender_id` identifies
    /// the attached session the line originated from, if any; echo and
    /// self-message capabilities decide who sees it. Returns how many
    /// clients the line was queued for.
    pub fn fanout_live(
        &self,
        clients: &[Arc<ClientSession>],
        sender_id: Option<u64>,
        message: &Message,
    ) -> usize {
        let mut sent = 0;
        for client in clients {
            let caps = client.caps();
            match sender_id {
                Some(id) if client.id() == id => {
                    if !caps.echo_message {
                        continue;
                    }
                }
                Some(_) => {
                    if !caps.self_message {
                        continue;
                    }
                }
                None => {}
            }
            client.send(message.clone());
            sent += 1;
        }
        sent
    }

    fn status_line(&self, target: &str, text: &str, batch_ref: Option<&str>) -> Message {
        let mut message = Message::new("PRIVMSG", vec![target.to_string(), text.to_string()])
            .with_prefix(format!("***!tether@{}", self.server_name));
        if let Some(batch_ref) = batch_ref {
            message = message.with_tag("batch", Some(batch_ref.to_string()));
        }
        message
    }
}
