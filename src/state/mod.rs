//! Shared bouncer state.
//!
//! One [`Bouncer`] per process holds the configured networks; each
//! [`Network`] tracks its attached clients and conversation targets.
//! A [`ConversationTarget`]'s state sits behind a single mutex held
//! across append and replay, which is what makes playback ordering
//! deterministic: a line appended while a client attaches is delivered
//! strictly after that client's playback run.

use crate::config::Config;
use crate::jobs::JobDispatcher;
use crate::network::AccessPolicy;
use crate::replay::{BufferedLine, ReplayBuffer, ReplayEngine};
use crate::session::ClientSession;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_proto::Message;
use tracing::{debug, info};

/// Whether a conversation target is a channel or a direct query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Shared channel; playback renders the channel name.
    Channel,
    /// One-to-one conversation; playback renders the recipient's nick.
    Query,
}

impl TargetKind {
    /// Classify a target by name.
    pub fn of(name: &str) -> Self {
        if name.starts_with('#') || name.starts_with('&') {
            Self::Channel
        } else {
            Self::Query
        }
    }
}

/// Mutable per-target state, guarded by the target's mutex.
#[derive(Debug)]
pub struct TargetState {
    /// Captured lines awaiting playback.
    pub buffer: ReplayBuffer,
    /// Detached targets buffer without delivering live lines.
    pub detached: bool,
    /// Clear the buffer after each channel playback run.
    pub auto_clear: bool,
}

/// One channel or query conversation.
#[derive(Debug)]
pub struct ConversationTarget {
    name: String,
    kind: TargetKind,
    /// Held across append and replay; see module docs.
    pub state: Mutex<TargetState>,
}

impl ConversationTarget {
    fn new(name: String, capacity: usize, ceiling: usize) -> Self {
        let kind = TargetKind::of(&name);
        Self {
            state: Mutex::new(TargetState {
                buffer: ReplayBuffer::new(capacity, ceiling),
                detached: false,
                // Channels clear after playback so reconnects do not
                // repeat lines the client already saw live.
                auto_clear: kind == TargetKind::Channel,
            }),
            name,
            kind,
        }
    }

    /// Target name as used on the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel or query.
    pub fn kind(&self) -> TargetKind {
        self.kind
    }
}

/// One upstream network's attached clients and targets.
#[derive(Debug)]
pub struct Network {
    name: String,
    clients: Mutex<Vec<Arc<ClientSession>>>,
    targets: Mutex<HashMap<String, Arc<ConversationTarget>>>,
}

impl Network {
    fn new(name: String) -> Self {
        Self {
            name,
            clients: Mutex::new(Vec::new()),
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Network name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an attached client.
    pub fn add_client(&self, session: Arc<ClientSession>) {
        self.clients.lock().push(session);
    }

    /// Remove a client by session id.
    pub fn remove_client(&self, id: u64) {
        self.clients.lock().retain(|c| c.id() != id);
    }

    /// Snapshot of attached clients.
    pub fn clients(&self) -> Vec<Arc<ClientSession>> {
        self.clients.lock().clone()
    }

    /// Look up a target without creating it.
    pub fn get_target(&self, name: &str) -> Option<Arc<ConversationTarget>> {
        self.targets.lock().get(name).cloned()
    }

    fn target(&self, name: &str, capacity: usize, ceiling: usize) -> Arc<ConversationTarget> {
        self.targets
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ConversationTarget::new(name.to_string(), capacity, ceiling)))
            .clone()
    }
}

/// Process-wide bouncer state.
pub struct Bouncer {
    config: Config,
    access: AccessPolicy,
    engine: ReplayEngine,
    jobs: JobDispatcher,
    networks: DashMap<String, Arc<Network>>,
    next_session_id: AtomicU64,
}

impl Bouncer {
    /// Build the bouncer from its configuration and job dispatcher.
    pub fn new(config: Config, jobs: JobDispatcher) -> Arc<Self> {
        let access = AccessPolicy::new(config.access.clone());
        let engine = ReplayEngine::new(config.bouncer.name.clone());
        Arc::new(Self {
            config,
            access,
            engine,
            jobs,
            networks: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Configuration the process was started with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Server name used in prefixes and rejection lines.
    pub fn server_name(&self) -> &str {
        &self.config.bouncer.name
    }

    /// Connection-origin policy.
    pub fn access(&self) -> &AccessPolicy {
        &self.access
    }

    /// Playback engine.
    pub fn engine(&self) -> &ReplayEngine {
        &self.engine
    }

    /// Background job dispatcher.
    pub fn jobs(&self) -> &JobDispatcher {
        &self.jobs
    }

    /// Allocate a session id.
    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get or create a network by name.
    pub fn network(&self, name: &str) -> Arc<Network> {
        self.networks
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(network = name, "creating network");
                Arc::new(Network::new(name.to_string()))
            })
            .clone()
    }

    /// The network downstream clients attach to by default.
    pub fn default_network(&self) -> Arc<Network> {
        self.network(&self.config.bouncer.network)
    }

    /// Get or create a conversation target on `network`, sized from
    /// the configured limits.
    pub fn target(&self, network: &Network, name: &str) -> Arc<ConversationTarget> {
        network.target(
            name,
            self.config.limits.buffer_size,
            self.config.limits.max_buffer_size,
        )
    }

    /// Attach `session` to a target: clear the detached flag and
    /// replay the buffer to this one client.
    pub fn attach(&self, network: &Network, name: &str, session: &Arc<ClientSession>) {
        let target = self.target(network, name);
        let clients = network.clients();
        let mut state = target.state.lock();
        state.detached = false;
        let delivered = self.engine.send_buffer(
            target.name(),
            target.kind(),
            &mut state,
            &clients,
            Some(session.id()),
        );
        debug!(
            session = session.id(),
            target = name,
            delivered,
            "client attached"
        );
    }

    /// Detach a target: keep buffering, stop delivering live lines.
    pub fn detach(&self, network: &Network, name: &str) {
        let target = self.target(network, name);
        target.state.lock().detached = true;
        debug!(target = name, "target detached");
    }

    /// Capture a line into a target's buffer and fan the wire form out
    /// to attached clients, under one state lock so playback ordering
    /// holds. `sender_id` names the attached session that produced the
    /// line, if any.
    pub fn record_and_fanout(
        &self,
        network: &Network,
        name: &str,
        line: BufferedLine,
        wire: &Message,
        sender_id: Option<u64>,
    ) {
        let target = self.target(network, name);
        let clients = network.clients();
        let mut state = target.state.lock();
        state.buffer.append(line);
        if !state.detached {
            self.engine.fanout_live(&clients, sender_id, wire);
        }
    }

    /// Send a server NOTICE to every attached client on every network.
    pub fn broadcast_notice(&self, text: &str) {
        let notice = Message::new("NOTICE", vec!["*".to_string(), text.to_string()])
            .with_prefix(self.server_name().to_string());
        for network in self.networks.iter() {
            for client in network.clients() {
                client.send(notice.clone());
            }
        }
    }
}
