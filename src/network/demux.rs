//! Connection demultiplexer.
//!
//! One listener accepts raw TCP (optionally TLS-terminated), holds
//! each connection unclassified until its first line arrives, sniffs
//! that line for IRC-versus-HTTP, and hands the stream to the matching
//! session driver with the first line and any already-read bytes, so
//! nothing read during classification is lost.

use crate::config::{AcceptProtocol, ListenConfig, TlsConfig};
use crate::error::ListenError;
use crate::session::{HttpSession, IrcSession};
use crate::state::Bouncer;
use bytes::BytesMut;
use parking_lot::RwLock;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use tether_proto::{sniff_first_line, SniffedProtocol};

/// Byte stream a classified connection rides on, TLS or plain.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased connection stream handed to session drivers.
pub type BoxedStream = Box<dyn AsyncStream>;

/// An unclassified connection is dropped if its first line does not
/// arrive within this window.
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(120);
/// An unclassified connection may buffer at most this many bytes
/// before producing a newline.
const CLASSIFY_LIMIT: usize = 4096;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Built but not yet accepting.
    Created,
    /// Accept loop running.
    Listening,
    /// Closed, by request or by descriptor exhaustion. Never reopens
    /// on its own.
    Closed,
}

/// Factory for bound listeners.
pub struct Listener;

impl Listener {
    /// Resolve and bind a configured listener, then start its accept
    /// loop.
    pub async fn bind(
        config: &ListenConfig,
        bouncer: Arc<Bouncer>,
    ) -> Result<ListenerHandle, ListenError> {
        let mut addrs = tokio::net::lookup_host(&config.address)
            .await
            .map_err(|err| ListenError::ResolutionFailed(format!("{}: {err}", config.address)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| ListenError::ResolutionFailed(config.address.clone()))?;
        if addr.port() == 0 {
            return Err(ListenError::InvalidPort(0));
        }
        let tls = match &config.tls {
            Some(tls) => Some(load_tls(tls)?),
            None => None,
        };
        let socket = TcpListener::bind(addr).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                ListenError::AddressInUse(addr)
            } else {
                ListenError::Io(err)
            }
        })?;
        Self::from_socket(socket, config.accept, tls, bouncer)
    }

    /// Start the accept loop on an already-bound socket.
    pub fn from_socket(
        socket: TcpListener,
        accept: AcceptProtocol,
        tls: Option<TlsAcceptor>,
        bouncer: Arc<Bouncer>,
    ) -> Result<ListenerHandle, ListenError> {
        let addr = socket.local_addr()?;
        let handle = ListenerHandle {
            addr,
            accept: Arc::new(RwLock::new(accept)),
            state: Arc::new(RwLock::new(ListenerState::Created)),
            shutdown: Arc::new(Notify::new()),
        };
        let accept = Arc::clone(&handle.accept);
        let state = Arc::clone(&handle.state);
        let shutdown = Arc::clone(&handle.shutdown);
        *state.write() = ListenerState::Listening;
        info!(%addr, tls = tls.is_some(), "listener open");
        tokio::spawn(accept_loop(socket, accept, state, shutdown, tls, bouncer));
        Ok(handle)
    }
}

/// Control handle for one bound listener.
#[derive(Clone)]
pub struct ListenerHandle {
    addr: SocketAddr,
    accept: Arc<RwLock<AcceptProtocol>>,
    state: Arc<RwLock<ListenerState>>,
    shutdown: Arc<Notify>,
}

impl ListenerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    /// Current accept policy.
    pub fn accept_protocol(&self) -> AcceptProtocol {
        *self.accept.read()
    }

    /// Change the accept policy; applies to connections classified
    /// after the change.
    pub fn set_accept_protocol(&self, accept: AcceptProtocol) {
        *self.accept.write() = accept;
    }

    /// Stop accepting and close the socket. Established connections
    /// are unaffected.
    pub fn close(&self) {
        *self.state.write() = ListenerState::Closed;
        self.shutdown.notify_waiters();
    }
}

async fn accept_loop(
    socket: TcpListener,
    accept: Arc<RwLock<AcceptProtocol>>,
    state: Arc<RwLock<ListenerState>>,
    shutdown: Arc<Notify>,
    tls: Option<TlsAcceptor>,
    bouncer: Arc<Bouncer>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    let accept = Arc::clone(&accept);
                    let tls = tls.clone();
                    let bouncer = Arc::clone(&bouncer);
                    tokio::spawn(async move {
                        let policy = *accept.read();
                        if let Err(err) = classify(stream, peer, policy, tls, bouncer).await {
                            debug!(%peer, %err, "connection dropped during classification");
                        }
                    });
                }
                Err(err) if is_fd_exhaustion(&err) => {
                    // Accepting again would spin; the listener socket
                    // is given back to the OS and stays closed until
                    // an operator reopens it.
                    error!(addr = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                        "out of file descriptors, closing listener");
                    bouncer.broadcast_notice(
                        "The limit of file descriptors has been reached. A listener was closed and must be re-opened manually.",
                    );
                    break;
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            }
        }
    }
    *state.write() = ListenerState::Closed;
}

fn is_fd_exhaustion(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// Read and route one connection's first line.
#[tracing::instrument(skip_all, fields(%peer))]
async fn classify(
    stream: TcpStream,
    peer: SocketAddr,
    policy: AcceptProtocol,
    tls: Option<TlsAcceptor>,
    bouncer: Arc<Bouncer>,
) -> std::io::Result<()> {
    let server = bouncer.server_name().to_string();
    let host = peer.ip().to_string();
    if !bouncer.access().host_allowed(&host) {
        debug!(%peer, "host denied by policy");
        let mut stream = stream;
        stream
            .write_all(format!(":{server} 465 * :You are banned from this server\r\n").as_bytes())
            .await?;
        return Ok(());
    }

    // Held only while the connection is unclassified.
    let slot = match bouncer.access().try_acquire_anonymous(peer.ip()) {
        Some(slot) => slot,
        None => {
            debug!(%peer, "anonymous connection ceiling reached");
            let mut stream = stream;
            stream
                .write_all(
                    format!(
                        ":{server} 464 unknown-nick :Too many anonymous connections from your IP\r\n"
                    )
                    .as_bytes(),
                )
                .await?;
            return Ok(());
        }
    };

    // The handshake counts against the unclassified window too; a peer
    // stalling mid-handshake must not pin its throttle slot.
    let mut stream: BoxedStream = match tls {
        Some(acceptor) => match timeout(CLASSIFY_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => Box::new(stream),
            Ok(Err(err)) => {
                debug!(%peer, %err, "tls handshake failed");
                return Ok(());
            }
            Err(_) => {
                debug!(%peer, "tls handshake timed out");
                return Ok(());
            }
        },
        None => Box::new(stream),
    };

    let (first_line, residual) = match read_first_line(&mut stream).await? {
        Some(parts) => parts,
        None => return Ok(()),
    };
    let sniffed = sniff_first_line(&first_line);
    debug!(%peer, ?sniffed, "classified connection");

    match sniffed {
        SniffedProtocol::Http if !policy.accepts_http() => {
            stream
                .write_all(
                    b"HTTP/1.0 403 Access Denied\r\n\r\nThis listener does not serve HTTP.\r\n",
                )
                .await?;
        }
        SniffedProtocol::Irc if !policy.accepts_irc() => {
            stream
                .write_all(b"ERROR :Closing link: this listener does not accept IRC\r\n")
                .await?;
        }
        SniffedProtocol::Http => {
            drop(slot);
            HttpSession::run(bouncer, stream, peer, first_line, residual).await?;
        }
        SniffedProtocol::Irc => {
            drop(slot);
            if let Err(err) = IrcSession::run(bouncer, stream, peer, first_line, residual).await {
                debug!(%peer, %err, "irc session ended with error");
            }
        }
    }
    Ok(())
}

/// Read until the first newline. Returns `None` when the peer went
/// away, sent too much without a newline, or took too long; all three
/// close silently.
async fn read_first_line(
    stream: &mut BoxedStream,
) -> std::io::Result<Option<(String, BytesMut)>> {
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(1024);
    let newline = loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            break pos;
        }
        if buf.len() >= CLASSIFY_LIMIT {
            debug!("unclassified connection exceeded read ceiling");
            return Ok(None);
        }
        let read = match timeout(CLASSIFY_TIMEOUT, stream.read_buf(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("unclassified connection timed out");
                return Ok(None);
            }
        };
        if read == 0 {
            return Ok(None);
        }
    };
    let line_bytes = buf.split_to(newline + 1);
    let first_line = String::from_utf8_lossy(&line_bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    Ok(Some((first_line, buf)))
}

fn load_tls(config: &TlsConfig) -> Result<TlsAcceptor, ListenError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&config.cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ListenError::Tls(format!(
            "no certificates found in {}",
            config.cert_path
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&config.key_path)?))?
        .ok_or_else(|| ListenError::Tls(format!("no private key found in {}", config.key_path)))?;
    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ListenError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(server)))
}
