//! Listener configuration.

use serde::Deserialize;

/// Which protocols a listener accepts after first-line classification.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcceptProtocol {
    /// IRC clients only; HTTP requests are rejected with a 403.
    Irc,
    /// HTTP only; IRC first lines are rejected with an error reply.
    Http,
    /// Both protocols, sniffed from the first line.
    #[default]
    All,
}

impl AcceptProtocol {
    /// Whether IRC connections are accepted under this policy.
    pub fn accepts_irc(self) -> bool {
        matches!(self, Self::Irc | Self::All)
    }

    /// Whether HTTP connections are accepted under this policy.
    pub fn accepts_http(self) -> bool {
        matches!(self, Self::Http | Self::All)
    }
}

/// One listener to bind.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind, resolved at listen time (e.g. "0.0.0.0:6667"
    /// or "localhost:6667").
    pub address: String,
    /// Accept policy for this listener.
    #[serde(default)]
    pub accept: AcceptProtocol,
    /// Optional TLS termination.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// TLS listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM format).
    pub cert_path: String,
    /// Path to private key file (PEM format).
    pub key_path: String,
}
