//! First-line protocol sniffing.
//!
//! A listener in `All` mode speaks both IRC and HTTP on one port. The
//! only information available at classification time is the first
//! complete line, so the rule is narrow and case-sensitive: an HTTP/1.0
//! or HTTP/1.1 GET or POST request line selects HTTP; anything else,
//! including malformed lines, is IRC.

/// The protocol selected from a connection's first line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedProtocol {
    /// Plain IRC client traffic (the default for unrecognized lines).
    Irc,
    /// An HTTP/1.x GET or POST request line.
    Http,
}

/// Classify a connection's first line (CRLF optional).
pub fn sniff_first_line(line: &str) -> SniffedProtocol {
    let line = line.trim_end_matches(['\r', '\n']);

    let path = if let Some(rest) = line.strip_prefix("GET ") {
        rest
    } else if let Some(rest) = line.strip_prefix("POST ") {
        rest
    } else {
        return SniffedProtocol::Irc;
    };

    let path = match path
        .strip_suffix(" HTTP/1.0")
        .or_else(|| path.strip_suffix(" HTTP/1.1"))
    {
        Some(p) => p,
        None => return SniffedProtocol::Irc,
    };

    if path.is_empty() {
        return SniffedProtocol::Irc;
    }

    SniffedProtocol::Http
}
