//! Interactive Connectivity Establishment
//!
//! A compact ICE implementation tailored to bridging WireGuard:
//! - [`stun`]: Binding message codec with short-term credentials
//! - [`candidate`]: candidate types, priorities and wire forms
//! - [`mux`]: per-interface UDP sockets shared by all agents
//! - [`agent`]: one agent per peer running gathering and connectivity checks
//! - [`conn`]: datagram connection over the selected candidate pair
//!
//! Local relay allocation (TURN client) is not implemented; relay candidates
//! advertised by remote agents are still paired and checked.

pub mod agent;
pub mod candidate;
pub mod conn;
pub mod mux;
pub mod stun;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::Serialize;
use std::fmt;

pub use agent::{Agent, AgentConfig, AgentEvent};
pub use candidate::{Candidate, CandidateType, NetworkType};
pub use conn::IceConn;
pub use mux::{MuxKind, UdpMux};

pub const UFRAG_LEN: usize = 16;
pub const PWD_LEN: usize = 32;

/// Fresh random ICE credentials: 16 letter ufrag, 32 letter password.
pub fn generate_credentials() -> (String, String) {
    (random_letters(UFRAG_LEN), random_letters(PWD_LEN))
}

fn random_letters(len: usize) -> String {
    const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Connection state of an agent (RFC 8445 with pion semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The nominated local/remote candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

/// `stun:` / `turn:` server URL (RFC 7064 / 7065).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunUrl {
    pub scheme: StunScheme,
    pub host: String,
    pub port: u16,
}

impl StunUrl {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .with_context(|| format!("invalid ICE server url {s:?}"))?;
        let scheme = match scheme {
            "stun" => StunScheme::Stun,
            "stuns" => StunScheme::Stuns,
            "turn" => StunScheme::Turn,
            "turns" => StunScheme::Turns,
            other => bail!("unsupported ICE server scheme {other:?}"),
        };
        let default_port = match scheme {
            StunScheme::Stuns | StunScheme::Turns => 5349,
            _ => 3478,
        };

        let rest = rest.split('?').next().unwrap_or(rest);
        let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
            let (host, tail) = v6
                .split_once(']')
                .with_context(|| format!("invalid IPv6 host in {s:?}"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().with_context(|| format!("invalid port in {s:?}"))?,
                None => default_port,
            };
            (host.to_string(), port)
        } else {
            match rest.rsplit_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    p.parse().with_context(|| format!("invalid port in {s:?}"))?,
                ),
                None => (rest.to_string(), default_port),
            }
        };

        if host.is_empty() {
            bail!("missing host in ICE server url {s:?}");
        }
        Ok(Self { scheme, host, port })
    }

    pub fn is_stun(&self) -> bool {
        matches!(self.scheme, StunScheme::Stun)
    }
}

impl fmt::Display for StunUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            StunScheme::Stun => "stun",
            StunScheme::Stuns => "stuns",
            StunScheme::Turn => "turn",
            StunScheme::Turns => "turns",
        };
        if self.host.contains(':') {
            write!(f, "{}:[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}:{}:{}", scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_credentials() {
        let (ufrag, pwd) = generate_credentials();
        assert_eq!(ufrag.len(), UFRAG_LEN);
        assert_eq!(pwd.len(), PWD_LEN);
        assert!(ufrag.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(generate_credentials().0, ufrag);
    }

    #[test]
    fn test_stun_url() {
        let u = StunUrl::parse("stun:stun.l.google.com:19302").unwrap();
        assert_eq!(u.host, "stun.l.google.com");
        assert_eq!(u.port, 19302);
        assert!(u.is_stun());

        let u = StunUrl::parse("turns:relay.example.com?transport=tcp").unwrap();
        assert_eq!(u.port, 5349);
        assert!(!u.is_stun());

        let u = StunUrl::parse("stun:[2001:db8::1]:3479").unwrap();
        assert_eq!(u.host, "2001:db8::1");
        assert_eq!(u.to_string(), "stun:[2001:db8::1]:3479");

        assert!(StunUrl::parse("http://example.com").is_err());
        assert!(StunUrl::parse("stun:").is_err());
    }
}
