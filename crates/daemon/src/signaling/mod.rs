//! Signaling multiplex
//!
//! Envelopes carrying ICE credentials, candidates and peer descriptions are
//! published to every configured backend and delivered to local subscriptions
//! keyed by `(ours, theirs)`.
//!
//! | URI | Backend |
//! |-----|---------|
//! | `http(s)://host/path?interval=1s&timeout=5s` | polling REST broker |
//! | `inprocess:` | process-global broker |
//! | `multicast://239.0.0.1:7788` | LAN multicast |

pub mod backend;
pub mod broker;
pub mod envelope;
pub mod http;
pub mod inprocess;
pub mod mcast;

use std::time::Duration;

pub use backend::{Backend, Delivery, MultiBackend, SubscriptionId, SubscriptionsRegistry};
pub use broker::{serve_broker, Broker, OfferLog};
pub use envelope::{Change, Credentials, Envelope, HostAddresses, Message, PeerDescription};

/// Schemes accepted in `signaling.backends`.
pub const KNOWN_SCHEMES: &[&str] = &["http", "https", "inprocess", "multicast", "grpc", "k8s", "p2p"];

/// Parse `500ms`, `5s`, `2m` or a bare number of seconds.
pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: f64 = num.parse().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    let secs = match unit {
        "ms" => n / 1000.0,
        "s" => n,
        "m" => n * 60.0,
        "h" => n * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5d"), None);
    }
}
