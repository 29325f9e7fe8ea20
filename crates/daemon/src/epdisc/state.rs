//! Per-peer connection state.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Connection state of a peer.
///
/// Extends the ICE connection states with the phases of the signaling
/// exchange that precede connectivity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PeerState {
    /// No agent
    Closed = 0,
    /// Agent being constructed
    Creating = 1,
    /// Advertising credentials, awaiting the remote ones
    Idle = 2,
    /// Remote credentials received, gathering
    New = 3,
    /// Connectivity checks running
    Connecting = 4,
    Connected = 5,
    Failed = 6,
    Disconnected = 7,
    Closing = 8,
    Restarting = 9,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Closed,
            1 => PeerState::Creating,
            2 => PeerState::Idle,
            3 => PeerState::New,
            4 => PeerState::Connecting,
            5 => PeerState::Connected,
            6 => PeerState::Failed,
            7 => PeerState::Disconnected,
            8 => PeerState::Closing,
            9 => PeerState::Restarting,
            _ => unreachable!("invalid peer state {v}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Closed => "closed",
            PeerState::Creating => "creating",
            PeerState::Idle => "idle",
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Failed => "failed",
            PeerState::Disconnected => "disconnected",
            PeerState::Closing => "closing",
            PeerState::Restarting => "restarting",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell holding a [`PeerState`].
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(s: PeerState) -> Self {
        Self(AtomicU8::new(s as u8))
    }

    pub fn load(&self) -> PeerState {
        PeerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. Fails if the state is not `from`.
    pub fn compare_and_swap(&self, from: PeerState, to: PeerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` unless the current state is one of `unless`.
    ///
    /// Returns the previous state on success.
    pub fn set_if_not(&self, to: PeerState, unless: &[PeerState]) -> Option<PeerState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let cur_state = PeerState::from_u8(cur);
                (!unless.contains(&cur_state)).then_some(to as u8)
            })
            .ok()
            .map(PeerState::from_u8)
    }

    pub fn swap(&self, to: PeerState) -> PeerState {
        PeerState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_compare_and_swap() {
        let s = AtomicState::new(PeerState::Closed);
        assert!(s.compare_and_swap(PeerState::Closed, PeerState::Creating));
        assert!(!s.compare_and_swap(PeerState::Closed, PeerState::Creating));
        assert_eq!(s.load(), PeerState::Creating);
    }

    #[test]
    fn test_set_if_not() {
        let s = AtomicState::new(PeerState::Connected);
        let unless = [PeerState::Closed, PeerState::Closing, PeerState::Restarting];
        assert_eq!(s.set_if_not(PeerState::Restarting, &unless), Some(PeerState::Connected));
        assert_eq!(s.set_if_not(PeerState::Restarting, &unless), None);
        assert_eq!(s.swap(PeerState::Closed), PeerState::Restarting);
    }

    #[test]
    fn test_concurrent_transitions_converge() {
        let s = Arc::new(AtomicState::new(PeerState::New));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || s.compare_and_swap(PeerState::New, PeerState::Connecting))
            })
            .collect();
        let won = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|w| *w)
            .count();
        assert_eq!(won, 1);
        assert_eq!(s.load(), PeerState::Connecting);
    }

    #[test]
    fn test_serialize() {
        assert_eq!(serde_json::to_string(&PeerState::Connecting).unwrap(), "\"connecting\"");
        assert_eq!(PeerState::Restarting.to_string(), "restarting");
    }
}
