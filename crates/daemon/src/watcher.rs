//! Watcher
//!
//! Keeps a snapshot of all WireGuard devices and turns every refresh into an
//! ordered list of [`Event`]s. Devices are identified by name and peers by
//! public key. The caller decides when to refresh (ticker, link monitor,
//! explicit sync) and dispatches the events in order.

use anyhow::Result;
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::wg::{Client, Device, Peer};

macro_rules! modifier {
    ($(#[$meta:meta])* $name:ident { $($flag:ident = $bit:expr => $label:literal,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            $(pub const $flag: $name = $name(1 << $bit);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0 && other.0 != 0
            }

            pub fn intersects(&self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn labels(&self) -> Vec<&'static str> {
                let mut out = Vec::new();
                $(if self.contains(Self::$flag) { out.push($label); })*
                out
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.labels().join("|"))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.labels().join(","))
            }
        }
    };
}

modifier! {
    /// Changed device fields.
    InterfaceModifier {
        PRIVATE_KEY = 0 => "private-key",
        LISTEN_PORT = 1 => "listen-port",
        FWMARK = 2 => "fwmark",
        PEERS = 3 => "peers",
    }
}

modifier! {
    /// Changed peer fields.
    PeerModifier {
        PRESHARED_KEY = 0 => "preshared-key",
        ENDPOINT = 1 => "endpoint",
        KEEPALIVE = 2 => "keepalive",
        HANDSHAKE = 3 => "handshake",
        RX_BYTES = 4 => "rx-bytes",
        TX_BYTES = 5 => "tx-bytes",
        ALLOWED_IPS = 6 => "allowed-ips",
        PROTOCOL_VERSION = 7 => "protocol-version",
        NAME = 8 => "name",
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    InterfaceAdded(Device),
    InterfaceRemoved(Device),
    InterfaceModified {
        old: Device,
        new: Device,
        modified: InterfaceModifier,
    },
    PeerAdded {
        interface: String,
        peer: Peer,
    },
    PeerRemoved {
        interface: String,
        peer: Peer,
    },
    PeerModified {
        interface: String,
        old: Peer,
        new: Peer,
        modified: PeerModifier,
    },
}

impl Event {
    pub fn interface(&self) -> &str {
        match self {
            Event::InterfaceAdded(d) | Event::InterfaceRemoved(d) => &d.name,
            Event::InterfaceModified { new, .. } => &new.name,
            Event::PeerAdded { interface, .. }
            | Event::PeerRemoved { interface, .. }
            | Event::PeerModified { interface, .. } => interface,
        }
    }
}

pub struct Watcher {
    client: Arc<Client>,
    filter: glob::Pattern,
    devices: BTreeMap<String, Device>,
    metrics: Arc<Metrics>,
}

impl Watcher {
    pub fn new(client: Arc<Client>, filter: glob::Pattern, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            filter,
            devices: BTreeMap::new(),
            metrics,
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Refresh the snapshot and return what changed since the last call.
    ///
    /// On error the snapshot is left untouched.
    pub async fn sync(&mut self) -> Result<Vec<Event>> {
        let listed = match self.client.devices().await {
            Ok(l) => l,
            Err(e) => {
                self.metrics.inc_watcher_errors();
                return Err(e);
            }
        };
        self.metrics.inc_watcher_syncs();

        let current: BTreeMap<String, Device> = listed
            .into_iter()
            .filter(|d| self.filter.matches(&d.name))
            .map(|d| (d.name.clone(), d))
            .collect();

        let events = diff_devices(&self.devices, &current);
        for e in &events {
            match e {
                Event::InterfaceAdded(d) => info!("🔌 Interface {} added", d.name),
                Event::InterfaceRemoved(d) => info!("Interface {} removed", d.name),
                _ => debug!("intf={} {:?}", e.interface(), EventKind(e)),
            }
        }
        self.devices = current;
        Ok(events)
    }

    /// Forget a device so that the next sync reports it as added again.
    pub fn forget(&mut self, name: &str) {
        self.devices.remove(name);
    }
}

struct EventKind<'a>(&'a Event);

impl fmt::Debug for EventKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Event::InterfaceAdded(_) => f.write_str("interface added"),
            Event::InterfaceRemoved(_) => f.write_str("interface removed"),
            Event::InterfaceModified { modified, .. } => write!(f, "interface modified: {modified}"),
            Event::PeerAdded { peer, .. } => write!(f, "peer={} added", peer.public_key),
            Event::PeerRemoved { peer, .. } => write!(f, "peer={} removed", peer.public_key),
            Event::PeerModified { new, modified, .. } => write!(f, "peer={} modified: {}", new.public_key, modified),
        }
    }
}

/// Events turning `old` into `new`.
///
/// Added interfaces are followed by one `PeerAdded` per peer. Removed
/// interfaces carry their last snapshot and produce no peer events.
pub fn diff_devices(old: &BTreeMap<String, Device>, new: &BTreeMap<String, Device>) -> Vec<Event> {
    let mut events = Vec::new();

    for (name, dev) in old {
        if !new.contains_key(name) {
            events.push(Event::InterfaceRemoved(dev.clone()));
        }
    }

    for (name, dev) in new {
        match old.get(name) {
            None => {
                events.push(Event::InterfaceAdded(dev.clone()));
                for p in &dev.peers {
                    events.push(Event::PeerAdded {
                        interface: name.clone(),
                        peer: p.clone(),
                    });
                }
            }
            Some(prev) => {
                let peer_events = diff_peers(name, prev, dev);
                let mut modified = interface_modifier(prev, dev);
                if !peer_events.is_empty() {
                    modified |= InterfaceModifier::PEERS;
                }
                if !modified.is_empty() {
                    events.push(Event::InterfaceModified {
                        old: prev.clone(),
                        new: dev.clone(),
                        modified,
                    });
                }
                events.extend(peer_events);
            }
        }
    }

    events
}

fn interface_modifier(old: &Device, new: &Device) -> InterfaceModifier {
    let mut m = InterfaceModifier::empty();
    if old.private_key != new.private_key {
        m |= InterfaceModifier::PRIVATE_KEY;
    }
    if old.listen_port != new.listen_port {
        m |= InterfaceModifier::LISTEN_PORT;
    }
    if old.fwmark != new.fwmark {
        m |= InterfaceModifier::FWMARK;
    }
    m
}

fn diff_peers(interface: &str, old: &Device, new: &Device) -> Vec<Event> {
    let mut events = Vec::new();

    for p in &old.peers {
        if new.peer(&p.public_key).is_none() {
            events.push(Event::PeerRemoved {
                interface: interface.to_string(),
                peer: p.clone(),
            });
        }
    }

    for p in &new.peers {
        match old.peer(&p.public_key) {
            None => events.push(Event::PeerAdded {
                interface: interface.to_string(),
                peer: p.clone(),
            }),
            Some(prev) => {
                let modified = peer_modifier(prev, p);
                if !modified.is_empty() {
                    events.push(Event::PeerModified {
                        interface: interface.to_string(),
                        old: prev.clone(),
                        new: p.clone(),
                        modified,
                    });
                }
            }
        }
    }

    events
}

pub fn peer_modifier(old: &Peer, new: &Peer) -> PeerModifier {
    let mut m = PeerModifier::empty();
    if old.preshared_key != new.preshared_key {
        m |= PeerModifier::PRESHARED_KEY;
    }
    if old.endpoint != new.endpoint {
        m |= PeerModifier::ENDPOINT;
    }
    if old.persistent_keepalive != new.persistent_keepalive {
        m |= PeerModifier::KEEPALIVE;
    }
    if old.last_handshake != new.last_handshake {
        m |= PeerModifier::HANDSHAKE;
    }
    if old.rx_bytes != new.rx_bytes {
        m |= PeerModifier::RX_BYTES;
    }
    if old.tx_bytes != new.tx_bytes {
        m |= PeerModifier::TX_BYTES;
    }
    if !same_set(&old.allowed_ips, &new.allowed_ips) {
        m |= PeerModifier::ALLOWED_IPS;
    }
    if old.protocol_version != new.protocol_version {
        m |= PeerModifier::PROTOCOL_VERSION;
    }
    if old.name != new.name {
        m |= PeerModifier::NAME;
    }
    m
}

fn same_set<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::wg::testing::MemoryDevice;
    use crate::wg::{DeviceConfig, PeerConfig};

    fn device(name: &str, peers: Vec<Peer>) -> Device {
        let sk = Key::generate_private();
        Device {
            name: name.into(),
            private_key: sk,
            public_key: sk.public_key(),
            listen_port: 51820,
            fwmark: 0,
            userspace: false,
            peers,
        }
    }

    fn map(devs: Vec<Device>) -> BTreeMap<String, Device> {
        devs.into_iter().map(|d| (d.name.clone(), d)).collect()
    }

    #[test]
    fn test_modifier_flags() {
        let m = PeerModifier::ENDPOINT | PeerModifier::ALLOWED_IPS;
        assert!(m.contains(PeerModifier::ENDPOINT));
        assert!(!m.contains(PeerModifier::HANDSHAKE));
        assert!(!m.contains(PeerModifier::empty()));
        assert_eq!(m.to_string(), "endpoint,allowed-ips");
        assert!(PeerModifier::empty().is_empty());
    }

    #[test]
    fn test_rename_is_a_modification() {
        let pk = Key::generate_private().public_key();
        let old = Peer::new(pk);
        let mut new = old.clone();
        new.name = Some("beta".into());
        assert_eq!(peer_modifier(&old, &new), PeerModifier::NAME);
        assert_eq!(PeerModifier::NAME.to_string(), "name");
    }

    #[test]
    fn test_added_and_removed_interfaces() {
        let p = Peer::new(Key::generate());
        let old = map(vec![device("wg0", vec![])]);
        let new = map(vec![device("wg1", vec![p.clone()])]);

        let events = diff_devices(&old, &new);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Event::InterfaceRemoved(d) if d.name == "wg0"));
        assert!(matches!(&events[1], Event::InterfaceAdded(d) if d.name == "wg1"));
        assert!(matches!(&events[2], Event::PeerAdded { interface, peer } if interface == "wg1" && *peer == p));
    }

    #[test]
    fn test_peer_diff() {
        let kept = Peer::new(Key::generate());
        let gone = Peer::new(Key::generate());
        let added = Peer::new(Key::generate());

        let before = device("wg0", vec![kept.clone(), gone.clone()]);
        let mut after = before.clone();
        let mut changed = kept.clone();
        changed.allowed_ips = vec!["10.0.0.2/32".parse().unwrap()];
        changed.rx_bytes = 100;
        after.peers = vec![changed, added.clone()];

        let events = diff_devices(&map(vec![before]), &map(vec![after]));
        assert!(matches!(&events[0], Event::InterfaceModified { modified, .. } if *modified == InterfaceModifier::PEERS));
        assert!(matches!(&events[1], Event::PeerRemoved { peer, .. } if peer.public_key == gone.public_key));
        assert!(matches!(&events[2], Event::PeerModified { modified, .. }
            if *modified == PeerModifier::ALLOWED_IPS | PeerModifier::RX_BYTES));
        assert!(matches!(&events[3], Event::PeerAdded { peer, .. } if peer.public_key == added.public_key));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_allowed_ips_order_ignored() {
        let mut a = Peer::new(Key::generate());
        a.allowed_ips = vec!["10.0.0.1/32".parse().unwrap(), "10.0.1.0/24".parse().unwrap()];
        let mut b = a.clone();
        b.allowed_ips.reverse();
        assert!(peer_modifier(&a, &b).is_empty());
    }

    #[test]
    fn test_interface_fields() {
        let before = device("wg0", vec![]);
        let mut after = before.clone();
        after.listen_port = 51821;
        let events = diff_devices(&map(vec![before]), &map(vec![after]));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::InterfaceModified { modified, .. } if *modified == InterfaceModifier::LISTEN_PORT));
    }

    #[tokio::test]
    async fn test_sync_with_client() {
        let client = Arc::new(Client::local_only());
        let dev = MemoryDevice::new("wg-test0", 51820);
        client.register(dev.clone());
        client.register(MemoryDevice::new("other0", 51821));

        let filter = glob::Pattern::new("wg-*").unwrap();
        let mut w = Watcher::new(Arc::clone(&client), filter, Metrics::new());

        let events = w.sync().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::InterfaceAdded(d) if d.name == "wg-test0"));
        assert!(w.sync().await.unwrap().is_empty());

        let pk = Key::generate();
        client
            .configure_device("wg-test0", &DeviceConfig::peer(PeerConfig::new(pk)))
            .await
            .unwrap();
        let events = w.sync().await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::PeerAdded { peer, .. } if peer.public_key == pk)));

        w.forget("wg-test0");
        let events = w.sync().await.unwrap();
        assert!(matches!(&events[0], Event::InterfaceAdded(_)));
    }
}
