//! Interface aggregate
//!
//! An [`Interface`] is the shared view of one WireGuard device: its latest
//! snapshot, settings and the metadata peer discovery learned about peers.
//! A [`ManagedInterface`] adds the features running on it and dispatches
//! watcher events to them in a fixed order.
//!
//! ### Feature order
//! `autocfg`, `cfgsync`, `rtsync`, `epdisc`, `pdisc`, `hsync`, `hooks`. Features are
//! started in this order and closed in reverse.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

use crate::config::InterfaceSettings;
use crate::crypto::Key;
use crate::epdisc::{EndpointDiscovery, PeerState, PeerStatus};
use crate::link::LinkEvent;
use crate::metrics::Metrics;
use crate::watcher::{Event, InterfaceModifier, PeerModifier};
use crate::wg::{Client, Device, DeviceConfig, Peer, PeerConfig, Reachability};

const STATE_CHANGES_CAPACITY: usize = 64;

/// What peer discovery learned about a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerMeta {
    pub name: String,
    pub hosts: BTreeMap<String, Vec<IpAddr>>,
}

/// Connection state change of a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub interface: String,
    pub peer: Key,
    pub old: PeerState,
    pub new: PeerState,
    pub at: DateTime<Utc>,
}

pub struct Interface {
    pub name: String,
    pub index: u32,
    pub settings: InterfaceSettings,
    pub client: Arc<Client>,
    pub metrics: Arc<Metrics>,
    device: RwLock<Device>,
    meta: RwLock<HashMap<Key, PeerMeta>>,
    /// Renamed peers with their previous name, not yet dispatched.
    renames: Mutex<Vec<(Key, Option<String>)>>,
    hosts_changed: Notify,
    sync: Arc<Notify>,
    state_changes: broadcast::Sender<StateChange>,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intf={}", self.name)
    }
}

impl Interface {
    /// `sync` is notified whenever a change should be picked up by the watcher.
    pub fn new(
        device: Device,
        index: u32,
        settings: InterfaceSettings,
        client: Arc<Client>,
        metrics: Arc<Metrics>,
        sync: Arc<Notify>,
    ) -> Arc<Self> {
        let (state_changes, _) = broadcast::channel(STATE_CHANGES_CAPACITY);
        Arc::new(Self {
            name: device.name.clone(),
            index,
            settings,
            client,
            metrics,
            device: RwLock::new(device),
            meta: RwLock::new(HashMap::new()),
            renames: Mutex::new(Vec::new()),
            hosts_changed: Notify::new(),
            sync,
            state_changes,
        })
    }

    pub fn device(&self) -> Device {
        self.device.read().clone()
    }

    pub fn update_device(&self, device: Device) {
        *self.device.write() = device;
    }

    pub fn private_key(&self) -> Key {
        self.device.read().private_key
    }

    pub fn public_key(&self) -> Key {
        self.device.read().public_key
    }

    pub fn listen_port(&self) -> u16 {
        self.device.read().listen_port
    }

    pub fn is_userspace(&self) -> bool {
        self.device.read().userspace
    }

    pub fn peer(&self, pk: &Key) -> Option<Peer> {
        self.device.read().peer(pk).cloned()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.device.read().peers.clone()
    }

    /// Key-derived addresses of this node.
    pub fn own_addresses(&self) -> Vec<IpNet> {
        self.public_key().host_addresses(&self.settings.prefixes)
    }

    /// Change the device and ask the watcher to pick up the result.
    pub async fn configure(&self, cfg: &DeviceConfig) -> Result<()> {
        self.client.configure_device(&self.name, cfg).await?;
        self.request_sync();
        Ok(())
    }

    pub async fn add_peer(&self, pc: PeerConfig) -> Result<()> {
        self.configure(&DeviceConfig::peer(pc)).await
    }

    pub async fn remove_peer(&self, pk: &Key) -> Result<()> {
        self.configure(&DeviceConfig::peer(PeerConfig::remove(*pk))).await
    }

    pub fn request_sync(&self) {
        self.sync.notify_one();
    }

    pub fn peer_meta(&self, pk: &Key) -> Option<PeerMeta> {
        self.meta.read().get(pk).cloned()
    }

    pub fn peer_metas(&self) -> HashMap<Key, PeerMeta> {
        self.meta.read().clone()
    }

    /// Store `meta` for `pk`. Returns whether anything changed.
    ///
    /// A new name is reported as a `NAME` modification of the peer on the
    /// next sync.
    pub fn set_peer_meta(&self, pk: Key, meta: PeerMeta) -> bool {
        let mut all = self.meta.write();
        let old_name = match all.get(&pk) {
            Some(old) if *old == meta => return false,
            Some(old) => Some(old.name.clone()),
            None => None,
        };
        let renamed = old_name.as_deref() != Some(meta.name.as_str());
        all.insert(pk, meta);
        drop(all);

        if renamed {
            let mut renames = self.renames.lock();
            // Keep the name from before the first pending rename
            if !renames.iter().any(|(k, _)| *k == pk) {
                renames.push((pk, old_name));
            }
            drop(renames);
            self.request_sync();
        }
        true
    }

    /// Peers renamed since the last call, with their previous names.
    pub fn take_renames(&self) -> Vec<(Key, Option<String>)> {
        std::mem::take(&mut *self.renames.lock())
    }

    /// `peer` with its name filled in from the discovered metadata.
    pub fn named(&self, peer: &Peer) -> Peer {
        let mut p = peer.clone();
        if p.name.is_none() {
            p.name = self.meta.read().get(&peer.public_key).map(|m| m.name.clone());
        }
        p
    }

    pub fn remove_peer_meta(&self, pk: &Key) -> bool {
        self.meta.write().remove(pk).is_some()
    }

    pub fn notify_hosts_changed(&self) {
        self.hosts_changed.notify_one();
    }

    pub async fn hosts_changed(&self) {
        self.hosts_changed.notified().await
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_changes.subscribe()
    }

    pub fn publish_state_change(&self, peer: Key, old: PeerState, new: PeerState) {
        let change = StateChange {
            interface: self.name.clone(),
            peer,
            old,
            new,
            at: Utc::now(),
        };
        // No receivers is fine.
        let _ = self.state_changes.send(change);
    }
}

/// A unit of functionality attached to an interface.
///
/// Event handlers run on the supervisor task and must return quickly.
#[async_trait]
pub trait Feature: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_interface_modified(&self, _old: &Device, _new: &Device, _modified: InterfaceModifier) {}

    async fn on_peer_added(&self, _peer: &Peer) {}

    async fn on_peer_removed(&self, _peer: &Peer) {}

    async fn on_peer_modified(&self, _old: &Peer, _new: &Peer, _modified: PeerModifier) {}

    async fn on_link_event(&self, _event: &LinkEvent) {}

    /// Reconcile with the system state.
    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Status of one peer as served on `/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub public_key: Key,
    pub name: Option<String>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub reachability: Reachability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice: Option<PeerStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSummary {
    pub name: String,
    pub index: u32,
    pub public_key: Key,
    pub listen_port: u16,
    pub userspace: bool,
    pub features: Vec<&'static str>,
    pub peers: Vec<PeerSummary>,
}

pub struct ManagedInterface {
    pub intf: Arc<Interface>,
    features: Vec<Arc<dyn Feature>>,
    epdisc: Option<Arc<EndpointDiscovery>>,
}

impl ManagedInterface {
    pub fn new(intf: Arc<Interface>, features: Vec<Arc<dyn Feature>>, epdisc: Option<Arc<EndpointDiscovery>>) -> Self {
        Self { intf, features, epdisc }
    }

    pub fn name(&self) -> &str {
        &self.intf.name
    }

    pub fn feature_names(&self) -> Vec<&'static str> {
        self.features.iter().map(|f| f.name()).collect()
    }

    /// Start all features in order. If one fails, the ones already started
    /// are closed again.
    pub async fn start(&self) -> Result<()> {
        for (i, f) in self.features.iter().enumerate() {
            if let Err(e) = f.start().await {
                error!("{} Failed to start {}: {:#}", self.intf, f.name(), e);
                for started in self.features[..i].iter().rev() {
                    if let Err(e) = started.close().await {
                        warn!("{} Failed to close {}: {:#}", self.intf, started.name(), e);
                    }
                }
                return Err(e.context(format!("failed to start {} on {}", f.name(), self.intf.name)));
            }
            debug!("{} Started {}", self.intf, f.name());
        }
        info!("{} Started features: {}", self.intf, self.feature_names().join(", "));
        Ok(())
    }

    /// Dispatch a watcher event for this interface.
    pub async fn handle(&self, event: &Event) {
        match event {
            Event::InterfaceAdded(dev) => self.intf.update_device(dev.clone()),
            Event::InterfaceRemoved(_) => {}
            Event::InterfaceModified { old, new, modified } => {
                self.intf.update_device(new.clone());
                for f in &self.features {
                    f.on_interface_modified(old, new, *modified).await;
                }
            }
            Event::PeerAdded { peer, .. } => {
                self.intf.metrics.inc_peers();
                let peer = self.intf.named(peer);
                for f in &self.features {
                    f.on_peer_added(&peer).await;
                }
            }
            Event::PeerRemoved { peer, .. } => {
                self.intf.metrics.dec_peers();
                let peer = self.intf.named(peer);
                for f in &self.features {
                    f.on_peer_removed(&peer).await;
                }
            }
            Event::PeerModified { old, new, modified, .. } => {
                for f in &self.features {
                    f.on_peer_modified(old, new, *modified).await;
                }
            }
        }
    }

    /// Dispatch a `NAME` modification for every peer renamed since the last call.
    pub async fn dispatch_renames(&self) {
        for (pk, old_name) in self.intf.take_renames() {
            let Some(peer) = self.intf.peer(&pk) else {
                continue;
            };
            let new = self.intf.named(&peer);
            let old = Peer { name: old_name, ..peer };
            if old.name == new.name {
                continue;
            }
            let event = Event::PeerModified {
                interface: self.intf.name.clone(),
                old,
                new,
                modified: PeerModifier::NAME,
            };
            self.handle(&event).await;
        }
    }

    pub async fn on_link_event(&self, event: &LinkEvent) {
        for f in &self.features {
            f.on_link_event(event).await;
        }
    }

    /// Restart the ICE sessions of all peers. Returns how many were restarted.
    pub fn restart(&self) -> usize {
        self.epdisc.as_ref().map_or(0, |e| e.restart_peers())
    }

    pub async fn sync(&self) {
        for f in &self.features {
            if let Err(e) = f.sync().await {
                warn!("{} Failed to sync {}: {:#}", self.intf, f.name(), e);
            }
        }
    }

    /// Close all features in reverse start order.
    pub async fn close(&self) {
        for f in self.features.iter().rev() {
            if let Err(e) = f.close().await {
                warn!("{} Failed to close {}: {:#}", self.intf, f.name(), e);
            }
        }
        for _ in self.intf.peers() {
            self.intf.metrics.dec_peers();
        }
        info!("{} Closed", self.intf);
    }

    pub fn summary(&self) -> InterfaceSummary {
        let dev = self.intf.device();
        let metas = self.intf.peer_metas();
        let now = Utc::now();

        let peers = dev
            .peers
            .iter()
            .map(|p| {
                let ice = self.epdisc.as_ref().and_then(|e| e.peer_status(&p.public_key));
                let reachability = match &ice {
                    Some(s) if s.state == PeerState::Connected => s.reachability,
                    _ => p.reachability(now),
                };
                PeerSummary {
                    public_key: p.public_key,
                    name: metas.get(&p.public_key).map(|m| m.name.clone()),
                    endpoint: p.endpoint,
                    allowed_ips: p.allowed_ips.clone(),
                    last_handshake: p.last_handshake,
                    rx_bytes: p.rx_bytes,
                    tx_bytes: p.tx_bytes,
                    reachability,
                    ice,
                }
            })
            .collect();

        InterfaceSummary {
            name: dev.name.clone(),
            index: self.intf.index,
            public_key: dev.public_key,
            listen_port: dev.listen_port,
            userspace: dev.userspace,
            features: self.feature_names(),
            peers,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::wg::testing::MemoryDevice;

    /// Interface backed by an in-memory device registered with a local client.
    pub fn memory_interface(name: &str, settings: InterfaceSettings) -> (Arc<Interface>, Arc<MemoryDevice>) {
        let client = Arc::new(Client::local_only());
        let dev = MemoryDevice::new(name, 51820);
        client.register(dev.clone());
        let intf = Interface::new(dev.snapshot_device(), 7, settings, client, Metrics::new(), Arc::new(Notify::new()));
        (intf, dev)
    }
}
