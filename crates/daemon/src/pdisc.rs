//! Peer discovery
//!
//! Nodes sharing a community key announce themselves on the community
//! channel: sealed from the node's private key to the community public key,
//! and received by everyone holding the community private key.
//!
//! ### Description handling
//! - `ADD` for a known peer is applied as `UPDATE`, `UPDATE` for an unknown
//!   one as `ADD`, and `REMOVE` for an unknown one is ignored
//! - `UPDATE` with `publicKeyNew` replaces the peer (key rotation)
//! - after learning a new peer we announce ourselves again, in case the
//!   newcomer was not subscribed yet when we first did

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::{Key, KeyPair};
use crate::interface::{Feature, Interface, PeerMeta};
use crate::signaling::{Change, Delivery, HostAddresses, Message, MultiBackend, PeerDescription, SubscriptionId};
use crate::watcher::InterfaceModifier;
use crate::wg::{Device, Peer, PeerConfig};

const READVERTISE_DELAY: Duration = Duration::from_secs(1);
const DELIVERY_QUEUE: usize = 32;

pub fn build_info() -> String {
    format!("icewire/{}", env!("CARGO_PKG_VERSION"))
}

struct Inner {
    intf: Arc<Interface>,
    backend: Arc<MultiBackend>,
    /// Community private key
    community: Key,
    filter: HashMap<Key, bool>,
    /// Last description seen per peer
    descs: Mutex<HashMap<Key, PeerDescription>>,
}

pub struct PeerDiscovery {
    inner: Arc<Inner>,
    subscription: Mutex<Option<SubscriptionId>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerDiscovery {
    /// Returns `None` if no community is configured.
    pub fn new(intf: Arc<Interface>, backend: Arc<MultiBackend>) -> Option<Arc<Self>> {
        let community = intf.settings.pdisc.community.map(|c| c.0).filter(Key::is_set)?;

        let mut filter = HashMap::new();
        for k in &intf.settings.pdisc.whitelist {
            filter.insert(*k, true);
        }
        for k in &intf.settings.pdisc.blacklist {
            filter.insert(*k, false);
        }

        Some(Arc::new(Self {
            inner: Arc::new(Inner {
                intf,
                backend,
                community,
                filter,
                descs: Mutex::new(HashMap::new()),
            }),
            subscription: Mutex::new(None),
            task: Mutex::new(None),
        }))
    }

    pub fn description(&self, change: Change, old_key: Option<Key>) -> PeerDescription {
        self.inner.description(change, old_key)
    }

    /// Apply a description received from `sender`.
    pub async fn on_description(&self, sender: Key, desc: PeerDescription) -> Result<()> {
        Inner::on_description(&self.inner, sender, desc).await
    }
}

impl Inner {
    /// Whitelisted peers are accepted; with a non-empty whitelist nobody else is.
    fn is_accepted(&self, pk: &Key) -> bool {
        match self.filter.get(pk) {
            Some(verdict) => *verdict,
            None => !self.filter.values().any(|v| *v),
        }
    }

    fn description(&self, change: Change, old_key: Option<Key>) -> PeerDescription {
        let settings = &self.intf.settings;
        let pk = self.intf.public_key();
        let own = self.intf.own_addresses();

        let mut allowed_ips: Vec<_> = settings
            .addresses
            .iter()
            .map(|a| ipnet::IpNet::from(a.addr()))
            .collect();
        allowed_ips.extend(own.iter().copied());
        allowed_ips.extend(settings.networks.iter().map(|n| n.trunc()));
        allowed_ips.sort();
        allowed_ips.dedup();

        let name = settings.advertised_name();
        let mut hosts: BTreeMap<String, HostAddresses> = settings
            .extra_hosts
            .iter()
            .map(|(n, a)| (n.clone(), HostAddresses { addresses: a.clone() }))
            .collect();
        let mut addresses: Vec<_> = own.iter().map(|a| a.addr()).collect();
        addresses.extend(settings.addresses.iter().map(|a| a.addr()));
        hosts.insert(name.clone(), HostAddresses { addresses });

        let (public_key, public_key_new) = match old_key {
            Some(old) => (old, Some(pk)),
            None => (pk, None),
        };

        PeerDescription {
            change,
            name,
            public_key,
            public_key_new,
            allowed_ips,
            build_info: build_info(),
            hosts,
        }
    }

    async fn send_description(&self, change: Change, old_key: Option<Key>) -> Result<()> {
        let sk = self.intf.private_key();
        if !sk.is_set() {
            debug!("{} No private key yet, not announcing", self.intf);
            return Ok(());
        }
        let desc = self.description(change, old_key);
        let kp = KeyPair::new(sk, self.community.public_key());
        self.backend
            .publish(&kp, &Message::peer(desc))
            .await
            .context("failed to publish peer description")?;
        self.intf.metrics.inc_published();
        debug!("{} Sent peer description ({:?})", self.intf, change);
        Ok(())
    }

    async fn on_delivery(this: &Arc<Self>, d: Delivery) {
        let Some(desc) = d.message.peer else {
            return;
        };
        this.intf.metrics.inc_received();
        if let Err(e) = Self::on_description(this, d.sender, desc).await {
            error!("{} Failed to handle peer description from {}: {:#}", this.intf, d.sender, e);
        }
    }

    async fn on_description(this: &Arc<Self>, sender: Key, mut desc: PeerDescription) -> Result<()> {
        let intf = &this.intf;
        if sender == intf.public_key() {
            return Ok(());
        }

        // Rotated keys are announced from the new key.
        let claimed = desc.public_key_new.unwrap_or(desc.public_key);
        if claimed != sender {
            warn!(
                "{} Dropping description of {} received from {}",
                intf, desc.public_key, sender
            );
            return Ok(());
        }

        let pk = desc.public_key;
        if !this.is_accepted(&pk) {
            warn!("{} Ignoring filtered peer={}", intf, pk);
            return Ok(());
        }

        let known = intf.peer(&pk).is_some() || this.descs.lock().contains_key(&pk);
        match desc.change {
            Change::Add if known => {
                debug!("{} peer={} already exists, updating it instead", intf, pk);
                desc.change = Change::Update;
            }
            Change::Update if !known => {
                debug!("{} peer={} does not exist yet, adding it instead", intf, pk);
                desc.change = Change::Add;
            }
            Change::Remove if !known => {
                debug!("{} Ignoring removal of unknown peer={}", intf, pk);
                return Ok(());
            }
            _ => {}
        }

        match (desc.change, desc.public_key_new) {
            (Change::Add, new_key) => {
                let key = new_key.unwrap_or(pk);
                intf.add_peer(peer_config(key, &desc)).await?;
                this.apply_meta(key, &desc);
                this.descs.lock().insert(key, desc);
                intf.metrics.inc_discovered();
                info!("{} Discovered peer={}", intf, key);
            }
            (Change::Update, Some(new_key)) => {
                intf.remove_peer(&pk).await?;
                this.forget(&pk);
                intf.add_peer(peer_config(new_key, &desc)).await?;
                this.apply_meta(new_key, &desc);
                this.descs.lock().insert(new_key, desc);
                info!("{} peer={} rotated its key to {}", intf, pk, new_key);
            }
            (Change::Update, None) => {
                let unchanged = match this.descs.lock().get(&pk) {
                    Some(prev) => same_networks(&prev.allowed_ips, &desc.allowed_ips),
                    None => intf
                        .peer(&pk)
                        .is_some_and(|p| same_networks(&p.allowed_ips, &desc.allowed_ips)),
                };
                if !unchanged {
                    let mut pc = peer_config(pk, &desc);
                    pc.update_only = true;
                    intf.add_peer(pc).await?;
                }
                this.apply_meta(pk, &desc);
                this.descs.lock().insert(pk, desc);
            }
            (Change::Remove, _) => {
                intf.remove_peer(&pk).await?;
                this.forget(&pk);
                info!("{} peer={} left", intf, pk);
            }
        }

        if !known {
            let this = Arc::clone(this);
            tokio::spawn(async move {
                tokio::time::sleep(READVERTISE_DELAY).await;
                if let Err(e) = this.send_description(Change::Add, None).await {
                    error!("{} Failed to send peer description: {:#}", this.intf, e);
                }
            });
        }
        Ok(())
    }

    fn apply_meta(&self, pk: Key, desc: &PeerDescription) {
        let meta = PeerMeta {
            name: desc.name.clone(),
            hosts: desc
                .hosts
                .iter()
                .map(|(n, h)| (n.clone(), h.addresses.clone()))
                .collect(),
        };
        if self.intf.set_peer_meta(pk, meta) {
            self.intf.notify_hosts_changed();
        }
    }

    fn forget(&self, pk: &Key) {
        self.descs.lock().remove(pk);
        if self.intf.remove_peer_meta(pk) {
            self.intf.notify_hosts_changed();
        }
    }
}

fn peer_config(pk: Key, desc: &PeerDescription) -> PeerConfig {
    PeerConfig {
        allowed_ips: Some(desc.allowed_ips.clone()),
        ..PeerConfig::new(pk)
    }
}

fn same_networks(a: &[ipnet::IpNet], b: &[ipnet::IpNet]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

#[async_trait]
impl Feature for PeerDiscovery {
    fn name(&self) -> &'static str {
        "pdisc"
    }

    async fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(DELIVERY_QUEUE);
        let kp = KeyPair::new(self.inner.community, Key::default());
        let id = self.inner.backend.subscribe(kp, tx);
        *self.subscription.lock() = Some(id);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(d) = rx.recv().await {
                Inner::on_delivery(&inner, d).await;
            }
        });
        *self.task.lock() = Some(task);

        info!("{} Started peer discovery", self.inner.intf);
        if let Err(e) = self.inner.send_description(Change::Add, None).await {
            error!("{} Failed to send peer description: {:#}", self.inner.intf, e);
        }
        Ok(())
    }

    async fn on_interface_modified(&self, old: &Device, new: &Device, modified: InterfaceModifier) {
        if !modified.contains(InterfaceModifier::PRIVATE_KEY) || !new.private_key.is_set() {
            return;
        }
        let old_key = old.private_key.is_set().then_some(old.public_key);
        let change = if old_key.is_some() { Change::Update } else { Change::Add };
        if let Err(e) = self.inner.send_description(change, old_key).await {
            error!("{} Failed to send peer description: {:#}", self.inner.intf, e);
        }
    }

    async fn on_peer_removed(&self, peer: &Peer) {
        self.inner.forget(&peer.public_key);
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.inner.send_description(Change::Remove, None).await {
            warn!("{} Failed to withdraw peer description: {:#}", self.inner.intf, e);
        }
        if let Some(id) = self.subscription.lock().take() {
            self.inner.backend.unsubscribe(id);
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
