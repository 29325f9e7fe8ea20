//! Route synchronization
//!
//! Keeps the kernel routing table and the peers' AllowedIPs aligned:
//! - AllowedIPs of a peer are installed as routes via its key-derived
//!   address, tagged with [`RTPROT_ICEWIRE`]
//! - routes added by others whose gateway is a peer's key-derived address
//!   become AllowedIPs of that peer
//!
//! Our own routes are recognized by their protocol id and skipped on the
//! reverse path.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use crate::crypto::Key;
use crate::error::is_not_supported;
use crate::interface::{Feature, Interface};
use crate::link::{self, LinkEvent, Route, RTPROT_ICEWIRE};
use crate::watcher::PeerModifier;
use crate::wg::{Peer, PeerConfig};

/// What a kernel route means for the AllowedIPs of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    AddAllowedIp(Key, IpNet),
    RemoveAllowedIp(Key, IpNet),
}

pub struct RouteSync {
    intf: Arc<Interface>,
    table: u32,
    /// Key-derived peer address -> peer
    gateways: Mutex<HashMap<IpAddr, Key>>,
}

impl RouteSync {
    pub fn new(intf: Arc<Interface>) -> Result<Arc<Self>> {
        let table = link::table_lookup(&intf.settings.routing_table)?;
        Ok(Arc::new(Self {
            intf,
            table,
            gateways: Mutex::new(HashMap::new()),
        }))
    }

    fn gateways_of(&self, pk: &Key) -> Vec<IpAddr> {
        pk.host_addresses(&self.intf.settings.prefixes)
            .iter()
            .map(|n| n.addr())
            .collect()
    }

    fn track(&self, pk: Key) {
        let mut gws = self.gateways.lock();
        for gw in self.gateways_of(&pk) {
            gws.insert(gw, pk);
        }
    }

    fn untrack(&self, pk: &Key) {
        self.gateways.lock().retain(|_, k| k != pk);
    }

    /// Gateway for `dst`: the peer's key-derived address of the same family,
    /// unless `dst` is that address itself.
    fn gateway_for(&self, pk: &Key, dst: &IpNet) -> Option<IpAddr> {
        let gw = self
            .gateways_of(pk)
            .into_iter()
            .find(|g| g.is_ipv4() == dst.addr().is_ipv4())?;
        let host = dst.prefix_len() == dst.max_prefix_len();
        (!(host && dst.addr() == gw)).then_some(gw)
    }

    async fn add_routes(&self, pk: &Key, dsts: &[IpNet]) {
        for dst in dsts {
            let gw = self.gateway_for(pk, dst);
            match link::add_route(&self.intf.name, dst, gw, self.table).await {
                Ok(()) => {
                    self.intf.metrics.inc_routes_added();
                    info!("{} peer={} Added route {} via {:?}", self.intf, pk, dst, gw);
                }
                Err(e) => error!("{} peer={} Failed to add route {}: {:#}", self.intf, pk, dst, e),
            }
        }
    }

    async fn delete_routes(&self, pk: &Key, dsts: &[IpNet]) {
        for dst in dsts {
            match link::delete_route(&self.intf.name, dst, self.table).await {
                Ok(()) => {
                    self.intf.metrics.inc_routes_removed();
                    info!("{} peer={} Removed route {}", self.intf, pk, dst);
                }
                Err(e) => error!("{} peer={} Failed to delete route {}: {:#}", self.intf, pk, dst, e),
            }
        }
    }

    /// Decide how a route change affects the AllowedIPs of our peers.
    pub fn route_action(&self, route: &Route, added: bool, peers: &[Peer]) -> Option<RouteAction> {
        if route.table != self.table {
            trace!("{} Ignoring route from table {}", self.intf, route.table);
            return None;
        }
        if route.protocol == Some(RTPROT_ICEWIRE) {
            trace!("{} Ignoring own route to {}", self.intf, route.dst);
            return None;
        }
        if route.dev.as_deref().is_some_and(|d| d != self.intf.name) {
            return None;
        }
        let gw = route.gateway?;
        let pk = *self.gateways.lock().get(&gw)?;
        let peer = peers.iter().find(|p| p.public_key == pk)?;

        if added {
            if peer.allowed_ips.iter().any(|a| a.contains(&route.dst)) {
                trace!("{} peer={} Route {} already covered", self.intf, pk, route.dst);
                return None;
            }
            Some(RouteAction::AddAllowedIp(pk, route.dst))
        } else {
            peer.allowed_ips
                .contains(&route.dst)
                .then_some(RouteAction::RemoveAllowedIp(pk, route.dst))
        }
    }

    async fn handle_route(&self, route: &Route, added: bool) -> Result<()> {
        if route.table != self.table || route.gateway.is_none() {
            return Ok(());
        }
        let dev = self.intf.client.device(&self.intf.name).await?;
        let Some(action) = self.route_action(route, added, &dev.peers) else {
            return Ok(());
        };

        let (pk, allowed_ips) = match &action {
            RouteAction::AddAllowedIp(pk, dst) => {
                let mut ips = dev.peer(pk).map(|p| p.allowed_ips.clone()).unwrap_or_default();
                ips.push(*dst);
                info!("{} peer={} Adding AllowedIP {} from kernel route", self.intf, pk, dst);
                (*pk, ips)
            }
            RouteAction::RemoveAllowedIp(pk, dst) => {
                let mut ips = dev.peer(pk).map(|p| p.allowed_ips.clone()).unwrap_or_default();
                ips.retain(|a| a != dst);
                info!("{} peer={} Removing AllowedIP {} of vanished route", self.intf, pk, dst);
                (*pk, ips)
            }
        };

        let pc = PeerConfig {
            update_only: true,
            allowed_ips: Some(allowed_ips),
            ..PeerConfig::new(pk)
        };
        self.intf.add_peer(pc).await
    }

    /// Remove all routes of the interface pointing at `pk`.
    async fn remove_peer_routes(&self, pk: &Key) -> Result<()> {
        let gws = self.gateways_of(pk);
        let routes = link::routes(self.table).await?;
        for r in routes {
            if r.dev.as_deref() != Some(self.intf.name.as_str()) {
                continue;
            }
            let ours = match r.gateway {
                Some(gw) => gws.contains(&gw),
                None => r.dst.prefix_len() == r.dst.max_prefix_len() && gws.contains(&r.dst.addr()),
            };
            if ours {
                self.delete_routes(pk, &[r.dst]).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Feature for RouteSync {
    fn name(&self) -> &'static str {
        "rtsync"
    }

    async fn start(&self) -> Result<()> {
        info!("{} Started route synchronization (table {})", self.intf, self.table);
        for p in self.intf.peers() {
            self.track(p.public_key);
        }
        Ok(())
    }

    async fn on_peer_added(&self, peer: &Peer) {
        self.track(peer.public_key);
        self.add_routes(&peer.public_key, &peer.allowed_ips).await;
        if let Err(e) = self.sync().await {
            error!("{} Failed to synchronize routes: {:#}", self.intf, e);
        }
    }

    async fn on_peer_removed(&self, peer: &Peer) {
        self.untrack(&peer.public_key);
        if let Err(e) = self.remove_peer_routes(&peer.public_key).await {
            if is_not_supported(&e) {
                return;
            }
            error!("{} peer={} Failed to remove routes: {:#}", self.intf, peer.public_key, e);
        }
    }

    async fn on_peer_modified(&self, old: &Peer, new: &Peer, modified: PeerModifier) {
        if !modified.contains(PeerModifier::ALLOWED_IPS) {
            return;
        }
        let before: BTreeSet<IpNet> = old.allowed_ips.iter().copied().collect();
        let after: BTreeSet<IpNet> = new.allowed_ips.iter().copied().collect();
        let added: Vec<IpNet> = after.difference(&before).copied().collect();
        let removed: Vec<IpNet> = before.difference(&after).copied().collect();

        self.add_routes(&new.public_key, &added).await;
        self.delete_routes(&new.public_key, &removed).await;
    }

    async fn on_link_event(&self, event: &LinkEvent) {
        if !self.intf.settings.watch_routes {
            return;
        }
        let res = match event {
            LinkEvent::RouteAdded(r) => self.handle_route(r, true).await,
            LinkEvent::RouteDeleted(r) => self.handle_route(r, false).await,
            LinkEvent::LinkChanged { .. } => Ok(()),
        };
        if let Err(e) = res {
            error!("{} Failed to handle route update: {:#}", self.intf, e);
        }
    }

    /// Reflect the current kernel routes into AllowedIPs.
    async fn sync(&self) -> Result<()> {
        let routes = match link::routes(self.table).await {
            Ok(r) => r,
            Err(e) if is_not_supported(&e) => {
                debug!("{} Route synchronization not supported", self.intf);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for r in routes.iter().filter(|r| r.dev.as_deref() == Some(self.intf.name.as_str())) {
            if let Err(e) = self.handle_route(r, true).await {
                warn!("{} Failed to handle route to {}: {:#}", self.intf, r.dst, e);
            }
        }
        Ok(())
    }
}
