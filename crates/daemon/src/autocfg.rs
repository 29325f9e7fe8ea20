//! Auto-configuration
//!
//! Brings a fresh interface into a usable state: private key, listen port,
//! statically configured peers, key-derived addresses, MTU and link state.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::config::{InterfaceSettings, PeerSettings, PortRange};
use crate::crypto::Key;
use crate::error::is_not_supported;
use crate::interface::{Feature, Interface, PeerMeta};
use crate::link::{self, MIN_MTU, WG_OVERHEAD};
use crate::watcher::InterfaceModifier;
use crate::wg::{Device, DeviceConfig, Peer, PeerConfig};

/// MTU of the tunnel on top of a link with `link_mtu`.
pub fn tunnel_mtu(link_mtu: u32) -> Result<u32> {
    match link_mtu.checked_sub(WG_OVERHEAD) {
        Some(mtu) if mtu >= MIN_MTU => Ok(mtu),
        _ => bail!("MTU too small: {}", link_mtu),
    }
}

/// First port in `range` where a UDP socket can be bound.
pub async fn find_free_port(range: PortRange) -> Result<u16> {
    for port in range.min..=range.max {
        if UdpSocket::bind(("0.0.0.0", port)).await.is_ok() {
            return Ok(port);
        }
    }
    bail!("no free UDP port in {}-{}", range.min, range.max)
}

/// Key and port changes needed to bring `dev` in line with `settings`.
pub fn device_changes(dev: &Device, settings: &InterfaceSettings) -> (Option<Key>, bool) {
    let key = match settings.private_key {
        Some(sk) if sk.is_set() && sk != dev.private_key => Some(sk),
        _ if !dev.private_key.is_set() => Some(Key::generate_private()),
        _ => None,
    };
    let port = dev.listen_port == 0 || settings.listen_port.is_some_and(|p| p != dev.listen_port);
    (key, port)
}

pub(crate) async fn resolve(endpoint: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await
        .with_context(|| format!("failed to resolve {endpoint}"))?
        .next()
        .with_context(|| format!("no address for {endpoint}"))
}

pub struct AutoConfig {
    intf: Arc<Interface>,
}

impl AutoConfig {
    pub fn new(intf: Arc<Interface>) -> Arc<Self> {
        Arc::new(Self { intf })
    }

    async fn static_peer(&self, ps: &PeerSettings) -> Result<PeerConfig> {
        let endpoint = match &ps.endpoint {
            Some(ep) => Some(resolve(ep).await?),
            None => None,
        };
        let mut allowed_ips = ps.allowed_ips.clone();
        for a in ps.public_key.host_addresses(&self.intf.settings.prefixes) {
            if !allowed_ips.contains(&a) {
                allowed_ips.push(a);
            }
        }
        Ok(PeerConfig {
            preshared_key: ps.preshared_key,
            endpoint,
            persistent_keepalive: ps.persistent_keepalive,
            allowed_ips: Some(allowed_ips),
            ..PeerConfig::new(ps.public_key)
        })
    }

    /// Apply key, listen port and static peers.
    pub async fn configure_wireguard(&self) -> Result<()> {
        let settings = &self.intf.settings;
        let dev = self.intf.device();
        let (private_key, port) = device_changes(&dev, settings);

        let mut cfg = DeviceConfig {
            private_key,
            ..Default::default()
        };
        if private_key.is_some() && settings.private_key.is_none() {
            warn!("{} Device has no private key, setting a random one", self.intf);
        }
        if port {
            cfg.listen_port = Some(match settings.listen_port {
                Some(p) => p,
                None => {
                    warn!("{} Device has no listen port, setting a random one", self.intf);
                    find_free_port(settings.listen_port_range).await?
                }
            });
        }
        if let Some(fwmark) = settings.fwmark.filter(|m| *m != dev.fwmark) {
            cfg.fwmark = Some(fwmark);
        }

        for ps in &settings.peers {
            match self.static_peer(ps).await {
                Ok(pc) => cfg.peers.push(pc),
                Err(e) => error!("{} peer={} Skipping static peer: {:#}", self.intf, ps.public_key, e),
            }
            if let Some(name) = &ps.name {
                let meta = PeerMeta {
                    name: name.clone(),
                    ..Default::default()
                };
                if self.intf.set_peer_meta(ps.public_key, meta) {
                    self.intf.notify_hosts_changed();
                }
            }
        }

        if cfg == DeviceConfig::default() {
            return Ok(());
        }
        self.intf.configure(&cfg).await.context("failed to configure device")
    }

    fn addresses(&self, pk: &Key) -> Vec<IpNet> {
        let settings = &self.intf.settings;
        let mut addrs: Vec<IpNet> = settings.prefixes.iter().map(|p| pk.ip_address(p)).collect();
        addrs.extend(settings.addresses.iter().copied());
        addrs
    }

    async fn add_addresses(&self, pk: &Key) -> Result<()> {
        for a in self.addresses(pk) {
            link::add_address(&self.intf.name, &a).await?;
            debug!("{} Added address {}", self.intf, a);
        }
        Ok(())
    }

    async fn remove_addresses(&self, pk: &Key) -> Result<()> {
        for a in self.addresses(pk) {
            link::delete_address(&self.intf.name, &a).await?;
            debug!("{} Removed address {}", self.intf, a);
        }
        Ok(())
    }

    /// Tunnel MTU from the smallest of the peer endpoint routes and the default route.
    pub async fn detect_mtu(&self) -> Result<u32> {
        let mut mtu: Option<u32> = None;
        for p in self.intf.peers() {
            if let Some(ep) = p.endpoint {
                let m = link::route_mtu(ep.ip()).await?;
                mtu = Some(mtu.map_or(m, |c| c.min(m)));
            }
        }
        let mtu = match (mtu, link::default_route_mtu().await) {
            (Some(m), Ok(d)) => m.min(d),
            (Some(m), Err(e)) => {
                debug!("{} No default route MTU: {:#}", self.intf, e);
                m
            }
            (None, d) => d?,
        };
        tunnel_mtu(mtu)
    }

    async fn configure_link(&self) -> Result<()> {
        let pk = self.intf.public_key();
        if pk.is_set() {
            self.add_addresses(&pk).await.context("failed to add addresses")?;
        }

        let mtu = match self.intf.settings.mtu {
            Some(m) => Some(m),
            None => match self.detect_mtu().await {
                Ok(m) => Some(m),
                Err(e) => {
                    error!("{} Failed to detect MTU: {:#}", self.intf, e);
                    None
                }
            },
        };
        if let Some(mtu) = mtu {
            link::set_mtu(&self.intf.name, mtu).await.context("failed to set MTU")?;
            info!("{} Set MTU to {}", self.intf, mtu);
        }

        link::set_up(&self.intf.name).await.context("failed to bring link up")
    }

    /// Key-derived AllowedIPs missing from `peer`.
    fn missing_allowed_ips(&self, peer: &Peer) -> Vec<IpNet> {
        peer.public_key
            .host_addresses(&self.intf.settings.prefixes)
            .into_iter()
            .filter(|a| !peer.allowed_ips.contains(a))
            .collect()
    }
}

#[async_trait]
impl Feature for AutoConfig {
    fn name(&self) -> &'static str {
        "autocfg"
    }

    async fn start(&self) -> Result<()> {
        info!("{} Started auto-configuration", self.intf);
        if let Err(e) = self.configure_wireguard().await {
            error!("{} Failed to configure WireGuard interface: {:#}", self.intf, e);
        }
        if let Err(e) = self.configure_link().await {
            if is_not_supported(&e) {
                debug!("{} Link configuration not supported on this platform", self.intf);
            } else {
                error!("{} Failed to configure link: {:#}", self.intf, e);
            }
        }
        Ok(())
    }

    async fn on_interface_modified(&self, old: &Device, new: &Device, modified: InterfaceModifier) {
        if !modified.contains(InterfaceModifier::PRIVATE_KEY) {
            return;
        }
        if old.private_key.is_set() {
            if let Err(e) = self.remove_addresses(&old.public_key).await {
                error!("{} Failed to remove old addresses: {:#}", self.intf, e);
            }
        }
        if new.private_key.is_set() {
            if let Err(e) = self.add_addresses(&new.public_key).await {
                error!("{} Failed to add new addresses: {:#}", self.intf, e);
            }
        }
    }

    async fn on_peer_added(&self, peer: &Peer) {
        // Discovered peers bring their own AllowedIPs.
        if self.intf.peer_meta(&peer.public_key).is_some() {
            return;
        }
        let missing = self.missing_allowed_ips(peer);
        if missing.is_empty() {
            return;
        }
        let mut allowed_ips = peer.allowed_ips.clone();
        allowed_ips.extend(missing);
        let pc = PeerConfig {
            update_only: true,
            allowed_ips: Some(allowed_ips),
            ..PeerConfig::new(peer.public_key)
        };
        if let Err(e) = self.intf.add_peer(pc).await {
            error!("{} peer={} Failed to add key-derived AllowedIPs: {:#}", self.intf, peer.public_key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::testing::memory_interface;

    #[test]
    fn test_tunnel_mtu() {
        assert_eq!(tunnel_mtu(1500).unwrap(), 1420);
        assert_eq!(tunnel_mtu(1360).unwrap(), 1280);
        assert!(tunnel_mtu(1359).is_err());
        assert!(tunnel_mtu(40).is_err());
    }

    #[test]
    fn test_device_changes() {
        let sk = Key::generate_private();
        let mut dev = Device {
            name: "wg0".into(),
            private_key: Key::default(),
            public_key: Key::default(),
            listen_port: 0,
            fwmark: 0,
            userspace: false,
            peers: Vec::new(),
        };
        let mut settings = InterfaceSettings::default();

        let (key, port) = device_changes(&dev, &settings);
        assert!(key.unwrap().is_set());
        assert!(port);

        dev.private_key = sk;
        dev.public_key = sk.public_key();
        dev.listen_port = 51820;
        assert_eq!(device_changes(&dev, &settings), (None, false));

        settings.listen_port = Some(51821);
        let other = Key::generate_private();
        settings.private_key = Some(other);
        assert_eq!(device_changes(&dev, &settings), (Some(other), true));
    }

    #[tokio::test]
    async fn test_find_free_port() {
        let s = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let taken = s.local_addr().unwrap().port();
        let port = find_free_port(PortRange { min: taken, max: taken.saturating_add(20) }).await.unwrap();
        assert_ne!(port, taken);
    }

    #[tokio::test]
    async fn test_static_peers_and_port() {
        let mut settings = InterfaceSettings::default();
        settings.listen_port = Some(51999);
        let pk = Key::generate_private().public_key();
        settings.peers = vec![PeerSettings {
            public_key: pk,
            name: Some("gamma".into()),
            preshared_key: None,
            endpoint: Some("127.0.0.1:51820".into()),
            allowed_ips: vec!["192.168.9.0/24".parse().unwrap()],
            persistent_keepalive: Some(25),
        }];
        let (intf, dev) = memory_interface("wg-ac0", settings);
        let ac = AutoConfig::new(Arc::clone(&intf));
        ac.configure_wireguard().await.unwrap();

        let snap = dev.snapshot_device();
        assert_eq!(snap.listen_port, 51999);
        let peer = snap.peer(&pk).unwrap();
        assert_eq!(peer.endpoint, Some("127.0.0.1:51820".parse().unwrap()));
        assert_eq!(peer.persistent_keepalive, 25);
        assert_eq!(peer.allowed_ips.len(), 1 + intf.settings.prefixes.len());
        assert_eq!(intf.peer_meta(&pk).unwrap().name, "gamma");

        // Nothing left to change on the device itself
        intf.update_device(snap);
        assert_eq!(device_changes(&intf.device(), &intf.settings), (None, false));
    }

    #[tokio::test]
    async fn test_key_derived_allowed_ips() {
        let (intf, dev) = memory_interface("wg-ac1", InterfaceSettings::default());
        let ac = AutoConfig::new(Arc::clone(&intf));
        let pk = Key::generate_private().public_key();
        intf.add_peer(PeerConfig::new(pk)).await.unwrap();

        let peer = dev.snapshot_device().peer(&pk).cloned().unwrap();
        ac.on_peer_added(&peer).await;
        let peer = dev.snapshot_device().peer(&pk).cloned().unwrap();
        assert_eq!(peer.allowed_ips, pk.host_addresses(&intf.settings.prefixes));
        assert!(ac.missing_allowed_ips(&peer).is_empty());
    }
}
