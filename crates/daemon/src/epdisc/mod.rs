//! Endpoint discovery
//!
//! Finds a working path to every peer of an interface with ICE and points
//! WireGuard at it.
//!
//! ### Per interface
//! - host mux: one UDP socket per local address on a random port
//! - srflx mux: one ephemeral socket for STUN gathering
//! - nftables table for the kernel-NAT proxy (absent where unsupported)
//!
//! ### Per peer
//! A coordinator task (see [`peer`]) exchanges credentials and candidates
//! over signaling, runs the agent and installs the proxy once connected.

pub mod peer;
pub mod state;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub use peer::{is_session_restart, reachability, Control, PeerHandle, PeerStatus};
pub use state::{AtomicState, PeerState};

use crate::crypto::Key;
use crate::error::is_not_supported;
use crate::ice::{CandidateType, UdpMux};
use crate::interface::{Feature, Interface};
use crate::nat::Nat;
use crate::proxy::ProxyContext;
use crate::signaling::MultiBackend;
use crate::watcher::{InterfaceModifier, PeerModifier};
use crate::wg::{Device, Peer};
use peer::PeerContext;

pub struct EndpointDiscovery {
    ctx: Arc<PeerContext>,
    nat: Option<Arc<Nat>>,
    proxy_ctx: Mutex<ProxyContext>,
    peers: Mutex<HashMap<Key, PeerHandle>>,
}

impl EndpointDiscovery {
    /// Bind the muxes and create the NAT table of `intf`.
    ///
    /// The host mux never binds to `managed` interfaces or any other
    /// WireGuard link. Facilities the platform does not support are skipped.
    /// Any other failure fails the interface.
    pub async fn new(intf: Arc<Interface>, backend: Arc<MultiBackend>, managed: &[String]) -> Result<Arc<Self>> {
        let settings = &intf.settings.ice;

        let host_mux = if settings.has_candidate_type(CandidateType::Host) {
            let filter = glob::Pattern::new(&settings.interface_filter)
                .with_context(|| format!("invalid interface filter {:?}", settings.interface_filter))?;
            let mut exclude = managed.to_vec();
            exclude.push(intf.name.clone());
            match UdpMux::bind_host(&filter, &exclude, &settings.network_types, settings.port_range).await {
                Ok(m) => Some(Arc::new(m)),
                Err(e) if is_not_supported(&e) => {
                    info!("{} Host candidates not supported on this platform", intf);
                    None
                }
                Err(e) => return Err(e.context("failed to create host mux")),
            }
        } else {
            None
        };

        let srflx_mux = if settings.has_candidate_type(CandidateType::ServerReflexive) {
            Some(Arc::new(UdpMux::bind_srflx().await?))
        } else {
            None
        };

        let nat = if intf.is_userspace() {
            None
        } else {
            match Nat::new(intf.index).await {
                Ok(n) => Some(Arc::new(n)),
                Err(e) if is_not_supported(&e) => {
                    info!("{} nftables not available, using loopback proxies", intf);
                    None
                }
                Err(e) => return Err(e),
            }
        };

        Ok(Self::with_facilities(intf, backend, host_mux, srflx_mux, nat))
    }

    /// Engine using the given muxes and NAT table.
    pub fn with_facilities(
        intf: Arc<Interface>,
        backend: Arc<MultiBackend>,
        host_mux: Option<Arc<UdpMux>>,
        srflx_mux: Option<Arc<UdpMux>>,
        nat: Option<Arc<Nat>>,
    ) -> Arc<Self> {
        let bind = intf
            .client
            .local_device(&intf.name)
            .and_then(|d| d.ice_bind());
        let proxy_ctx = ProxyContext {
            nat: nat.clone(),
            bind,
            listen_port: intf.listen_port(),
        };

        Arc::new(Self {
            ctx: Arc::new(PeerContext {
                settings: intf.settings.ice.clone(),
                intf,
                backend,
                host_mux,
                srflx_mux,
            }),
            nat,
            proxy_ctx: Mutex::new(proxy_ctx),
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn peer_status(&self, pk: &Key) -> Option<PeerStatus> {
        self.peers.lock().get(pk).map(|p| p.status())
    }

    pub fn statuses(&self) -> Vec<(Key, PeerStatus)> {
        self.peers
            .lock()
            .iter()
            .map(|(k, p)| (*k, p.status()))
            .collect()
    }

    /// Restart the sessions of all peers.
    pub fn restart_peers(&self) -> usize {
        let peers = self.peers.lock();
        for p in peers.values() {
            p.send(Control::Restart);
        }
        peers.len()
    }

    fn add_peer(&self, pk: Key) {
        let mut peers = self.peers.lock();
        if peers.contains_key(&pk) {
            return;
        }
        let handle = PeerHandle::spawn(
            Arc::clone(&self.ctx),
            self.ctx.intf.private_key(),
            pk,
            self.proxy_ctx.lock().clone(),
        );
        debug!("{} Started coordinator for peer={}", self.ctx.intf, pk);
        peers.insert(pk, handle);
    }

    async fn remove_peer(&self, pk: &Key) {
        let handle = self.peers.lock().remove(pk);
        if let Some(h) = handle {
            h.close().await;
            debug!("{} Stopped coordinator for peer={}", self.ctx.intf, pk);
        }
    }
}

#[async_trait]
impl Feature for EndpointDiscovery {
    fn name(&self) -> &'static str {
        "epdisc"
    }

    async fn start(&self) -> Result<()> {
        info!(
            "{} Endpoint discovery started (host mux {:?}, srflx mux {:?}, kernel NAT {})",
            self.ctx.intf,
            self.ctx.host_mux.as_ref().map(|m| m.port()),
            self.ctx.srflx_mux.as_ref().map(|m| m.port()),
            self.nat.is_some()
        );
        Ok(())
    }

    async fn on_interface_modified(&self, _old: &Device, new: &Device, modified: InterfaceModifier) {
        if modified.contains(InterfaceModifier::LISTEN_PORT) {
            self.proxy_ctx.lock().listen_port = new.listen_port;
            for p in self.peers.lock().values() {
                p.send(Control::ListenPort(new.listen_port));
            }
        }
        if modified.contains(InterfaceModifier::PRIVATE_KEY) {
            for p in self.peers.lock().values() {
                p.send(Control::KeyChanged(new.private_key));
            }
        }
    }

    async fn on_peer_added(&self, peer: &Peer) {
        self.add_peer(peer.public_key);
    }

    async fn on_peer_removed(&self, peer: &Peer) {
        self.remove_peer(&peer.public_key).await;
    }

    async fn on_peer_modified(&self, _old: &Peer, new: &Peer, modified: PeerModifier) {
        if modified.contains(PeerModifier::ENDPOINT) {
            if let Some(p) = self.peers.lock().get(&new.public_key) {
                p.send(Control::EndpointChanged(new.endpoint));
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let handles: Vec<PeerHandle> = self.peers.lock().drain().map(|(_, h)| h).collect();
        for h in handles {
            h.close().await;
        }
        if let Some(nat) = &self.nat {
            if let Err(e) = nat.close().await {
                warn!("{} Failed to remove nftables table: {:#}", self.ctx.intf, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceSettings;
    use crate::ice::{MuxKind, NetworkType};
    use crate::interface::testing::memory_interface;
    use crate::proxy::ProxyType;
    use crate::signaling::Credentials;
    use crate::wg::testing::MemoryDevice;
    use crate::wg::{PeerConfig, Reachability};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn settings() -> InterfaceSettings {
        let mut s = InterfaceSettings::default();
        s.ice.candidate_types = vec![CandidateType::Host];
        s.ice.network_types = vec![NetworkType::Udp4];
        s.ice.urls = Vec::new();
        s
    }

    async fn loopback_mux() -> Arc<UdpMux> {
        let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Arc::new(UdpMux::from_sockets(MuxKind::Host, vec![s]).unwrap())
    }

    async fn wait_until(ep: &EndpointDiscovery, pk: &Key, what: &str, f: impl Fn(&PeerStatus) -> bool) -> PeerStatus {
        for _ in 0..400 {
            if let Some(s) = ep.peer_status(pk) {
                if f(&s) {
                    return s;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("peer {} never reached {}: {:?}", pk, what, ep.peer_status(pk));
    }

    async fn wait_for(ep: &EndpointDiscovery, pk: &Key, state: PeerState) -> PeerStatus {
        wait_until(ep, pk, state.as_str(), |s| s.state == state).await
    }

    async fn pair(backend: &Arc<MultiBackend>) -> [(Arc<Interface>, Arc<MemoryDevice>, Arc<EndpointDiscovery>); 2] {
        let (intf_a, dev_a) = memory_interface("wg-a", settings());
        let (intf_b, dev_b) = memory_interface("wg-b", settings());
        intf_a.add_peer(PeerConfig::new(intf_b.public_key())).await.unwrap();
        intf_b.add_peer(PeerConfig::new(intf_a.public_key())).await.unwrap();

        let ep_a = EndpointDiscovery::with_facilities(
            Arc::clone(&intf_a),
            Arc::clone(backend),
            Some(loopback_mux().await),
            None,
            None,
        );
        let ep_b = EndpointDiscovery::with_facilities(
            Arc::clone(&intf_b),
            Arc::clone(backend),
            Some(loopback_mux().await),
            None,
            None,
        );
        [(intf_a, dev_a, ep_a), (intf_b, dev_b, ep_b)]
    }

    #[test]
    fn test_session_restart_detection() {
        let old = ("ufrag".to_string(), "pwd".to_string());
        let creds = |u: &str, p: &str| Credentials {
            ufrag: u.into(),
            pwd: p.into(),
            need_creds: false,
        };
        assert!(!is_session_restart(&old, &creds("ufrag", "pwd")));
        assert!(is_session_restart(&old, &creds("other", "pwd")));
        assert!(is_session_restart(&old, &creds("ufrag", "other")));
        assert!(!is_session_restart(&old, &creds("", "")));
        assert!(!is_session_restart(&(String::new(), String::new()), &creds("a", "b")));
    }

    #[test]
    fn test_reachability_from_pair() {
        use crate::ice::{Candidate, CandidatePair};
        let host = Candidate::host("192.0.2.1:1000".parse().unwrap(), 1);
        let mut relay = Candidate::host("192.0.2.2:1000".parse().unwrap(), 1);
        relay.typ = CandidateType::Relay;

        let pair = |l: &Candidate, r: &Candidate| CandidatePair {
            local: l.clone(),
            remote: r.clone(),
        };
        assert_eq!(reachability(PeerState::Connected, Some(&pair(&host, &host))), Reachability::Direct);
        assert_eq!(reachability(PeerState::Connected, Some(&pair(&host, &relay))), Reachability::Relayed);
        assert_eq!(reachability(PeerState::Connected, Some(&pair(&relay, &host))), Reachability::Relayed);
        assert_eq!(
            reachability(PeerState::Connected, Some(&pair(&relay, &relay))),
            Reachability::RelayedBidir
        );
        assert_eq!(reachability(PeerState::Failed, Some(&pair(&host, &host))), Reachability::None);
        assert_eq!(reachability(PeerState::Connected, None), Reachability::None);
    }

    #[tokio::test]
    async fn test_idle_without_remote() {
        let backend = Arc::new(MultiBackend::new(&["inprocess:".to_string()]).await.unwrap());
        let (intf, _dev) = memory_interface("wg-ep0", settings());
        let ep = EndpointDiscovery::with_facilities(intf, backend, Some(loopback_mux().await), None, None);

        let remote = Key::generate_private().public_key();
        ep.on_peer_added(&Peer::new(remote)).await;
        let status = wait_for(&ep, &remote, PeerState::Idle).await;
        assert_eq!(status.restarts, 0);
        assert_eq!(status.reachability, Reachability::None);

        assert_eq!(ep.restart_peers(), 1);
        wait_until(&ep, &remote, "restarted", |s| s.restarts == 1 && s.state == PeerState::Idle).await;

        ep.on_peer_removed(&Peer::new(remote)).await;
        assert!(ep.peer_status(&remote).is_none());
        ep.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_peers_connect_over_loopback() {
        let backend = Arc::new(MultiBackend::new(&["inprocess:".to_string()]).await.unwrap());
        let [(intf_a, dev_a, ep_a), (intf_b, dev_b, ep_b)] = pair(&backend).await;
        let pk_a = intf_a.public_key();
        let pk_b = intf_b.public_key();

        ep_a.on_peer_added(&Peer::new(pk_b)).await;
        ep_b.on_peer_added(&Peer::new(pk_a)).await;

        let sa = wait_for(&ep_a, &pk_b, PeerState::Connected).await;
        let sb = wait_for(&ep_b, &pk_a, PeerState::Connected).await;

        assert_ne!(sa.controlling, sb.controlling);
        assert_eq!(sa.proxy, Some(ProxyType::Loopback));
        assert_eq!(sa.reachability, Reachability::Direct);
        assert_eq!(sa.local_candidate, Some(CandidateType::Host));

        // The device endpoint is the one returned by the proxy.
        let endpoint_a = dev_a.snapshot_device().peer(&pk_b).and_then(|p| p.endpoint);
        assert!(endpoint_a.is_some());
        assert_eq!(endpoint_a, sa.endpoint);
        let endpoint_b = dev_b.snapshot_device().peer(&pk_a).and_then(|p| p.endpoint);
        assert_eq!(endpoint_b, sb.endpoint);

        ep_a.close().await.unwrap();
        ep_b.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_endpoint_reapplied_after_restart() {
        let backend = Arc::new(MultiBackend::new(&["inprocess:".to_string()]).await.unwrap());
        let [(intf_a, dev_a, ep_a), (intf_b, _dev_b, ep_b)] = pair(&backend).await;
        let pk_a = intf_a.public_key();
        let pk_b = intf_b.public_key();

        ep_a.on_peer_added(&Peer::new(pk_b)).await;
        ep_b.on_peer_added(&Peer::new(pk_a)).await;
        wait_for(&ep_a, &pk_b, PeerState::Connected).await;
        wait_for(&ep_b, &pk_a, PeerState::Connected).await;

        let elsewhere: SocketAddr = "192.0.2.99:1234".parse().unwrap();
        intf_a.client.set_endpoint("wg-a", &pk_b, elsewhere).await.unwrap();

        // B starts a new session, A restarts and reconnects
        ep_b.on_peer_removed(&Peer::new(pk_a)).await;
        ep_b.on_peer_added(&Peer::new(pk_a)).await;
        let sa = wait_until(&ep_a, &pk_b, "reconnected", |s| {
            s.restarts >= 1 && s.state == PeerState::Connected
        })
        .await;

        let endpoint = dev_a.snapshot_device().peer(&pk_b).and_then(|p| p.endpoint);
        assert_ne!(endpoint, Some(elsewhere));
        assert_eq!(endpoint, sa.endpoint);

        ep_a.close().await.unwrap();
        ep_b.close().await.unwrap();
    }
}
