//! Bridges between a nominated ICE pair and the WireGuard socket.
//!
//! ### Variants
//! - **Kernel NAT**: two nftables rules let WireGuard talk to the remote
//!   candidate directly through the mux port. Only possible when the local
//!   candidate is a socket of ours (host or srflx) and nftables is available.
//! - **Loopback**: datagrams are shuttled between the ICE connection and
//!   WireGuard. For kernel devices a UDP socket on loopback is connected to
//!   the listen port; for user-space devices the connection is attached to
//!   the device's bind.
//!
//! In every case [`Proxy::update_candidate_pair`] returns the address
//! WireGuard has to use as the peer endpoint.

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::ice::{CandidatePair, CandidateType, IceConn};
use crate::nat::{Nat, NatRule};
use crate::userspace::Bind;

const MAX_DATAGRAM: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    KernelNat,
    Loopback,
    InProcess,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyType::KernelNat => "kernel_nat",
            ProxyType::Loopback => "loopback",
            ProxyType::InProcess => "in_process",
        };
        f.write_str(s)
    }
}

/// Interface-wide facilities a proxy may use.
#[derive(Clone, Default)]
pub struct ProxyContext {
    pub nat: Option<Arc<Nat>>,
    pub bind: Option<Arc<Bind>>,
    pub listen_port: u16,
}

impl ProxyContext {
    /// Which proxy bridges `pair`.
    pub fn select(&self, pair: &CandidatePair) -> ProxyType {
        if self.bind.is_some() {
            ProxyType::InProcess
        } else if self.nat.is_some() && can_nat(pair) {
            ProxyType::KernelNat
        } else {
            ProxyType::Loopback
        }
    }
}

/// Kernel NAT works only for candidates backed by one of our mux sockets.
pub fn can_nat(pair: &CandidatePair) -> bool {
    matches!(pair.local.typ, CandidateType::Host | CandidateType::ServerReflexive)
}

pub enum Proxy {
    KernelNat(NatProxy),
    Loopback(LoopbackProxy),
}

impl Proxy {
    /// Empty proxy of the given type. Nothing is installed before the first
    /// [`Proxy::update_candidate_pair`].
    pub fn new(typ: ProxyType, ctx: &ProxyContext) -> Result<Self> {
        Ok(match typ {
            ProxyType::KernelNat => {
                let nat = ctx.nat.clone().context("kernel NAT is not available")?;
                Proxy::KernelNat(NatProxy::new(nat, ctx.listen_port))
            }
            ProxyType::InProcess => {
                let bind = ctx.bind.clone().context("device has no in-process bind")?;
                Proxy::Loopback(LoopbackProxy::in_process(bind))
            }
            ProxyType::Loopback => Proxy::Loopback(LoopbackProxy::forward(ctx.listen_port)),
        })
    }

    pub fn typ(&self) -> ProxyType {
        match self {
            Proxy::KernelNat(_) => ProxyType::KernelNat,
            Proxy::Loopback(p) if p.is_in_process() => ProxyType::InProcess,
            Proxy::Loopback(_) => ProxyType::Loopback,
        }
    }

    /// Bridge `conn` and return the endpoint WireGuard should use for the peer.
    pub async fn update_candidate_pair(&mut self, pair: &CandidatePair, conn: Arc<IceConn>) -> Result<SocketAddr> {
        match self {
            Proxy::KernelNat(p) => p.update_candidate_pair(pair).await,
            Proxy::Loopback(p) => p.update_candidate_pair(conn).await,
        }
    }

    /// Follow a change of the WireGuard listen port.
    pub async fn update_listen_port(&mut self, port: u16) -> Result<()> {
        match self {
            Proxy::KernelNat(p) => p.update_listen_port(port).await,
            Proxy::Loopback(p) => p.update_listen_port(port).await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Proxy::KernelNat(p) => p.close().await,
            Proxy::Loopback(p) => p.close(),
        }
    }
}

/// Installed rules for one peer.
pub struct NatProxy {
    nat: Arc<Nat>,
    listen_port: u16,
    mux_port: u16,
    remote: Option<SocketAddr>,
    redirect: Option<NatRule>,
    masquerade: Option<NatRule>,
}

impl NatProxy {
    fn new(nat: Arc<Nat>, listen_port: u16) -> Self {
        Self {
            nat,
            listen_port,
            mux_port: 0,
            remote: None,
            redirect: None,
            masquerade: None,
        }
    }

    async fn update_candidate_pair(&mut self, pair: &CandidatePair) -> Result<SocketAddr> {
        let remote = pair.remote.addr();
        self.mux_port = pair.local.base_port();
        self.remote = Some(remote);
        self.install().await?;

        info!(
            "Kernel NAT proxy: {} -> {} via mux port {}",
            self.listen_port, remote, self.mux_port
        );
        Ok(remote)
    }

    async fn update_listen_port(&mut self, port: u16) -> Result<()> {
        if port == self.listen_port {
            return Ok(());
        }
        self.listen_port = port;
        if self.remote.is_some() {
            self.install().await?;
        }
        Ok(())
    }

    /// Replace both rules with ones matching the current ports and remote.
    async fn install(&mut self) -> Result<()> {
        self.remove().await;
        let Some(remote) = self.remote else {
            return Ok(());
        };

        self.redirect = Some(self.nat.redirect_non_stun(self.mux_port, self.listen_port).await?);
        self.masquerade = Some(
            self.nat
                .masquerade_source_port(self.listen_port, self.mux_port, remote)
                .await?,
        );
        Ok(())
    }

    async fn remove(&mut self) {
        for rule in [self.redirect.take(), self.masquerade.take()].into_iter().flatten() {
            if let Err(e) = self.nat.delete(&rule).await {
                warn!("Failed to remove NAT rule {} from {}: {:#}", rule.id, self.nat.table(), e);
            }
        }
    }

    async fn close(&mut self) {
        self.remove().await;
        self.remote = None;
    }
}

enum Mode {
    Forward {
        listen_port: u16,
        socket: Option<Arc<UdpSocket>>,
        tasks: Vec<JoinHandle<()>>,
    },
    InProcess {
        bind: Arc<Bind>,
        remote: Option<SocketAddr>,
    },
}

/// Datagram shuttle between an ICE connection and WireGuard.
pub struct LoopbackProxy {
    mode: Mode,
}

impl LoopbackProxy {
    fn forward(listen_port: u16) -> Self {
        Self {
            mode: Mode::Forward {
                listen_port,
                socket: None,
                tasks: Vec::new(),
            },
        }
    }

    fn in_process(bind: Arc<Bind>) -> Self {
        Self {
            mode: Mode::InProcess { bind, remote: None },
        }
    }

    fn is_in_process(&self) -> bool {
        matches!(self.mode, Mode::InProcess { .. })
    }

    async fn update_candidate_pair(&mut self, conn: Arc<IceConn>) -> Result<SocketAddr> {
        match &mut self.mode {
            Mode::InProcess { bind, remote } => {
                if let Some(old) = remote.take() {
                    bind.detach(&old);
                }
                let ep = bind.attach(conn);
                *remote = Some(ep);
                Ok(ep)
            }
            Mode::Forward {
                listen_port,
                socket,
                tasks,
            } => {
                let sock = match socket {
                    Some(s) => Arc::clone(s),
                    None => {
                        let s = Arc::new(dial_loopback(*listen_port).await?);
                        *socket = Some(Arc::clone(&s));
                        s
                    }
                };

                for t in tasks.drain(..) {
                    t.abort();
                }
                tasks.push(tokio::spawn(wireguard_to_ice(Arc::clone(&sock), Arc::clone(&conn))));
                tasks.push(tokio::spawn(ice_to_wireguard(Arc::clone(&sock), conn)));

                let ep = sock.local_addr()?;
                info!("Loopback proxy: {} <-> 127.0.0.1:{}", ep, listen_port);
                Ok(ep)
            }
        }
    }

    async fn update_listen_port(&mut self, port: u16) -> Result<()> {
        if let Mode::Forward {
            listen_port, socket, ..
        } = &mut self.mode
        {
            *listen_port = port;
            if let Some(s) = socket {
                let target = SocketAddr::new(loopback_for(s.local_addr()?.ip()), port);
                s.connect(target)
                    .await
                    .with_context(|| format!("failed to reconnect loopback proxy to {target}"))?;
                debug!("Loopback proxy now forwards to {}", target);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        match &mut self.mode {
            Mode::InProcess { bind, remote } => {
                if let Some(r) = remote.take() {
                    bind.detach(&r);
                }
            }
            Mode::Forward { socket, tasks, .. } => {
                for t in tasks.drain(..) {
                    t.abort();
                }
                *socket = None;
            }
        }
    }
}

impl Drop for LoopbackProxy {
    fn drop(&mut self) {
        self.close();
    }
}

fn loopback_for(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

async fn dial_loopback(listen_port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .context("failed to bind loopback proxy socket")?;
    socket
        .connect((Ipv4Addr::LOCALHOST, listen_port))
        .await
        .with_context(|| format!("failed to connect loopback proxy to port {listen_port}"))?;
    Ok(socket)
}

async fn wireguard_to_ice(socket: Arc<UdpSocket>, conn: Arc<IceConn>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                trace!("Loopback proxy socket closed: {}", e);
                return;
            }
        };
        if let Err(e) = conn.send(&buf[..n]).await {
            trace!("ICE conn to {} closed: {}", conn.remote_addr(), e);
            return;
        }
    }
}

async fn ice_to_wireguard(socket: Arc<UdpSocket>, conn: Arc<IceConn>) {
    loop {
        let data = match conn.recv().await {
            Ok(d) => d,
            Err(e) => {
                trace!("ICE conn to {} closed: {}", conn.remote_addr(), e);
                return;
            }
        };
        if let Err(e) = socket.send(&data).await {
            // The listen socket may be restarting; keep the shuttle alive.
            debug!("Failed to forward to WireGuard: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::{Candidate, MuxKind, UdpMux};
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair(local: CandidateType) -> CandidatePair {
        let remote = Candidate::host("198.51.100.7:40000".parse().unwrap(), 65535);
        let local = match local {
            CandidateType::Host => Candidate::host("192.0.2.1:49200".parse().unwrap(), 65535),
            CandidateType::ServerReflexive => Candidate::server_reflexive(
                "203.0.113.1:61000".parse().unwrap(),
                "0.0.0.0:49300".parse().unwrap(),
                65535,
            ),
            CandidateType::PeerReflexive => Candidate::peer_reflexive("203.0.113.1:61001".parse().unwrap(), 1),
            CandidateType::Relay => {
                let mut c = Candidate::host("203.0.113.9:3478".parse().unwrap(), 0);
                c.typ = CandidateType::Relay;
                c
            }
        };
        CandidatePair { local, remote }
    }

    #[test]
    fn test_can_nat() {
        assert!(can_nat(&pair(CandidateType::Host)));
        assert!(can_nat(&pair(CandidateType::ServerReflexive)));
        assert!(!can_nat(&pair(CandidateType::PeerReflexive)));
        assert!(!can_nat(&pair(CandidateType::Relay)));
        assert_eq!(pair(CandidateType::ServerReflexive).local.base_port(), 49300);
    }

    #[test]
    fn test_select_without_nat() {
        let ctx = ProxyContext {
            listen_port: 51820,
            ..Default::default()
        };
        assert_eq!(ctx.select(&pair(CandidateType::Host)), ProxyType::Loopback);
        assert_eq!(ctx.select(&pair(CandidateType::Relay)), ProxyType::Loopback);
        assert!(Proxy::new(ProxyType::KernelNat, &ctx).is_err());
    }

    #[tokio::test]
    async fn test_select_in_process() {
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let ctx = ProxyContext {
            bind: Some(Bind::new(tx)),
            ..Default::default()
        };
        assert_eq!(ctx.select(&pair(CandidateType::Host)), ProxyType::InProcess);
        let proxy = Proxy::new(ProxyType::InProcess, &ctx).unwrap();
        assert_eq!(proxy.typ(), ProxyType::InProcess);
    }

    #[tokio::test]
    async fn test_loopback_forward() {
        // Stand-in for the WireGuard listen socket.
        let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let wg_port = wg.local_addr().unwrap().port();

        let mux_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mux = Arc::new(UdpMux::from_sockets(MuxKind::Host, vec![mux_socket]).unwrap());
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (conn, feed) = IceConn::for_test(Arc::clone(&mux), remote.local_addr().unwrap());

        let ctx = ProxyContext {
            listen_port: wg_port,
            ..Default::default()
        };
        let mut proxy = Proxy::new(ProxyType::Loopback, &ctx).unwrap();
        assert_eq!(proxy.typ(), ProxyType::Loopback);

        let ep = proxy
            .update_candidate_pair(&pair(CandidateType::PeerReflexive), Arc::clone(&conn))
            .await
            .unwrap();
        assert!(ep.ip().is_loopback());

        // Remote to WireGuard.
        feed.send(b"from-remote".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = timeout(Duration::from_secs(2), wg.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"from-remote");
        assert_eq!(from, ep);

        // WireGuard to remote.
        wg.send_to(b"from-wg", ep).await.unwrap();
        let (n, from) = timeout(Duration::from_secs(2), remote.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"from-wg");
        assert_eq!(from, conn.local_addr());

        proxy.close().await;
    }
}
