//! UDP muxes shared by all ICE agents of an interface.
//!
//! ### Routing
//! One reader task per socket classifies every datagram and hands it to the
//! agent owning it, identified by its local ufrag:
//! - STUN requests/indications: by the USERNAME attribute (`local:remote`)
//! - STUN responses: by the transaction id recorded when the request was sent
//! - everything else: by the remote address last used with that agent
//!
//! The host mux binds one socket per local address, all on the same port, so
//! that a single firewall rule per mux covers every address.

use anyhow::{bail, Context, Result};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::candidate::NetworkType;
use super::stun::{self, Class, TransactionId};
use crate::config::PortRange;
use crate::link;

const BIND_ATTEMPTS: usize = 16;
const TRANSACTION_TTL: Duration = Duration::from_secs(30);
const RECV_BUFFER: usize = 65536;

/// A datagram routed to an agent.
#[derive(Debug)]
pub struct Inbound {
    pub socket: Arc<MuxSocket>,
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxKind {
    Host,
    ServerReflexive,
}

#[derive(Debug)]
pub struct MuxSocket {
    pub socket: UdpSocket,
    pub local: SocketAddr,
    pub index: usize,
}

#[derive(Default)]
struct Routes {
    ufrags: HashMap<String, mpsc::Sender<Inbound>>,
    remotes: HashMap<(usize, SocketAddr), String>,
    transactions: HashMap<TransactionId, (String, Instant)>,
}

impl Routes {
    fn lookup(&self, ufrag: &str) -> Option<mpsc::Sender<Inbound>> {
        self.ufrags.get(ufrag).cloned()
    }

    fn classify(&mut self, index: usize, from: SocketAddr, data: &[u8]) -> Option<mpsc::Sender<Inbound>> {
        if !stun::is_stun(data) {
            let ufrag = self.remotes.get(&(index, from))?;
            return self.lookup(ufrag);
        }

        let (_, class) = stun::split_message_type(u16::from_be_bytes([data[0], data[1]]));
        match class {
            Class::Request | Class::Indication => {
                let msg = stun::Message::parse(data).ok()?;
                let ufrag = match msg.username() {
                    Some(u) => u.split(':').next().unwrap_or(u).to_string(),
                    None => self.remotes.get(&(index, from))?.clone(),
                };
                let tx = self.lookup(&ufrag)?;
                self.remotes.insert((index, from), ufrag);
                Some(tx)
            }
            Class::Success | Class::Error => {
                let txid = stun::transaction_id(data)?;
                match self.transactions.remove(&txid) {
                    Some((ufrag, _)) => self.lookup(&ufrag),
                    None => {
                        let ufrag = self.remotes.get(&(index, from))?;
                        self.lookup(ufrag)
                    }
                }
            }
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.transactions
            .retain(|_, (_, at)| now.duration_since(*at) < TRANSACTION_TTL);
    }
}

/// Set of UDP sockets multiplexed between agents.
pub struct UdpMux {
    kind: MuxKind,
    port: u16,
    sockets: Vec<Arc<MuxSocket>>,
    routes: Arc<Mutex<Routes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpMux {
    /// Bind one socket per usable local address on a random port from `range`.
    pub async fn bind_host(
        filter: &glob::Pattern,
        exclude: &[String],
        network_types: &[NetworkType],
        range: PortRange,
    ) -> Result<Self> {
        if network_types.is_empty() {
            bail!("no network types enabled for host candidates");
        }
        let addrs = host_addresses(link::addresses(None).await?, filter, exclude, network_types);

        if addrs.is_empty() {
            bail!("no usable local addresses for host candidates");
        }

        for attempt in 0..BIND_ATTEMPTS {
            let port = rand::thread_rng().gen_range(range.min..=range.max);
            match bind_all(&addrs, port).await {
                Ok(sockets) => {
                    info!("Host mux listening on port {} ({} addresses)", port, sockets.len());
                    return Self::from_sockets(MuxKind::Host, sockets);
                }
                Err(e) => debug!("Host mux bind on port {} failed (attempt {}): {}", port, attempt + 1, e),
            }
        }
        bail!("failed to find a free port in {}-{}", range.min, range.max)
    }

    /// Single socket on an ephemeral port for server-reflexive gathering.
    pub async fn bind_srflx() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind srflx mux socket")?;
        let mux = Self::from_sockets(MuxKind::ServerReflexive, vec![socket])?;
        info!("Srflx mux listening on port {}", mux.port);
        Ok(mux)
    }

    pub fn from_sockets(kind: MuxKind, sockets: Vec<UdpSocket>) -> Result<Self> {
        let routes = Arc::new(Mutex::new(Routes::default()));
        let mut wrapped = Vec::with_capacity(sockets.len());
        let mut tasks = Vec::with_capacity(sockets.len());

        for (index, socket) in sockets.into_iter().enumerate() {
            let local = socket.local_addr()?;
            let s = Arc::new(MuxSocket { socket, local, index });
            tasks.push(tokio::spawn(read_loop(Arc::clone(&s), Arc::clone(&routes))));
            wrapped.push(s);
        }

        let port = wrapped.first().map(|s| s.local.port()).unwrap_or(0);
        Ok(Self {
            kind,
            port,
            sockets: wrapped,
            routes,
            tasks,
        })
    }

    pub fn kind(&self) -> MuxKind {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn sockets(&self) -> &[Arc<MuxSocket>] {
        &self.sockets
    }

    /// Route datagrams for `ufrag` to `tx`.
    pub fn register(&self, ufrag: &str, tx: mpsc::Sender<Inbound>) {
        self.routes.lock().ufrags.insert(ufrag.to_string(), tx);
    }

    pub fn unregister(&self, ufrag: &str) {
        let mut routes = self.routes.lock();
        routes.ufrags.remove(ufrag);
        routes.remotes.retain(|_, u| u != ufrag);
        routes.transactions.retain(|_, (u, _)| u != ufrag);
    }

    /// Send on behalf of the agent owning `ufrag`, remembering the route back.
    pub async fn send_to(&self, socket: &MuxSocket, ufrag: &str, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        {
            let mut routes = self.routes.lock();
            routes.remotes.insert((socket.index, to), ufrag.to_string());

            if let Some(txid) = stun::transaction_id(buf) {
                let (_, class) = stun::split_message_type(u16::from_be_bytes([buf[0], buf[1]]));
                if class == Class::Request {
                    if routes.transactions.len() > 1024 {
                        routes.prune();
                    }
                    routes
                        .transactions
                        .insert(txid, (ufrag.to_string(), Instant::now()));
                }
            }
        }
        socket.socket.send_to(buf, to).await
    }

    pub fn close(&mut self) {
        for t in self.tasks.drain(..) {
            t.abort();
        }
        let mut routes = self.routes.lock();
        routes.ufrags.clear();
        routes.remotes.clear();
        routes.transactions.clear();
    }
}

impl Drop for UdpMux {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Local addresses eligible for host candidates.
///
/// Addresses of WireGuard links and of the excluded interfaces are skipped,
/// so ICE never runs through another tunnel.
fn host_addresses(
    addrs: Vec<link::InterfaceAddress>,
    filter: &glob::Pattern,
    exclude: &[String],
    network_types: &[NetworkType],
) -> Vec<IpAddr> {
    addrs
        .into_iter()
        .filter(|a| a.up && !a.loopback)
        .filter(|a| a.kind.as_deref() != Some("wireguard"))
        .filter(|a| filter.matches(&a.ifname) && !exclude.contains(&a.ifname))
        .map(|a| a.addr.addr())
        .filter(|ip| usable_host_address(ip, network_types))
        .collect()
}

fn usable_host_address(ip: &IpAddr, network_types: &[NetworkType]) -> bool {
    match ip {
        IpAddr::V4(v4) => network_types.contains(&NetworkType::Udp4) && !v4.is_link_local(),
        IpAddr::V6(v6) => network_types.contains(&NetworkType::Udp6) && !is_unicast_link_local(v6),
    }
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

async fn bind_all(addrs: &[IpAddr], port: u16) -> io::Result<Vec<UdpSocket>> {
    let mut sockets = Vec::with_capacity(addrs.len());
    for ip in addrs {
        sockets.push(UdpSocket::bind(SocketAddr::new(*ip, port)).await?);
    }
    Ok(sockets)
}

async fn read_loop(socket: Arc<MuxSocket>, routes: Arc<Mutex<Routes>>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (n, from) = match socket.socket.recv_from(&mut buf).await {
            Ok(r) => r,
            // ICMP port unreachable surfaces as a receive error on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!("Mux socket {} receive failed: {}", socket.local, e);
                break;
            }
        };

        let data = &buf[..n];
        let Some(tx) = routes.lock().classify(socket.index, from, data) else {
            trace!("Dropping {} bytes from {} on {}: no route", n, from, socket.local);
            continue;
        };

        let inbound = Inbound {
            socket: Arc::clone(&socket),
            from,
            data: data.to_vec(),
        };
        if tx.try_send(inbound).is_err() {
            trace!("Agent queue full, dropping datagram from {}", from);
        }
    }
}
