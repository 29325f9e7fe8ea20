//! User-space WireGuard device.
//!
//! A TUN interface carries the plaintext side; `defguard_boringtun` does the
//! Noise sessions. The UDP side is a [`Bind`] which, besides its sockets, can
//! carry ICE connections: datagrams for an endpoint with an attached
//! [`IceConn`] are sent over that connection, and everything it receives is
//! fed into the same inbound queue as the sockets.
//!
//! ### Tasks
//! - TUN reader: route by destination address, encapsulate, send
//! - network reader: identify the peer, decapsulate, write to TUN
//! - timers: handshake retries and keepalives every 250ms

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use defguard_boringtun::noise::{Packet, Tunn, TunnResult};
use defguard_boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::Key;
use crate::ice::IceConn;
use crate::wg::{Device, DeviceConfig, DeviceHandle, Peer};

const MAX_PACKET: usize = 65536;
const TIMER_TICK: Duration = Duration::from_millis(250);
const INBOUND_QUEUE: usize = 1024;

type Datagram = (SocketAddr, Vec<u8>);

/// UDP side of a user-space device.
pub struct Bind {
    sockets: RwLock<Vec<Arc<UdpSocket>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    conns: RwLock<HashMap<SocketAddr, (Arc<IceConn>, JoinHandle<()>)>>,
    inbound: mpsc::Sender<Datagram>,
}

impl Bind {
    pub fn new(inbound: mpsc::Sender<Datagram>) -> Arc<Self> {
        Arc::new(Self {
            sockets: RwLock::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            conns: RwLock::new(HashMap::new()),
            inbound,
        })
    }

    /// (Re)bind the sockets on `port`; 0 picks a free port. Returns the bound port.
    pub fn bind(&self, port: u16) -> io::Result<u16> {
        let v4 = bind_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
        let port = v4.local_addr()?.port();
        let mut sockets = vec![Arc::new(v4)];
        match bind_socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)) {
            Ok(v6) => sockets.push(Arc::new(v6)),
            Err(e) => debug!("IPv6 bind on port {} failed: {}", port, e),
        }

        let mut readers = self.readers.lock();
        for r in readers.drain(..) {
            r.abort();
        }
        for s in &sockets {
            readers.push(tokio::spawn(read_socket(Arc::clone(s), self.inbound.clone())));
        }
        *self.sockets.write() = sockets;
        Ok(port)
    }

    /// Carry traffic for the conn's remote address over `conn`.
    ///
    /// Returns the address to use as the peer endpoint.
    pub fn attach(&self, conn: Arc<IceConn>) -> SocketAddr {
        let remote = conn.remote_addr();
        let inbound = self.inbound.clone();
        let reader = Arc::clone(&conn);
        let task = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(data) => {
                        if inbound.send((remote, data)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        trace!("ICE conn to {} closed: {}", remote, e);
                        break;
                    }
                }
            }
        });

        if let Some((_, old)) = self.conns.write().insert(remote, (conn, task)) {
            old.abort();
        }
        debug!("Attached ICE conn for {}", remote);
        remote
    }

    pub fn detach(&self, remote: &SocketAddr) {
        if let Some((_, task)) = self.conns.write().remove(remote) {
            task.abort();
            debug!("Detached ICE conn for {}", remote);
        }
    }

    pub async fn send(&self, to: SocketAddr, buf: &[u8]) -> io::Result<()> {
        let conn = self.conns.read().get(&to).map(|(c, _)| Arc::clone(c));
        if let Some(conn) = conn {
            conn.send(buf).await?;
            return Ok(());
        }

        let socket = self
            .sockets
            .read()
            .iter()
            .find(|s| s.local_addr().map(|a| a.is_ipv4() == to.is_ipv4()).unwrap_or(false))
            .cloned();
        match socket {
            Some(s) => s.send_to(buf, to).await.map(|_| ()),
            None => Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no socket for address family")),
        }
    }

    pub fn close(&self) {
        for r in self.readers.lock().drain(..) {
            r.abort();
        }
        for (_, (conn, task)) in self.conns.write().drain() {
            task.abort();
            conn.close();
        }
        self.sockets.write().clear();
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn read_socket(socket: Arc<UdpSocket>, inbound: mpsc::Sender<Datagram>) {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if inbound.send((from, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!("WireGuard socket receive failed: {}", e);
                break;
            }
        }
    }
}

struct UserPeer {
    info: Peer,
    tunn: Option<Tunn>,
    index: u32,
}

struct State {
    device: Device,
    peers: Vec<UserPeer>,
    next_index: u32,
}

impl State {
    fn new(name: &str) -> Self {
        Self {
            device: Device {
                name: name.to_string(),
                private_key: Key::ZERO,
                public_key: Key::ZERO,
                listen_port: 0,
                fwmark: 0,
                userspace: true,
                peers: Vec::new(),
            },
            peers: Vec::new(),
            next_index: 1,
        }
    }

    fn snapshot(&self) -> Device {
        let mut d = self.device.clone();
        d.peers = self.peers.iter().map(|p| p.info.clone()).collect();
        d
    }

    /// Move to `target`, keeping sessions whose keys did not change.
    fn reconcile(&mut self, target: Device) {
        let key_changed = target.private_key != self.device.private_key;
        let mut old: HashMap<Key, UserPeer> = self.peers.drain(..).map(|p| (p.info.public_key, p)).collect();

        for info in &target.peers {
            let reuse = old.remove(&info.public_key).filter(|p| {
                !key_changed
                    && p.tunn.is_some()
                    && p.info.preshared_key == info.preshared_key
                    && p.info.persistent_keepalive == info.persistent_keepalive
            });
            let peer = match reuse {
                Some(mut p) => {
                    let (hs, rx, tx) = (p.info.last_handshake, p.info.rx_bytes, p.info.tx_bytes);
                    p.info = info.clone();
                    p.info.last_handshake = hs;
                    p.info.rx_bytes = rx;
                    p.info.tx_bytes = tx;
                    p
                }
                None => {
                    let index = self.next_index;
                    self.next_index = self.next_index.wrapping_add(1) & 0x00ff_ffff;
                    UserPeer {
                        info: info.clone(),
                        tunn: new_tunn(&target.private_key, info, index),
                        index,
                    }
                }
            };
            self.peers.push(peer);
        }

        let mut device = target;
        device.peers.clear();
        self.device = device;
    }

    /// Peer whose allowed IPs cover `dst` with the longest prefix.
    fn route(&self, dst: IpAddr) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                p.info
                    .allowed_ips
                    .iter()
                    .filter(|n| n.contains(&dst))
                    .map(IpNet::prefix_len)
                    .max()
                    .map(|len| (len, i))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, i)| i)
    }

    fn by_index(&self, receiver_idx: u32) -> Option<usize> {
        self.peers.iter().position(|p| p.index == receiver_idx >> 8)
    }

    fn refresh_handshake(&mut self, i: usize) {
        let p = &mut self.peers[i];
        if let Some(age) = p.tunn.as_ref().and_then(|t| t.time_since_last_handshake()) {
            if let Ok(age) = chrono::Duration::from_std(age) {
                p.info.last_handshake = Some(Utc::now() - age);
            }
        }
    }
}

fn new_tunn(private_key: &Key, info: &Peer, index: u32) -> Option<Tunn> {
    if !private_key.is_set() {
        return None;
    }
    let keepalive = (info.persistent_keepalive > 0).then_some(info.persistent_keepalive);
    Some(Tunn::new(
        StaticSecret::from(*private_key.as_bytes()),
        PublicKey::from(*info.public_key.as_bytes()),
        info.preshared_key.map(|k| *k.as_bytes()),
        keepalive,
        index,
        None,
    ))
}

/// Destination address of an IP packet.
fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let b: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::from(b))
        }
        6 if packet.len() >= 40 => {
            let b: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::from(b))
        }
        _ => None,
    }
}

/// Work produced while holding the state lock.
#[derive(Default)]
struct Output {
    network: Vec<Datagram>,
    tunnel: Vec<Vec<u8>>,
}

/// User-space WireGuard device.
pub struct UserDevice {
    name: String,
    state: Arc<Mutex<State>>,
    bind: Arc<Bind>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UserDevice {
    /// Create the TUN interface `name` and start the packet loops.
    pub async fn create(name: &str) -> Result<Arc<Self>> {
        let mut config = tun::Configuration::default();
        config.name(name).up();
        let tun = tun::create_as_async(&config).with_context(|| format!("failed to create TUN device {name}"))?;
        let (mut reader, writer) = tokio::io::split(tun);

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let bind = Bind::new(tx);
        let state = Arc::new(Mutex::new(State::new(name)));

        let mut tasks = Vec::new();

        let (st, b) = (Arc::clone(&state), Arc::clone(&bind));
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            let mut out = vec![0u8; MAX_PACKET + 64];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!("TUN read failed: {}", e);
                        break;
                    }
                };
                let output = outbound(&st, &buf[..n], &mut out);
                send_all(&b, output.network).await;
            }
        }));

        let (st, b) = (Arc::clone(&state), Arc::clone(&bind));
        tasks.push(tokio::spawn(network_loop(st, b, rx, writer)));

        let (st, b) = (Arc::clone(&state), Arc::clone(&bind));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIMER_TICK);
            let mut out = vec![0u8; MAX_PACKET];
            loop {
                ticker.tick().await;
                let output = timers(&st, &mut out);
                send_all(&b, output.network).await;
            }
        }));

        info!("🧵 Created user-space WireGuard device {}", name);
        Ok(Arc::new(Self {
            name: name.to_string(),
            state,
            bind,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn bind(&self) -> Arc<Bind> {
        Arc::clone(&self.bind)
    }
}

#[async_trait]
impl DeviceHandle for UserDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Device {
        self.state.lock().snapshot()
    }

    async fn configure(&self, cfg: &DeviceConfig) -> Result<()> {
        let mut target = self.snapshot();
        let old_port = target.listen_port;
        target.apply(cfg);

        if target.listen_port != old_port || self.bind.sockets.read().is_empty() {
            target.listen_port = self
                .bind
                .bind(target.listen_port)
                .with_context(|| format!("failed to bind port {}", target.listen_port))?;
            debug!("intf={} Listening on port {}", self.name, target.listen_port);
        }

        self.state.lock().reconcile(target);
        Ok(())
    }

    async fn close(&self) {
        for t in self.tasks.lock().drain(..) {
            t.abort();
        }
        self.bind.close();
        info!("Closed user-space WireGuard device {}", self.name);
    }

    fn ice_bind(&self) -> Option<Arc<Bind>> {
        Some(self.bind())
    }
}

fn outbound(state: &Mutex<State>, packet: &[u8], out: &mut [u8]) -> Output {
    let mut output = Output::default();
    let Some(dst) = destination(packet) else {
        return output;
    };

    let mut st = state.lock();
    let Some(i) = st.route(dst) else {
        trace!("No peer for destination {}", dst);
        return output;
    };
    let p = &mut st.peers[i];
    let (Some(tunn), Some(ep)) = (p.tunn.as_mut(), p.info.endpoint) else {
        return output;
    };

    match tunn.encapsulate(packet, out) {
        TunnResult::WriteToNetwork(data) => {
            p.info.tx_bytes += data.len() as u64;
            output.network.push((ep, data.to_vec()));
        }
        TunnResult::Err(e) => debug!("Encapsulation failed: {:?}", e),
        _ => {}
    }
    output
}

fn inbound(state: &Mutex<State>, from: SocketAddr, data: &[u8], out: &mut [u8]) -> Output {
    let mut output = Output::default();
    let mut st = state.lock();

    let candidates: Vec<usize> = match Tunn::parse_incoming_packet(data) {
        Ok(Packet::HandshakeInit(_)) => (0..st.peers.len()).collect(),
        Ok(Packet::HandshakeResponse(p)) => st.by_index(p.receiver_idx).into_iter().collect(),
        Ok(Packet::PacketCookieReply(p)) => st.by_index(p.receiver_idx).into_iter().collect(),
        Ok(Packet::PacketData(p)) => st.by_index(p.receiver_idx).into_iter().collect(),
        Err(e) => {
            trace!("Invalid WireGuard packet from {}: {:?}", from, e);
            return output;
        }
        #[allow(unreachable_patterns)]
        Ok(_) => return output,
    };

    for i in candidates {
        let p = &mut st.peers[i];
        let Some(tunn) = p.tunn.as_mut() else { continue };

        let mut matched = false;
        let mut res = tunn.decapsulate(Some(from.ip()), data, out);
        loop {
            match res {
                TunnResult::Done => {
                    matched = true;
                    break;
                }
                TunnResult::Err(_) => break,
                TunnResult::WriteToNetwork(pkt) => {
                    matched = true;
                    output.network.push((from, pkt.to_vec()));
                    // Flush packets queued while the handshake was pending
                    res = tunn.decapsulate(None, &[], out);
                }
                TunnResult::WriteToTunnelV4(pkt, _) | TunnResult::WriteToTunnelV6(pkt, _) => {
                    matched = true;
                    output.tunnel.push(pkt.to_vec());
                    break;
                }
            }
        }

        if matched {
            p.info.rx_bytes += data.len() as u64;
            if p.info.endpoint != Some(from) {
                debug!("peer={} Endpoint roamed to {}", p.info.public_key, from);
                p.info.endpoint = Some(from);
            }
            st.refresh_handshake(i);
            break;
        }
    }
    output
}

fn timers(state: &Mutex<State>, out: &mut [u8]) -> Output {
    let mut output = Output::default();
    let mut st = state.lock();
    for i in 0..st.peers.len() {
        let p = &mut st.peers[i];
        let Some(tunn) = p.tunn.as_mut() else { continue };
        match tunn.update_timers(out) {
            TunnResult::WriteToNetwork(pkt) => {
                if let Some(ep) = p.info.endpoint {
                    output.network.push((ep, pkt.to_vec()));
                }
            }
            TunnResult::Err(e) => trace!("peer={} Timer error: {:?}", p.info.public_key, e),
            _ => {}
        }
        st.refresh_handshake(i);
    }
    output
}

async fn send_all(bind: &Bind, network: Vec<Datagram>) {
    for (to, pkt) in network {
        if let Err(e) = bind.send(to, &pkt).await {
            trace!("Send to {} failed: {}", to, e);
        }
    }
}

async fn network_loop(
    state: Arc<Mutex<State>>,
    bind: Arc<Bind>,
    mut rx: mpsc::Receiver<Datagram>,
    mut writer: WriteHalf<tun::AsyncDevice>,
) {
    let mut out = vec![0u8; MAX_PACKET];
    while let Some((from, data)) = rx.recv().await {
        let output = inbound(&state, from, &data, &mut out);
        send_all(&bind, output.network).await;
        for pkt in output.tunnel {
            if let Err(e) = writer.write_all(&pkt).await {
                warn!("TUN write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(sk: Key, peers: &[(Key, &str)]) -> Device {
        let mut d = State::new("wg-test").device;
        d.private_key = sk;
        d.public_key = sk.public_key();
        d.peers = peers
            .iter()
            .map(|(pk, net)| {
                let mut p = Peer::new(*pk);
                p.allowed_ips = vec![net.parse().unwrap()];
                p
            })
            .collect();
        d
    }

    #[test]
    fn test_destination() {
        let mut v4 = vec![0u8; 20];
        v4[0] = 0x45;
        v4[16..20].copy_from_slice(&[10, 237, 0, 9]);
        assert_eq!(destination(&v4), Some("10.237.0.9".parse().unwrap()));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6[24] = 0xfc;
        v6[39] = 1;
        assert_eq!(destination(&v6), Some("fc00::1".parse().unwrap()));

        assert_eq!(destination(&v4[..10]), None);
        assert_eq!(destination(&[]), None);
    }

    #[test]
    fn test_reconcile_keeps_sessions() {
        let sk = Key::generate_private();
        let a = Key::generate_private().public_key();
        let b = Key::generate_private().public_key();

        let mut st = State::new("wg-test");
        st.reconcile(target(sk, &[(a, "10.0.0.0/16"), (b, "10.0.1.0/24")]));
        assert_eq!(st.peers.len(), 2);
        assert!(st.peers.iter().all(|p| p.tunn.is_some()));
        let index_a = st.peers[0].index;
        st.peers[0].info.rx_bytes = 99;

        // Longest prefix wins
        assert_eq!(st.route("10.0.1.5".parse().unwrap()), Some(1));
        assert_eq!(st.route("10.0.2.5".parse().unwrap()), Some(0));
        assert_eq!(st.route("192.168.0.1".parse().unwrap()), None);

        // Same keys: session and counters survive
        st.reconcile(target(sk, &[(a, "10.0.0.0/16")]));
        assert_eq!(st.peers.len(), 1);
        assert_eq!(st.peers[0].index, index_a);
        assert_eq!(st.peers[0].info.rx_bytes, 99);
        assert_eq!(st.by_index(index_a << 8 | 3), Some(0));

        // New private key: fresh session
        st.reconcile(target(Key::generate_private(), &[(a, "10.0.0.0/16")]));
        assert_ne!(st.peers[0].index, index_a);
        assert_eq!(st.snapshot().peers[0].rx_bytes, 0);
    }

    #[test]
    fn test_no_sessions_without_private_key() {
        let mut st = State::new("wg-test");
        let a = Key::generate_private().public_key();
        st.reconcile(target(Key::ZERO, &[(a, "10.0.0.0/16")]));
        assert!(st.peers[0].tunn.is_none());
    }

    #[tokio::test]
    async fn test_bind_sockets() {
        let (tx, mut rx) = mpsc::channel(8);
        let bind = Bind::new(tx);
        let port = bind.bind(0).unwrap();
        assert_ne!(port, 0);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        bind.send(peer_addr, b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.port(), port);

        peer.send_to(b"back", ("127.0.0.1", port)).await.unwrap();
        let (src, data) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src, peer_addr);
        assert_eq!(data, b"back");

        bind.close();
        assert!(bind.send(peer_addr, b"x").await.is_err());
    }
}
