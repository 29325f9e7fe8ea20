//! WireGuard client.
//!
//! Kernel devices are read with `wg show all dump` and changed with `wg set`.
//! Private and preshared keys are written to the tool's stdin so they never
//! appear in the process list. User-space devices created by this daemon are
//! kept in an in-process registry and configured directly.
//!
//! All mutations go through one [`Client`] and are serialized by its lock.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ipnet::IpNet;
use log::{debug, trace};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::crypto::Key;
use crate::error::PlatformError;
use crate::link;

/// A handshake older than this no longer counts as a live session.
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(120);

/// Snapshot of a WireGuard device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(skip)]
    pub private_key: Key,
    pub public_key: Key,
    pub listen_port: u16,
    pub fwmark: u32,
    pub userspace: bool,
    pub peers: Vec<Peer>,
}

/// Snapshot of a WireGuard peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub public_key: Key,
    /// Name learned through peer discovery or configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip)]
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub persistent_keepalive: u16,
    pub protocol_version: u32,
}

/// How a peer is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    None,
    Direct,
    Relayed,
    RelayedBidir,
}

impl Peer {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            name: None,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            persistent_keepalive: 0,
            protocol_version: 1,
        }
    }

    /// Reachability as seen by WireGuard alone.
    pub fn reachability(&self, now: DateTime<Utc>) -> Reachability {
        if self.endpoint.is_none() {
            return Reachability::None;
        }
        match self.last_handshake {
            Some(hs) => match now.signed_duration_since(hs).to_std() {
                Ok(age) if age < REKEY_TIMEOUT => Reachability::Direct,
                Err(_) => Reachability::Direct,
                _ => Reachability::None,
            },
            None => Reachability::None,
        }
    }
}

impl Device {
    pub fn peer(&self, pk: &Key) -> Option<&Peer> {
        self.peers.iter().find(|p| p.public_key == *pk)
    }

    /// Apply `cfg` the way the kernel does.
    pub fn apply(&mut self, cfg: &DeviceConfig) {
        if let Some(sk) = cfg.private_key {
            self.private_key = sk;
            self.public_key = sk.public_key();
        }
        if let Some(port) = cfg.listen_port {
            self.listen_port = port;
        }
        if let Some(mark) = cfg.fwmark {
            self.fwmark = mark;
        }
        if cfg.replace_peers {
            self.peers.retain(|p| cfg.peers.iter().any(|c| c.public_key == p.public_key && !c.remove));
        }

        for pc in &cfg.peers {
            let pos = self.peers.iter().position(|p| p.public_key == pc.public_key);
            if pc.remove {
                if let Some(i) = pos {
                    self.peers.remove(i);
                }
                continue;
            }
            let peer = match pos {
                Some(i) => &mut self.peers[i],
                None if pc.update_only => continue,
                None => {
                    self.peers.push(Peer::new(pc.public_key));
                    let last = self.peers.len() - 1;
                    &mut self.peers[last]
                }
            };
            if let Some(psk) = pc.preshared_key {
                peer.preshared_key = psk.is_set().then_some(psk);
            }
            if let Some(ep) = pc.endpoint {
                peer.endpoint = Some(ep);
            }
            if let Some(ka) = pc.persistent_keepalive {
                peer.persistent_keepalive = ka;
            }
            if let Some(ips) = &pc.allowed_ips {
                peer.allowed_ips = ips.clone();
            }
        }
    }
}

/// Device changes; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    /// Remove all peers not listed in `peers`
    pub replace_peers: bool,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: Key,
    pub remove: bool,
    /// Skip the change if the peer does not exist
    pub update_only: bool,
    /// `Some(Key::ZERO)` clears the preshared key
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    /// Replaces the allowed IPs when set
    pub allowed_ips: Option<Vec<IpNet>>,
}

impl PeerConfig {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            remove: false,
            update_only: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            allowed_ips: None,
        }
    }

    pub fn remove(public_key: Key) -> Self {
        Self {
            remove: true,
            ..Self::new(public_key)
        }
    }
}

impl DeviceConfig {
    pub fn peer(pc: PeerConfig) -> Self {
        Self {
            peers: vec![pc],
            ..Default::default()
        }
    }
}

/// A WireGuard device configured in-process.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    fn name(&self) -> &str;

    fn snapshot(&self) -> Device;

    async fn configure(&self, cfg: &DeviceConfig) -> Result<()>;

    async fn close(&self);

    /// UDP bind able to carry ICE connections, if the device has one.
    fn ice_bind(&self) -> Option<Arc<crate::userspace::Bind>> {
        None
    }
}

/// Single entry point for reading and changing WireGuard devices.
pub struct Client {
    kernel: bool,
    local: RwLock<HashMap<String, Arc<dyn DeviceHandle>>>,
    lock: Mutex<()>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Client for kernel and in-process devices.
    pub fn new() -> Self {
        Self {
            kernel: cfg!(target_os = "linux"),
            local: RwLock::new(HashMap::new()),
            lock: Mutex::new(()),
        }
    }

    /// Client that only knows in-process devices.
    pub fn local_only() -> Self {
        Self {
            kernel: false,
            ..Self::new()
        }
    }

    /// Whether kernel devices are managed through the `wg` tool.
    pub fn has_kernel(&self) -> bool {
        self.kernel
    }

    pub fn register(&self, dev: Arc<dyn DeviceHandle>) {
        debug!("Registered in-process device {}", dev.name());
        self.local.write().insert(dev.name().to_string(), dev);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn DeviceHandle>> {
        self.local.write().remove(name)
    }

    pub fn local_device(&self, name: &str) -> Option<Arc<dyn DeviceHandle>> {
        self.local.read().get(name).cloned()
    }

    pub fn is_local(&self, name: &str) -> bool {
        self.local.read().contains_key(name)
    }

    /// All devices. Kernel devices are skipped where `wg` is unavailable.
    pub async fn devices(&self) -> Result<Vec<Device>> {
        let mut out: Vec<Device> = self.local.read().values().map(|d| d.snapshot()).collect();
        if self.kernel {
            match wg(&["show", "all", "dump"], None).await {
                Ok(dump) => {
                    let kernel = parse_dump(&dump)?;
                    out.extend(kernel.into_iter().filter(|d| !self.is_local(&d.name)));
                }
                Err(PlatformError::NotSupported) => trace!("wg tool not available"),
                Err(e) => return Err(e).context("failed to list WireGuard devices"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn device(&self, name: &str) -> Result<Device> {
        if let Some(d) = self.local_device(name) {
            return Ok(d.snapshot());
        }
        if !self.kernel {
            return Err(PlatformError::NotFound.into());
        }
        let dump = wg(&["show", name, "dump"], None).await?;
        let dump = prefix_lines(name, &dump);
        parse_dump(&dump)?
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::NotFound.into())
    }

    pub async fn configure_device(&self, name: &str, cfg: &DeviceConfig) -> Result<()> {
        let _guard = self.lock.lock().await;

        if let Some(d) = self.local_device(name) {
            return d.configure(cfg).await;
        }
        if !self.kernel {
            return Err(PlatformError::NotSupported.into());
        }

        if cfg.replace_peers {
            let current = self.device(name).await?;
            for p in &current.peers {
                if !cfg.peers.iter().any(|c| c.public_key == p.public_key) {
                    wg(&["set", name, "peer", &p.public_key.to_string(), "remove"], None).await?;
                }
            }
        }

        let (args, stdin) = device_args(name, cfg);
        if args.len() > 2 {
            run_set(&args, stdin).await?;
        }

        for pc in &cfg.peers {
            if pc.update_only && !pc.remove {
                let current = self.device(name).await?;
                if current.peer(&pc.public_key).is_none() {
                    continue;
                }
            }
            let (args, stdin) = peer_args(name, pc);
            run_set(&args, stdin).await?;
        }
        Ok(())
    }

    /// Point an existing peer at `endpoint`.
    pub async fn set_endpoint(&self, name: &str, pk: &Key, endpoint: SocketAddr) -> Result<()> {
        let pc = PeerConfig {
            update_only: true,
            endpoint: Some(endpoint),
            ..PeerConfig::new(*pk)
        };
        self.configure_device(name, &DeviceConfig::peer(pc)).await
    }

    pub async fn remove_peer(&self, name: &str, pk: &Key) -> Result<()> {
        self.configure_device(name, &DeviceConfig::peer(PeerConfig::remove(*pk)))
            .await
    }
}

async fn run_set(args: &[String], stdin: Option<String>) -> Result<()> {
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    wg(&refs, stdin.as_deref()).await?;
    Ok(())
}

fn device_args(name: &str, cfg: &DeviceConfig) -> (Vec<String>, Option<String>) {
    let mut args = vec!["set".to_string(), name.to_string()];
    let mut stdin = None;
    if let Some(port) = cfg.listen_port {
        args.extend(["listen-port".to_string(), port.to_string()]);
    }
    if let Some(mark) = cfg.fwmark {
        let v = if mark == 0 { "off".to_string() } else { mark.to_string() };
        args.extend(["fwmark".to_string(), v]);
    }
    if let Some(sk) = cfg.private_key {
        args.extend(["private-key".to_string(), "/dev/stdin".to_string()]);
        stdin = Some(sk.to_string());
    }
    (args, stdin)
}

fn peer_args(name: &str, pc: &PeerConfig) -> (Vec<String>, Option<String>) {
    let mut args = vec![
        "set".to_string(),
        name.to_string(),
        "peer".to_string(),
        pc.public_key.to_string(),
    ];
    if pc.remove {
        args.push("remove".to_string());
        return (args, None);
    }

    let mut stdin = None;
    if let Some(psk) = pc.preshared_key {
        args.extend(["preshared-key".to_string(), "/dev/stdin".to_string()]);
        stdin = Some(if psk.is_set() { psk.to_string() } else { String::new() });
    }
    if let Some(ep) = pc.endpoint {
        args.extend(["endpoint".to_string(), ep.to_string()]);
    }
    if let Some(ka) = pc.persistent_keepalive {
        args.extend(["persistent-keepalive".to_string(), ka.to_string()]);
    }
    if let Some(ips) = &pc.allowed_ips {
        let list: Vec<String> = ips.iter().map(|n| n.to_string()).collect();
        args.extend(["allowed-ips".to_string(), list.join(",")]);
    }
    (args, stdin)
}

async fn wg(args: &[&str], stdin: Option<&str>) -> Result<String, PlatformError> {
    link::run("wg", args, stdin).await
}

/// `wg show <name> dump` omits the interface column that `show all` has.
fn prefix_lines(name: &str, dump: &str) -> String {
    dump.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| format!("{name}\t{l}\n"))
        .collect()
}

/// Parse the output of `wg show all dump`.
pub fn parse_dump(dump: &str) -> Result<Vec<Device>> {
    let mut devices: Vec<Device> = Vec::new();

    for (lineno, line) in dump.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let f: Vec<&str> = line.split('\t').collect();
        match f.len() {
            5 => {
                let private_key = parse_optional_key(f[1])?.unwrap_or(Key::ZERO);
                devices.push(Device {
                    name: f[0].to_string(),
                    private_key,
                    public_key: parse_optional_key(f[2])?.unwrap_or(Key::ZERO),
                    listen_port: f[3].parse().unwrap_or(0),
                    fwmark: parse_off(f[4])?,
                    userspace: false,
                    peers: Vec::new(),
                });
            }
            9 => {
                let Some(dev) = devices.last_mut().filter(|d| d.name == f[0]) else {
                    bail!("line {}: peer of unknown device {}", lineno + 1, f[0]);
                };
                let handshake: i64 = f[5].parse().context("invalid latest-handshake")?;
                dev.peers.push(Peer {
                    public_key: f[1].parse().context("invalid peer key")?,
                    name: None,
                    preshared_key: parse_optional_key(f[2])?,
                    endpoint: parse_endpoint(f[3]),
                    allowed_ips: parse_allowed_ips(f[4])?,
                    last_handshake: (handshake > 0)
                        .then(|| Utc.timestamp_opt(handshake, 0).single())
                        .flatten(),
                    rx_bytes: f[6].parse().context("invalid transfer-rx")?,
                    tx_bytes: f[7].parse().context("invalid transfer-tx")?,
                    persistent_keepalive: parse_off(f[8])? as u16,
                    protocol_version: 1,
                });
            }
            n => bail!("line {}: unexpected field count {}", lineno + 1, n),
        }
    }
    Ok(devices)
}

fn parse_optional_key(s: &str) -> Result<Option<Key>> {
    match s {
        "(none)" | "" => Ok(None),
        s => Ok(Some(s.parse().context("invalid key")?)),
    }
}

fn parse_off(s: &str) -> Result<u32> {
    match s {
        "off" => Ok(0),
        s if s.starts_with("0x") => {
            u32::from_str_radix(&s[2..], 16).with_context(|| format!("invalid number {s:?}"))
        }
        s => s.parse().with_context(|| format!("invalid number {s:?}")),
    }
}

fn parse_endpoint(s: &str) -> Option<SocketAddr> {
    if s == "(none)" {
        return None;
    }
    match s.parse() {
        Ok(ep) => Some(ep),
        Err(_) => {
            // Scoped IPv6 endpoints ([fe80::1%eth0]:51820) cannot be represented
            debug!("Ignoring unparsable endpoint {:?}", s);
            None
        }
    }
}

fn parse_allowed_ips(s: &str) -> Result<Vec<IpNet>> {
    if s == "(none)" || s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|n| n.trim().parse::<IpNet>().with_context(|| format!("invalid allowed ip {n:?}")))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory device that records how often it was configured.
    pub struct MemoryDevice {
        name: String,
        pub device: parking_lot::Mutex<Device>,
        pub calls: AtomicUsize,
    }

    impl MemoryDevice {
        pub fn new(name: &str, listen_port: u16) -> Arc<Self> {
            let sk = Key::generate_private();
            Arc::new(Self {
                name: name.to_string(),
                device: parking_lot::Mutex::new(Device {
                    name: name.to_string(),
                    private_key: sk,
                    public_key: sk.public_key(),
                    listen_port,
                    fwmark: 0,
                    userspace: true,
                    peers: Vec::new(),
                }),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn snapshot_device(&self) -> Device {
            self.device.lock().clone()
        }
    }

    #[async_trait]
    impl DeviceHandle for MemoryDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn snapshot(&self) -> Device {
            self.device.lock().clone()
        }

        async fn configure(&self, cfg: &DeviceConfig) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.device.lock().apply(cfg);
            Ok(())
        }

        async fn close(&self) {}
    }
}
