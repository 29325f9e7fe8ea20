use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::crypto::{Key, KeyPassphrase};
use crate::ice::{CandidateType, NetworkType};

/// Top-level configuration for the icewire daemon.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    /// Defaults applied to every interface without its own section.
    #[serde(default)]
    pub interface: InterfaceSettings,
    /// Per-interface settings. Listed interfaces are created on start.
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceSettings>,
}

/// Daemon runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Interval of the periodic WireGuard device scan
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
    /// Glob on interface names the daemon manages
    #[serde(default = "default_filter")]
    pub interface_filter: String,
    /// Port of the /metrics, /health and /status endpoint (0 disables it)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Listen address of the built-in HTTP signaling broker
    #[serde(default)]
    pub broker_listen: Option<String>,
    /// Time an offer is kept by the built-in broker
    #[serde(default = "default_broker_ttl")]
    pub broker_ttl_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            watch_interval_secs: default_watch_interval(),
            interface_filter: default_filter(),
            http_port: default_http_port(),
            broker_listen: None,
            broker_ttl_secs: default_broker_ttl(),
        }
    }
}

impl DaemonConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn broker_ttl(&self) -> Duration {
        Duration::from_secs(self.broker_ttl_secs)
    }
}

/// Signaling backends, as URIs.
///
/// ```toml
/// [signaling]
/// backends = ["https://broker.example.com/?interval=2", "multicast://[ff02::1:6a]:5353"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

/// Settings of a single WireGuard interface and its features.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceSettings {
    #[serde(default)]
    pub private_key: Option<Key>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default = "default_listen_port_range")]
    pub listen_port_range: PortRange,
    #[serde(default)]
    pub fwmark: Option<u32>,
    #[serde(default)]
    pub mtu: Option<u32>,
    /// Create a user-space device even if the kernel module is loaded
    #[serde(default)]
    pub userspace: bool,

    /// Prefixes for key-derived addresses
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<IpNet>,
    /// Additional static addresses of this node
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// Networks routed via this node, advertised to other peers
    #[serde(default)]
    pub networks: Vec<IpNet>,
    /// Name of the routing table used for route sync
    #[serde(default = "default_routing_table")]
    pub routing_table: String,

    /// Name advertised to other peers (defaults to the hostname)
    #[serde(default)]
    pub hostname: Option<String>,
    /// Domain suffix appended to hostnames in the hosts file
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_hosts_path")]
    pub hosts_path: String,
    #[serde(default)]
    pub extra_hosts: BTreeMap<String, Vec<IpAddr>>,

    #[serde(default = "default_true")]
    pub auto_config: bool,
    /// Apply `<config_path>/<name>.conf` to the device
    #[serde(default)]
    pub sync_config: bool,
    /// Directory of wg-quick style configuration files
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default = "default_true")]
    pub sync_routes: bool,
    #[serde(default = "default_true")]
    pub watch_routes: bool,
    #[serde(default = "default_true")]
    pub sync_hosts: bool,
    #[serde(default = "default_true")]
    pub discover_peers: bool,
    #[serde(default = "default_true")]
    pub discover_endpoints: bool,

    #[serde(default)]
    pub ice: IceSettings,
    #[serde(default)]
    pub pdisc: PeerDiscoverySettings,
    #[serde(default)]
    pub peers: Vec<PeerSettings>,
    #[serde(default)]
    pub hooks: Vec<HookSettings>,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            private_key: None,
            listen_port: None,
            listen_port_range: default_listen_port_range(),
            fwmark: None,
            mtu: None,
            userspace: false,
            prefixes: default_prefixes(),
            addresses: Vec::new(),
            networks: Vec::new(),
            routing_table: default_routing_table(),
            hostname: None,
            domain: String::new(),
            hosts_path: default_hosts_path(),
            extra_hosts: BTreeMap::new(),
            auto_config: true,
            sync_config: false,
            config_path: default_config_path(),
            sync_routes: true,
            watch_routes: true,
            sync_hosts: true,
            discover_peers: true,
            discover_endpoints: true,
            ice: IceSettings::default(),
            pdisc: PeerDiscoverySettings::default(),
            peers: Vec::new(),
            hooks: Vec::new(),
        }
    }
}

impl InterfaceSettings {
    /// Name advertised via peer discovery.
    pub fn advertised_name(&self) -> String {
        self.hostname.clone().unwrap_or_else(system_hostname)
    }
}

/// ICE agent settings.
///
/// Timing defaults:
/// - check interval: 200ms
/// - disconnected after 5s without traffic, failed after 25s
/// - keepalive every 2s on the selected pair
#[derive(Debug, Clone, Deserialize)]
pub struct IceSettings {
    /// STUN servers (`stun:host:port`)
    #[serde(default = "default_ice_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_candidate_types")]
    pub candidate_types: Vec<CandidateType>,
    #[serde(default = "default_network_types")]
    pub network_types: Vec<NetworkType>,
    /// Glob on local interface names used for host candidates
    #[serde(default = "default_filter")]
    pub interface_filter: String,
    #[serde(default = "default_ice_port_range")]
    pub port_range: PortRange,

    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
    #[serde(default = "default_disconnected_timeout")]
    pub disconnected_timeout_secs: u64,
    #[serde(default = "default_failed_timeout")]
    pub failed_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_max_binding_requests")]
    pub max_binding_requests: u32,
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,
}

impl Default for IceSettings {
    fn default() -> Self {
        Self {
            urls: default_ice_urls(),
            candidate_types: default_candidate_types(),
            network_types: default_network_types(),
            interface_filter: default_filter(),
            port_range: default_ice_port_range(),
            check_interval_ms: default_check_interval(),
            disconnected_timeout_secs: default_disconnected_timeout(),
            failed_timeout_secs: default_failed_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            max_binding_requests: default_max_binding_requests(),
            restart_timeout_secs: default_restart_timeout(),
        }
    }
}

impl IceSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(10))
    }

    pub fn disconnected_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnected_timeout_secs)
    }

    pub fn failed_timeout(&self) -> Duration {
        Duration::from_secs(self.failed_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    pub fn has_candidate_type(&self, t: CandidateType) -> bool {
        self.candidate_types.contains(&t)
    }
}

/// Peer discovery settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PeerDiscoverySettings {
    /// Shared community secret (base64 key or passphrase)
    #[serde(default)]
    pub community: Option<KeyPassphrase>,
    /// Only accept these peers (empty accepts everyone)
    #[serde(default)]
    pub whitelist: Vec<Key>,
    #[serde(default)]
    pub blacklist: Vec<Key>,
}

/// Statically configured peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerSettings {
    pub public_key: Key,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preshared_key: Option<Key>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
}

/// External hook invoked on peer and connection events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HookSettings {
    Exec {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Pass the event as JSON on stdin
        #[serde(default = "default_true")]
        stdin: bool,
    },
    Web {
        url: String,
        #[serde(default = "default_hook_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

fn default_watch_interval() -> u64 {
    1
}
fn default_filter() -> String {
    "*".to_string()
}
fn default_http_port() -> u16 {
    9090
}
fn default_broker_ttl() -> u64 {
    300
}
fn default_backends() -> Vec<String> {
    vec!["http://127.0.0.1:8080/".to_string()]
}
fn default_listen_port_range() -> PortRange {
    PortRange {
        min: 51820,
        max: 65535,
    }
}
fn default_prefixes() -> Vec<IpNet> {
    ["fc2f:9a4d::/32", "10.237.0.0/16"]
        .iter()
        .filter_map(|p| p.parse().ok())
        .collect()
}
fn default_routing_table() -> String {
    "main".to_string()
}
fn default_hosts_path() -> String {
    "/etc/hosts".to_string()
}
fn default_config_path() -> String {
    "/etc/wireguard".to_string()
}
fn default_true() -> bool {
    true
}
fn default_ice_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_candidate_types() -> Vec<CandidateType> {
    vec![
        CandidateType::Host,
        CandidateType::ServerReflexive,
        CandidateType::PeerReflexive,
        CandidateType::Relay,
    ]
}
fn default_network_types() -> Vec<NetworkType> {
    vec![NetworkType::Udp4, NetworkType::Udp6]
}
fn default_ice_port_range() -> PortRange {
    PortRange {
        min: 49152,
        max: 65535,
    }
}
fn default_check_interval() -> u64 {
    200
}
fn default_disconnected_timeout() -> u64 {
    5
}
fn default_failed_timeout() -> u64 {
    25
}
fn default_keepalive_interval() -> u64 {
    2
}
fn default_max_binding_requests() -> u32 {
    7
}
fn default_restart_timeout() -> u64 {
    10
}
fn default_hook_method() -> String {
    "POST".to_string()
}

/// Host name of this machine.
pub fn system_hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = ["~/.icewire/config.toml", "/etc/icewire/config.toml", "./icewire.toml"];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }

    /// Settings for the interface `name`.
    pub fn interface_settings(&self, name: &str) -> InterfaceSettings {
        self.interfaces
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.interface.clone())
    }

    /// Validate values that serde cannot check.
    pub fn check(&self) -> Result<()> {
        glob::Pattern::new(&self.daemon.interface_filter)
            .with_context(|| format!("invalid interface filter {:?}", self.daemon.interface_filter))?;

        if self.signaling.backends.is_empty() {
            bail!("at least one signaling backend is required");
        }
        for uri in &self.signaling.backends {
            let url = url::Url::parse(uri).with_context(|| format!("invalid backend uri {uri:?}"))?;
            match url.scheme() {
                "http" | "https" | "inprocess" | "multicast" => {}
                s if crate::signaling::KNOWN_SCHEMES.contains(&s) => {
                    bail!("backend scheme {s:?} is not supported by this build");
                }
                s => bail!("unknown backend scheme {s:?} in {uri:?}"),
            }
        }

        let sections = std::iter::once(("<default>", &self.interface))
            .chain(self.interfaces.iter().map(|(n, s)| (n.as_str(), s)));
        for (name, s) in sections {
            check_interface(s).with_context(|| format!("interface {name}"))?;
        }

        Ok(())
    }
}

fn check_interface(s: &InterfaceSettings) -> Result<()> {
    for (what, r) in [("listen_port_range", s.listen_port_range), ("ice.port_range", s.ice.port_range)] {
        if r.min == 0 || r.min > r.max {
            bail!("{what}: invalid range {}-{}", r.min, r.max);
        }
    }
    if s.listen_port == Some(0) {
        bail!("listen_port must be in 1-65535");
    }
    if s.ice.failed_timeout_secs < s.ice.disconnected_timeout_secs {
        bail!("ice.failed_timeout_secs must not be shorter than ice.disconnected_timeout_secs");
    }
    glob::Pattern::new(&s.ice.interface_filter)
        .with_context(|| format!("invalid ice.interface_filter {:?}", s.ice.interface_filter))?;
    for u in &s.ice.urls {
        crate::ice::StunUrl::parse(u)?;
    }
    if let Some(m) = s.mtu {
        if m < 1280 {
            bail!("mtu {m} is below the IPv6 minimum of 1280");
        }
    }
    Ok(())
}
