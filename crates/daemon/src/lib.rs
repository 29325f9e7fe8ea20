//! # icewire
//!
//! WireGuard overlay daemon. Augments existing WireGuard interfaces with
//! ICE based endpoint discovery, community peer discovery, route and hosts
//! synchronization.
//!
//! ## Key Components
//!
//! ### Peer lifecycle
//! - [`Watcher`] - Diffs WireGuard devices and peers into events
//! - [`ManagedInterface`] - Runs the features of one interface in order
//! - [`Daemon`] - Supervisor owning all interfaces and the signaling backends
//!
//! ### Features
//! - [`EndpointDiscovery`] - One ICE agent per peer, bridged to WireGuard by a [`Proxy`]
//! - [`PeerDiscovery`] - Exchanges peer descriptions on a community channel
//! - [`RouteSync`] - Mirrors AllowedIPs into the kernel routing table and back
//! - [`AutoConfig`] - Keys, ports, key-derived addresses, MTU and link state
//! - [`ConfigSync`] - Applies wg-quick configuration files to the device
//! - [`HostsSync`] - Peer names in the hosts file
//! - [`Hooks`] - Exec and web hooks on peer events
//!
//! ### Signaling
//! - [`MultiBackend`] - Publish/subscribe over HTTP, multicast and in-process brokers
//! - [`Broker`] - Built-in HTTP broker
//!
//! ## Example
//!
//! ```rust,ignore
//! use icewire::{Client, Config, Daemon};
//! use std::sync::Arc;
//!
//! let config = Config::load("/etc/icewire/config.toml")?;
//! let daemon = Daemon::new(config, Arc::new(Client::new())).await?;
//! daemon.run().await?;
//! ```

pub mod autocfg;
pub mod backoff;
pub mod cfgsync;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod epdisc;
pub mod error;
pub mod hooks;
pub mod hsync;
pub mod http;
pub mod ice;
pub mod interface;
pub mod link;
pub mod metrics;
pub mod nat;
pub mod pdisc;
pub mod proxy;
pub mod rtsync;
pub mod signaling;
pub mod userspace;
pub mod watcher;
pub mod wg;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{Config, DaemonConfig, HookSettings, IceSettings, InterfaceSettings, SignalingConfig};

// ============================================================================
// Keys and errors
// ============================================================================

pub use crypto::{Key, KeyPair, KeyPassphrase, PublicKeyPair};
pub use error::{PlatformError, SignalingError};

// ============================================================================
// Supervisor
// ============================================================================

pub use daemon::Daemon;
pub use interface::{Feature, Interface, InterfaceSummary, ManagedInterface, PeerSummary};
pub use metrics::Metrics;
pub use watcher::{Event, Watcher};

// ============================================================================
// Features
// ============================================================================

pub use autocfg::AutoConfig;
pub use cfgsync::ConfigSync;
pub use epdisc::{EndpointDiscovery, PeerState, PeerStatus};
pub use hooks::Hooks;
pub use hsync::HostsSync;
pub use pdisc::PeerDiscovery;
pub use rtsync::RouteSync;

// ============================================================================
// ICE and proxies
// ============================================================================

pub use ice::{Agent, AgentConfig, Candidate, CandidateType, IceConn, NetworkType, UdpMux};
pub use proxy::{Proxy, ProxyType};

// ============================================================================
// Signaling
// ============================================================================

pub use signaling::{Broker, MultiBackend, PeerDescription};

// ============================================================================
// WireGuard
// ============================================================================

pub use userspace::UserDevice;
pub use wg::{Client, Device, DeviceConfig, Peer, PeerConfig, Reachability};
