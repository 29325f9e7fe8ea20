//! Top-level supervisor
//!
//! The [`Daemon`] owns the WireGuard client, the signaling backends and one
//! [`ManagedInterface`] per device the watcher reports. It runs the watcher
//! loop and fans link events out to the interfaces.
//!
//! ### Triggers
//! - periodic tick (`daemon.watch_interval_secs`)
//! - explicit sync requests from features
//! - `SIGUSR1`
//! - link changes from the kernel monitor
//!
//! `SIGINT`/`SIGTERM` close all interfaces in reverse feature order, delete the
//! interfaces the daemon created and close the signaling backends.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::autocfg::AutoConfig;
use crate::cfgsync::{self, ConfigSync};
use crate::config::{Config, InterfaceSettings};
use crate::epdisc::EndpointDiscovery;
use crate::error::is_not_supported;
use crate::hooks::Hooks;
use crate::hsync::HostsSync;
use crate::interface::{Feature, Interface, InterfaceSummary, ManagedInterface};
use crate::link::{self, LinkEvent};
use crate::metrics::Metrics;
use crate::pdisc::PeerDiscovery;
use crate::rtsync::RouteSync;
use crate::signaling::{self, MultiBackend};
use crate::userspace::UserDevice;
use crate::watcher::{Event, Watcher};
use crate::wg::{Client, Device};

pub struct Daemon {
    config: Config,
    client: Arc<Client>,
    metrics: Arc<Metrics>,
    backend: Arc<MultiBackend>,
    watcher: tokio::sync::Mutex<Watcher>,
    filter: glob::Pattern,
    interfaces: RwLock<BTreeMap<String, Arc<ManagedInterface>>>,
    /// Interfaces created by us, deleted again on shutdown.
    created: Mutex<Vec<String>>,
    sync: Arc<Notify>,
}

impl Daemon {
    pub async fn new(config: Config, client: Arc<Client>) -> Result<Arc<Self>> {
        config.check()?;

        let backend = MultiBackend::new(&config.signaling.backends)
            .await
            .context("failed to open signaling backends")?;
        let filter = glob::Pattern::new(&config.daemon.interface_filter)?;
        let metrics = Metrics::new();
        let watcher = Watcher::new(Arc::clone(&client), filter.clone(), Arc::clone(&metrics));

        Ok(Arc::new(Self {
            config,
            client,
            metrics,
            backend: Arc::new(backend),
            watcher: tokio::sync::Mutex::new(watcher),
            filter,
            interfaces: RwLock::new(BTreeMap::new()),
            created: Mutex::new(Vec::new()),
            sync: Arc::new(Notify::new()),
        }))
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn interface(&self, name: &str) -> Option<Arc<ManagedInterface>> {
        self.interfaces.read().get(name).cloned()
    }

    /// Status snapshot of all managed interfaces.
    pub fn statuses(&self) -> Vec<InterfaceSummary> {
        self.interfaces.read().values().map(|mi| mi.summary()).collect()
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.create_interfaces().await?;
        self.create_from_config_files().await;

        if self.config.daemon.http_port != 0 {
            let addr: SocketAddr = ([0, 0, 0, 0], self.config.daemon.http_port).into();
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = crate::http::serve(daemon, addr).await {
                    error!("Status server failed: {:#}", e);
                }
            });
        }

        if let Some(listen) = &self.config.daemon.broker_listen {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("invalid broker listen address {listen:?}"))?;
            let ttl = self.config.daemon.broker_ttl();
            tokio::spawn(async move {
                if let Err(e) = signaling::serve_broker(addr, ttl).await {
                    error!("Signaling broker failed: {:#}", e);
                }
            });
        }

        let mut link_events = match link::monitor() {
            Ok(rx) => Some(rx),
            Err(e) if is_not_supported(&e) => {
                debug!("Link monitor not available, relying on periodic scans");
                None
            }
            Err(e) => return Err(e.context("failed to subscribe to link changes")),
        };

        let result = self.watch(&mut link_events).await;
        self.shutdown().await;
        result
    }

    async fn watch(&self, link_events: &mut Option<mpsc::Receiver<LinkEvent>>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.daemon.watch_interval());
        let mut resync = Resync::new()?;
        let mut shutdown = std::pin::pin!(shutdown_signal());

        info!(
            "👀 Watching interfaces matching {:?} every {:?}",
            self.config.daemon.interface_filter,
            self.config.daemon.watch_interval()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.sync_all().await;
                }
                _ = self.sync.notified() => {
                    self.sync_devices().await;
                }
                _ = resync.recv() => {
                    info!("Received SIGUSR1, resyncing");
                    self.sync_all().await;
                }
                ev = recv_link_event(link_events) => match ev {
                    Some(ev) => self.on_link_event(ev).await,
                    None => {
                        warn!("Link monitor exited, relying on periodic scans");
                        *link_events = None;
                    }
                },
            }
        }
    }

    async fn on_link_event(&self, ev: LinkEvent) {
        match &ev {
            LinkEvent::LinkChanged { name, deleted } => {
                debug!("Link {} changed (deleted={})", name, deleted);
                self.sync_devices().await;
            }
            LinkEvent::RouteAdded(_) | LinkEvent::RouteDeleted(_) => {
                let interfaces: Vec<_> = self.interfaces.read().values().cloned().collect();
                for mi in interfaces {
                    mi.on_link_event(&ev).await;
                }
            }
        }
    }

    /// Restart the ICE sessions of all peers on all interfaces.
    pub fn restart(&self) -> usize {
        let interfaces: Vec<_> = self.interfaces.read().values().cloned().collect();
        let restarted: usize = interfaces.iter().map(|mi| mi.restart()).sum();
        info!("🔄 Restarting {} peer sessions", restarted);
        restarted
    }

    /// Watcher sync followed by a sync of every feature.
    pub async fn sync_all(&self) {
        self.create_from_config_files().await;
        self.sync_devices().await;
        let interfaces: Vec<_> = self.interfaces.read().values().cloned().collect();
        for mi in interfaces {
            mi.sync().await;
        }
    }

    /// Rescan devices and dispatch the resulting events.
    pub async fn sync_devices(&self) {
        let events = match self.watcher.lock().await.sync().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to list WireGuard devices: {:#}", e);
                return;
            }
        };
        for event in &events {
            self.handle(event).await;
        }

        let interfaces: Vec<_> = self.interfaces.read().values().cloned().collect();
        for mi in interfaces {
            mi.dispatch_renames().await;
        }
    }

    async fn handle(&self, event: &Event) {
        match event {
            Event::InterfaceAdded(dev) => {
                if let Err(e) = self.add_interface(dev).await {
                    error!("intf={} Failed to manage interface: {:#}", dev.name, e);
                    // Retry on the next sync
                    self.watcher.lock().await.forget(&dev.name);
                }
            }
            Event::InterfaceRemoved(dev) => {
                let removed = self.interfaces.write().remove(&dev.name);
                if let Some(mi) = removed {
                    mi.close().await;
                    self.metrics.dec_interfaces();
                }
            }
            other => {
                let mi = self.interface(other.interface());
                if let Some(mi) = mi {
                    mi.handle(other).await;
                }
            }
        }
    }

    async fn add_interface(&self, dev: &Device) -> Result<()> {
        let index = if self.client.has_kernel() {
            match link::find(&dev.name).await {
                Ok(l) => l.index,
                Err(e) => {
                    debug!("intf={} No link index: {:#}", dev.name, e);
                    0
                }
            }
        } else {
            0
        };

        let settings = self.config.interface_settings(&dev.name);
        let intf = Interface::new(
            dev.clone(),
            index,
            settings,
            Arc::clone(&self.client),
            Arc::clone(&self.metrics),
            Arc::clone(&self.sync),
        );

        let (features, epdisc) = self.features(&intf).await?;
        let mi = Arc::new(ManagedInterface::new(Arc::clone(&intf), features, epdisc));
        mi.start().await?;
        mi.handle(&Event::InterfaceAdded(dev.clone())).await;

        info!("{} Managing interface (index {})", intf, index);
        self.interfaces.write().insert(dev.name.clone(), mi);
        self.metrics.inc_interfaces();
        Ok(())
    }

    /// Features of an interface in start order.
    ///
    /// Fails if endpoint discovery cannot be set up.
    async fn features(&self, intf: &Arc<Interface>) -> Result<(Vec<Arc<dyn Feature>>, Option<Arc<EndpointDiscovery>>)> {
        let s = &intf.settings;
        let mut features: Vec<Arc<dyn Feature>> = Vec::new();
        let mut epdisc = None;

        if s.auto_config {
            features.push(AutoConfig::new(Arc::clone(intf)));
        }
        if s.sync_config {
            features.push(ConfigSync::new(Arc::clone(intf)));
        }
        if s.sync_routes {
            match RouteSync::new(Arc::clone(intf)) {
                Ok(f) => features.push(f),
                Err(e) => warn!("{} Route sync disabled: {:#}", intf, e),
            }
        }
        if s.discover_endpoints {
            let f = EndpointDiscovery::new(Arc::clone(intf), Arc::clone(&self.backend), &self.managed_names())
                .await
                .context("failed to start endpoint discovery")?;
            epdisc = Some(Arc::clone(&f));
            features.push(f);
        }
        if s.discover_peers {
            match PeerDiscovery::new(Arc::clone(intf), Arc::clone(&self.backend)) {
                Some(f) => features.push(f),
                None => debug!("{} No community configured, peer discovery disabled", intf),
            }
        }
        if s.sync_hosts {
            features.push(HostsSync::new(Arc::clone(intf)));
        }
        match Hooks::new(Arc::clone(intf)) {
            Ok(Some(f)) => features.push(f),
            Ok(None) => {}
            Err(e) => warn!("{} Hooks disabled: {:#}", intf, e),
        }

        Ok((features, epdisc))
    }

    /// Names of all interfaces managed or created by the daemon.
    fn managed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.interfaces.read().keys().cloned().collect();
        for name in self.created.lock().iter() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Create the interfaces listed in the configuration that do not exist yet.
    pub async fn create_interfaces(&self) -> Result<()> {
        for (name, settings) in &self.config.interfaces {
            if self.client.device(name).await.is_ok() {
                debug!("intf={} Interface already exists", name);
                continue;
            }
            self.create_interface(name, settings)
                .await
                .with_context(|| format!("failed to create interface {name}"))?;
            self.created.lock().push(name.clone());
        }
        Ok(())
    }

    /// Create devices for configuration files that have none yet.
    pub async fn create_from_config_files(&self) {
        let settings = &self.config.interface;
        if !settings.sync_config {
            return;
        }
        let names = match cfgsync::config_files(&settings.config_path, &self.filter) {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to list configuration files in {}: {:#}", settings.config_path, e);
                return;
            }
        };

        for name in names {
            if self.config.interfaces.contains_key(&name) || self.client.device(&name).await.is_ok() {
                continue;
            }
            match self.create_interface(&name, &self.config.interface_settings(&name)).await {
                Ok(()) => self.created.lock().push(name),
                Err(e) => warn!("intf={} Failed to create interface from configuration file: {:#}", name, e),
            }
        }
    }

    async fn create_interface(&self, name: &str, settings: &InterfaceSettings) -> Result<()> {
        if !settings.userspace && self.client.has_kernel() {
            match link::create_wireguard(name).await {
                Ok(l) => {
                    info!("🔧 Created kernel WireGuard interface {} (index {})", name, l.index);
                    return Ok(());
                }
                Err(e) if is_not_supported(&e) => {
                    info!("Kernel WireGuard not available, creating user-space interface {}", name);
                }
                Err(e) => return Err(e),
            }
        }
        let dev = UserDevice::create(name).await?;
        self.client.register(dev);
        Ok(())
    }

    /// Close all interfaces and delete the ones we created.
    pub async fn shutdown(&self) {
        let interfaces: Vec<_> = std::mem::take(&mut *self.interfaces.write()).into_values().collect();
        for mi in interfaces.into_iter().rev() {
            mi.close().await;
            self.metrics.dec_interfaces();
        }

        let created: Vec<String> = std::mem::take(&mut *self.created.lock());
        for name in created {
            if let Some(dev) = self.client.unregister(&name) {
                dev.close().await;
                info!("Closed user-space interface {}", name);
            } else if let Err(e) = link::delete(&name).await {
                warn!("Failed to delete interface {}: {:#}", name, e);
            } else {
                info!("Deleted interface {}", name);
            }
        }

        self.backend.close().await;
        info!("👋 Bye");
    }
}

async fn recv_link_event(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// SIGUSR1 listener; never fires where signals are unavailable.
struct Resync {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Resync {
    fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            signal: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
                .context("failed to install SIGUSR1 handler")?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.signal.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            return;
        }
    }

    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Key;
    use crate::wg::testing::MemoryDevice;
    use crate::wg::{DeviceConfig, PeerConfig};

    fn quiet_settings(hosts_path: &std::path::Path) -> InterfaceSettings {
        InterfaceSettings {
            auto_config: false,
            sync_routes: false,
            discover_endpoints: false,
            discover_peers: false,
            hosts_path: hosts_path.to_string_lossy().into_owned(),
            ..InterfaceSettings::default()
        }
    }

    async fn daemon(settings: InterfaceSettings) -> Arc<Daemon> {
        let mut config = Config::default();
        config.signaling.backends = vec!["inprocess:".to_string()];
        config.daemon.interface_filter = "wg-dm*".to_string();
        config.interface = settings;
        Daemon::new(config, Arc::new(Client::local_only())).await.unwrap()
    }

    #[tokio::test]
    async fn test_interface_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon(quiet_settings(&dir.path().join("hosts"))).await;

        let dev = MemoryDevice::new("wg-dm0", 51820);
        d.client.register(dev.clone());
        d.client.register(MemoryDevice::new("other0", 51821));

        d.sync_devices().await;
        let st = d.statuses();
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].name, "wg-dm0");
        assert_eq!(st[0].features, vec!["hsync"]);
        assert!(d.metrics().to_prometheus().contains("icewire_interfaces 1"));

        let pk = Key::generate_private().public_key();
        d.client
            .configure_device("wg-dm0", &DeviceConfig::peer(PeerConfig::new(pk)))
            .await
            .unwrap();
        d.sync_devices().await;
        let st = d.statuses();
        assert_eq!(st[0].peers.len(), 1);
        assert_eq!(st[0].peers[0].public_key, pk);

        d.client.unregister("wg-dm0");
        d.sync_devices().await;
        assert!(d.statuses().is_empty());
        assert!(d.metrics().to_prometheus().contains("icewire_interfaces 0"));
    }

    #[tokio::test]
    async fn test_invalid_hooks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = quiet_settings(&dir.path().join("hosts"));
        settings.sync_hosts = false;
        settings.hooks = vec![crate::config::HookSettings::Web {
            url: "not a url".to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::new(),
        }];
        let d = daemon(settings).await;
        d.client.register(MemoryDevice::new("wg-dm1", 51820));

        // Invalid hooks are skipped, the interface is still managed
        d.sync_devices().await;
        let st = d.statuses();
        assert_eq!(st.len(), 1);
        assert!(st[0].features.is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_discovery_failure_fails_interface() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = quiet_settings(&dir.path().join("hosts"));
        settings.discover_endpoints = true;
        settings.ice.candidate_types = vec![crate::ice::CandidateType::Host];
        settings.ice.network_types = Vec::new();
        let d = daemon(settings).await;
        d.client.register(MemoryDevice::new("wg-dm3", 51820));

        d.sync_devices().await;
        assert!(d.interface("wg-dm3").is_none());
        assert!(d.metrics().to_prometheus().contains("icewire_interfaces 0"));

        // Forgotten by the watcher, so the next sync retries
        d.sync_devices().await;
        assert!(d.interface("wg-dm3").is_none());
    }

    #[tokio::test]
    async fn test_config_file_applied_to_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = quiet_settings(&dir.path().join("hosts"));
        settings.sync_config = true;
        settings.config_path = dir.path().to_string_lossy().into_owned();
        let pk = Key::generate_private().public_key();
        std::fs::write(
            dir.path().join("wg-dm4.conf"),
            format!("[Interface]\nListenPort = 51844\n\n[Peer]\nPublicKey = {pk}\nAllowedIPs = 10.4.0.0/24\n"),
        )
        .unwrap();
        // Not matched by the interface filter
        std::fs::write(dir.path().join("other4.conf"), "[Interface]\n").unwrap();

        let d = daemon(settings).await;
        let dev = MemoryDevice::new("wg-dm4", 51820);
        d.client.register(dev.clone());

        d.sync_all().await;
        let st = d.statuses();
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].features, vec!["cfgsync", "hsync"]);
        assert!(d.created.lock().is_empty());

        let snap = dev.snapshot_device();
        assert_eq!(snap.listen_port, 51844);
        assert_eq!(snap.peer(&pk).unwrap().allowed_ips, vec!["10.4.0.0/24".parse::<ipnet::IpNet>().unwrap()]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_interfaces() {
        let dir = tempfile::tempdir().unwrap();
        let d = daemon(quiet_settings(&dir.path().join("hosts"))).await;
        d.client.register(MemoryDevice::new("wg-dm2", 51820));
        d.sync_devices().await;
        assert!(d.interface("wg-dm2").is_some());

        d.shutdown().await;
        assert!(d.statuses().is_empty());
        // Not created by us
        assert!(d.client.is_local("wg-dm2"));
    }
}
