//! Config-file synchronization
//!
//! Applies a wg-quick style file (`<config_path>/<name>.conf`) to the device
//! when the interface is started and again whenever its contents change.
//! `Address` and `MTU` go to the link. `DNS`, `Table`, `SaveConfig` and the
//! up/down scripts belong to wg-quick and are ignored.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use log::{debug, info};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::autocfg::resolve;
use crate::crypto::Key;
use crate::error::is_not_supported;
use crate::interface::{Feature, Interface};
use crate::link;
use crate::wg::{DeviceConfig, PeerConfig};

/// A `[Peer]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePeer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

/// Contents of a wg-quick configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub private_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub addresses: Vec<IpNet>,
    pub mtu: Option<u32>,
    pub peers: Vec<FilePeer>,
}

#[derive(PartialEq)]
enum Section {
    None,
    Interface,
    Peer,
}

const IGNORED: &[&str] = &["dns", "table", "saveconfig", "preup", "postup", "predown", "postdown"];

fn parse_list<T>(value: &str, f: impl Fn(&str) -> Result<T>) -> Result<Vec<T>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(f)
        .collect()
}

fn parse_net(s: &str) -> Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    let ip: IpAddr = s.parse().with_context(|| format!("invalid address {s:?}"))?;
    let len = if ip.is_ipv4() { 32 } else { 128 };
    Ok(IpNet::new(ip, len)?)
}

fn parse_off<T: std::str::FromStr + Default>(value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if value.eq_ignore_ascii_case("off") {
        return Ok(T::default());
    }
    Ok(value.parse()?)
}

fn parse_fwmark(value: &str) -> Result<u32> {
    match value.strip_prefix("0x") {
        Some(hex) => Ok(u32::from_str_radix(hex, 16)?),
        None => parse_off(value),
    }
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self> {
        let mut cfg = ConfigFile::default();
        let mut section = Section::None;
        let mut peer_lines = Vec::new();

        for (i, raw) in content.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                section = match line.to_ascii_lowercase().as_str() {
                    "[interface]" => Section::Interface,
                    "[peer]" => {
                        cfg.peers.push(FilePeer {
                            public_key: Key::ZERO,
                            preshared_key: None,
                            endpoint: None,
                            allowed_ips: Vec::new(),
                            persistent_keepalive: None,
                        });
                        peer_lines.push(lineno);
                        Section::Peer
                    }
                    _ => bail!("line {lineno}: unknown section {line}"),
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                bail!("line {lineno}: expected key = value");
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            let result = if section == Section::Interface {
                cfg_interface(&mut cfg, &key, value)
            } else if let (Section::Peer, Some(peer)) = (&section, cfg.peers.last_mut()) {
                cfg_peer(peer, &key, value)
            } else {
                Err(anyhow::anyhow!("key outside of a section"))
            };
            result.with_context(|| format!("line {lineno}: {key}"))?;
        }

        for (peer, lineno) in cfg.peers.iter().zip(peer_lines) {
            if !peer.public_key.is_set() {
                bail!("line {lineno}: peer without PublicKey");
            }
        }
        Ok(cfg)
    }

    /// Full device configuration; peers not in the file are removed.
    pub async fn device_config(&self) -> Result<DeviceConfig> {
        let mut peers = Vec::with_capacity(self.peers.len());
        for p in &self.peers {
            let endpoint = match &p.endpoint {
                Some(ep) => Some(resolve(ep).await?),
                None => None,
            };
            peers.push(PeerConfig {
                preshared_key: Some(p.preshared_key.unwrap_or(Key::ZERO)),
                endpoint,
                persistent_keepalive: Some(p.persistent_keepalive.unwrap_or(0)),
                allowed_ips: Some(p.allowed_ips.clone()),
                ..PeerConfig::new(p.public_key)
            });
        }
        Ok(DeviceConfig {
            private_key: self.private_key,
            listen_port: self.listen_port,
            fwmark: self.fwmark,
            replace_peers: true,
            peers,
        })
    }
}

fn cfg_interface(cfg: &mut ConfigFile, key: &str, value: &str) -> Result<()> {
    match key {
        "privatekey" => cfg.private_key = Some(value.parse()?),
        "listenport" => cfg.listen_port = Some(value.parse()?),
        "fwmark" => cfg.fwmark = Some(parse_fwmark(value)?),
        "address" => cfg.addresses.extend(parse_list(value, parse_net)?),
        "mtu" => cfg.mtu = Some(value.parse()?),
        k if IGNORED.contains(&k) => {}
        _ => bail!("unknown interface key"),
    }
    Ok(())
}

fn cfg_peer(peer: &mut FilePeer, key: &str, value: &str) -> Result<()> {
    match key {
        "publickey" => peer.public_key = value.parse()?,
        "presharedkey" => peer.preshared_key = Some(value.parse()?),
        "endpoint" => peer.endpoint = Some(value.to_string()),
        "allowedips" => peer.allowed_ips.extend(parse_list(value, parse_net)?),
        "persistentkeepalive" => peer.persistent_keepalive = Some(parse_off(value)?),
        _ => bail!("unknown peer key"),
    }
    Ok(())
}

pub fn config_file(dir: &str, name: &str) -> PathBuf {
    Path::new(dir).join(format!("{name}.conf"))
}

/// Names of the interfaces with a configuration file in `dir`, filtered by `filter`.
pub fn config_files(dir: &str, filter: &glob::Pattern) -> Result<Vec<String>> {
    let pattern = config_file(&glob::Pattern::escape(dir), "*");
    let mut names = Vec::new();
    for entry in glob::glob(&pattern.to_string_lossy())? {
        let path = entry?;
        if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
            if filter.matches(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub struct ConfigSync {
    intf: Arc<Interface>,
    path: PathBuf,
    applied: Mutex<Option<ConfigFile>>,
}

impl ConfigSync {
    pub fn new(intf: Arc<Interface>) -> Arc<Self> {
        let path = config_file(&intf.settings.config_path, &intf.name);
        Arc::new(Self {
            intf,
            path,
            applied: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply the file unless it is missing or unchanged since the last call.
    pub async fn sync_file(&self) -> Result<bool> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} No configuration file at {}", self.intf, self.path.display());
                return Ok(false);
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        };
        let cfg = ConfigFile::parse(&content).with_context(|| format!("failed to parse {}", self.path.display()))?;
        if self.applied.lock().as_ref() == Some(&cfg) {
            return Ok(false);
        }

        self.apply(&cfg).await?;
        *self.applied.lock() = Some(cfg);
        info!("{} Synchronized configuration from {}", self.intf, self.path.display());
        Ok(true)
    }

    async fn apply(&self, cfg: &ConfigFile) -> Result<()> {
        let dc = cfg.device_config().await?;
        self.intf.configure(&dc).await.context("failed to configure device")?;

        match self.configure_link(cfg).await {
            Err(e) if is_not_supported(&e) => {
                debug!("{} Link configuration not supported on this platform", self.intf);
                Ok(())
            }
            r => r,
        }
    }

    async fn configure_link(&self, cfg: &ConfigFile) -> Result<()> {
        for a in &cfg.addresses {
            link::add_address(&self.intf.name, a).await?;
        }
        if let Some(mtu) = cfg.mtu {
            link::set_mtu(&self.intf.name, mtu).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Feature for ConfigSync {
    fn name(&self) -> &'static str {
        "cfgsync"
    }

    async fn start(&self) -> Result<()> {
        self.sync_file().await?;
        info!("{} Started configuration file synchronization", self.intf);
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        self.sync_file().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceSettings;
    use crate::interface::testing::memory_interface;

    fn key() -> Key {
        Key::generate_private().public_key()
    }

    #[test]
    fn test_parse_wg_quick() {
        let sk = Key::generate_private();
        let (a, b) = (key(), key());
        let cfg = ConfigFile::parse(&format!(
            "# managed by hand
[Interface]
PrivateKey = {sk}
ListenPort = 51820
FwMark = 0x10
Address = 10.0.0.1/24, fd00::1
DNS = 10.0.0.53
MTU = 1380
PostUp = iptables -A FORWARD -i %i -j ACCEPT

[Peer]
PublicKey = {a}
Endpoint = 192.0.2.1:51820 # office
AllowedIPs = 10.0.0.2/32,
AllowedIPs = 192.168.50.0/24
PersistentKeepalive = 25

[peer]
publickey = {b}
PersistentKeepalive = off
"
        ))
        .unwrap();

        assert_eq!(cfg.private_key, Some(sk));
        assert_eq!(cfg.listen_port, Some(51820));
        assert_eq!(cfg.fwmark, Some(16));
        assert_eq!(cfg.mtu, Some(1380));
        assert_eq!(
            cfg.addresses,
            vec!["10.0.0.1/24".parse::<IpNet>().unwrap(), "fd00::1/128".parse().unwrap()]
        );
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[0].public_key, a);
        assert_eq!(cfg.peers[0].endpoint.as_deref(), Some("192.0.2.1:51820"));
        assert_eq!(cfg.peers[0].allowed_ips.len(), 2);
        assert_eq!(cfg.peers[0].persistent_keepalive, Some(25));
        assert_eq!(cfg.peers[1].public_key, b);
        assert_eq!(cfg.peers[1].persistent_keepalive, Some(0));
        assert!(cfg.peers[1].allowed_ips.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        let err = ConfigFile::parse("[Interface]\nListenPort = 51820\nFoo = bar").unwrap_err();
        assert!(format!("{err:#}").contains("line 3"));

        assert!(ConfigFile::parse("ListenPort = 1").is_err());
        assert!(ConfigFile::parse("[Wat]").is_err());
        assert!(ConfigFile::parse("[Interface]\nListenPort 1").is_err());
        assert!(ConfigFile::parse("[Interface]\nPrivateKey = nope").is_err());

        let err = ConfigFile::parse("[Peer]\nAllowedIPs = 10.0.0.0/8").unwrap_err();
        assert!(format!("{err:#}").contains("without PublicKey"));
    }

    #[test]
    fn test_config_files() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["wg1.conf", "wg0.conf", "eth0.conf", "wg2.conf.bak", "wg3.key"] {
            std::fs::write(dir.path().join(f), "").unwrap();
        }
        let dir = dir.path().to_string_lossy().into_owned();
        let names = config_files(&dir, &glob::Pattern::new("wg*").unwrap()).unwrap();
        assert_eq!(names, vec!["wg0", "wg1"]);
    }

    #[tokio::test]
    async fn test_file_applied_and_followed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = InterfaceSettings {
            sync_config: true,
            config_path: dir.path().to_string_lossy().into_owned(),
            ..InterfaceSettings::default()
        };
        let (intf, dev) = memory_interface("wg-cs0", settings);
        let cs = ConfigSync::new(Arc::clone(&intf));

        // Missing file is not an error
        cs.start().await.unwrap();
        assert_eq!(dev.calls(), 0);

        let stray = key();
        intf.add_peer(PeerConfig::new(stray)).await.unwrap();

        let (a, c) = (key(), key());
        std::fs::write(
            cs.path(),
            format!("[Interface]\nListenPort = 51999\n\n[Peer]\nPublicKey = {a}\nEndpoint = 127.0.0.1:51820\nAllowedIPs = 10.9.0.2/32\nPersistentKeepalive = 25\n"),
        )
        .unwrap();
        assert!(cs.sync_file().await.unwrap());

        let snap = dev.snapshot_device();
        assert_eq!(snap.listen_port, 51999);
        assert!(snap.peer(&stray).is_none());
        let peer = snap.peer(&a).unwrap();
        assert_eq!(peer.endpoint, Some("127.0.0.1:51820".parse().unwrap()));
        assert_eq!(peer.allowed_ips, vec!["10.9.0.2/32".parse::<IpNet>().unwrap()]);
        assert_eq!(peer.persistent_keepalive, 25);

        // Unchanged contents are not applied again
        let calls = dev.calls();
        cs.sync().await.unwrap();
        assert_eq!(dev.calls(), calls);

        std::fs::write(cs.path(), format!("[Interface]\nListenPort = 51999\n\n[Peer]\nPublicKey = {c}\n")).unwrap();
        cs.sync().await.unwrap();
        let snap = dev.snapshot_device();
        assert!(snap.peer(&a).is_none());
        assert!(snap.peer(&c).is_some());
    }

    #[tokio::test]
    async fn test_invalid_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let settings = InterfaceSettings {
            config_path: dir.path().to_string_lossy().into_owned(),
            ..InterfaceSettings::default()
        };
        let (intf, dev) = memory_interface("wg-cs1", settings);
        let cs = ConfigSync::new(intf);
        std::fs::write(cs.path(), "[Interface]\nListenPort = many\n").unwrap();

        let err = cs.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("wg-cs1.conf"));
        assert_eq!(dev.calls(), 0);
    }
}
