//! Hosts file synchronization
//!
//! Writes one line per peer address into the hosts file:
//!
//! ```text
//! fc2f:9a4d::1234 beta beta.mesh # icewire: ifname=wg0, ifindex=7, pk=...
//! ```
//!
//! Lines carrying our marker for this interface index are replaced on every
//! sync. Everything else in the file is left alone.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::crypto::Key;
use crate::interface::{Feature, Interface, PeerMeta};
use crate::watcher::PeerModifier;
use crate::wg::Peer;

pub const MARKER: &str = "icewire:";

/// One line of the hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub ip: IpAddr,
    pub names: Vec<String>,
    pub comment: Option<String>,
}

impl Host {
    pub fn parse(line: &str) -> Option<Host> {
        let (entry, comment) = match line.split_once('#') {
            Some((e, c)) => (e, Some(c.trim().to_string())),
            None => (line, None),
        };
        let mut fields = entry.split_whitespace();
        let ip = fields.next()?.parse().ok()?;
        let names: Vec<String> = fields.map(str::to_string).collect();
        if names.is_empty() {
            return None;
        }
        Some(Host { ip, names, comment })
    }

    pub fn line(&self) -> String {
        let mut l = format!("{} {}", self.ip, self.names.join(" "));
        if let Some(c) = &self.comment {
            l.push_str(" # ");
            l.push_str(c);
        }
        l
    }
}

/// Whether `line` was written by us for interface `ifindex`.
fn is_ours(line: &str, ifindex: u32) -> bool {
    let Some(h) = Host::parse(line) else {
        return false;
    };
    let Some(c) = h.comment else {
        return false;
    };
    c.starts_with(MARKER)
        && c.split([',', ' '])
            .any(|f| f.trim() == format!("ifindex={ifindex}"))
}

/// Hosts entries for the given peers.
pub fn hosts(
    ifname: &str,
    ifindex: u32,
    domain: &str,
    metas: &BTreeMap<Key, PeerMeta>,
) -> Vec<Host> {
    let suffix = match domain {
        "" => String::new(),
        d if d.starts_with('.') => d.to_string(),
        d => format!(".{d}"),
    };

    let mut out = Vec::new();
    for (pk, meta) in metas {
        let mut by_ip: BTreeMap<IpAddr, Vec<String>> = BTreeMap::new();
        for (name, addrs) in &meta.hosts {
            for a in addrs {
                let names = by_ip.entry(*a).or_default();
                names.push(name.clone());
                if !suffix.is_empty() {
                    names.push(format!("{name}{suffix}"));
                }
            }
        }
        for (ip, names) in by_ip {
            out.push(Host {
                ip,
                names,
                comment: Some(format!("{MARKER} ifname={ifname}, ifindex={ifindex}, pk={pk}")),
            });
        }
    }
    out
}

/// Replace our lines for `ifindex` in `content` with `hosts`.
pub fn rewrite(content: &str, ifindex: u32, hosts: &[Host]) -> String {
    let mut lines: Vec<String> = content
        .lines()
        .filter(|l| !is_ours(l, ifindex))
        .map(str::to_string)
        .collect();
    lines.extend(hosts.iter().map(Host::line));
    lines.dedup_by(|a, b| a.is_empty() && b.is_empty());

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

pub struct HostsSync {
    intf: Arc<Interface>,
    path: PathBuf,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HostsSync {
    pub fn new(intf: Arc<Interface>) -> Arc<Self> {
        let path = PathBuf::from(shellexpand::tilde(&intf.settings.hosts_path).into_owned());
        Arc::new(Self {
            intf,
            path,
            task: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn update(intf: &Interface, path: &Path, hosts: &[Host]) -> Result<()> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let updated = rewrite(&content, intf.index, hosts);
        if updated == content {
            debug!("{} Hosts file already up to date", intf);
            return Ok(());
        }
        tokio::fs::write(path, updated)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        intf.metrics.inc_hosts_syncs();
        info!("{} Updated hosts file ({} hosts)", intf, hosts.len());
        Ok(())
    }

    async fn sync_file(intf: &Interface, path: &Path) -> Result<()> {
        let metas: BTreeMap<Key, PeerMeta> = intf.peer_metas().into_iter().collect();
        let hosts = hosts(&intf.name, intf.index, &intf.settings.domain, &metas);
        Self::update(intf, path, &hosts).await
    }
}

#[async_trait]
impl Feature for HostsSync {
    fn name(&self) -> &'static str {
        "hsync"
    }

    async fn start(&self) -> Result<()> {
        let intf = Arc::clone(&self.intf);
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            loop {
                intf.hosts_changed().await;
                if let Err(e) = HostsSync::sync_file(&intf, &path).await {
                    warn!("{} Failed to sync hosts: {:#}", intf, e);
                }
            }
        });
        *self.task.lock() = Some(task);
        info!("{} Started hosts synchronization of {}", self.intf, self.path.display());
        Ok(())
    }

    async fn on_peer_removed(&self, peer: &Peer) {
        if self.intf.remove_peer_meta(&peer.public_key) {
            self.intf.notify_hosts_changed();
        }
    }

    async fn on_peer_modified(&self, _old: &Peer, _new: &Peer, modified: PeerModifier) {
        if modified.contains(PeerModifier::NAME) {
            self.intf.notify_hosts_changed();
        }
    }

    async fn sync(&self) -> Result<()> {
        Self::sync_file(&self.intf, &self.path).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Self::update(&self.intf, &self.path, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceSettings;
    use crate::interface::testing::memory_interface;
    use std::time::Duration;

    const EXISTING: &str = "127.0.0.1 localhost\n::1 localhost ip6-localhost\n10.0.0.1 router # lan\n";

    fn meta(name: &str, ip: &str) -> PeerMeta {
        let mut hosts = BTreeMap::new();
        hosts.insert(name.to_string(), vec![ip.parse().unwrap()]);
        PeerMeta {
            name: name.to_string(),
            hosts,
        }
    }

    #[test]
    fn test_parse_line() {
        let h = Host::parse("10.0.0.1  router  gw # lan").unwrap();
        assert_eq!(h.ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(h.names, vec!["router", "gw"]);
        assert_eq!(h.comment.as_deref(), Some("lan"));
        assert!(Host::parse("# only a comment").is_none());
        assert!(Host::parse("10.0.0.1").is_none());
        assert!(Host::parse("").is_none());
    }

    #[test]
    fn test_hosts_with_domain() {
        let pk = Key::generate_private().public_key();
        let mut metas = BTreeMap::new();
        metas.insert(pk, meta("beta", "10.237.1.2"));

        let hs = hosts("wg0", 7, "mesh", &metas);
        assert_eq!(hs.len(), 1);
        assert_eq!(hs[0].names, vec!["beta", "beta.mesh"]);
        assert_eq!(
            hs[0].line(),
            format!("10.237.1.2 beta beta.mesh # icewire: ifname=wg0, ifindex=7, pk={pk}")
        );
    }

    #[test]
    fn test_rewrite_keeps_foreign_lines() {
        let pk = Key::generate_private().public_key();
        let mut metas = BTreeMap::new();
        metas.insert(pk, meta("beta", "10.237.1.2"));
        let hs = hosts("wg0", 7, "", &metas);

        let once = rewrite(EXISTING, 7, &hs);
        assert!(once.starts_with(EXISTING));
        assert!(once.contains("10.237.1.2 beta # icewire:"));

        // Idempotent
        assert_eq!(rewrite(&once, 7, &hs), once);

        // Other interfaces are untouched
        let other = rewrite(&once, 8, &[]);
        assert_eq!(other, once);

        assert_eq!(rewrite(&once, 7, &[]), EXISTING);
    }

    #[tokio::test]
    async fn test_sync_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, EXISTING).unwrap();

        let mut settings = InterfaceSettings::default();
        settings.hosts_path = path.to_string_lossy().into_owned();
        let (intf, _dev) = memory_interface("wg-hs0", settings);
        let hs = HostsSync::new(Arc::clone(&intf));
        hs.start().await.unwrap();

        let pk = Key::generate_private().public_key();
        intf.set_peer_meta(pk, meta("beta", "10.237.1.2"));
        intf.notify_hosts_changed();

        let mut written = false;
        for _ in 0..50 {
            if std::fs::read_to_string(&path).unwrap().contains("beta") {
                written = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(written);

        hs.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), EXISTING);
    }
}
