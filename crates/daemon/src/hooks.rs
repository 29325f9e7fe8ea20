//! Exec and web hooks
//!
//! Hooks are invoked on peer additions, removals and renames, interface
//! changes and connection state changes. Each invocation runs in its own task so that
//! slow hooks never hold up event dispatch.
//!
//! Exec hooks get the event kind as arguments, e.g.
//! `added peer wg0 <key>` or `changed peer wg0 <key> connected connecting`,
//! and the JSON event on stdin. Web hooks receive the JSON event as body.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::HookSettings;
use crate::interface::{Feature, Interface, StateChange};
use crate::metrics::Metrics;
use crate::watcher::{InterfaceModifier, PeerModifier};
use crate::wg::{Device, Peer};

const WEB_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload handed to hooks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    PeerAdded { interface: String, peer: Peer },
    PeerRemoved { interface: String, peer: Peer },
    PeerModified { interface: String, peer: Peer, modified: Vec<&'static str> },
    InterfaceModified { interface: Device, modified: Vec<&'static str> },
    PeerStateChanged(StateChange),
}

impl HookEvent {
    /// Arguments passed to exec hooks.
    pub fn args(&self) -> Vec<String> {
        match self {
            HookEvent::PeerAdded { interface, peer } => {
                vec!["added".into(), "peer".into(), interface.clone(), peer.public_key.to_string()]
            }
            HookEvent::PeerRemoved { interface, peer } => {
                vec!["removed".into(), "peer".into(), interface.clone(), peer.public_key.to_string()]
            }
            HookEvent::PeerModified { interface, peer, modified } => {
                let mut args = vec!["modified".into(), "peer".into(), interface.clone(), peer.public_key.to_string()];
                args.extend(modified.iter().map(|m| m.to_string()));
                args
            }
            HookEvent::InterfaceModified { interface, modified } => {
                let mut args = vec!["modified".into(), "interface".into(), interface.name.clone()];
                args.extend(modified.iter().map(|m| m.to_string()));
                args
            }
            HookEvent::PeerStateChanged(c) => vec![
                "changed".into(),
                "peer".into(),
                c.interface.clone(),
                c.peer.to_string(),
                c.new.to_string(),
                c.old.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub enum Hook {
    Exec {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        stdin: bool,
    },
    Web {
        url: reqwest::Url,
        method: reqwest::Method,
        headers: BTreeMap<String, String>,
    },
}

impl Hook {
    pub fn from_settings(s: &HookSettings) -> Result<Self> {
        Ok(match s {
            HookSettings::Exec {
                command,
                args,
                env,
                stdin,
            } => Hook::Exec {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
                stdin: *stdin,
            },
            HookSettings::Web { url, method, headers } => Hook::Web {
                url: url.parse().with_context(|| format!("invalid web hook URL {url:?}"))?,
                method: method
                    .to_uppercase()
                    .parse()
                    .with_context(|| format!("invalid web hook method {method:?}"))?,
                headers: headers.clone(),
            },
        })
    }

    async fn run(&self, client: &reqwest::Client, event: &HookEvent) -> Result<()> {
        let body = serde_json::to_vec_pretty(event)?;
        match self {
            Hook::Exec {
                command,
                args,
                env,
                stdin,
            } => {
                let mut cmd = Command::new(command);
                cmd.args(args)
                    .args(event.args())
                    .envs(env)
                    .stdin(if *stdin { Stdio::piped() } else { Stdio::null() })
                    .stdout(Stdio::null())
                    .kill_on_drop(true);
                let mut child = cmd.spawn().with_context(|| format!("failed to run {command}"))?;
                if let Some(mut input) = child.stdin.take() {
                    input.write_all(&body).await?;
                    input.write_all(b"\n").await?;
                }
                let status = child.wait().await?;
                if !status.success() {
                    bail!("{command} exited with {status}");
                }
            }
            Hook::Web { url, method, headers } => {
                let mut req = client
                    .request(method.clone(), url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body);
                for (k, v) in headers {
                    req = req.header(k.as_str(), v.as_str());
                }
                let resp = req.send().await.context("web hook request failed")?;
                if !resp.status().is_success() {
                    bail!("web hook endpoint responded with {}", resp.status());
                }
            }
        }
        Ok(())
    }
}

fn dispatch(hooks: &Arc<Vec<Hook>>, client: &reqwest::Client, metrics: &Arc<Metrics>, event: HookEvent) {
    for (i, _) in hooks.iter().enumerate() {
        let hooks = Arc::clone(hooks);
        let client = client.clone();
        let metrics = Arc::clone(metrics);
        let event = event.clone();
        tokio::spawn(async move {
            let res = hooks[i].run(&client, &event).await;
            metrics.inc_hooks(res.is_ok());
            match res {
                Ok(()) => debug!("Hook {} ran for {:?}", i, event.args()),
                Err(e) => error!("Failed to invoke hook {}: {:#}", i, e),
            }
        });
    }
}

pub struct Hooks {
    intf: Arc<Interface>,
    hooks: Arc<Vec<Hook>>,
    client: reqwest::Client,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Hooks {
    /// Returns `None` if no hooks are configured.
    pub fn new(intf: Arc<Interface>) -> Result<Option<Arc<Self>>> {
        if intf.settings.hooks.is_empty() {
            return Ok(None);
        }
        let hooks = intf
            .settings
            .hooks
            .iter()
            .map(Hook::from_settings)
            .collect::<Result<Vec<_>>>()?;
        let client = reqwest::Client::builder()
            .timeout(WEB_HOOK_TIMEOUT)
            .user_agent(crate::pdisc::build_info())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Some(Arc::new(Self {
            intf,
            hooks: Arc::new(hooks),
            client,
            task: Mutex::new(None),
        })))
    }

    fn fire(&self, event: HookEvent) {
        dispatch(&self.hooks, &self.client, &self.intf.metrics, event);
    }
}

#[async_trait]
impl Feature for Hooks {
    fn name(&self) -> &'static str {
        "hooks"
    }

    async fn start(&self) -> Result<()> {
        let mut changes = self.intf.subscribe_state_changes();
        let hooks = Arc::clone(&self.hooks);
        let client = self.client.clone();
        let metrics = Arc::clone(&self.intf.metrics);
        let label = self.intf.to_string();

        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(c) => dispatch(&hooks, &client, &metrics, HookEvent::PeerStateChanged(c)),
                    Err(RecvError::Lagged(n)) => warn!("{} Hooks missed {} state changes", label, n),
                    Err(RecvError::Closed) => return,
                }
            }
        });
        *self.task.lock() = Some(task);
        info!("{} Started {} hooks", self.intf, self.hooks.len());
        Ok(())
    }

    async fn on_interface_modified(&self, _old: &Device, new: &Device, modified: InterfaceModifier) {
        self.fire(HookEvent::InterfaceModified {
            interface: new.clone(),
            modified: modified.labels(),
        });
    }

    async fn on_peer_added(&self, peer: &Peer) {
        self.fire(HookEvent::PeerAdded {
            interface: self.intf.name.clone(),
            peer: peer.clone(),
        });
    }

    async fn on_peer_removed(&self, peer: &Peer) {
        self.fire(HookEvent::PeerRemoved {
            interface: self.intf.name.clone(),
            peer: peer.clone(),
        });
    }

    async fn on_peer_modified(&self, _old: &Peer, new: &Peer, modified: PeerModifier) {
        // Counters and handshakes change on every sync
        let relevant = PeerModifier::NAME | PeerModifier::ENDPOINT | PeerModifier::ALLOWED_IPS | PeerModifier::PRESHARED_KEY;
        if !modified.intersects(relevant) {
            return;
        }
        self.fire(HookEvent::PeerModified {
            interface: self.intf.name.clone(),
            peer: new.clone(),
            modified: modified.labels(),
        });
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceSettings;
    use crate::crypto::Key;
    use crate::epdisc::PeerState;
    use crate::interface::testing::memory_interface;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn peer() -> Peer {
        Peer::new(Key::generate_private().public_key())
    }

    #[test]
    fn test_event_args_and_json() {
        let p = peer();
        let ev = HookEvent::PeerAdded {
            interface: "wg0".into(),
            peer: p.clone(),
        };
        assert_eq!(ev.args(), vec!["added", "peer", "wg0", &p.public_key.to_string()]);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "peer_added");
        assert_eq!(json["interface"], "wg0");

        let mut renamed = p.clone();
        renamed.name = Some("beta".into());
        let ev = HookEvent::PeerModified {
            interface: "wg0".into(),
            peer: renamed,
            modified: PeerModifier::NAME.labels(),
        };
        assert_eq!(ev.args(), vec!["modified", "peer", "wg0", &p.public_key.to_string(), "name"]);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "peer_modified");
        assert_eq!(json["peer"]["name"], "beta");
    }

    #[test]
    fn test_from_settings() {
        let web = HookSettings::Web {
            url: "http://127.0.0.1:1/hook".into(),
            method: "put".into(),
            headers: BTreeMap::new(),
        };
        match Hook::from_settings(&web).unwrap() {
            Hook::Web { method, .. } => assert_eq!(method, reqwest::Method::PUT),
            h => panic!("unexpected hook {h:?}"),
        }

        let bad = HookSettings::Web {
            url: "not a url".into(),
            method: "POST".into(),
            headers: BTreeMap::new(),
        };
        assert!(Hook::from_settings(&bad).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_hook_receives_event() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("event.json");
        let hook = Hook::Exec {
            command: "sh".into(),
            args: vec!["-c".into(), format!("cat > {}; echo \"$@\" >> {}", out.display(), out.display()), "hook".into()],
            env: BTreeMap::new(),
            stdin: true,
        };
        let p = peer();
        let ev = HookEvent::PeerRemoved {
            interface: "wg0".into(),
            peer: p.clone(),
        };
        hook.run(&reqwest::Client::new(), &ev).await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert!(written.contains("\"peer_removed\""));
        assert!(written.contains(&format!("removed peer wg0 {}", p.public_key)));
    }

    #[tokio::test]
    async fn test_web_hook_posts_state_change() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if n == 0 || (text.contains("peer_state_changed") && text.trim_end().ends_with('}')) {
                    break;
                }
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut settings = InterfaceSettings::default();
        settings.hooks = vec![HookSettings::Web {
            url: format!("http://{addr}/hook"),
            method: "POST".into(),
            headers: BTreeMap::from([("X-Token".to_string(), "secret".to_string())]),
        }];
        let (intf, _dev) = memory_interface("wg-hk0", settings);
        let hooks = Hooks::new(Arc::clone(&intf)).unwrap().unwrap();
        hooks.start().await.unwrap();

        intf.publish_state_change(Key::generate_private().public_key(), PeerState::Connecting, PeerState::Connected);

        let request = tokio::time::timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.to_lowercase().contains("x-token: secret"));
        assert!(request.contains("\"connected\""));

        hooks.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_hooks_configured() {
        let (intf, _dev) = memory_interface("wg-hk1", InterfaceSettings::default());
        assert!(Hooks::new(intf).unwrap().is_none());
    }
}
