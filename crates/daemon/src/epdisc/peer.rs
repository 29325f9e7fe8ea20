//! Per-peer coordinator
//!
//! Each peer runs one task that owns its ICE agent, proxy and signaling
//! subscription. Signaling deliveries, agent events, connect results and
//! control messages are merged into one `select!` loop, so all per-peer
//! mutations are serial. The state itself lives in an [`AtomicState`] so that
//! status readers never block the coordinator.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

use super::state::{AtomicState, PeerState};
use crate::backoff::ExponentialBackoff;
use crate::config::IceSettings;
use crate::crypto::{Key, KeyPair, PublicKeyPair};
use crate::ice::{
    Agent, AgentConfig, AgentEvent, Candidate, CandidatePair, CandidateType, ConnectionState, IceConn, UdpMux,
};
use crate::interface::Interface;
use crate::proxy::{Proxy, ProxyContext, ProxyType};
use crate::signaling::{Credentials, Delivery, Message, MultiBackend, SubscriptionId};
use crate::wg::Reachability;

/// Channel capacity between the agent callbacks and the coordinator.
pub const EVENT_QUEUE: usize = 32;
pub const CANDIDATE_PUBLISH_TIMEOUT: Duration = Duration::from_secs(15);
pub const CREDENTIALS_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Interface-wide facilities shared by all peers.
pub struct PeerContext {
    pub intf: Arc<Interface>,
    pub backend: Arc<MultiBackend>,
    pub settings: IceSettings,
    pub host_mux: Option<Arc<UdpMux>>,
    pub srflx_mux: Option<Arc<UdpMux>>,
}

pub enum Control {
    /// The interface private key changed.
    KeyChanged(Key),
    ListenPort(u16),
    /// WireGuard reports a new endpoint for the peer.
    EndpointChanged(Option<SocketAddr>),
    /// Tear the session down and start a new one.
    Restart,
    Close(oneshot::Sender<()>),
}

/// Snapshot served on `/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub state: PeerState,
    pub restarts: u64,
    pub reachability: Reachability,
    pub controlling: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_candidate: Option<CandidateType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_candidate: Option<CandidateType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_pair: Option<CandidatePair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    pub last_state_change: DateTime<Utc>,
}

#[derive(Default)]
struct Info {
    selected: Option<CandidatePair>,
    proxy: Option<ProxyType>,
    endpoint: Option<SocketAddr>,
    controlling: bool,
    last_state_change: Option<DateTime<Utc>>,
}

/// State readable outside the coordinator.
pub struct PeerShared {
    pub public_key: Key,
    state: AtomicState,
    restarts: AtomicU64,
    info: Mutex<Info>,
}

impl PeerShared {
    pub fn state(&self) -> PeerState {
        self.state.load()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> PeerStatus {
        let state = self.state();
        let info = self.info.lock();
        PeerStatus {
            state,
            restarts: self.restarts(),
            reachability: reachability(state, info.selected.as_ref()),
            controlling: info.controlling,
            local_candidate: info.selected.as_ref().map(|p| p.local.typ),
            remote_candidate: info.selected.as_ref().map(|p| p.remote.typ),
            selected_pair: info.selected.clone(),
            proxy: info.proxy,
            endpoint: info.endpoint,
            last_state_change: info.last_state_change.unwrap_or_else(Utc::now),
        }
    }
}

/// Reachability derived from the ICE session.
pub fn reachability(state: PeerState, pair: Option<&CandidatePair>) -> Reachability {
    match (state, pair) {
        (PeerState::Connected, Some(p)) => {
            let local = p.local.typ == CandidateType::Relay;
            let remote = p.remote.typ == CandidateType::Relay;
            match (local, remote) {
                (true, true) => Reachability::RelayedBidir,
                (true, false) | (false, true) => Reachability::Relayed,
                (false, false) => Reachability::Direct,
            }
        }
        _ => Reachability::None,
    }
}

/// New credentials from a peer that already sent different ones.
pub fn is_session_restart(old: &(String, String), new: &Credentials) -> bool {
    let non_empty = !old.0.is_empty() && !old.1.is_empty() && !new.ufrag.is_empty() && !new.pwd.is_empty();
    non_empty && (old.0 != new.ufrag || old.1 != new.pwd)
}

/// Handle to a running coordinator.
pub struct PeerHandle {
    shared: Arc<PeerShared>,
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn spawn(ctx: Arc<PeerContext>, ours: Key, theirs: Key, proxy_ctx: ProxyContext) -> Self {
        let shared = Arc::new(PeerShared {
            public_key: theirs,
            state: AtomicState::new(PeerState::Closed),
            restarts: AtomicU64::new(0),
            info: Mutex::new(Info::default()),
        });

        let (control_tx, control_rx) = mpsc::channel(EVENT_QUEUE);
        let (deliveries_tx, deliveries_rx) = mpsc::channel(EVENT_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (connected_tx, connected_rx) = mpsc::channel(4);
        let (outbox_tx, outbox_rx) = mpsc::channel(EVENT_QUEUE * 2);

        let label = format!("{} peer={}", ctx.intf, theirs);
        let publisher = tokio::spawn(publisher(Arc::clone(&ctx), outbox_rx, label.clone()));

        let coordinator = Coordinator {
            label,
            shared: Arc::clone(&shared),
            theirs,
            ours,
            proxy_ctx,
            subscription: None,
            deliveries_tx,
            events_tx,
            connected_tx,
            outbox: outbox_tx,
            agent: None,
            generation: 0,
            remote_creds: None,
            proxy: None,
            last_endpoint: None,
            resend_at: None,
            creds_backoff: ExponentialBackoff::credentials(),
            recreate_at: None,
            reconnect_backoff: ExponentialBackoff::reconnect(),
            publisher,
            ctx,
        };
        let task = tokio::spawn(coordinator.run(control_rx, deliveries_rx, events_rx, connected_rx));

        Self {
            shared,
            control: control_tx,
            task,
        }
    }

    pub fn shared(&self) -> &Arc<PeerShared> {
        &self.shared
    }

    pub fn status(&self) -> PeerStatus {
        self.shared.status()
    }

    pub fn send(&self, c: Control) {
        if let Err(e) = self.control.try_send(c) {
            warn!("Failed to reach coordinator of peer={}: {}", self.shared.public_key, e);
        }
    }

    /// Stop the coordinator and wait until agent and proxy are released.
    pub async fn close(self) {
        let (done, rx) = oneshot::channel();
        if self.control.send(Control::Close(done)).await.is_ok() && rx.await.is_ok() {
            return;
        }
        self.task.abort();
    }
}

/// Messages are published in order with a deadline, retrying until it expires.
struct Outgoing {
    kp: KeyPair,
    message: Message,
    deadline: Duration,
    what: &'static str,
}

async fn publisher(ctx: Arc<PeerContext>, mut rx: mpsc::Receiver<Outgoing>, label: String) {
    let metrics = Arc::clone(&ctx.intf.metrics);
    while let Some(o) = rx.recv().await {
        let mut backoff = ExponentialBackoff::reconnect();
        let attempt = async {
            loop {
                match ctx.backend.publish(&o.kp, &o.message).await {
                    Ok(()) => return,
                    Err(e) => {
                        debug!("{} Publishing {} failed, retrying: {}", label, o.what, e);
                        tokio::time::sleep(backoff.next().unwrap_or(Duration::from_secs(1))).await;
                    }
                }
            }
        };
        match timeout(o.deadline, attempt).await {
            Ok(()) => {
                metrics.inc_published();
                trace!("{} Published {}", label, o.what);
            }
            Err(_) => {
                metrics.inc_publish_failures();
                warn!("{} Failed to publish {} within {:?}", label, o.what, o.deadline);
            }
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(t) => sleep_until(t).await,
        None => std::future::pending().await,
    }
}

struct Coordinator {
    label: String,
    ctx: Arc<PeerContext>,
    shared: Arc<PeerShared>,
    theirs: Key,
    /// Private key of the interface.
    ours: Key,
    proxy_ctx: ProxyContext,

    subscription: Option<SubscriptionId>,
    deliveries_tx: mpsc::Sender<Delivery>,
    events_tx: mpsc::Sender<(u64, AgentEvent)>,
    connected_tx: mpsc::Sender<(u64, Result<Arc<IceConn>>)>,
    outbox: mpsc::Sender<Outgoing>,
    publisher: JoinHandle<()>,

    agent: Option<Arc<Agent>>,
    generation: u64,
    remote_creds: Option<(String, String)>,
    proxy: Option<Proxy>,
    last_endpoint: Option<SocketAddr>,

    resend_at: Option<Instant>,
    creds_backoff: ExponentialBackoff,
    recreate_at: Option<Instant>,
    reconnect_backoff: ExponentialBackoff,
}

impl Coordinator {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<Control>,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut events: mpsc::Receiver<(u64, AgentEvent)>,
        mut connected: mpsc::Receiver<(u64, Result<Arc<IceConn>>)>,
    ) {
        self.update_controlling();
        if self.ours.is_set() {
            self.subscribe();
            self.recreate_at = Some(Instant::now());
        } else {
            debug!("{} Waiting for a private key", self.label);
        }

        loop {
            let resend_at = self.resend_at;
            let recreate_at = self.recreate_at;

            tokio::select! {
                biased;
                ctl = control.recv() => match ctl {
                    Some(Control::Close(done)) => {
                        self.close().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(c) => self.on_control(c).await,
                    None => {
                        self.close().await;
                        return;
                    }
                },
                Some((generation, ev)) = events.recv() => {
                    if generation == self.generation {
                        self.on_agent_event(ev).await;
                    } else {
                        trace!("{} Ignoring event of stale agent {}", self.label, generation);
                    }
                }
                Some((generation, res)) = connected.recv() => {
                    if generation == self.generation {
                        self.on_connected(res).await;
                    }
                }
                Some(d) = deliveries.recv() => self.on_delivery(d).await,
                _ = wait_until(resend_at) => self.resend_credentials(),
                _ = wait_until(recreate_at) => self.create_agent(),
            }
        }
    }

    fn public_pair(&self) -> PublicKeyPair {
        PublicKeyPair {
            ours: self.ours.public_key(),
            theirs: self.theirs,
        }
    }

    fn update_controlling(&self) {
        self.shared.info.lock().controlling = self.public_pair().is_controlling();
    }

    fn controlling(&self) -> bool {
        self.shared.info.lock().controlling
    }

    fn key_pair(&self) -> KeyPair {
        KeyPair::new(self.ours, self.theirs)
    }

    fn subscribe(&mut self) {
        let id = self.ctx.backend.subscribe(self.key_pair(), self.deliveries_tx.clone());
        if let Some(old) = self.subscription.replace(id) {
            self.ctx.backend.unsubscribe(old);
        }
        debug!("{} Subscribed to signaling", self.label);
    }

    fn unsubscribe(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.ctx.backend.unsubscribe(id);
        }
    }

    fn state(&self) -> PeerState {
        self.shared.state()
    }

    fn on_state_change(&self, old: PeerState, new: PeerState) {
        if old == new {
            return;
        }
        debug!("{} State {} -> {}", self.label, old, new);
        self.shared.info.lock().last_state_change = Some(Utc::now());

        let metrics = &self.ctx.intf.metrics;
        if new == PeerState::Connected {
            metrics.inc_connected();
        } else if old == PeerState::Connected {
            metrics.dec_connected();
        }
        self.ctx.intf.publish_state_change(self.theirs, old, new);
    }

    fn transition(&self, from: PeerState, to: PeerState) -> bool {
        let ok = self.shared.state.compare_and_swap(from, to);
        if ok {
            self.on_state_change(from, to);
        }
        ok
    }

    fn set_state_unless(&self, to: PeerState, unless: &[PeerState]) -> bool {
        match self.shared.state.set_if_not(to, unless) {
            Some(prev) => {
                self.on_state_change(prev, to);
                true
            }
            None => false,
        }
    }

    fn create_agent(&mut self) {
        self.recreate_at = None;
        if !self.transition(PeerState::Closed, PeerState::Creating) {
            return;
        }

        let config = match AgentConfig::from_settings(
            &self.ctx.settings,
            self.ctx.host_mux.clone(),
            self.ctx.srflx_mux.clone(),
        ) {
            Ok(c) => c,
            Err(e) => {
                let delay = self.reconnect_backoff.next().unwrap_or(Duration::from_secs(1));
                error!("{} Failed to create agent, retrying in {:?}: {:#}", self.label, delay, e);
                self.transition(PeerState::Creating, PeerState::Closed);
                self.recreate_at = Some(Instant::now() + delay);
                return;
            }
        };

        self.generation += 1;
        let agent = Agent::new(config, self.generation, self.events_tx.clone());
        debug!(
            "{} Created agent {} (ufrag {})",
            self.label,
            self.generation,
            agent.local_credentials().0
        );
        self.agent = Some(Arc::new(agent));
        self.remote_creds = None;
        self.ctx.intf.metrics.inc_agents();
        self.reconnect_backoff.reset();

        if self.transition(PeerState::Creating, PeerState::Idle) {
            self.creds_backoff.reset();
            self.resend_at = Some(Instant::now());
        }
    }

    fn publish(&self, message: Message, deadline: Duration, what: &'static str) {
        let o = Outgoing {
            kp: self.key_pair(),
            message,
            deadline,
            what,
        };
        if let Err(e) = self.outbox.try_send(o) {
            warn!("{} Dropping {}: {}", self.label, what, e);
        }
    }

    fn send_credentials(&self, need_creds: bool) {
        let Some(agent) = &self.agent else {
            return;
        };
        let (ufrag, pwd) = agent.local_credentials();
        debug!("{} Sending credentials (need_creds={})", self.label, need_creds);
        self.publish(
            Message::credentials(Credentials { ufrag, pwd, need_creds }),
            CREDENTIALS_PUBLISH_TIMEOUT,
            "credentials",
        );
    }

    /// Credentials are re-sent with backoff for as long as the peer is idle.
    fn resend_credentials(&mut self) {
        self.resend_at = None;
        if self.state() != PeerState::Idle {
            return;
        }
        self.send_credentials(true);
        let delay = self.creds_backoff.next().unwrap_or(Duration::from_secs(60));
        self.resend_at = Some(Instant::now() + delay);
    }

    async fn on_delivery(&mut self, d: Delivery) {
        if d.sender != self.theirs {
            warn!("{} Ignoring message from {}", self.label, d.sender);
            return;
        }
        self.ctx.intf.metrics.inc_received();

        if let Some(creds) = d.message.credentials {
            self.on_remote_credentials(creds).await;
        }
        if let Some(c) = d.message.candidate {
            self.on_remote_candidate(c).await;
        }
    }

    async fn on_remote_credentials(&mut self, creds: Credentials) {
        let state = self.state();
        if matches!(
            state,
            PeerState::Closed | PeerState::Creating | PeerState::Closing | PeerState::Restarting
        ) {
            debug!("{} Ignoring credentials in state {}", self.label, state);
            return;
        }

        if let Some(current) = &self.remote_creds {
            if is_session_restart(current, &creds) {
                self.restart("remote credentials changed", Duration::ZERO).await;
            } else if creds.need_creds {
                self.send_credentials(false);
            }
            return;
        }

        let Some(agent) = self.agent.clone() else {
            return;
        };
        if let Err(e) = agent.set_remote_credentials(&creds.ufrag, &creds.pwd).await {
            warn!("{} Failed to set remote credentials: {:#}", self.label, e);
            return;
        }
        self.remote_creds = Some((creds.ufrag.clone(), creds.pwd.clone()));

        if !self.transition(PeerState::Idle, PeerState::New) {
            return;
        }
        self.resend_at = None;

        if creds.need_creds {
            self.send_credentials(false);
        }
        if let Err(e) = agent.gather_candidates().await {
            warn!("{} Failed to gather candidates: {:#}", self.label, e);
        }
    }

    async fn on_remote_candidate(&mut self, c: Candidate) {
        let state = self.state();
        let Some(agent) = self.agent.clone() else {
            return;
        };

        match state {
            PeerState::New | PeerState::Connecting | PeerState::Connected | PeerState::Failed | PeerState::Disconnected => {}
            _ => {
                debug!("{} Dropping candidate received in state {}: {}", self.label, state, c);
                return;
            }
        }

        debug!("{} Remote candidate {}", self.label, c);
        if let Err(e) = agent.add_remote_candidate(c).await {
            warn!("{} Failed to add remote candidate: {:#}", self.label, e);
            return;
        }
        self.ctx.intf.metrics.inc_candidates_received();

        if state == PeerState::New && self.transition(PeerState::New, PeerState::Connecting) {
            self.connect(agent);
        }
    }

    fn connect(&self, agent: Arc<Agent>) {
        let Some((ufrag, pwd)) = self.remote_creds.clone() else {
            return;
        };
        let controlling = self.controlling();
        let generation = self.generation;
        let tx = self.connected_tx.clone();

        info!(
            "{} Connecting as {} agent",
            self.label,
            if controlling { "controlling" } else { "controlled" }
        );
        tokio::spawn(async move {
            let res = if controlling {
                agent.dial(&ufrag, &pwd).await
            } else {
                agent.accept(&ufrag, &pwd).await
            };
            let _ = tx.send((generation, res)).await;
        });
    }

    async fn on_connected(&mut self, res: Result<Arc<IceConn>>) {
        let conn = match res {
            Ok(c) => c,
            Err(e) => {
                if self.state() == PeerState::Connecting {
                    warn!("{} Connecting failed: {:#}", self.label, e);
                    self.restart("connect failed", self.ctx.settings.restart_timeout()).await;
                }
                return;
            }
        };

        let pair = match &self.agent {
            Some(a) => a.selected_pair().await,
            None => None,
        };
        let Some(pair) = pair else {
            warn!("{} Connected without a selected pair", self.label);
            self.restart("no selected pair", Duration::ZERO).await;
            return;
        };

        let endpoint = match self.update_proxy(&pair, conn).await {
            Ok(ep) => ep,
            Err(e) => {
                error!("{} Failed to set up proxy: {:#}", self.label, e);
                self.restart("proxy setup failed", self.ctx.settings.restart_timeout()).await;
                return;
            }
        };

        if self.last_endpoint != Some(endpoint) {
            if let Err(e) = self
                .ctx
                .intf
                .client
                .set_endpoint(&self.ctx.intf.name, &self.theirs, endpoint)
                .await
            {
                error!("{} Failed to set endpoint {}: {:#}", self.label, endpoint, e);
            } else {
                self.last_endpoint = Some(endpoint);
                self.ctx.intf.request_sync();
            }
        }

        {
            let mut info = self.shared.info.lock();
            info.selected = Some(pair.clone());
            info.endpoint = self.last_endpoint;
        }

        if self.transition(PeerState::Connecting, PeerState::Connected) {
            info!(
                "✅ {} Connected via {} <-> {} (endpoint {})",
                self.label,
                pair.local.typ,
                pair.remote.typ,
                endpoint
            );
        }
    }

    /// Bridge `pair`. A proxy of a different type replaces the current one.
    async fn update_proxy(&mut self, pair: &CandidatePair, conn: Arc<IceConn>) -> Result<SocketAddr> {
        let want = self.proxy_ctx.select(pair);
        let mut proxy = match self.proxy.take() {
            Some(p) if p.typ() == want => p,
            old => {
                let new = Proxy::new(want, &self.proxy_ctx)?;
                if let Some(mut old) = old {
                    old.close().await;
                }
                self.ctx.intf.metrics.inc_proxy(want);
                new
            }
        };

        let res = proxy.update_candidate_pair(pair, conn).await;
        self.proxy = Some(proxy);
        self.shared.info.lock().proxy = Some(want);
        res
    }

    async fn on_agent_event(&mut self, ev: AgentEvent) {
        match ev {
            AgentEvent::Candidate(Some(c)) => {
                debug!("{} Local candidate {}", self.label, c);
                self.ctx.intf.metrics.inc_candidates_sent();
                self.publish(Message::candidate(c), CANDIDATE_PUBLISH_TIMEOUT, "candidate");
            }
            AgentEvent::Candidate(None) => debug!("{} Gathering completed", self.label),
            AgentEvent::SelectedPair(p) => {
                debug!("{} Selected pair {} <-> {}", self.label, p.local, p.remote);
            }
            AgentEvent::ConnectionState(s) => self.on_ice_state(s).await,
        }
    }

    async fn on_ice_state(&mut self, s: ConnectionState) {
        if self.state() == PeerState::Closing {
            return;
        }
        debug!("{} ICE connection state {}", self.label, s);

        let (to, reason) = match s {
            ConnectionState::Failed => (PeerState::Failed, "ICE failed"),
            ConnectionState::Disconnected => (PeerState::Disconnected, "ICE disconnected"),
            _ => return,
        };
        let unless = [
            PeerState::Closed,
            PeerState::Closing,
            PeerState::Restarting,
            PeerState::Creating,
        ];
        if self.set_state_unless(to, &unless) {
            self.restart(reason, self.ctx.settings.restart_timeout()).await;
        }
    }

    /// Close the agent and schedule a new one after `delay`.
    async fn restart(&mut self, reason: &str, delay: Duration) {
        let unless = [
            PeerState::Closed,
            PeerState::Closing,
            PeerState::Restarting,
            PeerState::Creating,
        ];
        if !self.set_state_unless(PeerState::Restarting, &unless) {
            return;
        }

        let restarts = self.shared.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        self.ctx.intf.metrics.inc_restarts();
        info!("🔄 {} Restarting session ({}), restart #{}", self.label, reason, restarts);

        self.resend_at = None;
        self.close_agent().await;
        if self.transition(PeerState::Restarting, PeerState::Closed) && self.ours.is_set() {
            self.recreate_at = Some(Instant::now() + delay);
        }
    }

    async fn close_agent(&mut self) {
        if let Some(agent) = self.agent.take() {
            agent.close().await;
        }
        self.remote_creds = None;
        // The next session sets the endpoint again, even if the proxy keeps its address
        self.last_endpoint = None;
        let mut info = self.shared.info.lock();
        info.selected = None;
        info.endpoint = None;
    }

    async fn on_control(&mut self, c: Control) {
        match c {
            Control::KeyChanged(sk) => {
                if sk == self.ours {
                    return;
                }
                info!("{} Interface key changed, resubscribing", self.label);
                self.ours = sk;
                self.update_controlling();
                if sk.is_set() {
                    self.subscribe();
                } else {
                    self.unsubscribe();
                }

                if self.state() == PeerState::Closed {
                    if sk.is_set() {
                        self.recreate_at = Some(Instant::now());
                    }
                } else {
                    self.restart("key changed", Duration::ZERO).await;
                }
            }
            Control::ListenPort(port) => {
                self.proxy_ctx.listen_port = port;
                if let Some(p) = &mut self.proxy {
                    if let Err(e) = p.update_listen_port(port).await {
                        warn!("{} Failed to follow listen port {}: {:#}", self.label, port, e);
                    }
                }
            }
            Control::EndpointChanged(ep) => {
                if self.state() == PeerState::Connected && ep.is_some() && ep != self.last_endpoint {
                    warn!(
                        "{} Endpoint changed externally to {:?} (ours {:?})",
                        self.label, ep, self.last_endpoint
                    );
                }
            }
            Control::Restart => {
                if self.state() == PeerState::Closed {
                    debug!("{} No session to restart", self.label);
                } else {
                    self.restart("requested", Duration::ZERO).await;
                }
            }
            Control::Close(_) => {}
        }
    }

    async fn close(&mut self) {
        let prev = self.shared.state.swap(PeerState::Closing);
        self.on_state_change(prev, PeerState::Closing);

        self.unsubscribe();
        if self.ours.is_set() {
            let backend = Arc::clone(&self.ctx.backend);
            let channel = self.public_pair();
            tokio::spawn(async move { backend.withdraw(&channel).await });
        }
        self.resend_at = None;
        self.recreate_at = None;
        self.close_agent().await;
        if let Some(mut p) = self.proxy.take() {
            p.close().await;
        }
        self.shared.info.lock().proxy = None;
        self.publisher.abort();

        self.transition(PeerState::Closing, PeerState::Closed);
        debug!("{} Closed", self.label);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.ctx.backend.unsubscribe(id);
        }
        self.publisher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceSettings;
    use crate::ice::{self, MuxKind, NetworkType};
    use crate::interface::testing::memory_interface;
    use tokio::net::UdpSocket;

    fn settings() -> InterfaceSettings {
        let mut s = InterfaceSettings::default();
        s.ice.candidate_types = vec![CandidateType::Host];
        s.ice.network_types = vec![NetworkType::Udp4];
        s.ice.urls = Vec::new();
        s
    }

    /// Remote end of the signaling channel, driven by the test.
    struct Remote {
        kp: KeyPair,
        backend: Arc<MultiBackend>,
        rx: mpsc::Receiver<Delivery>,
    }

    impl Remote {
        fn new(backend: Arc<MultiBackend>, theirs: Key) -> Self {
            let kp = KeyPair::new(Key::generate_private(), theirs);
            let (tx, rx) = mpsc::channel(64);
            backend.subscribe(kp, tx);
            Self { kp, backend, rx }
        }

        fn public_key(&self) -> Key {
            self.kp.ours.public_key()
        }

        async fn send(&self, msg: Message) {
            self.backend.publish(&self.kp, &msg).await.unwrap();
        }

        async fn send_credentials(&self, (ufrag, pwd): (String, String), need_creds: bool) {
            self.send(Message::credentials(Credentials { ufrag, pwd, need_creds }))
                .await;
        }

        /// Next credentials message, skipping candidates.
        async fn credentials(&mut self, within: Duration) -> Option<Credentials> {
            let deadline = Instant::now() + within;
            loop {
                match timeout(deadline.saturating_duration_since(Instant::now()), self.rx.recv()).await {
                    Ok(Some(d)) => {
                        if let Some(c) = d.message.credentials {
                            return Some(c);
                        }
                    }
                    Ok(None) | Err(_) => return None,
                }
            }
        }
    }

    struct Harness {
        intf: Arc<Interface>,
        handle: PeerHandle,
        remote: Remote,
    }

    async fn harness(name: &str, settings: InterfaceSettings) -> Harness {
        let backend = Arc::new(MultiBackend::new(&["inprocess:".to_string()]).await.unwrap());
        let (intf, _dev) = memory_interface(name, settings);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mux = Arc::new(UdpMux::from_sockets(MuxKind::Host, vec![socket]).unwrap());

        let ctx = Arc::new(PeerContext {
            settings: intf.settings.ice.clone(),
            intf: Arc::clone(&intf),
            backend: Arc::clone(&backend),
            host_mux: Some(mux),
            srflx_mux: None,
        });
        let remote = Remote::new(backend, intf.public_key());
        let proxy_ctx = ProxyContext {
            nat: None,
            bind: None,
            listen_port: 51820,
        };
        let handle = PeerHandle::spawn(ctx, intf.private_key(), remote.public_key(), proxy_ctx);
        Harness { intf, handle, remote }
    }

    async fn wait_status(handle: &PeerHandle, what: &str, f: impl Fn(&PeerStatus) -> bool) -> PeerStatus {
        for _ in 0..300 {
            let s = handle.status();
            if f(&s) {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("peer never reached {}: {:?}", what, handle.status());
    }

    #[tokio::test]
    async fn test_credentials_resent_while_idle() {
        let mut h = harness("wg-pc0", settings()).await;
        wait_status(&h.handle, "idle", |s| s.state == PeerState::Idle).await;

        let first = h.remote.credentials(Duration::from_secs(3)).await.unwrap();
        assert!(first.need_creds);
        let second = h.remote.credentials(Duration::from_secs(3)).await.unwrap();
        assert!(second.need_creds);
        assert_eq!(second.ufrag, first.ufrag);

        h.remote.send_credentials(ice::generate_credentials(), true).await;
        let reply = h.remote.credentials(Duration::from_secs(3)).await.unwrap();
        assert!(!reply.need_creds);
        assert_eq!(reply.ufrag, first.ufrag);
        assert_eq!(h.handle.status().state, PeerState::New);

        // No longer idle, so nothing is re-sent
        assert!(h.remote.credentials(Duration::from_millis(2500)).await.is_none());
        h.handle.close().await;
    }

    #[tokio::test]
    async fn test_candidates_before_new_are_dropped() {
        let mut h = harness("wg-pc1", settings()).await;
        wait_status(&h.handle, "idle", |s| s.state == PeerState::Idle).await;
        h.remote.credentials(Duration::from_secs(3)).await.unwrap();

        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let candidate = Candidate::host(silent.local_addr().unwrap(), 1);
        h.remote.send(Message::candidate(candidate.clone())).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.intf.metrics.candidates_received_total.load(Ordering::Relaxed), 0);
        assert_eq!(h.handle.status().state, PeerState::Idle);

        h.remote.send_credentials(ice::generate_credentials(), false).await;
        wait_status(&h.handle, "new", |s| s.state == PeerState::New).await;
        h.remote.send(Message::candidate(candidate)).await;
        wait_status(&h.handle, "connecting", |s| s.state == PeerState::Connecting).await;
        assert_eq!(h.intf.metrics.candidates_received_total.load(Ordering::Relaxed), 1);

        h.handle.close().await;
    }

    #[tokio::test]
    async fn test_changed_credentials_restart_session() {
        let mut h = harness("wg-pc2", settings()).await;
        let idle = wait_status(&h.handle, "idle", |s| s.state == PeerState::Idle).await;
        let first = h.remote.credentials(Duration::from_secs(3)).await.unwrap();

        let pair = PublicKeyPair {
            ours: h.intf.public_key(),
            theirs: h.remote.public_key(),
        };
        assert_eq!(idle.controlling, pair.is_controlling());

        h.remote.send_credentials(ice::generate_credentials(), false).await;
        wait_status(&h.handle, "new", |s| s.state == PeerState::New).await;

        // Different credentials mean the remote started a new session
        h.remote.send_credentials(ice::generate_credentials(), false).await;
        let restarted = wait_status(&h.handle, "restarted", |s| s.restarts == 1 && s.state == PeerState::Idle).await;
        assert_eq!(restarted.controlling, idle.controlling);
        assert_eq!(h.intf.metrics.agent_restarts_total.load(Ordering::Relaxed), 1);

        // The new agent advertises fresh credentials
        let mut fresh = None;
        while let Some(c) = h.remote.credentials(Duration::from_secs(3)).await {
            if c.need_creds && c.ufrag != first.ufrag {
                fresh = Some(c);
                break;
            }
        }
        assert!(fresh.is_some());

        h.handle.close().await;
    }

    #[tokio::test]
    async fn test_requested_restart() {
        let mut h = harness("wg-pc4", settings()).await;
        wait_status(&h.handle, "idle", |s| s.state == PeerState::Idle).await;
        let first = h.remote.credentials(Duration::from_secs(3)).await.unwrap();

        h.handle.send(Control::Restart);
        wait_status(&h.handle, "restarted", |s| s.restarts == 1 && s.state == PeerState::Idle).await;
        assert_eq!(h.intf.metrics.agent_restarts_total.load(Ordering::Relaxed), 1);

        let mut fresh = None;
        while let Some(c) = h.remote.credentials(Duration::from_secs(3)).await {
            if c.ufrag != first.ufrag {
                fresh = Some(c);
                break;
            }
        }
        assert!(fresh.is_some());

        h.handle.close().await;
    }

    #[tokio::test]
    async fn test_ice_failure_restarts_agent() {
        let mut s = settings();
        s.ice.disconnected_timeout_secs = 1;
        s.ice.failed_timeout_secs = 1;
        s.ice.restart_timeout_secs = 0;
        let mut h = harness("wg-pc3", s).await;
        let idle = wait_status(&h.handle, "idle", |s| s.state == PeerState::Idle).await;
        h.remote.credentials(Duration::from_secs(3)).await.unwrap();

        // Nobody answers checks on this address
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        h.remote.send_credentials(ice::generate_credentials(), false).await;
        wait_status(&h.handle, "new", |s| s.state == PeerState::New).await;
        h.remote
            .send(Message::candidate(Candidate::host(silent.local_addr().unwrap(), 1)))
            .await;
        wait_status(&h.handle, "connecting", |s| s.state == PeerState::Connecting).await;

        let restarted = wait_status(&h.handle, "restarted", |s| s.restarts >= 1 && s.state == PeerState::Idle).await;
        assert_eq!(restarted.controlling, idle.controlling);
        assert_eq!(restarted.reachability, Reachability::None);
        assert!(restarted.selected_pair.is_none());

        h.handle.close().await;
    }
}
