//! ICE agent
//!
//! ### Design
//! Every agent is one task owning all of its state. The public [`Agent`] handle
//! talks to it over a command channel; the task selects over commands,
//! datagrams routed by the muxes and a check timer.
//!
//! ### Nomination
//! Nomination is aggressive. The controlling agent flags every check with
//! USE-CANDIDATE and selects the first pair that succeeds. The controlled agent
//! selects the first succeeded pair the remote has nominated. Once selected,
//! a pair stays selected until the agent is closed.
//!
//! ### Liveness
//! The selected pair is kept alive with Binding requests. Without inbound
//! traffic the agent turns `Disconnected`, and `Failed` after the failed
//! timeout.

use anyhow::{anyhow, bail, Result};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::candidate::{compute_priority, pair_priority, Candidate, CandidateType, NetworkType, COMPONENT_RTP};
use super::conn::IceConn;
use super::mux::{Inbound, MuxSocket, UdpMux};
use super::stun::{self, Class, Message, MessageBuilder, TransactionId, METHOD_BINDING};
use super::{generate_credentials, CandidatePair, ConnectionState, StunUrl};
use crate::config::IceSettings;

const GATHER_RTO: Duration = Duration::from_millis(500);
const GATHER_ATTEMPTS: u32 = 3;
const CHECK_RTO: Duration = Duration::from_millis(250);
const CHECK_RTO_MAX: Duration = Duration::from_secs(3);
const TRANSACTION_TTL: Duration = Duration::from_secs(30);
const DNS_TIMEOUT: Duration = Duration::from_secs(3);
const COMMAND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;
const CONN_QUEUE: usize = 512;

#[derive(Clone)]
pub struct AgentConfig {
    pub local_ufrag: String,
    pub local_pwd: String,
    pub urls: Vec<StunUrl>,
    pub candidate_types: Vec<CandidateType>,
    pub network_types: Vec<NetworkType>,
    pub host_mux: Option<Arc<UdpMux>>,
    pub srflx_mux: Option<Arc<UdpMux>>,
    pub check_interval: Duration,
    pub disconnected_timeout: Duration,
    pub failed_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_binding_requests: u32,
}

impl AgentConfig {
    /// Agent configuration with fresh local credentials.
    pub fn from_settings(
        settings: &IceSettings,
        host_mux: Option<Arc<UdpMux>>,
        srflx_mux: Option<Arc<UdpMux>>,
    ) -> Result<Self> {
        let (local_ufrag, local_pwd) = generate_credentials();
        let urls = settings
            .urls
            .iter()
            .map(|u| StunUrl::parse(u))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            local_ufrag,
            local_pwd,
            urls,
            candidate_types: settings.candidate_types.clone(),
            network_types: settings.network_types.clone(),
            host_mux,
            srflx_mux,
            check_interval: settings.check_interval(),
            disconnected_timeout: settings.disconnected_timeout(),
            failed_timeout: settings.failed_timeout(),
            keepalive_interval: settings.keepalive_interval(),
            max_binding_requests: settings.max_binding_requests.max(1),
        })
    }
}

/// Notifications emitted by an agent, tagged with its generation.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A gathered local candidate, `None` once gathering completed.
    Candidate(Option<Candidate>),
    ConnectionState(ConnectionState),
    SelectedPair(CandidatePair),
}

enum Command {
    GatherCandidates,
    AddRemoteCandidate(Candidate),
    SetRemoteCredentials {
        ufrag: String,
        pwd: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        controlling: bool,
        ufrag: String,
        pwd: String,
        reply: oneshot::Sender<Result<Arc<IceConn>>>,
    },
    SelectedPair(oneshot::Sender<Option<CandidatePair>>),
    Close(oneshot::Sender<()>),
}

/// Handle to a running agent. Dropping it closes the agent.
pub struct Agent {
    local_ufrag: String,
    local_pwd: String,
    commands: mpsc::Sender<Command>,
}

impl Agent {
    pub fn new(config: AgentConfig, generation: u64, events: mpsc::Sender<(u64, AgentEvent)>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        for mux in [&config.host_mux, &config.srflx_mux].into_iter().flatten() {
            mux.register(&config.local_ufrag, inbound_tx.clone());
        }

        let agent = Agent {
            local_ufrag: config.local_ufrag.clone(),
            local_pwd: config.local_pwd.clone(),
            commands,
        };

        let now = Instant::now();
        let task = AgentTask {
            cfg: config,
            generation,
            events,
            tie_breaker: rand::random(),
            remote_ufrag: None,
            remote_pwd: None,
            controlling: None,
            locals: Vec::new(),
            remotes: Vec::new(),
            pairs: Vec::new(),
            selected: None,
            transactions: HashMap::new(),
            state: ConnectionState::New,
            gathering_started: false,
            gathering_done: false,
            gather_pending: 0,
            checking_since: None,
            last_received: now,
            last_keepalive: now,
            connect_reply: None,
            conn_tx: None,
            conn_closed: None,
        };
        tokio::spawn(task.run(command_rx, inbound_rx));

        agent
    }

    pub fn local_credentials(&self) -> (String, String) {
        (self.local_ufrag.clone(), self.local_pwd.clone())
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| anyhow!("ICE agent is closed"))
    }

    pub async fn gather_candidates(&self) -> Result<()> {
        self.command(Command::GatherCandidates).await
    }

    pub async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        self.command(Command::AddRemoteCandidate(candidate)).await
    }

    /// Fails if different credentials were set before.
    pub async fn set_remote_credentials(&self, ufrag: &str, pwd: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SetRemoteCredentials {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("ICE agent is closed"))?
    }

    /// Run connectivity checks as the controlling agent.
    pub async fn dial(&self, ufrag: &str, pwd: &str) -> Result<Arc<IceConn>> {
        self.connect(true, ufrag, pwd).await
    }

    /// Run connectivity checks as the controlled agent.
    pub async fn accept(&self, ufrag: &str, pwd: &str) -> Result<Arc<IceConn>> {
        self.connect(false, ufrag, pwd).await
    }

    async fn connect(&self, controlling: bool, ufrag: &str, pwd: &str) -> Result<Arc<IceConn>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            controlling,
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| anyhow!("ICE agent closed while connecting"))?
    }

    pub async fn selected_pair(&self) -> Option<CandidatePair> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SelectedPair(reply)).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Stop the agent and wait for it to release its mux routes.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.command(Command::Close(done)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

struct Pair {
    local: usize,
    remote: usize,
    state: PairState,
    nominated: bool,
    triggered: bool,
    requests: u32,
    last_sent: Option<Instant>,
}

struct LocalCandidate {
    candidate: Candidate,
    mux: Arc<UdpMux>,
    socket: Arc<MuxSocket>,
}

enum TransactionKind {
    Gather {
        mux: Arc<UdpMux>,
        socket: Arc<MuxSocket>,
        server: SocketAddr,
        attempts: u32,
    },
    Check {
        pair: usize,
    },
    Keepalive,
}

struct Transaction {
    kind: TransactionKind,
    sent: Instant,
}

struct AgentTask {
    cfg: AgentConfig,
    generation: u64,
    events: mpsc::Sender<(u64, AgentEvent)>,
    tie_breaker: u64,

    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    controlling: Option<bool>,

    locals: Vec<LocalCandidate>,
    remotes: Vec<Candidate>,
    pairs: Vec<Pair>,
    selected: Option<usize>,
    transactions: HashMap<TransactionId, Transaction>,

    state: ConnectionState,
    gathering_started: bool,
    gathering_done: bool,
    gather_pending: usize,
    checking_since: Option<Instant>,
    last_received: Instant,
    last_keepalive: Instant,

    connect_reply: Option<oneshot::Sender<Result<Arc<IceConn>>>>,
    conn_tx: Option<mpsc::Sender<Vec<u8>>>,
    conn_closed: Option<Arc<AtomicBool>>,
}

impl AgentTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbound: mpsc::Receiver<Inbound>) {
        let mut ticker = tokio::time::interval(self.cfg.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Close(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(inb) = inbound.recv() => self.handle_inbound(inb).await,
                _ = ticker.tick() => self.on_tick().await,
            }
        }
        self.shutdown();
    }

    fn emit(&self, event: AgentEvent) {
        match self.events.try_send((self.generation, event)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let tx = self.events.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(
            "ICE agent {} state {} -> {}",
            self.cfg.local_ufrag, self.state, state
        );
        self.state = state;
        self.emit(AgentEvent::ConnectionState(state));
    }

    fn fail(&mut self, reason: &str) {
        info!("ICE agent {} failed: {}", self.cfg.local_ufrag, reason);
        self.set_state(ConnectionState::Failed);
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(anyhow!("ICE connectivity checks failed: {reason}")));
        }
    }

    fn shutdown(&mut self) {
        for mux in [&self.cfg.host_mux, &self.cfg.srflx_mux].into_iter().flatten() {
            mux.unregister(&self.cfg.local_ufrag);
        }
        if let Some(closed) = self.conn_closed.take() {
            closed.store(true, Ordering::Release);
        }
        self.conn_tx = None;
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(anyhow!("ICE agent closed")));
        }
        self.set_state(ConnectionState::Closed);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::GatherCandidates => self.gather().await,
            Command::AddRemoteCandidate(c) => {
                if !c.network_type.is_udp() {
                    debug!("Ignoring non-UDP remote candidate {}", c);
                } else if self.remotes.iter().any(|r| r.addr() == c.addr()) {
                    trace!("Duplicate remote candidate {}", c);
                } else {
                    debug!("Adding remote candidate {}", c);
                    self.add_remote(c);
                }
            }
            Command::SetRemoteCredentials { ufrag, pwd, reply } => {
                let _ = reply.send(self.set_remote_credentials(ufrag, pwd));
            }
            Command::Connect {
                controlling,
                ufrag,
                pwd,
                reply,
            } => {
                if self.controlling.is_some() {
                    let _ = reply.send(Err(anyhow!("ICE agent is already connecting")));
                    return;
                }
                if matches!(self.state, ConnectionState::Failed | ConnectionState::Closed) {
                    let _ = reply.send(Err(anyhow!("ICE agent is {}", self.state)));
                    return;
                }
                if let Err(e) = self.set_remote_credentials(ufrag, pwd) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.controlling = Some(controlling);
                self.checking_since = Some(Instant::now());
                self.connect_reply = Some(reply);
                self.set_state(ConnectionState::Checking);
            }
            Command::SelectedPair(reply) => {
                let _ = reply.send(self.selected_pair());
            }
            Command::Close(_) => {}
        }
    }

    fn set_remote_credentials(&mut self, ufrag: String, pwd: String) -> Result<()> {
        match (&self.remote_ufrag, &self.remote_pwd) {
            (Some(u), Some(p)) if *u == ufrag && *p == pwd => Ok(()),
            (Some(_), _) => bail!("remote credentials already set"),
            _ => {
                self.remote_ufrag = Some(ufrag);
                self.remote_pwd = Some(pwd);
                Ok(())
            }
        }
    }

    fn selected_pair(&self) -> Option<CandidatePair> {
        let p = &self.pairs[self.selected?];
        Some(CandidatePair {
            local: self.locals[p.local].candidate.clone(),
            remote: self.remotes[p.remote].clone(),
        })
    }

    fn network_allowed(&self, addr: SocketAddr) -> bool {
        self.cfg
            .network_types
            .contains(&NetworkType::for_addr(addr.ip(), false))
    }

    async fn gather(&mut self) {
        if self.gathering_started {
            debug!("Gathering already started for {}", self.cfg.local_ufrag);
            return;
        }
        self.gathering_started = true;

        if self.cfg.candidate_types.contains(&CandidateType::Host) {
            if let Some(mux) = self.cfg.host_mux.clone() {
                for socket in mux.sockets() {
                    if !self.network_allowed(socket.local) {
                        continue;
                    }
                    let pref = u16::MAX.saturating_sub(socket.index as u16);
                    let c = Candidate::host(socket.local, pref);
                    self.add_local(c, Arc::clone(&mux), Arc::clone(socket));
                }
            }
        }

        if self.cfg.candidate_types.contains(&CandidateType::ServerReflexive) {
            if let Some(mux) = self.cfg.srflx_mux.clone() {
                self.gather_server_reflexive(mux).await;
            }
        }

        if self.cfg.candidate_types.contains(&CandidateType::Relay) {
            trace!("Relay candidates are not gathered locally");
        }

        if self.gather_pending == 0 {
            self.finish_gathering();
        }
    }

    async fn gather_server_reflexive(&mut self, mux: Arc<UdpMux>) {
        let now = Instant::now();
        for url in self.cfg.urls.clone() {
            if !url.is_stun() {
                continue;
            }

            let lookup = tokio::net::lookup_host((url.host.as_str(), url.port));
            let server = match tokio::time::timeout(DNS_TIMEOUT, lookup).await {
                Ok(Ok(mut addrs)) => addrs.find(|a| a.is_ipv4()),
                Ok(Err(e)) => {
                    warn!("Failed to resolve STUN server {}: {}", url, e);
                    continue;
                }
                Err(_) => {
                    warn!("Timed out resolving STUN server {}", url);
                    continue;
                }
            };
            let Some(server) = server else {
                debug!("STUN server {} has no IPv4 address", url);
                continue;
            };

            for socket in mux.sockets() {
                let txid = stun::new_transaction_id();
                let req = MessageBuilder::binding_request(&txid).fingerprint().build();
                if let Err(e) = mux.send_to(socket, &self.cfg.local_ufrag, &req, server).await {
                    debug!("STUN request to {} failed: {}", server, e);
                    continue;
                }
                self.transactions.insert(
                    txid,
                    Transaction {
                        kind: TransactionKind::Gather {
                            mux: Arc::clone(&mux),
                            socket: Arc::clone(socket),
                            server,
                            attempts: 1,
                        },
                        sent: now,
                    },
                );
                self.gather_pending += 1;
            }
        }
    }

    fn gather_step_done(&mut self) {
        self.gather_pending = self.gather_pending.saturating_sub(1);
        if self.gather_pending == 0 {
            self.finish_gathering();
        }
    }

    fn finish_gathering(&mut self) {
        if self.gathering_done {
            return;
        }
        self.gathering_done = true;
        debug!(
            "Gathering complete for {}: {} local candidates",
            self.cfg.local_ufrag,
            self.locals.len()
        );
        self.emit(AgentEvent::Candidate(None));
    }

    fn compatible(&self, local: usize, remote: usize) -> bool {
        let l = &self.locals[local];
        let r = &self.remotes[remote];
        r.network_type.is_udp() && l.socket.local.is_ipv4() == r.address.is_ipv4()
    }

    fn add_local(&mut self, candidate: Candidate, mux: Arc<UdpMux>, socket: Arc<MuxSocket>) -> usize {
        debug!("Gathered local candidate {}", candidate);
        self.emit(AgentEvent::Candidate(Some(candidate.clone())));

        let idx = self.locals.len();
        self.locals.push(LocalCandidate {
            candidate,
            mux,
            socket,
        });
        for r in 0..self.remotes.len() {
            if self.compatible(idx, r) {
                self.pairs.push(Pair::new(idx, r));
            }
        }
        idx
    }

    fn add_remote(&mut self, candidate: Candidate) -> usize {
        let idx = self.remotes.len();
        self.remotes.push(candidate);
        for l in 0..self.locals.len() {
            if self.compatible(l, idx) {
                self.pairs.push(Pair::new(l, idx));
            }
        }
        idx
    }

    fn find_or_add_pair(&mut self, local: usize, remote: usize) -> usize {
        if let Some(i) = self
            .pairs
            .iter()
            .position(|p| p.local == local && p.remote == remote)
        {
            return i;
        }
        self.pairs.push(Pair::new(local, remote));
        self.pairs.len() - 1
    }

    fn pair_priority(&self, pair: &Pair) -> u64 {
        let l = self.locals[pair.local].candidate.priority;
        let r = self.remotes[pair.remote].priority;
        if self.controlling == Some(true) {
            pair_priority(l, r)
        } else {
            pair_priority(r, l)
        }
    }

    fn is_selected_remote(&self, inb: &Inbound) -> bool {
        let Some(sel) = self.selected else {
            return false;
        };
        let p = &self.pairs[sel];
        Arc::ptr_eq(&self.locals[p.local].socket, &inb.socket) && self.remotes[p.remote].addr() == inb.from
    }

    fn touch(&mut self) {
        self.last_received = Instant::now();
        if self.state == ConnectionState::Disconnected {
            self.set_state(ConnectionState::Connected);
        }
    }

    async fn send(&self, local: usize, buf: &[u8], to: SocketAddr) {
        let l = &self.locals[local];
        if let Err(e) = l.mux.send_to(&l.socket, &self.cfg.local_ufrag, buf, to).await {
            debug!("Send from {} to {} failed: {}", l.socket.local, to, e);
        }
    }

    async fn handle_inbound(&mut self, inb: Inbound) {
        if !stun::is_stun(&inb.data) {
            self.handle_data(inb);
            return;
        }

        let msg = match Message::parse(&inb.data) {
            Ok(m) => m,
            Err(e) => {
                trace!("Malformed STUN message from {}: {}", inb.from, e);
                return;
            }
        };
        if !msg.verify_fingerprint() {
            trace!("Bad STUN fingerprint from {}", inb.from);
            return;
        }

        match msg.class {
            Class::Request if msg.is_binding_request() => self.handle_request(&inb, &msg).await,
            Class::Success | Class::Error => self.handle_response(&inb, &msg),
            _ => {
                if self.is_selected_remote(&inb) {
                    self.touch();
                }
            }
        }
    }

    fn handle_data(&mut self, inb: Inbound) {
        if !self.is_selected_remote(&inb) {
            trace!("Dropping {} bytes from {}: not the selected pair", inb.data.len(), inb.from);
            return;
        }
        self.touch();
        if let Some(tx) = &self.conn_tx {
            if tx.try_send(inb.data).is_err() {
                trace!("Connection queue full, dropping datagram");
            }
        }
    }

    async fn handle_request(&mut self, inb: &Inbound, msg: &Message) {
        let Some(remote_ufrag) = self.remote_ufrag.clone() else {
            trace!("Check from {} before remote credentials are known", inb.from);
            return;
        };
        let expected = format!("{}:{}", self.cfg.local_ufrag, remote_ufrag);
        if msg.username() != Some(expected.as_str()) {
            debug!("Check from {} with unexpected username {:?}", inb.from, msg.username());
            return;
        }
        if !msg.verify_integrity(self.cfg.local_pwd.as_bytes()) {
            debug!("Check from {} failed integrity", inb.from);
            return;
        }

        let Some(local) = self
            .locals
            .iter()
            .position(|l| Arc::ptr_eq(&l.socket, &inb.socket))
        else {
            trace!("Check on {} without a local candidate", inb.socket.local);
            return;
        };

        let remote = match self.remotes.iter().position(|r| r.addr() == inb.from) {
            Some(i) => i,
            None => {
                let c = Candidate::peer_reflexive(inb.from, msg.priority().unwrap_or(0));
                debug!("Learned peer-reflexive candidate {}", c);
                self.add_remote(c)
            }
        };

        let response = MessageBuilder::new(METHOD_BINDING, Class::Success, &msg.transaction_id)
            .xor_mapped_address(inb.from)
            .integrity(self.cfg.local_pwd.as_bytes())
            .fingerprint()
            .build();
        self.send(local, &response, inb.from).await;

        if self.is_selected_remote(inb) {
            self.touch();
        }

        let idx = self.find_or_add_pair(local, remote);
        let controlled = self.controlling == Some(false);
        let pair = &mut self.pairs[idx];
        if msg.use_candidate() {
            pair.nominated = true;
        }
        let select = match pair.state {
            PairState::Succeeded => controlled && pair.nominated,
            PairState::InProgress => false,
            PairState::Waiting | PairState::Failed => {
                if pair.state == PairState::Failed {
                    pair.requests = 0;
                }
                pair.state = PairState::Waiting;
                pair.triggered = true;
                false
            }
        };
        if select && self.selected.is_none() {
            self.select(idx);
        }
    }

    fn handle_response(&mut self, inb: &Inbound, msg: &Message) {
        let Some(tx) = self.transactions.remove(&msg.transaction_id) else {
            trace!("Response from {} for unknown transaction", inb.from);
            return;
        };

        match tx.kind {
            TransactionKind::Gather { mux, socket, server, .. } => {
                match (msg.class, msg.xor_mapped_address()) {
                    (Class::Success, Some(mapped)) => {
                        let known = self.locals.iter().any(|l| {
                            l.candidate.typ == CandidateType::ServerReflexive && l.candidate.addr() == mapped
                        });
                        if !known {
                            let pref = u16::MAX.saturating_sub(socket.index as u16);
                            let c = Candidate::server_reflexive(mapped, socket.local, pref);
                            self.add_local(c, mux, socket);
                        }
                    }
                    _ => debug!("STUN server {} returned no mapped address", server),
                }
                self.gather_step_done();
            }
            TransactionKind::Keepalive => {
                if msg.class == Class::Success && self.is_selected_remote(inb) {
                    self.touch();
                }
            }
            TransactionKind::Check { pair } => self.handle_check_response(inb, msg, pair),
        }
    }

    fn handle_check_response(&mut self, inb: &Inbound, msg: &Message, idx: usize) {
        let Some(pwd) = &self.remote_pwd else {
            return;
        };
        if msg.class == Class::Error {
            debug!("Check to {} failed with error {:?}", inb.from, msg.error_code());
            self.pairs[idx].state = PairState::Failed;
            return;
        }
        if !msg.verify_integrity(pwd.as_bytes()) {
            debug!("Check response from {} failed integrity", inb.from);
            return;
        }
        if self.remotes[self.pairs[idx].remote].addr() != inb.from {
            debug!("Asymmetric check response from {}", inb.from);
            self.pairs[idx].state = PairState::Failed;
            return;
        }

        let pair = &mut self.pairs[idx];
        pair.state = PairState::Succeeded;
        let nominated = pair.nominated;
        trace!("Pair {} succeeded", idx);

        if self.selected.is_some() {
            if self.is_selected_remote(inb) {
                self.touch();
            }
            return;
        }
        match self.controlling {
            Some(true) => self.select(idx),
            Some(false) if nominated => self.select(idx),
            _ => {}
        }
    }

    fn select(&mut self, idx: usize) {
        self.selected = Some(idx);
        let p = &self.pairs[idx];
        let local = &self.locals[p.local];
        let remote = &self.remotes[p.remote];

        info!(
            "ICE agent {} selected {} {} <-> {} {}",
            self.cfg.local_ufrag,
            local.candidate.typ,
            local.candidate.addr(),
            remote.typ,
            remote.addr()
        );

        let (tx, rx) = mpsc::channel(CONN_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));
        let conn = Arc::new(IceConn::new(
            Arc::clone(&local.mux),
            Arc::clone(&local.socket),
            self.cfg.local_ufrag.clone(),
            remote.addr(),
            rx,
            Arc::clone(&closed),
        ));
        let pair = CandidatePair {
            local: local.candidate.clone(),
            remote: remote.clone(),
        };

        self.conn_tx = Some(tx);
        self.conn_closed = Some(closed);
        let now = Instant::now();
        self.last_received = now;
        self.last_keepalive = now;

        self.emit(AgentEvent::SelectedPair(pair));
        self.set_state(ConnectionState::Connected);
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Ok(conn));
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.retransmit_gather(now).await;
        self.transactions
            .retain(|_, t| now.duration_since(t.sent) < TRANSACTION_TTL);

        match self.state {
            ConnectionState::Checking => self.run_checks(now).await,
            ConnectionState::Connected | ConnectionState::Disconnected => self.run_liveness(now).await,
            _ => {}
        }
    }

    async fn retransmit_gather(&mut self, now: Instant) {
        let due: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|(_, t)| matches!(t.kind, TransactionKind::Gather { .. }))
            .filter(|(_, t)| now.duration_since(t.sent) >= GATHER_RTO)
            .map(|(id, _)| *id)
            .collect();

        for id in due {
            let Some(Transaction {
                kind: TransactionKind::Gather { mux, socket, server, attempts },
                ..
            }) = self.transactions.remove(&id)
            else {
                continue;
            };

            if attempts >= GATHER_ATTEMPTS {
                debug!("STUN server {} did not answer", server);
                self.gather_step_done();
                continue;
            }

            let txid = stun::new_transaction_id();
            let req = MessageBuilder::binding_request(&txid).fingerprint().build();
            if let Err(e) = mux.send_to(&socket, &self.cfg.local_ufrag, &req, server).await {
                debug!("STUN retransmit to {} failed: {}", server, e);
            }
            self.transactions.insert(
                txid,
                Transaction {
                    kind: TransactionKind::Gather {
                        mux,
                        socket,
                        server,
                        attempts: attempts + 1,
                    },
                    sent: now,
                },
            );
        }
    }

    fn check_rto(requests: u32) -> Duration {
        let shift = requests.saturating_sub(1).min(8);
        (CHECK_RTO * (1 << shift)).min(CHECK_RTO_MAX)
    }

    async fn run_checks(&mut self, now: Instant) {
        let mut due = Vec::new();
        for (i, p) in self.pairs.iter_mut().enumerate() {
            if p.state != PairState::InProgress {
                continue;
            }
            let Some(last) = p.last_sent else { continue };
            if now.duration_since(last) < Self::check_rto(p.requests) {
                continue;
            }
            if p.requests >= self.cfg.max_binding_requests {
                trace!("Pair {} failed after {} requests", i, p.requests);
                p.state = PairState::Failed;
            } else {
                due.push(i);
            }
        }
        for i in due {
            self.send_check(i, now, false).await;
        }

        let next = self
            .pairs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state == PairState::Waiting)
            .max_by_key(|(_, p)| (p.triggered, self.pair_priority(p)))
            .map(|(i, _)| i);
        if let Some(i) = next {
            self.send_check(i, now, false).await;
        }

        if let Some(since) = self.checking_since {
            if self.selected.is_none() && now.duration_since(since) >= self.cfg.failed_timeout {
                self.fail("no candidate pair succeeded");
            }
        }
    }

    async fn run_liveness(&mut self, now: Instant) {
        let idle = now.duration_since(self.last_received);
        if idle >= self.cfg.failed_timeout {
            self.fail("selected pair timed out");
            return;
        }
        if idle >= self.cfg.disconnected_timeout && self.state == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
        }

        if now.duration_since(self.last_keepalive) >= self.cfg.keepalive_interval {
            if let Some(sel) = self.selected {
                self.last_keepalive = now;
                self.send_check(sel, now, true).await;
            }
        }
    }

    async fn send_check(&mut self, idx: usize, now: Instant, keepalive: bool) {
        let (Some(ufrag), Some(pwd)) = (self.remote_ufrag.clone(), self.remote_pwd.clone()) else {
            return;
        };
        let controlling = self.controlling.unwrap_or(false);
        let local = self.pairs[idx].local;
        let to = self.remotes[self.pairs[idx].remote].addr();

        let local_pref = ((self.locals[local].candidate.priority >> 8) & 0xFFFF) as u16;
        let priority = compute_priority(CandidateType::PeerReflexive, local_pref, COMPONENT_RTP);

        let txid = stun::new_transaction_id();
        let mut builder = MessageBuilder::binding_request(&txid)
            .username(&format!("{}:{}", ufrag, self.cfg.local_ufrag))
            .priority(priority)
            .ice_role(controlling, self.tie_breaker);
        if controlling && !keepalive {
            builder = builder.use_candidate();
        }
        let req = builder.integrity(pwd.as_bytes()).fingerprint().build();

        let kind = if keepalive {
            TransactionKind::Keepalive
        } else {
            let p = &mut self.pairs[idx];
            p.state = PairState::InProgress;
            p.requests += 1;
            p.last_sent = Some(now);
            p.triggered = false;
            TransactionKind::Check { pair: idx }
        };
        self.transactions.insert(txid, Transaction { kind, sent: now });
        self.send(local, &req, to).await;
    }
}

impl Pair {
    fn new(local: usize, remote: usize) -> Self {
        Self {
            local,
            remote,
            state: PairState::Waiting,
            nominated: false,
            triggered: false,
            requests: 0,
            last_sent: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::mux::MuxKind;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    async fn loopback_config(failed_timeout: Duration) -> AgentConfig {
        let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mux = Arc::new(UdpMux::from_sockets(MuxKind::Host, vec![s]).unwrap());
        let (local_ufrag, local_pwd) = generate_credentials();
        AgentConfig {
            local_ufrag,
            local_pwd,
            urls: Vec::new(),
            candidate_types: vec![CandidateType::Host],
            network_types: vec![NetworkType::Udp4],
            host_mux: Some(mux),
            srflx_mux: None,
            check_interval: Duration::from_millis(20),
            disconnected_timeout: Duration::from_secs(2),
            failed_timeout,
            keepalive_interval: Duration::from_millis(500),
            max_binding_requests: 7,
        }
    }

    async fn gathered(events: &mut mpsc::Receiver<(u64, AgentEvent)>) -> Vec<Candidate> {
        let mut out = Vec::new();
        loop {
            let (_, ev) = timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            match ev {
                AgentEvent::Candidate(Some(c)) => out.push(c),
                AgentEvent::Candidate(None) => return out,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_agents_connect_over_loopback() {
        let (tx_a, mut ev_a) = mpsc::channel(64);
        let (tx_b, mut ev_b) = mpsc::channel(64);
        let a = Agent::new(loopback_config(Duration::from_secs(5)).await, 1, tx_a);
        let b = Agent::new(loopback_config(Duration::from_secs(5)).await, 7, tx_b);

        a.gather_candidates().await.unwrap();
        b.gather_candidates().await.unwrap();
        let ca = gathered(&mut ev_a).await;
        let cb = gathered(&mut ev_b).await;
        assert_eq!(ca.len(), 1);
        assert_eq!(ca[0].typ, CandidateType::Host);

        for c in ca {
            b.add_remote_candidate(c).await.unwrap();
        }
        for c in cb {
            a.add_remote_candidate(c).await.unwrap();
        }

        let (ua, pa) = a.local_credentials();
        let (ub, pb) = b.local_credentials();
        let (conn_a, conn_b) = timeout(Duration::from_secs(5), async {
            tokio::join!(a.dial(&ub, &pb), b.accept(&ua, &pa))
        })
        .await
        .unwrap();
        let conn_a = conn_a.unwrap();
        let conn_b = conn_b.unwrap();

        conn_a.send(b"ping over ice").await.unwrap();
        let got = timeout(Duration::from_secs(2), conn_b.recv()).await.unwrap().unwrap();
        assert_eq!(got, b"ping over ice");

        conn_b.send(b"pong").await.unwrap();
        let got = timeout(Duration::from_secs(2), conn_a.recv()).await.unwrap().unwrap();
        assert_eq!(got, b"pong");

        let pair = a.selected_pair().await.unwrap();
        assert_eq!(pair.remote.addr(), conn_a.remote_addr());

        a.close().await;
        assert!(conn_a.is_closed());
        assert!(a.gather_candidates().await.is_err());
    }

    #[tokio::test]
    async fn test_dial_fails_without_candidates() {
        let (tx, mut events) = mpsc::channel(64);
        let a = Agent::new(loopback_config(Duration::from_millis(300)).await, 3, tx);

        let r = timeout(Duration::from_secs(3), a.dial("remoteufrag", "remotepassword"))
            .await
            .unwrap();
        assert!(r.is_err());

        let mut states = Vec::new();
        while let Ok(Some((generation, ev))) = timeout(Duration::from_millis(200), events.recv()).await {
            assert_eq!(generation, 3);
            if let AgentEvent::ConnectionState(s) = ev {
                states.push(s);
            }
        }
        assert_eq!(states, vec![ConnectionState::Checking, ConnectionState::Failed]);
    }

    #[tokio::test]
    async fn test_conflicting_remote_credentials() {
        let (tx, _events) = mpsc::channel(64);
        let a = Agent::new(loopback_config(Duration::from_secs(5)).await, 1, tx);
        a.set_remote_credentials("ufrag", "pwd").await.unwrap();
        a.set_remote_credentials("ufrag", "pwd").await.unwrap();
        assert!(a.set_remote_credentials("other", "pwd").await.is_err());
    }
}
