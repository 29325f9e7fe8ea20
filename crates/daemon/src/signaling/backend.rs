//! Backend dispatch and the multi-backend fan-out.

use futures::future::join_all;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use super::envelope::{Envelope, Message};
use super::http::HttpBackend;
use super::inprocess::InProcessBackend;
use super::mcast::MulticastBackend;
use crate::crypto::{Key, KeyPair, PublicKeyPair};
use crate::error::SignalingError;

/// A decrypted message together with the key of its sender.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sender: Key,
    pub message: Message,
}

pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    kp: KeyPair,
    tx: mpsc::Sender<Delivery>,
}

/// Local subscriptions shared by all backends of a [`MultiBackend`].
///
/// Backends hand every received envelope to [`SubscriptionsRegistry::dispatch`],
/// which opens it for each matching subscription.
#[derive(Default)]
pub struct SubscriptionsRegistry {
    next_id: AtomicU64,
    subs: Mutex<HashMap<Key, Vec<Subscription>>>,
}

impl SubscriptionsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kp: KeyPair, tx: mpsc::Sender<Delivery>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs
            .lock()
            .entry(kp.ours.public_key())
            .or_default()
            .push(Subscription { id, kp, tx });
        id
    }

    /// Remove a subscription, returning its key pair.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<KeyPair> {
        let mut subs = self.subs.lock();
        let mut removed = None;
        subs.retain(|_, list| {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                removed = Some(list.remove(pos).kp);
            }
            !list.is_empty()
        });
        removed
    }

    /// Whether another subscription still listens on `kp`.
    pub fn has_subscription(&self, kp: &PublicKeyPair) -> bool {
        self.subs
            .lock()
            .get(&kp.ours)
            .is_some_and(|list| list.iter().any(|s| s.kp.theirs == kp.theirs))
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }

    /// Deliver an envelope to every subscription it is addressed to.
    ///
    /// Returns the number of successful deliveries.
    pub async fn dispatch(&self, env: &Envelope) -> usize {
        let targets: Vec<(KeyPair, mpsc::Sender<Delivery>)> = {
            let subs = self.subs.lock();
            let Some(list) = subs.get(&env.recipient) else {
                trace!("No subscription for recipient {}", env.recipient.short());
                return 0;
            };
            list.iter()
                .filter(|s| !s.kp.theirs.is_set() || s.kp.theirs == env.sender)
                .map(|s| (s.kp, s.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (kp, tx) in targets {
            match env.open(&kp) {
                Ok(message) => {
                    let d = Delivery {
                        sender: env.sender,
                        message,
                    };
                    if tx.send(d).await.is_ok() {
                        delivered += 1;
                    }
                }
                Err(e) => warn!(
                    "Dropping envelope from {} to {}: {}",
                    env.sender.short(),
                    env.recipient.short(),
                    e
                ),
            }
        }
        delivered
    }
}

/// One configured signaling transport.
pub enum Backend {
    Http(HttpBackend),
    InProcess(InProcessBackend),
    Multicast(MulticastBackend),
}

impl Backend {
    pub async fn new(uri: &str, registry: Arc<SubscriptionsRegistry>) -> Result<Backend, SignalingError> {
        let url = Url::parse(uri).map_err(|e| SignalingError::InvalidUri(format!("{uri}: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(Backend::Http(HttpBackend::new(&url, registry)?)),
            "inprocess" => Ok(Backend::InProcess(InProcessBackend::new(registry))),
            "multicast" => Ok(Backend::Multicast(MulticastBackend::new(&url, registry).await?)),
            other => Err(SignalingError::Unsupported(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Http(_) => "http",
            Backend::InProcess(_) => "inprocess",
            Backend::Multicast(_) => "multicast",
        }
    }

    pub async fn publish(&self, env: &Envelope) -> Result<(), SignalingError> {
        match self {
            Backend::Http(b) => b.publish(env).await,
            Backend::InProcess(b) => b.publish(env).await,
            Backend::Multicast(b) => b.publish(env).await,
        }
    }

    /// Start receiving envelopes for `kp`.
    pub fn subscribe(&self, kp: &PublicKeyPair) {
        match self {
            Backend::Http(b) => b.subscribe(kp),
            Backend::InProcess(_) | Backend::Multicast(_) => {}
        }
    }

    pub fn unsubscribe(&self, kp: &PublicKeyPair) {
        match self {
            Backend::Http(b) => b.unsubscribe(kp),
            Backend::InProcess(_) | Backend::Multicast(_) => {}
        }
    }

    /// Drop what we published on the channel of `kp`, where the transport stores it.
    pub async fn withdraw(&self, kp: &PublicKeyPair) -> Result<(), SignalingError> {
        match self {
            Backend::Http(b) => b.withdraw(kp).await,
            Backend::InProcess(_) | Backend::Multicast(_) => Ok(()),
        }
    }

    pub async fn close(&self) {
        match self {
            Backend::Http(b) => b.close(),
            Backend::InProcess(b) => b.close(),
            Backend::Multicast(b) => b.close(),
        }
    }
}

/// Fans publishes out to every backend and merges their deliveries.
pub struct MultiBackend {
    backends: Vec<Backend>,
    registry: Arc<SubscriptionsRegistry>,
}

impl MultiBackend {
    pub async fn new(uris: &[String]) -> Result<Self, SignalingError> {
        if uris.is_empty() {
            return Err(SignalingError::NoBackends);
        }

        let registry = Arc::new(SubscriptionsRegistry::new());
        let mut backends = Vec::with_capacity(uris.len());
        for uri in uris {
            let b = Backend::new(uri, Arc::clone(&registry)).await?;
            debug!("Signaling backend {} ready ({})", b.name(), uri);
            backends.push(b);
        }

        Ok(Self { backends, registry })
    }

    pub fn registry(&self) -> &Arc<SubscriptionsRegistry> {
        &self.registry
    }

    /// Seal and publish `msg` on all backends. Succeeds if any backend accepted it.
    pub async fn publish(&self, kp: &KeyPair, msg: &Message) -> Result<(), SignalingError> {
        let env = Envelope::seal(kp, msg)?;
        let results = join_all(self.backends.iter().map(|b| b.publish(&env))).await;

        let mut errors = Vec::new();
        for (b, r) in self.backends.iter().zip(results) {
            match r {
                Ok(()) => {}
                Err(e) => {
                    debug!("Publish via {} failed: {}", b.name(), e);
                    errors.push(format!("{}: {}", b.name(), e));
                }
            }
        }

        if errors.len() == self.backends.len() {
            return Err(SignalingError::AllFailed(errors.join("; ")));
        }
        Ok(())
    }

    /// Deliver messages addressed to `kp` to `tx` until unsubscribed.
    pub fn subscribe(&self, kp: KeyPair, tx: mpsc::Sender<Delivery>) -> SubscriptionId {
        let public = kp.public();
        let first = !self.registry.has_subscription(&public);
        let id = self.registry.subscribe(kp, tx);
        if first {
            for b in &self.backends {
                b.subscribe(&public);
            }
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let Some(kp) = self.registry.unsubscribe(id) else {
            return;
        };
        let public = kp.public();
        if !self.registry.has_subscription(&public) {
            for b in &self.backends {
                b.unsubscribe(&public);
            }
        }
    }

    /// Withdraw our envelopes for `kp` from every backend that stores them.
    pub async fn withdraw(&self, kp: &PublicKeyPair) {
        for b in &self.backends {
            if let Err(e) = b.withdraw(kp).await {
                debug!("Withdraw via {} failed: {}", b.name(), e);
            }
        }
    }

    pub async fn close(&self) {
        for b in &self.backends {
            b.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::envelope::Credentials;

    fn hello() -> Message {
        Message::credentials(Credentials {
            ufrag: "u".into(),
            pwd: "p".into(),
            need_creds: false,
        })
    }

    #[tokio::test]
    async fn test_dispatch_matches_sender() {
        let registry = SubscriptionsRegistry::new();
        let a = Key::generate_private();
        let b = Key::generate_private();
        let c = Key::generate_private();

        let (tx, mut rx) = mpsc::channel(4);
        registry.subscribe(KeyPair::new(b, a.public_key()), tx);

        let from_a = Envelope::seal(&KeyPair::new(a, b.public_key()), &hello()).unwrap();
        assert_eq!(registry.dispatch(&from_a).await, 1);
        let d = rx.recv().await.unwrap();
        assert_eq!(d.sender, a.public_key());
        assert_eq!(d.message, hello());

        let from_c = Envelope::seal(&KeyPair::new(c, b.public_key()), &hello()).unwrap();
        assert_eq!(registry.dispatch(&from_c).await, 0);
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let registry = SubscriptionsRegistry::new();
        let community = Key::generate_private();
        let (tx, mut rx) = mpsc::channel(4);
        let id = registry.subscribe(KeyPair::new(community, Key::ZERO), tx);

        for _ in 0..2 {
            let sender = Key::generate_private();
            let env = Envelope::seal(&KeyPair::new(sender, community.public_key()), &hello()).unwrap();
            assert_eq!(registry.dispatch(&env).await, 1);
            assert_eq!(rx.recv().await.unwrap().sender, sender.public_key());
        }

        assert!(registry.unsubscribe(id).is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_multi_backend_rejects_bad_uris() {
        assert!(matches!(MultiBackend::new(&[]).await, Err(SignalingError::NoBackends)));
        assert!(matches!(
            MultiBackend::new(&["grpc://localhost:8080".to_string()]).await,
            Err(SignalingError::Unsupported(s)) if s == "grpc"
        ));
        assert!(matches!(
            MultiBackend::new(&["::not a uri".to_string()]).await,
            Err(SignalingError::InvalidUri(_))
        ));
    }
}
