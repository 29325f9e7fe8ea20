//! Polling REST broker client (`http://` / `https://`).
//!
//! ### Wire protocol
//! - `POST   offers/{sender}/{recipient}`: publish a JSON envelope
//! - `GET    offers/{sender}/{recipient}?since=N`: envelopes newer than N
//! - `DELETE offers/{sender}/{recipient}`: withdraw
//!
//! Subscribers poll `offers/{theirs}/{ours}`; the zero key as sender matches
//! any sender. Keys are path-escaped base64.

use chrono::Utc;
use log::{debug, trace};
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use super::backend::SubscriptionsRegistry;
use super::broker::OfferLog;
use super::envelope::Envelope;
use super::parse_duration;
use crate::crypto::{Key, PublicKeyPair};
use crate::error::SignalingError;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Envelopes older than this are ignored when polling.
const MAX_ENVELOPE_AGE: Duration = Duration::from_secs(60);

pub struct HttpBackend {
    base: Url,
    client: reqwest::Client,
    interval: Duration,
    registry: Arc<SubscriptionsRegistry>,
    pollers: Mutex<HashMap<PublicKeyPair, JoinHandle<()>>>,
}

impl HttpBackend {
    pub fn new(url: &Url, registry: Arc<SubscriptionsRegistry>) -> Result<Self, SignalingError> {
        let mut interval = DEFAULT_INTERVAL;
        let mut timeout = DEFAULT_TIMEOUT;
        let mut insecure = false;

        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "interval" => {
                    interval = parse_duration(&v)
                        .ok_or_else(|| SignalingError::InvalidUri(format!("invalid interval {v:?}")))?
                }
                "timeout" => {
                    timeout = parse_duration(&v)
                        .ok_or_else(|| SignalingError::InvalidUri(format!("invalid timeout {v:?}")))?
                }
                "insecure_skip_verify" => insecure = matches!(v.as_ref(), "true" | "1" | "yes"),
                other => return Err(SignalingError::InvalidUri(format!("unknown option {other:?}"))),
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| SignalingError::Transport(e.to_string()))?;

        let mut base = url.clone();
        base.set_query(None);
        if base.cannot_be_a_base() {
            return Err(SignalingError::InvalidUri(url.to_string()));
        }

        Ok(Self {
            base,
            client,
            interval,
            registry,
            pollers: Mutex::new(HashMap::new()),
        })
    }

    fn offers_url(&self, sender: &Key, recipient: &Key) -> Url {
        offers_url(&self.base, sender, recipient)
    }

    pub async fn publish(&self, env: &Envelope) -> Result<(), SignalingError> {
        let url = self.offers_url(&env.sender, &env.recipient);
        let resp = self
            .client
            .post(url)
            .json(env)
            .send()
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SignalingError::Transport(format!("broker returned {}", resp.status())));
        }
        Ok(())
    }

    /// Withdraw all envelopes we published on the channel from `kp.ours` to `kp.theirs`.
    pub async fn withdraw(&self, kp: &PublicKeyPair) -> Result<(), SignalingError> {
        let url = self.offers_url(&kp.ours, &kp.theirs);
        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(SignalingError::Transport(format!("broker returned {s}"))),
        }
    }

    pub fn subscribe(&self, kp: &PublicKeyPair) {
        let mut pollers = self.pollers.lock();
        if pollers.contains_key(kp) {
            return;
        }
        let url = self.offers_url(&kp.theirs, &kp.ours);
        let task = tokio::spawn(poll(
            self.client.clone(),
            url,
            self.interval,
            Arc::clone(&self.registry),
        ));
        pollers.insert(*kp, task);
    }

    pub fn unsubscribe(&self, kp: &PublicKeyPair) {
        if let Some(task) = self.pollers.lock().remove(kp) {
            task.abort();
        }
    }

    pub fn close(&self) {
        for (_, task) in self.pollers.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn offers_url(base: &Url, sender: &Key, recipient: &Key) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments
            .pop_if_empty()
            .push("offers")
            .push(&sender.to_string())
            .push(&recipient.to_string());
    }
    url
}

async fn poll(client: reqwest::Client, url: Url, interval: Duration, registry: Arc<SubscriptionsRegistry>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since = 0u64;

    loop {
        ticker.tick().await;

        let mut u = url.clone();
        u.query_pairs_mut().clear().append_pair("since", &since.to_string());

        let resp = match client.get(u).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Polling {} failed: {}", url, e);
                continue;
            }
        };
        match resp.status() {
            StatusCode::NOT_FOUND => continue,
            s if !s.is_success() => {
                debug!("Polling {} returned {}", url, s);
                continue;
            }
            _ => {}
        }

        let log: OfferLog = match resp.json().await {
            Ok(l) => l,
            Err(e) => {
                debug!("Invalid offer log from {}: {}", url, e);
                continue;
            }
        };

        // Broker restarted and lost its sequence numbers
        if log.seq < since {
            since = 0;
            continue;
        }
        since = log.seq;

        let now = Utc::now();
        for env in &log.envelopes {
            let age = now.signed_duration_since(env.timestamp).to_std().unwrap_or_default();
            if age > MAX_ENVELOPE_AGE {
                trace!("Skipping stale envelope from {}", env.sender.short());
                continue;
            }
            registry.dispatch(env).await;
        }
    }
}
