//! HTTP signaling broker server.
//!
//! Serves the REST surface polled by [`super::http::HttpBackend`]. Envelopes
//! are kept per `(sender, recipient)` channel in an append-only log with a
//! broker-wide sequence number, so that consecutive candidates do not
//! overwrite each other and pollers only fetch what is new.

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use super::envelope::Envelope;
use crate::crypto::Key;

const MAX_BODY: usize = 64 * 1024;
const MAX_CHANNEL_LEN: usize = 256;

/// Response body of `GET offers/{sender}/{recipient}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferLog {
    /// Highest sequence number covered by this response.
    pub seq: u64,
    pub envelopes: Vec<Envelope>,
}

struct Entry {
    seq: u64,
    at: Instant,
    env: Envelope,
}

#[derive(Default)]
struct State {
    seq: u64,
    channels: HashMap<(Key, Key), VecDeque<Entry>>,
}

impl State {
    fn prune(&mut self, ttl: Duration) {
        let now = Instant::now();
        self.channels.retain(|_, log| {
            while log.front().is_some_and(|e| now.duration_since(e.at) > ttl) {
                log.pop_front();
            }
            !log.is_empty()
        });
    }
}

pub struct Broker {
    ttl: Duration,
    state: Mutex<State>,
}

impl Broker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(State::default()),
        }
    }

    /// Append an envelope to its channel, returning its sequence number.
    pub fn post(&self, env: Envelope) -> u64 {
        let mut state = self.state.lock();
        state.prune(self.ttl);
        state.seq += 1;
        let seq = state.seq;

        let log = state.channels.entry((env.sender, env.recipient)).or_default();
        if log.len() >= MAX_CHANNEL_LEN {
            log.pop_front();
        }
        log.push_back(Entry {
            seq,
            at: Instant::now(),
            env,
        });
        seq
    }

    /// Envelopes newer than `since`. A zero `sender` matches any sender.
    pub fn get(&self, sender: &Key, recipient: &Key, since: u64) -> Option<OfferLog> {
        let mut state = self.state.lock();
        state.prune(self.ttl);

        let mut found = false;
        let mut entries: Vec<&Entry> = Vec::new();
        for ((s, r), log) in &state.channels {
            if r != recipient || (sender.is_set() && s != sender) {
                continue;
            }
            found = true;
            entries.extend(log.iter().filter(|e| e.seq > since));
        }
        if !found {
            return None;
        }
        entries.sort_by_key(|e| e.seq);

        // Everything up to the broker-wide sequence number has been seen.
        // A client ahead of it detects a broker restart.
        Some(OfferLog {
            seq: state.seq,
            envelopes: entries.into_iter().map(|e| e.env.clone()).collect(),
        })
    }

    pub fn delete(&self, sender: &Key, recipient: &Key) -> bool {
        self.state.lock().channels.remove(&(*sender, *recipient)).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().channels.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bind `addr` and serve the broker until the task is cancelled.
pub async fn serve_broker(addr: SocketAddr, ttl: Duration) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind broker on {addr}"))?;
    info!("📡 Signaling broker listening on http://{}/offers", addr);
    serve(Arc::new(Broker::new(ttl)), listener).await
}

pub async fn serve(broker: Arc<Broker>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Broker accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let broker = Arc::clone(&broker);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let broker = Arc::clone(&broker);
                handle_request(req, broker)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
            if let Err(e) = conn.await {
                debug!("Broker connection error: {}", e);
            }
        });
    }
}

fn respond(status: StatusCode, body: String) -> Response<String> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

fn json(body: String) -> Response<String> {
    let mut resp = respond(StatusCode::OK, body);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Extract `(sender, recipient)` from `.../offers/{sender}/{recipient}`.
fn parse_channel(path: &str) -> Option<(Key, Key)> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let pos = segments.iter().rposition(|s| *s == "offers")?;
    let [sender, recipient] = segments.get(pos + 1..)? else {
        return None;
    };
    let sender = urlencoding::decode(sender).ok()?.parse().ok()?;
    let recipient = urlencoding::decode(recipient).ok()?.parse().ok()?;
    Some((sender, recipient))
}

fn parse_since(query: Option<&str>) -> u64 {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()))
        .and_then(|mut pairs| pairs.find(|(k, _)| k == "since"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0)
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    broker: Arc<Broker>,
) -> Result<Response<String>, Infallible> {
    if req.uri().path() == "/health" {
        return Ok(respond(StatusCode::OK, "OK".to_string()));
    }

    let Some((sender, recipient)) = parse_channel(req.uri().path()) else {
        return Ok(respond(StatusCode::NOT_FOUND, "Not Found".to_string()));
    };

    let resp = match *req.method() {
        Method::POST => {
            let body = match Limited::new(req.into_body(), MAX_BODY).collect().await {
                Ok(b) => b.to_bytes(),
                Err(e) => return Ok(respond(StatusCode::PAYLOAD_TOO_LARGE, e.to_string())),
            };
            match serde_json::from_slice::<Envelope>(&body) {
                Ok(env) if env.sender == sender && env.recipient == recipient => {
                    let seq = broker.post(env);
                    debug!("Stored offer {} from {} to {}", seq, sender.short(), recipient.short());
                    respond(StatusCode::NO_CONTENT, String::new())
                }
                Ok(_) => respond(
                    StatusCode::BAD_REQUEST,
                    "envelope addressing does not match path".to_string(),
                ),
                Err(e) => respond(StatusCode::BAD_REQUEST, e.to_string()),
            }
        }
        Method::GET => {
            let since = parse_since(req.uri().query());
            match broker.get(&sender, &recipient, since) {
                Some(log) => match serde_json::to_string(&log) {
                    Ok(body) => json(body),
                    Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                },
                None => respond(StatusCode::NOT_FOUND, "Not Found".to_string()),
            }
        }
        Method::DELETE => {
            if broker.delete(&sender, &recipient) {
                respond(StatusCode::NO_CONTENT, String::new())
            } else {
                respond(StatusCode::NOT_FOUND, "Not Found".to_string())
            }
        }
        _ => respond(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string()),
    };
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::signaling::backend::MultiBackend;
    use crate::signaling::envelope::{Credentials, Message};
    use tokio::sync::mpsc;

    fn sealed(from: &Key, to: &Key, ufrag: &str) -> Envelope {
        let msg = Message::credentials(Credentials {
            ufrag: ufrag.into(),
            pwd: "pwd".into(),
            need_creds: false,
        });
        Envelope::seal(&KeyPair::new(*from, to.public_key()), &msg).unwrap()
    }

    #[test]
    fn test_log_since() {
        let broker = Broker::new(Duration::from_secs(60));
        let a = Key::generate_private();
        let b = Key::generate_private();
        let (pa, pb) = (a.public_key(), b.public_key());

        assert!(broker.get(&pa, &pb, 0).is_none());
        broker.post(sealed(&a, &b, "one"));
        broker.post(sealed(&a, &b, "two"));

        let log = broker.get(&pa, &pb, 0).unwrap();
        assert_eq!(log.envelopes.len(), 2);
        let since = log.seq;

        let log = broker.get(&pa, &pb, since).unwrap();
        assert!(log.envelopes.is_empty());
        assert_eq!(log.seq, since);

        broker.post(sealed(&a, &b, "three"));
        let log = broker.get(&pa, &pb, since).unwrap();
        assert_eq!(log.envelopes.len(), 1);
        assert!(log.seq > since);

        assert!(broker.delete(&pa, &pb));
        assert!(broker.is_empty());
    }

    #[test]
    fn test_wildcard_sender() {
        let broker = Broker::new(Duration::from_secs(60));
        let community = Key::generate_private();
        for _ in 0..3 {
            broker.post(sealed(&Key::generate_private(), &community, "x"));
        }
        let log = broker.get(&Key::ZERO, &community.public_key(), 0).unwrap();
        assert_eq!(log.envelopes.len(), 3);
    }

    #[test]
    fn test_ttl_expires_entries() {
        let broker = Broker::new(Duration::ZERO);
        let a = Key::generate_private();
        let b = Key::generate_private();
        broker.post(sealed(&a, &b, "gone"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(broker.get(&a.public_key(), &b.public_key(), 0).is_none());
    }

    #[test]
    fn test_parse_channel() {
        let a = Key([0xff; 32]);
        let b = Key::generate_private().public_key();
        let path = format!(
            "/api/offers/{}/{}",
            urlencoding::encode(&a.to_string()),
            urlencoding::encode(&b.to_string())
        );
        assert_eq!(parse_channel(&path), Some((a, b)));
        assert_eq!(parse_channel("/offers/onlyone"), None);
        assert_eq!(parse_since(Some("since=42")), 42);
        assert_eq!(parse_since(None), 0);
    }

    #[tokio::test]
    async fn test_http_backend_against_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = Arc::new(Broker::new(Duration::from_secs(60)));
        let server = tokio::spawn(serve(Arc::clone(&broker), listener));

        let uri = format!("http://{addr}/?interval=50ms");
        let alice = MultiBackend::new(&[uri.clone()]).await.unwrap();
        let bob = MultiBackend::new(&[uri]).await.unwrap();

        let a = Key::generate_private();
        let b = Key::generate_private();
        let (tx, mut rx) = mpsc::channel(8);
        bob.subscribe(KeyPair::new(b, a.public_key()), tx);

        let msg = Message::credentials(Credentials {
            ufrag: "ufrag".into(),
            pwd: "pwd".into(),
            need_creds: true,
        });
        alice.publish(&KeyPair::new(a, b.public_key()), &msg).await.unwrap();

        let d = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.sender, a.public_key());
        assert_eq!(d.message, msg);

        let channel = KeyPair::new(a, b.public_key()).public();
        assert!(broker.get(&channel.ours, &channel.theirs, 0).is_some());
        alice.withdraw(&channel).await;
        assert!(broker.is_empty());

        alice.close().await;
        bob.close().await;
        server.abort();
    }
}
