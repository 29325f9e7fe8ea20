//! Signaling messages and their sealed envelopes.
//!
//! ### Encryption
//! The JSON encoded [`Message`] is sealed with a NaCl box (X25519 +
//! XSalsa20-Poly1305) between the sender's private key and the recipient's
//! public key. Brokers only ever see the sender, recipient and ciphertext.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use crypto_box::{
    aead::{Aead, AeadCore, OsRng},
    PublicKey, SalsaBox, SecretKey,
};
use ipnet::IpNet;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::LazyLock;

use crate::crypto::{Key, KeyPair};
use crate::error::SignalingError;
use crate::ice::Candidate;

const NONCE_LEN: usize = 24;
const BOX_CACHE_SIZE: usize = 1024;

/// Precomputed boxes keyed by (our private key, their public key).
static BOXES: LazyLock<Mutex<LruCache<(Key, Key), SalsaBox>>> = LazyLock::new(|| {
    let size = NonZeroUsize::new(BOX_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
    Mutex::new(LruCache::new(size))
});

fn with_box<T>(ours: &Key, theirs: &Key, f: impl FnOnce(&SalsaBox) -> T) -> T {
    let mut cache = BOXES.lock();
    let b = cache.get_or_insert((*ours, *theirs), || {
        SalsaBox::new(&PublicKey::from(theirs.0), &SecretKey::from(ours.0))
    });
    f(b)
}

/// ICE credentials of the sending agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ufrag: String,
    pub pwd: String,
    /// Ask the receiver to answer with its own credentials.
    #[serde(default)]
    pub need_creds: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "REMOVE")]
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAddresses {
    pub addresses: Vec<IpAddr>,
}

/// A peer announcing itself on the community channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescription {
    pub change: Change,
    #[serde(default)]
    pub name: String,
    pub public_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_new: Option<Key>,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub build_info: String,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostAddresses>,
}

/// Decrypted envelope payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerDescription>,
}

impl Message {
    pub fn credentials(creds: Credentials) -> Self {
        Self {
            credentials: Some(creds),
            ..Default::default()
        }
    }

    pub fn candidate(c: Candidate) -> Self {
        Self {
            candidate: Some(c),
            ..Default::default()
        }
    }

    pub fn peer(desc: PeerDescription) -> Self {
        Self {
            peer: Some(desc),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contents {
    pub body: String,
    pub nonce: String,
}

/// What brokers store and forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Key,
    pub recipient: Key,
    pub contents: Contents,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Seal `msg` from `kp.ours` (private) to `kp.theirs` (public).
    pub fn seal(kp: &KeyPair, msg: &Message) -> Result<Envelope, SignalingError> {
        let plaintext = serde_json::to_vec(msg).map_err(|e| SignalingError::Crypto(e.to_string()))?;
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let body = with_box(&kp.ours, &kp.theirs, |b| b.encrypt(&nonce, plaintext.as_slice()))
            .map_err(|e| SignalingError::Crypto(e.to_string()))?;

        Ok(Envelope {
            sender: kp.ours.public_key(),
            recipient: kp.theirs,
            contents: Contents {
                body: STANDARD.encode(body),
                nonce: STANDARD.encode(nonce),
            },
            timestamp: Utc::now(),
        })
    }

    /// Open an envelope received on the subscription `kp`.
    ///
    /// A zero `kp.theirs` accepts any sender.
    pub fn open(&self, kp: &KeyPair) -> Result<Message, SignalingError> {
        if self.recipient != kp.ours.public_key() {
            return Err(SignalingError::KeyMismatch);
        }
        if kp.theirs.is_set() && self.sender != kp.theirs {
            return Err(SignalingError::KeyMismatch);
        }

        let nonce = STANDARD
            .decode(&self.contents.nonce)
            .map_err(|e| SignalingError::Crypto(e.to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(SignalingError::Crypto(format!("invalid nonce length {}", nonce.len())));
        }
        let nonce = crypto_box::Nonce::from_slice(&nonce);
        let body = STANDARD
            .decode(&self.contents.body)
            .map_err(|e| SignalingError::Crypto(e.to_string()))?;

        let plaintext = with_box(&kp.ours, &self.sender, |b| b.decrypt(nonce, body.as_slice()))
            .map_err(|e| SignalingError::Crypto(e.to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|e| SignalingError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Message {
        Message::credentials(Credentials {
            ufrag: "abcdefghijklmnop".into(),
            pwd: "abcdefghijklmnopqrstuvwxyzabcdef".into(),
            need_creds: true,
        })
    }

    #[test]
    fn test_seal_and_open() {
        let a = Key::generate_private();
        let b = Key::generate_private();

        let env = Envelope::seal(&KeyPair::new(a, b.public_key()), &creds()).unwrap();
        assert_eq!(env.sender, a.public_key());
        assert_eq!(env.recipient, b.public_key());

        let msg = env.open(&KeyPair::new(b, a.public_key())).unwrap();
        assert_eq!(msg, creds());
    }

    #[test]
    fn test_open_checks_addressing() {
        let a = Key::generate_private();
        let b = Key::generate_private();
        let c = Key::generate_private();
        let env = Envelope::seal(&KeyPair::new(a, b.public_key()), &creds()).unwrap();

        // Wrong recipient
        assert!(matches!(
            env.open(&KeyPair::new(c, a.public_key())),
            Err(SignalingError::KeyMismatch)
        ));
        // Wrong expected sender
        assert!(matches!(
            env.open(&KeyPair::new(b, c.public_key())),
            Err(SignalingError::KeyMismatch)
        ));
        // Wildcard sender
        assert!(env.open(&KeyPair::new(b, Key::ZERO)).is_ok());
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let a = Key::generate_private();
        let b = Key::generate_private();
        let mut env = Envelope::seal(&KeyPair::new(a, b.public_key()), &creds()).unwrap();

        let mut body = STANDARD.decode(&env.contents.body).unwrap();
        body[0] ^= 1;
        env.contents.body = STANDARD.encode(body);
        assert!(matches!(
            env.open(&KeyPair::new(b, a.public_key())),
            Err(SignalingError::Crypto(_))
        ));
    }

    #[test]
    fn test_peer_description_wire_fields() {
        let k = Key::generate_private().public_key();
        let desc = PeerDescription {
            change: Change::Add,
            name: "node1".into(),
            public_key: k,
            public_key_new: None,
            allowed_ips: vec!["10.237.0.5/32".parse().unwrap()],
            build_info: "icewire 0.3.0".into(),
            hosts: BTreeMap::from([(
                "node1".to_string(),
                HostAddresses {
                    addresses: vec!["10.237.0.5".parse().unwrap()],
                },
            )]),
        };
        let v = serde_json::to_value(Message::peer(desc)).unwrap();
        assert_eq!(v["peer"]["change"], "ADD");
        assert_eq!(v["peer"]["publicKey"], k.to_string());
        assert_eq!(v["peer"]["allowedIps"][0], "10.237.0.5/32");
        assert!(v["peer"].get("publicKeyNew").is_none());
        assert!(v.get("credentials").is_none());
    }
}
