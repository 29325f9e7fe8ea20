//! Curve25519 keys and key-derived overlay addresses.
//!
//! A [`Key`] is used for WireGuard private keys, public keys, preshared keys
//! and the community key alike. The textual form is standard base64, matching
//! the `wg` tooling.
//!
//! ### Key-derived addresses
//! Every public key maps to one IPv4 and one IPv6 address inside the
//! configured prefixes: the key is hashed with SipHash-2-4 (128 bit) and the
//! hash is shifted into the host bits of the prefix. Both sides compute the
//! same addresses, so no address negotiation is needed.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use ipnet::IpNet;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use siphasher::sip128::{Hasher128, SipHasher24};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;

const ADDR_HASH_KEY: [u8; 16] = [
    0x67, 0x67, 0x2c, 0x05, 0xd1, 0x3e, 0x11, 0x94, 0xbb, 0x38, 0x91, 0xff, 0x4f, 0x80, 0xb3, 0x97,
];

const ARGON_SALT: &[u8] = b"w1c3c0nn3cts3veryb0dy";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Key(pub [u8; KEY_LEN]);

impl Key {
    /// The all-zero key. Used as wildcard recipient on the community channel.
    pub const ZERO: Key = Key([0u8; KEY_LEN]);

    /// Generate a random, clamped Curve25519 private key.
    pub fn generate_private() -> Self {
        let mut k = Self::generate();
        k.clamp_scalar();
        k
    }

    /// Generate 32 random bytes (preshared keys).
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Key(bytes)
    }

    /// Derive a private key from a passphrase (argon2id).
    pub fn from_password(password: &str) -> Result<Self> {
        let params = Params::new(64 * 1024, 1, 4, Some(KEY_LEN))
            .map_err(|e| anyhow!("invalid argon2 parameters: {e}"))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        argon
            .hash_password_into(password.as_bytes(), ARGON_SALT, out.as_mut())
            .map_err(|e| anyhow!("failed to derive key from password: {e}"))?;

        let mut k = Key(*out);
        k.clamp_scalar();
        Ok(k)
    }

    fn clamp_scalar(&mut self) {
        self.0[0] &= 248;
        self.0[31] &= 127;
        self.0[31] |= 64;
    }

    pub fn is_set(&self) -> bool {
        *self != Key::ZERO
    }

    /// Derive the public key of a private key.
    pub fn public_key(&self) -> Key {
        let sk = crypto_box::SecretKey::from(self.0);
        Key(*sk.public_key().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        let s = self.to_string();
        s[..8].to_string()
    }

    /// Key-derived address inside `prefix`, keeping the prefix length.
    pub fn ip_address(&self, prefix: &IpNet) -> IpNet {
        let mut hasher = SipHasher24::new_with_key(&ADDR_HASH_KEY);
        hasher.write(&self.0);
        let hash = hasher.finish128().as_bytes();

        let ones = u32::from(prefix.prefix_len());
        match prefix {
            IpNet::V4(net) => {
                let mut d = [0u8; 4];
                d.copy_from_slice(&hash[..4]);
                let host = u32::from_be_bytes(d).checked_shr(ones).unwrap_or(0);
                let addr = u32::from(net.network()) | host;
                IpNet::new(IpAddr::V4(Ipv4Addr::from(addr)), net.prefix_len())
                    .unwrap_or(*prefix)
            }
            IpNet::V6(net) => {
                let host = u128::from_be_bytes(hash).checked_shr(ones).unwrap_or(0);
                let addr = u128::from(net.network()) | host;
                IpNet::new(IpAddr::V6(Ipv6Addr::from(addr)), net.prefix_len())
                    .unwrap_or(*prefix)
            }
        }
    }

    /// Key-derived addresses as host-length networks (/32 or /128).
    pub fn host_addresses(&self, prefixes: &[IpNet]) -> Vec<IpNet> {
        prefixes
            .iter()
            .map(|p| {
                let a = self.ip_address(p).addr();
                IpNet::from(a)
            })
            .collect()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl FromStr for Key {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .with_context(|| format!("invalid base64 key: {s:?}"))?;
        if bytes.len() != KEY_LEN {
            bail!("invalid key length {} (expected {})", bytes.len(), KEY_LEN);
        }
        let mut k = [0u8; KEY_LEN];
        k.copy_from_slice(&bytes);
        Ok(Key(k))
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A key that is deserialized from a passphrase when it is not valid base64.
///
/// Lets users write `community = "some shared words"` in the config.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyPassphrase(pub Key);

impl fmt::Debug for KeyPassphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyPassphrase(..)")
    }
}

impl<'de> Deserialize<'de> for KeyPassphrase {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        if let Ok(k) = s.parse::<Key>() {
            return Ok(KeyPassphrase(k));
        }
        Key::from_password(&s)
            .map(KeyPassphrase)
            .map_err(serde::de::Error::custom)
    }
}

/// Directional signaling channel: our private key, their public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct KeyPair {
    pub ours: Key,
    pub theirs: Key,
}

impl KeyPair {
    pub fn new(ours: Key, theirs: Key) -> Self {
        Self { ours, theirs }
    }

    /// Public half of this pair.
    pub fn public(&self) -> PublicKeyPair {
        PublicKeyPair {
            ours: self.ours.public_key(),
            theirs: self.theirs,
        }
    }
}

/// Public keys of both ends of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct PublicKeyPair {
    pub ours: Key,
    pub theirs: Key,
}

impl PublicKeyPair {
    /// The side with the numerically smaller public key controls the ICE session.
    pub fn is_controlling(&self) -> bool {
        self.ours.0.cmp(&self.theirs.0) == Ordering::Less
    }

    pub fn reversed(&self) -> PublicKeyPair {
        PublicKeyPair {
            ours: self.theirs,
            theirs: self.ours,
        }
    }
}
