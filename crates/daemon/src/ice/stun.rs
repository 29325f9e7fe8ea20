//! STUN message codec (RFC 5389 / RFC 8445 subset)
//!
//! Only the Binding method is implemented, together with the attributes ICE
//! connectivity checks need:
//! - USERNAME, MESSAGE-INTEGRITY (HMAC-SHA1 keyed with the ICE password)
//! - FINGERPRINT (CRC-32 xor `0x5354554e`)
//! - XOR-MAPPED-ADDRESS, PRIORITY, USE-CANDIDATE
//! - ICE-CONTROLLING / ICE-CONTROLLED, ERROR-CODE

use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;
pub const METHOD_BINDING: u16 = 0x001;

const FINGERPRINT_XOR: u32 = 0x5354_554e;
const INTEGRITY_LEN: usize = 20;

pub type TransactionId = [u8; 12];

pub mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("message too short")]
    TooShort,
    #[error("not a STUN message")]
    NotStun,
    #[error("length field does not match datagram")]
    BadLength,
    #[error("truncated attribute")]
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

pub fn message_type(method: u16, class: Class) -> u16 {
    let c: u16 = match class {
        Class::Request => 0b00,
        Class::Indication => 0b01,
        Class::Success => 0b10,
        Class::Error => 0b11,
    };
    (method & 0x000F)
        | ((method & 0x0070) << 1)
        | ((method & 0x0F80) << 2)
        | ((c & 0b01) << 4)
        | ((c & 0b10) << 7)
}

pub fn split_message_type(t: u16) -> (u16, Class) {
    let method = (t & 0x000F) | ((t >> 1) & 0x0070) | ((t >> 2) & 0x0F80);
    let class = match ((t >> 4) & 0b01) | ((t >> 7) & 0b10) {
        0b00 => Class::Request,
        0b01 => Class::Indication,
        0b10 => Class::Success,
        _ => Class::Error,
    };
    (method, class)
}

/// Cheap check used by the muxes: leading zero bits plus magic cookie.
pub fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN
        && buf[0] & 0xC0 == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

/// Transaction id of a STUN datagram, without a full parse.
pub fn transaction_id(buf: &[u8]) -> Option<TransactionId> {
    if !is_stun(buf) {
        return None;
    }
    let mut id = [0u8; 12];
    id.copy_from_slice(&buf[8..20]);
    Some(id)
}

pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

#[derive(Debug, Clone)]
struct Attribute {
    typ: u16,
    value: Vec<u8>,
    offset: usize,
}

/// A parsed STUN message.
#[derive(Debug, Clone)]
pub struct Message {
    pub method: u16,
    pub class: Class,
    pub transaction_id: TransactionId,
    attributes: Vec<Attribute>,
    raw: Vec<u8>,
}

impl Message {
    pub fn parse(buf: &[u8]) -> Result<Message, StunError> {
        if buf.len() < HEADER_LEN {
            return Err(StunError::TooShort);
        }
        if !is_stun(buf) {
            return Err(StunError::NotStun);
        }

        let typ = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if HEADER_LEN + len != buf.len() || len % 4 != 0 {
            return Err(StunError::BadLength);
        }

        let (method, class) = split_message_type(typ);
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..20]);

        let mut attributes = Vec::new();
        let mut off = HEADER_LEN;
        while off < buf.len() {
            if off + 4 > buf.len() {
                return Err(StunError::Truncated);
            }
            let at = u16::from_be_bytes([buf[off], buf[off + 1]]);
            let alen = u16::from_be_bytes([buf[off + 2], buf[off + 3]]) as usize;
            let start = off + 4;
            if start + alen > buf.len() {
                return Err(StunError::Truncated);
            }
            attributes.push(Attribute {
                typ: at,
                value: buf[start..start + alen].to_vec(),
                offset: off,
            });
            off = start + padded(alen);
        }

        Ok(Message {
            method,
            class,
            transaction_id,
            attributes,
            raw: buf.to_vec(),
        })
    }

    pub fn get(&self, typ: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.typ == typ)
            .map(|a| a.value.as_slice())
    }

    pub fn contains(&self, typ: u16) -> bool {
        self.attributes.iter().any(|a| a.typ == typ)
    }

    pub fn is_binding_request(&self) -> bool {
        self.method == METHOD_BINDING && self.class == Class::Request
    }

    pub fn username(&self) -> Option<&str> {
        self.get(attr::USERNAME)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn priority(&self) -> Option<u32> {
        let v = self.get(attr::PRIORITY)?;
        (v.len() == 4).then(|| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    pub fn use_candidate(&self) -> bool {
        self.contains(attr::USE_CANDIDATE)
    }

    pub fn error_code(&self) -> Option<u16> {
        let v = self.get(attr::ERROR_CODE)?;
        (v.len() >= 4).then(|| u16::from(v[2] & 0x07) * 100 + u16::from(v[3]))
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.get(attr::XOR_MAPPED_ADDRESS)
            .and_then(|v| decode_xor_address(v, &self.transaction_id))
            .or_else(|| self.get(attr::MAPPED_ADDRESS).and_then(decode_address))
    }

    /// Check MESSAGE-INTEGRITY with the short-term credential `key`.
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        let Some(a) = self
            .attributes
            .iter()
            .find(|a| a.typ == attr::MESSAGE_INTEGRITY)
        else {
            return false;
        };
        if a.value.len() != INTEGRITY_LEN {
            return false;
        }

        let mut head = self.raw[..a.offset].to_vec();
        set_length(&mut head, a.offset - HEADER_LEN + 4 + INTEGRITY_LEN);

        let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(key) else {
            return false;
        };
        mac.update(&head);
        mac.verify_slice(&a.value).is_ok()
    }

    /// Check FINGERPRINT. Messages without one pass.
    pub fn verify_fingerprint(&self) -> bool {
        let Some(a) = self.attributes.iter().find(|a| a.typ == attr::FINGERPRINT) else {
            return true;
        };
        if a.value.len() != 4 {
            return false;
        }
        let mut head = self.raw[..a.offset].to_vec();
        set_length(&mut head, a.offset - HEADER_LEN + 8);

        let expected = crc32fast::hash(&head) ^ FINGERPRINT_XOR;
        a.value == expected.to_be_bytes()
    }
}

/// Incremental STUN message encoder.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(method: u16, class: Class, transaction_id: &TransactionId) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&message_type(method, class).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(transaction_id);
        Self { buf }
    }

    pub fn binding_request(transaction_id: &TransactionId) -> Self {
        Self::new(METHOD_BINDING, Class::Request, transaction_id)
    }

    pub fn attr(mut self, typ: u16, value: &[u8]) -> Self {
        self.buf.extend_from_slice(&typ.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        self.buf.resize(self.buf.len() + padded(value.len()) - value.len(), 0);
        let len = self.buf.len() - HEADER_LEN;
        set_length(&mut self.buf, len);
        self
    }

    pub fn username(self, username: &str) -> Self {
        self.attr(attr::USERNAME, username.as_bytes())
    }

    pub fn priority(self, priority: u32) -> Self {
        self.attr(attr::PRIORITY, &priority.to_be_bytes())
    }

    pub fn use_candidate(self) -> Self {
        self.attr(attr::USE_CANDIDATE, &[])
    }

    pub fn ice_role(self, controlling: bool, tie_breaker: u64) -> Self {
        let typ = if controlling {
            attr::ICE_CONTROLLING
        } else {
            attr::ICE_CONTROLLED
        };
        self.attr(typ, &tie_breaker.to_be_bytes())
    }

    pub fn xor_mapped_address(self, addr: SocketAddr) -> Self {
        let mut txid = [0u8; 12];
        txid.copy_from_slice(&self.buf[8..20]);
        let v = encode_xor_address(addr, &txid);
        self.attr(attr::XOR_MAPPED_ADDRESS, &v)
    }

    pub fn error_code(self, code: u16, reason: &str) -> Self {
        let mut v = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
        v.extend_from_slice(reason.as_bytes());
        self.attr(attr::ERROR_CODE, &v)
    }

    /// Append MESSAGE-INTEGRITY. Must come before the fingerprint.
    pub fn integrity(mut self, key: &[u8]) -> Self {
        let len = self.buf.len() - HEADER_LEN + 4 + INTEGRITY_LEN;
        set_length(&mut self.buf, len);

        let tag = match Hmac::<Sha1>::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(&self.buf);
                mac.finalize().into_bytes().to_vec()
            }
            // HMAC accepts keys of any length
            Err(_) => vec![0u8; INTEGRITY_LEN],
        };
        self.attr(attr::MESSAGE_INTEGRITY, &tag)
    }

    /// Append FINGERPRINT. Must be the last attribute.
    pub fn fingerprint(mut self) -> Self {
        let len = self.buf.len() - HEADER_LEN + 8;
        set_length(&mut self.buf, len);
        let crc = crc32fast::hash(&self.buf) ^ FINGERPRINT_XOR;
        self.attr(attr::FINGERPRINT, &crc.to_be_bytes())
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn set_length(buf: &mut [u8], len: usize) {
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
}

fn encode_xor_address(addr: SocketAddr, txid: &TransactionId) -> Vec<u8> {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut v = Vec::with_capacity(20);
    match addr.ip() {
        IpAddr::V4(ip) => {
            v.extend_from_slice(&[0, 0x01]);
            v.extend_from_slice(&port.to_be_bytes());
            v.extend_from_slice(&(u32::from(ip) ^ MAGIC_COOKIE).to_be_bytes());
        }
        IpAddr::V6(ip) => {
            v.extend_from_slice(&[0, 0x02]);
            v.extend_from_slice(&port.to_be_bytes());
            let mask = xor_mask(txid);
            for (b, m) in ip.octets().iter().zip(mask.iter()) {
                v.push(b ^ m);
            }
        }
    }
    v
}

fn decode_xor_address(v: &[u8], txid: &TransactionId) -> Option<SocketAddr> {
    if v.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([v[2], v[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match v[1] {
        0x01 => {
            let raw = u32::from_be_bytes([v[4], v[5], v[6], v[7]]) ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        0x02 if v.len() >= 20 => {
            let mask = xor_mask(txid);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = v[4 + i] ^ mask[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn decode_address(v: &[u8]) -> Option<SocketAddr> {
    if v.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([v[2], v[3]]);
    match v[1] {
        0x01 => Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(v[4], v[5], v[6], v[7])),
            port,
        )),
        0x02 if v.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&v[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn xor_mask(txid: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(txid);
    mask
}

/// Extract the mapped address from a raw Binding success response.
pub fn parse_xor_mapped_address(buf: &[u8]) -> Option<SocketAddr> {
    Message::parse(buf).ok()?.xor_mapped_address()
}
