//! ICE candidates and their SDP / JSON wire forms.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

impl CandidateType {
    /// Type preference (RFC 8445 section 5.1.2.2).
    pub fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => bail!("unknown candidate type {s:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Udp4,
    Udp6,
    Tcp4,
    Tcp6,
}

impl NetworkType {
    pub fn for_addr(ip: IpAddr, tcp: bool) -> Self {
        match (ip.is_ipv4(), tcp) {
            (true, false) => NetworkType::Udp4,
            (false, false) => NetworkType::Udp6,
            (true, true) => NetworkType::Tcp4,
            (false, true) => NetworkType::Tcp6,
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, NetworkType::Udp4 | NetworkType::Udp6)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, NetworkType::Udp4 | NetworkType::Tcp4)
    }

    fn transport(&self) -> &'static str {
        if self.is_udp() {
            "udp"
        } else {
            "tcp"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcpType {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "passive")]
    Passive,
    #[serde(rename = "so")]
    SimultaneousOpen,
}

impl TcpType {
    fn as_str(&self) -> &'static str {
        match self {
            TcpType::Active => "active",
            TcpType::Passive => "passive",
            TcpType::SimultaneousOpen => "so",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedAddress {
    pub address: IpAddr,
    pub port: u16,
}

/// A transport address an agent believes might reach its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(rename = "type")]
    pub typ: CandidateType,
    pub foundation: String,
    pub component: u16,
    pub network_type: NetworkType,
    pub priority: u32,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<RelatedAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<TcpType>,
    /// SDP form details kept so that a parsed line serializes unchanged.
    #[serde(skip)]
    pub sdp: SdpDetails,
}

/// Parts of an SDP candidate line without a structured field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpDetails {
    /// Line started with `candidate:`
    pub prefixed: bool,
    /// Transport as spelled on the line, e.g. `UDP`
    pub transport: Option<String>,
    /// Unknown extension pairs in order, e.g. `generation 0`
    pub extensions: Vec<(String, String)>,
}

pub const COMPONENT_RTP: u16 = 1;

impl Candidate {
    fn new(typ: CandidateType, addr: SocketAddr, local_pref: u16) -> Self {
        let network_type = NetworkType::for_addr(addr.ip(), false);
        Self {
            typ,
            foundation: compute_foundation(typ, addr.ip(), network_type),
            component: COMPONENT_RTP,
            network_type,
            priority: compute_priority(typ, local_pref, COMPONENT_RTP),
            address: addr.ip(),
            port: addr.port(),
            related_address: None,
            relay_protocol: None,
            tcp_type: None,
            sdp: SdpDetails::default(),
        }
    }

    pub fn host(addr: SocketAddr, local_pref: u16) -> Self {
        Self::new(CandidateType::Host, addr, local_pref)
    }

    pub fn server_reflexive(mapped: SocketAddr, base: SocketAddr, local_pref: u16) -> Self {
        let mut c = Self::new(CandidateType::ServerReflexive, mapped, local_pref);
        c.related_address = Some(RelatedAddress {
            address: base.ip(),
            port: base.port(),
        });
        c
    }

    /// Remote candidate learned from an incoming check.
    pub fn peer_reflexive(addr: SocketAddr, priority: u32) -> Self {
        let mut c = Self::new(CandidateType::PeerReflexive, addr, 0);
        c.priority = priority;
        c
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Local port packets for this candidate arrive on.
    pub fn base_port(&self) -> u16 {
        match (self.typ, self.related_address) {
            (CandidateType::Host, _) | (_, None) => self.port,
            (_, Some(r)) => r.port,
        }
    }

    /// SDP `a=candidate` value. The `candidate:` prefix is only written for
    /// lines parsed with one.
    pub fn marshal(&self) -> String {
        let transport = match &self.sdp.transport {
            Some(t) if t.eq_ignore_ascii_case(self.network_type.transport()) => t.as_str(),
            _ => self.network_type.transport(),
        };
        let mut s = format!(
            "{}{} {} {} {} {} {} typ {}",
            if self.sdp.prefixed { "candidate:" } else { "" },
            self.foundation,
            self.component,
            transport,
            self.priority,
            self.address,
            self.port,
            self.typ
        );
        if let Some(r) = &self.related_address {
            s.push_str(&format!(" raddr {} rport {}", r.address, r.port));
        }
        if let Some(t) = &self.tcp_type {
            s.push_str(&format!(" tcptype {}", t.as_str()));
        }
        for (k, v) in &self.sdp.extensions {
            s.push_str(&format!(" {k} {v}"));
        }
        s
    }

    pub fn unmarshal(line: &str) -> Result<Self> {
        let line = line.trim();
        let (prefixed, line) = match line.strip_prefix("candidate:") {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() < 8 || f[6] != "typ" {
            bail!("malformed candidate {line:?}");
        }

        let component = f[1].parse().context("invalid component")?;
        let tcp = match f[2].to_lowercase().as_str() {
            "udp" => false,
            "tcp" => true,
            other => bail!("unknown transport {other:?}"),
        };
        let priority = f[3].parse().context("invalid priority")?;
        let address: IpAddr = f[4]
            .parse()
            .map_err(|_| anyhow!("unsupported candidate address {:?}", f[4]))?;
        let port = f[5].parse().context("invalid port")?;
        let typ = f[7].parse()?;

        let mut c = Candidate {
            typ,
            foundation: f[0].to_string(),
            component,
            network_type: NetworkType::for_addr(address, tcp),
            priority,
            address,
            port,
            related_address: None,
            relay_protocol: None,
            tcp_type: None,
            sdp: SdpDetails {
                prefixed,
                transport: Some(f[2].to_string()),
                extensions: Vec::new(),
            },
        };

        let mut raddr = None;
        let mut rport = None;
        for kv in f[8..].chunks(2) {
            let [k, v] = kv else {
                bail!("dangling candidate extension {:?}", kv);
            };
            match *k {
                "raddr" => raddr = Some(v.parse::<IpAddr>().context("invalid raddr")?),
                "rport" => rport = Some(v.parse::<u16>().context("invalid rport")?),
                "tcptype" => {
                    c.tcp_type = Some(match *v {
                        "active" => TcpType::Active,
                        "passive" => TcpType::Passive,
                        "so" => TcpType::SimultaneousOpen,
                        _ => bail!("unknown tcptype {v:?}"),
                    })
                }
                _ => c.sdp.extensions.push((k.to_string(), v.to_string())),
            }
        }
        if let (Some(address), Some(port)) = (raddr, rport) {
            c.related_address = Some(RelatedAddress { address, port });
        }

        Ok(c)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.marshal())
    }
}

/// `(2^24)*type_pref + (2^8)*local_pref + (256 - component)`
pub fn compute_priority(typ: CandidateType, local_pref: u16, component: u16) -> u32 {
    (typ.preference() << 24) + (u32::from(local_pref) << 8) + (256 - u32::from(component.min(256)))
}

pub fn compute_foundation(typ: CandidateType, ip: IpAddr, network: NetworkType) -> String {
    let mut h = crc32fast::Hasher::new();
    h.update(typ.as_str().as_bytes());
    h.update(ip.to_string().as_bytes());
    h.update(network.transport().as_bytes());
    h.finalize().to_string()
}

/// Priority of a candidate pair (RFC 8445 section 6.1.2.3).
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let (g, d) = (u64::from(controlling), u64::from(controlled));
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority() {
        assert_eq!(
            compute_priority(CandidateType::Host, 65535, 1),
            (126 << 24) + (65535 << 8) + 255
        );
        assert!(
            compute_priority(CandidateType::Host, 0, 1)
                > compute_priority(CandidateType::ServerReflexive, 65535, 1)
        );
    }

    #[test]
    fn test_sdp_line_is_stable() {
        let line = "1052353102 1 udp 1694498815 198.51.100.7 51000 typ srflx raddr 0.0.0.0 rport 40123";
        let c = Candidate::unmarshal(line).unwrap();
        assert_eq!(c.typ, CandidateType::ServerReflexive);
        assert_eq!(c.network_type, NetworkType::Udp4);
        assert_eq!(c.base_port(), 40123);
        assert_eq!(c.marshal(), line);

        let with_prefix = format!("candidate:{line}");
        let prefixed = Candidate::unmarshal(&with_prefix).unwrap();
        assert_eq!(prefixed.addr(), c.addr());
        assert_eq!(prefixed.marshal(), with_prefix);
    }

    #[test]
    fn test_foreign_sdp_lines_round_trip() {
        let lines = [
            "candidate:842163049 1 udp 1677729535 203.0.113.4 54400 typ srflx raddr 10.0.0.2 rport 54400 generation 0",
            "3021447510 1 UDP 2130706431 192.168.1.20 61023 typ host generation 0 network-id 1",
            "candidate:1 1 TCP 1015021823 2001:db8::7 9 typ host tcptype active generation 0 ufrag Hq3d",
        ];
        for line in lines {
            let c = Candidate::unmarshal(line).unwrap();
            assert_eq!(c.marshal(), line);
        }

        let c = Candidate::unmarshal(lines[1]).unwrap();
        assert_eq!(c.network_type, NetworkType::Udp4);
        assert_eq!(
            c.sdp.extensions,
            vec![
                ("generation".to_string(), "0".to_string()),
                ("network-id".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn test_unmarshal_rejects_garbage() {
        assert!(Candidate::unmarshal("").is_err());
        assert!(Candidate::unmarshal("1 1 udp 1 10.0.0.1 5000 host").is_err());
        assert!(Candidate::unmarshal("1 1 sctp 1 10.0.0.1 5000 typ host").is_err());
        assert!(Candidate::unmarshal("1 1 udp 1 host.local 5000 typ host").is_err());
    }

    #[test]
    fn test_json_wire_fields() {
        let c = Candidate::server_reflexive(
            "203.0.113.9:61000".parse().unwrap(),
            "0.0.0.0:40000".parse().unwrap(),
            65535,
        );
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "srflx");
        assert_eq!(v["networkType"], "udp4");
        assert_eq!(v["relatedAddress"]["port"], 40000);
        assert!(v.get("tcpType").is_none());

        let back: Candidate = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_pair_priority_is_symmetric() {
        let a = compute_priority(CandidateType::Host, 65535, 1);
        let b = compute_priority(CandidateType::ServerReflexive, 65535, 1);
        // Both agents compute the same priority for the same pair
        assert_eq!(pair_priority(a, b) >> 1, pair_priority(b, a) >> 1);
        assert!(pair_priority(a, a) > pair_priority(b, b));
    }
}
