//! Kernel interface abstraction.
//!
//! Links, addresses and routes are managed through the iproute2 `ip` tool in
//! JSON mode (`ip -j`), the same way the WireGuard client shells out to `wg`.
//! Platforms without iproute2 get [`PlatformError::NotSupported`].
//!
//! ### Route protocol
//! Routes installed by route sync carry protocol id [`RTPROT_ICEWIRE`] so
//! that the reverse path (routes -> AllowedIPs) can skip them.

use anyhow::{Context, Result};
use ipnet::IpNet;
use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::PlatformError;

/// Routing protocol id marking routes owned by this daemon.
pub const RTPROT_ICEWIRE: u8 = 98;

pub const TABLE_MAIN: u32 = 254;

/// Bytes added by WireGuard encapsulation (IPv6 + UDP + WG header).
pub const WG_OVERHEAD: u32 = 80;

/// Smallest MTU an IPv6 capable link may use.
pub const MIN_MTU: u32 = 1280;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub index: u32,
    pub mtu: u32,
    pub up: bool,
    pub point_to_point: bool,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub ifname: String,
    pub ifindex: u32,
    pub addr: IpNet,
    pub loopback: bool,
    pub up: bool,
    /// Link type, e.g. `wireguard`.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: IpNet,
    pub gateway: Option<IpAddr>,
    pub dev: Option<String>,
    pub table: u32,
    pub protocol: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    RouteAdded(Route),
    RouteDeleted(Route),
    LinkChanged { name: String, deleted: bool },
}

#[derive(Debug, Deserialize)]
struct JsonLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    linkinfo: Option<JsonLinkInfo>,
    #[serde(default)]
    addr_info: Vec<JsonAddr>,
}

#[derive(Debug, Deserialize)]
struct JsonLinkInfo {
    info_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonAddr {
    local: IpAddr,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct JsonRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<IpAddr>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    protocol: Option<serde_json::Value>,
    #[serde(default)]
    mtu: Option<u32>,
}

impl From<JsonLink> for Link {
    fn from(j: JsonLink) -> Self {
        Link {
            up: j.flags.iter().any(|f| f == "UP"),
            point_to_point: j.flags.iter().any(|f| f == "POINTOPOINT"),
            kind: j.linkinfo.and_then(|i| i.info_kind),
            name: j.ifname,
            index: j.ifindex,
            mtu: j.mtu,
        }
    }
}

/// Run a platform tool, optionally feeding `stdin`, and return its stdout.
pub(crate) async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String, PlatformError> {
    if !cfg!(target_os = "linux") {
        return Err(PlatformError::NotSupported);
    }

    trace!("Executing: {} {}", program, args.join(" "));
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PlatformError::NotSupported)
        }
        Err(e) => return Err(e.into()),
    };

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.write_all(b"\n").await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::from_command(
            &format!("{} {}", program, args.join(" ")),
            &stderr,
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn ip(args: &[&str]) -> Result<String, PlatformError> {
    run("ip", args, None).await
}

async fn ip_json<T: DeserializeOwned>(args: &[&str]) -> Result<T> {
    let mut full = vec!["-j"];
    full.extend_from_slice(args);
    let out = ip(&full).await?;
    let out = if out.trim().is_empty() { "[]" } else { out.as_str() };
    serde_json::from_str(out).with_context(|| format!("failed to parse `ip {}` output", args.join(" ")))
}

fn suppress_done(r: Result<String, PlatformError>) -> Result<()> {
    match r {
        Ok(_) | Err(PlatformError::Exists) | Err(PlatformError::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn create_wireguard(name: &str) -> Result<Link> {
    ip(&["link", "add", "dev", name, "type", "wireguard"]).await?;
    find(name).await
}

pub async fn find(name: &str) -> Result<Link> {
    let links: Vec<JsonLink> = ip_json(&["-d", "link", "show", "dev", name]).await?;
    links
        .into_iter()
        .next()
        .map(Link::from)
        .ok_or_else(|| PlatformError::NotFound.into())
}

pub async fn links() -> Result<Vec<Link>> {
    let links: Vec<JsonLink> = ip_json(&["-d", "link", "show"]).await?;
    Ok(links.into_iter().map(Link::from).collect())
}

pub async fn delete(name: &str) -> Result<()> {
    suppress_done(ip(&["link", "delete", "dev", name]).await)
}

pub async fn set_up(name: &str) -> Result<()> {
    ip(&["link", "set", "dev", name, "up"]).await?;
    Ok(())
}

pub async fn set_mtu(name: &str, mtu: u32) -> Result<()> {
    ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()]).await?;
    Ok(())
}

pub async fn add_address(name: &str, addr: &IpNet) -> Result<()> {
    suppress_done(ip(&["address", "add", &addr.to_string(), "dev", name]).await)
}

pub async fn delete_address(name: &str, addr: &IpNet) -> Result<()> {
    match ip(&["address", "delete", &addr.to_string(), "dev", name]).await {
        Err(PlatformError::Command { stderr, .. })
            if stderr.contains("Cannot assign requested address") =>
        {
            Ok(())
        }
        r => suppress_done(r),
    }
}

/// Addresses of all interfaces, or of `name` only.
pub async fn addresses(name: Option<&str>) -> Result<Vec<InterfaceAddress>> {
    let links: Vec<JsonLink> = match name {
        Some(n) => ip_json(&["-d", "address", "show", "dev", n]).await?,
        None => ip_json(&["-d", "address", "show"]).await?,
    };
    Ok(flatten_addresses(links))
}

fn flatten_addresses(links: Vec<JsonLink>) -> Vec<InterfaceAddress> {
    let mut out = Vec::new();
    for l in links {
        let up = l.flags.iter().any(|f| f == "UP");
        let loopback = l.flags.iter().any(|f| f == "LOOPBACK");
        let kind = l.linkinfo.and_then(|i| i.info_kind);
        for a in &l.addr_info {
            if let Ok(addr) = IpNet::new(a.local, a.prefixlen) {
                out.push(InterfaceAddress {
                    ifname: l.ifname.clone(),
                    ifindex: l.ifindex,
                    addr,
                    loopback,
                    up,
                    kind: kind.clone(),
                });
            }
        }
    }
    out
}

pub async fn add_route(dev: &str, dst: &IpNet, gateway: Option<IpAddr>, table: u32) -> Result<()> {
    let dst_s = dst.to_string();
    let table_s = table.to_string();
    let proto_s = RTPROT_ICEWIRE.to_string();
    let gw_s = gateway.map(|g| g.to_string());

    let mut args = vec!["route", "add", dst_s.as_str()];
    if let Some(gw) = &gw_s {
        args.extend_from_slice(&["via", gw.as_str()]);
    }
    args.extend_from_slice(&["dev", dev, "proto", proto_s.as_str(), "table", table_s.as_str()]);
    suppress_done(ip(&args).await)
}

pub async fn delete_route(dev: &str, dst: &IpNet, table: u32) -> Result<()> {
    suppress_done(
        ip(&["route", "delete", &dst.to_string(), "dev", dev, "table", &table.to_string()]).await,
    )
}

/// All IPv4 and IPv6 routes of `table`.
pub async fn routes(table: u32) -> Result<Vec<Route>> {
    let t = table.to_string();
    let mut out = Vec::new();
    for family in ["-4", "-6"] {
        let rs: Vec<JsonRoute> = ip_json(&[family, "route", "show", "table", &t]).await?;
        out.extend(rs.into_iter().filter_map(|r| convert_route(r, table)));
    }
    Ok(out)
}

fn convert_route(r: JsonRoute, table: u32) -> Option<Route> {
    let dst = parse_dst(&r.dst, r.gateway)?;
    Some(Route {
        dst,
        gateway: r.gateway,
        dev: r.dev,
        table,
        protocol: r.protocol.as_ref().and_then(parse_protocol),
    })
}

fn parse_dst(s: &str, gw: Option<IpAddr>) -> Option<IpNet> {
    if s == "default" {
        return match gw {
            Some(IpAddr::V6(_)) => "::/0".parse().ok(),
            _ => "0.0.0.0/0".parse().ok(),
        };
    }
    s.parse::<IpNet>()
        .ok()
        .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
}

fn parse_protocol(v: &serde_json::Value) -> Option<u8> {
    match v {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        serde_json::Value::String(s) => match s.as_str() {
            "kernel" => Some(2),
            "boot" => Some(3),
            "static" => Some(4),
            _ => s.parse().ok(),
        },
        _ => None,
    }
}

/// MTU of the link used to reach `ip`.
pub async fn route_mtu(dst: IpAddr) -> Result<u32> {
    let rs: Vec<JsonRoute> = ip_json(&["route", "get", &dst.to_string()]).await?;
    let r = rs.into_iter().next().ok_or(PlatformError::NotFound)?;
    if let Some(mtu) = r.mtu {
        return Ok(mtu);
    }
    let dev = r.dev.ok_or(PlatformError::NotFound)?;
    Ok(find(&dev).await?.mtu)
}

/// Smallest MTU among the links carrying a default route.
pub async fn default_route_mtu() -> Result<u32> {
    let mut mtu: Option<u32> = None;
    for family in ["-4", "-6"] {
        let rs: Vec<JsonRoute> = match ip_json(&[family, "route", "show", "default"]).await {
            Ok(rs) => rs,
            Err(e) => {
                debug!("Failed to list {} default routes: {:#}", family, e);
                continue;
            }
        };
        for r in rs {
            let m = match (r.mtu, &r.dev) {
                (Some(m), _) => m,
                (None, Some(dev)) => find(dev).await?.mtu,
                _ => continue,
            };
            mtu = Some(mtu.map_or(m, |c| c.min(m)));
        }
    }
    mtu.ok_or_else(|| PlatformError::NotFound.into())
}

/// Resolve a routing table name or number.
pub fn table_lookup(name: &str) -> Result<u32> {
    if let Ok(n) = name.parse() {
        return Ok(n);
    }
    match name {
        "main" => return Ok(TABLE_MAIN),
        "local" => return Ok(255),
        "default" => return Ok(253),
        _ => {}
    }

    for path in ["/etc/iproute2/rt_tables", "/usr/share/iproute2/rt_tables"] {
        if let Ok(content) = fs::read_to_string(path) {
            if let Some(n) = parse_rt_tables(&content, name) {
                return Ok(n);
            }
        }
    }
    anyhow::bail!("unknown routing table {name:?}")
}

fn parse_rt_tables(content: &str, name: &str) -> Option<u32> {
    content
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .find_map(|l| {
            let mut it = l.split_whitespace();
            let num = it.next()?.parse().ok()?;
            (it.next()? == name).then_some(num)
        })
}

/// Subscribe to kernel route and link changes.
///
/// Runs `ip -o monitor route link` and parses its output. The receiver is
/// closed when the monitor process exits.
pub fn monitor() -> Result<mpsc::Receiver<LinkEvent>> {
    if !cfg!(target_os = "linux") {
        return Err(PlatformError::NotSupported.into());
    }

    let mut child = Command::new("ip")
        .args(["-o", "monitor", "route", "link"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PlatformError::NotSupported,
            _ => PlatformError::Io(e),
        })?;

    let stdout = child.stdout.take().context("monitor has no stdout")?;
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(ev) = parse_monitor_line(&line) {
                            if tx.send(ev).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Link monitor read failed: {}", e);
                        break;
                    }
                },
                _ = tx.closed() => break,
            }
        }
        let _ = child.kill().await;
    });

    Ok(rx)
}

fn parse_monitor_line(line: &str) -> Option<LinkEvent> {
    let mut line = line.trim();
    let mut kind = None;
    for (prefix, k) in [("[ROUTE]", "route"), ("[LINK]", "link")] {
        if let Some(rest) = line.strip_prefix(prefix) {
            line = rest.trim_start();
            kind = Some(k);
        }
    }

    let (deleted, line) = match line.strip_prefix("Deleted ") {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    let first = line.split_whitespace().next()?;
    let is_link = kind == Some("link")
        || (kind.is_none() && first.ends_with(':') && first[..first.len() - 1].parse::<u32>().is_ok());

    if is_link {
        let name = line.split_whitespace().nth(1)?.trim_end_matches(':');
        let name = name.split('@').next().unwrap_or(name);
        return Some(LinkEvent::LinkChanged {
            name: name.to_string(),
            deleted,
        });
    }

    let route = parse_route_line(line)?;
    Some(if deleted {
        LinkEvent::RouteDeleted(route)
    } else {
        LinkEvent::RouteAdded(route)
    })
}

fn parse_route_line(line: &str) -> Option<Route> {
    let mut tokens: Vec<&str> = line.split_whitespace().collect();
    if matches!(
        tokens.first(),
        Some(&"unicast") | Some(&"local") | Some(&"broadcast") | Some(&"multicast") | Some(&"anycast")
    ) {
        if tokens[0] != "unicast" {
            return None;
        }
        tokens.remove(0);
    }

    let dst_s = *tokens.first()?;
    let mut gateway = None;
    let mut dev = None;
    let mut table = TABLE_MAIN;
    let mut protocol = None;

    let mut i = 1;
    while i + 1 < tokens.len() {
        let v = tokens[i + 1];
        match tokens[i] {
            "via" => gateway = v.parse().ok(),
            "dev" => dev = Some(v.to_string()),
            "table" => table = table_lookup(v).unwrap_or(TABLE_MAIN),
            "proto" => protocol = parse_protocol(&serde_json::Value::String(v.to_string())),
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    Some(Route {
        dst: parse_dst(dst_s, gateway)?,
        gateway,
        dev,
        table,
        protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rt_tables() {
        let content = "# reserved values\n255\tlocal\n254\tmain\n\n100 overlay # ours\n";
        assert_eq!(parse_rt_tables(content, "overlay"), Some(100));
        assert_eq!(parse_rt_tables(content, "main"), Some(254));
        assert_eq!(parse_rt_tables(content, "missing"), None);
        assert_eq!(table_lookup("main").unwrap(), 254);
        assert_eq!(table_lookup("1234").unwrap(), 1234);
    }

    #[test]
    fn test_parse_ip_json_links() {
        let out = r#"[{"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP","LOWER_UP"],"mtu":65536,
            "addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8,"scope":"host"}]},
            {"ifindex":7,"ifname":"wg0","flags":["POINTOPOINT","NOARP","UP","LOWER_UP"],"mtu":1420,
            "linkinfo":{"info_kind":"wireguard"},
            "addr_info":[{"family":"inet6","local":"fc2f:9a4d::1","prefixlen":32}]}]"#;
        let links: Vec<JsonLink> = serde_json::from_str(out).unwrap();
        let addrs = flatten_addresses(serde_json::from_str(out).unwrap());

        let wg: Link = links.into_iter().nth(1).unwrap().into();
        assert_eq!(wg.index, 7);
        assert!(wg.point_to_point);
        assert_eq!(wg.kind.as_deref(), Some("wireguard"));

        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].loopback);
        assert_eq!(addrs[0].kind, None);
        assert_eq!(addrs[1].kind.as_deref(), Some("wireguard"));
        assert_eq!(addrs[1].addr, "fc2f:9a4d::1/32".parse::<IpNet>().unwrap());
    }

    #[test]
    fn test_parse_ip_json_routes() {
        let out = r#"[{"dst":"default","gateway":"192.168.1.1","dev":"eth0","protocol":"dhcp"},
            {"dst":"10.1.0.0/24","gateway":"10.237.4.2","dev":"wg0","protocol":"98"},
            {"dst":"10.2.0.7","dev":"wg0","protocol":"static"}]"#;
        let rs: Vec<JsonRoute> = serde_json::from_str(out).unwrap();
        let rs: Vec<Route> = rs.into_iter().filter_map(|r| convert_route(r, 100)).collect();

        assert_eq!(rs[0].dst, "0.0.0.0/0".parse::<IpNet>().unwrap());
        assert_eq!(rs[1].protocol, Some(RTPROT_ICEWIRE));
        assert_eq!(rs[2].dst, "10.2.0.7/32".parse::<IpNet>().unwrap());
        assert_eq!(rs[2].protocol, Some(4));
        assert!(rs.iter().all(|r| r.table == 100));
    }

    #[test]
    fn test_parse_monitor_lines() {
        let ev = parse_monitor_line("[ROUTE]10.1.0.0/24 via 10.237.4.2 dev wg0 table 100 proto boot metric 1024");
        assert_eq!(
            ev,
            Some(LinkEvent::RouteAdded(Route {
                dst: "10.1.0.0/24".parse().unwrap(),
                gateway: Some("10.237.4.2".parse().unwrap()),
                dev: Some("wg0".to_string()),
                table: 100,
                protocol: Some(3),
            }))
        );

        let ev = parse_monitor_line("Deleted fd00::/64 via fc2f:9a4d::2 dev wg0 proto 98 metric 1024 pref medium");
        assert!(matches!(ev, Some(LinkEvent::RouteDeleted(r)) if r.table == TABLE_MAIN && r.protocol == Some(98)));

        let ev = parse_monitor_line("Deleted 7: wg0: <POINTOPOINT,NOARP> mtu 1420 qdisc noop state DOWN");
        assert_eq!(
            ev,
            Some(LinkEvent::LinkChanged {
                name: "wg0".to_string(),
                deleted: true
            })
        );

        assert_eq!(parse_monitor_line("local 10.0.0.1 dev eth0 table local proto kernel"), None);
    }
}
