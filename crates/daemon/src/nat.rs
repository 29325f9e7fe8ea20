//! Kernel NAT rules backing the kernel-NAT proxy.
//!
//! Each interface owns one nftables table `icewire-if<ifindex>` in the `inet`
//! family with two chains hooked at raw priority:
//! - `ingress` (input): non-STUN datagrams sent to the host mux port are
//!   redirected to the WireGuard listen port
//! - `egress` (output): WireGuard datagrams to a peer leave with the mux port
//!   as their source port
//!
//! Both rewrites are `notrack` so conntrack never sees the mangled flows.
//! Every rule carries a `type=<t> id=<n>` comment. The id is unique within the
//! table and is used to find the rule handle after insertion.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::PlatformError;
use crate::link;

/// Identifies STUN messages at byte offset 4 of the UDP payload.
pub const STUN_MAGIC_COOKIE: u32 = 0x2112_a442;

const CHAIN_INGRESS: &str = "ingress";
const CHAIN_EGRESS: &str = "egress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuleType {
    RedirectNonStun = 1,
    MasqueradeSourcePort = 2,
}

/// Handle of an installed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub chain: &'static str,
    pub typ: RuleType,
    pub id: u32,
    pub handle: u64,
}

/// nftables table of one interface.
#[derive(Debug)]
pub struct Nat {
    table: String,
    last_id: AtomicU32,
}

impl Nat {
    /// Create the table, replacing a leftover one with the same name.
    ///
    /// Fails with [`PlatformError::NotSupported`] where nftables is unavailable.
    pub async fn new(ifindex: u32) -> Result<Self> {
        let table = format!("icewire-if{ifindex}");

        match nft(&["delete", "table", "inet", &table], None).await {
            Ok(_) | Err(PlatformError::NotFound) => {}
            Err(PlatformError::NotSupported) => return Err(PlatformError::NotSupported.into()),
            Err(e) => debug!("Failed to remove stale table {}: {}", table, e),
        }

        nft(&["-f", "-"], Some(&setup_script(&table)))
            .await
            .with_context(|| format!("failed to create nftables table {table}"))?;
        info!("Created nftables table inet {}", table);

        Ok(Self {
            table,
            last_id: AtomicU32::new(0),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Send non-STUN datagrams arriving at `mux_port` to `wg_port`.
    pub async fn redirect_non_stun(&self, mux_port: u16, wg_port: u16) -> Result<NatRule> {
        self.add_rule(CHAIN_INGRESS, RuleType::RedirectNonStun, &redirect_expr(mux_port, wg_port))
            .await
    }

    /// Rewrite the source port of WireGuard datagrams to `dest` to `mux_port`.
    pub async fn masquerade_source_port(&self, wg_port: u16, mux_port: u16, dest: SocketAddr) -> Result<NatRule> {
        self.add_rule(
            CHAIN_EGRESS,
            RuleType::MasqueradeSourcePort,
            &masquerade_expr(wg_port, mux_port, dest),
        )
        .await
    }

    async fn add_rule(&self, chain: &'static str, typ: RuleType, expr: &str) -> Result<NatRule> {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        let comment = rule_comment(typ, id);
        let script = format!("add rule inet {} {} {} comment \"{}\"\n", self.table, chain, expr, comment);

        nft(&["-f", "-"], Some(&script))
            .await
            .with_context(|| format!("failed to add rule to {}/{}", self.table, chain))?;

        let listing = nft(&["-j", "-a", "list", "chain", "inet", &self.table, chain], None).await?;
        let handle = find_handle(&listing, &comment)?
            .with_context(|| format!("rule {comment:?} not found after insertion"))?;

        debug!("Installed rule {} (handle {}) in {}/{}: {}", comment, handle, self.table, chain, expr);
        Ok(NatRule {
            chain,
            typ,
            id,
            handle,
        })
    }

    /// Remove a rule. Rules that are already gone are ignored.
    pub async fn delete(&self, rule: &NatRule) -> Result<()> {
        let handle = rule.handle.to_string();
        match nft(&["delete", "rule", "inet", &self.table, rule.chain, "handle", &handle], None).await {
            Ok(_) | Err(PlatformError::NotFound) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete rule {} from {}", rule.id, self.table)),
        }
    }

    pub async fn close(&self) -> Result<()> {
        match nft(&["delete", "table", "inet", &self.table], None).await {
            Ok(_) | Err(PlatformError::NotFound) => {
                debug!("Removed nftables table {}", self.table);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn nft(args: &[&str], stdin: Option<&str>) -> Result<String, PlatformError> {
    link::run("nft", args, stdin).await
}

fn setup_script(table: &str) -> String {
    format!(
        "table inet {table} {{\n\
         \tchain {CHAIN_INGRESS} {{ type filter hook input priority raw; policy accept; }}\n\
         \tchain {CHAIN_EGRESS} {{ type filter hook output priority raw; policy accept; }}\n\
         }}\n"
    )
}

fn rule_comment(typ: RuleType, id: u32) -> String {
    format!("type={} id={}", typ as u8, id)
}

fn redirect_expr(mux_port: u16, wg_port: u16) -> String {
    format!(
        "meta l4proto udp udp dport {mux_port} @th,96,32 != {STUN_MAGIC_COOKIE:#010x} notrack udp dport set {wg_port}"
    )
}

fn masquerade_expr(wg_port: u16, mux_port: u16, dest: SocketAddr) -> String {
    let family = if dest.is_ipv4() { "ip" } else { "ip6" };
    format!(
        "meta l4proto udp udp sport {wg_port} {family} daddr {} udp dport {} notrack udp sport set {mux_port}",
        dest.ip(),
        dest.port()
    )
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    nftables: Vec<ListingEntry>,
}

#[derive(Deserialize)]
struct ListingEntry {
    #[serde(default)]
    rule: Option<ListedRule>,
}

#[derive(Deserialize)]
struct ListedRule {
    handle: u64,
    #[serde(default)]
    comment: Option<String>,
}

fn find_handle(json: &str, comment: &str) -> Result<Option<u64>> {
    let listing: Listing = serde_json::from_str(json).context("failed to parse nft listing")?;
    Ok(listing
        .nftables
        .into_iter()
        .filter_map(|e| e.rule)
        .find(|r| r.comment.as_deref() == Some(comment))
        .map(|r| r.handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_expressions() {
        assert_eq!(
            redirect_expr(49200, 51820),
            "meta l4proto udp udp dport 49200 @th,96,32 != 0x2112a442 notrack udp dport set 51820"
        );
        assert_eq!(
            masquerade_expr(51820, 49200, "198.51.100.7:3478".parse().unwrap()),
            "meta l4proto udp udp sport 51820 ip daddr 198.51.100.7 udp dport 3478 notrack udp sport set 49200"
        );
        assert!(masquerade_expr(51820, 49200, "[2001:db8::7]:3478".parse().unwrap()).contains("ip6 daddr 2001:db8::7"));
    }

    #[test]
    fn test_setup_script() {
        let s = setup_script("icewire-if7");
        assert!(s.starts_with("table inet icewire-if7 {"));
        assert!(s.contains("chain ingress { type filter hook input priority raw;"));
        assert!(s.contains("chain egress { type filter hook output priority raw;"));
    }

    #[test]
    fn test_find_handle() {
        let json = r#"{"nftables": [
            {"metainfo": {"version": "1.0.9", "json_schema_version": 1}},
            {"chain": {"family": "inet", "table": "icewire-if7", "name": "ingress", "handle": 1}},
            {"rule": {"family": "inet", "table": "icewire-if7", "chain": "ingress", "handle": 4, "comment": "type=1 id=1", "expr": []}},
            {"rule": {"family": "inet", "table": "icewire-if7", "chain": "ingress", "handle": 9, "comment": "type=1 id=12", "expr": []}},
            {"rule": {"family": "inet", "table": "icewire-if7", "chain": "ingress", "handle": 11, "expr": []}}
        ]}"#;
        assert_eq!(find_handle(json, &rule_comment(RuleType::RedirectNonStun, 12)).unwrap(), Some(9));
        assert_eq!(find_handle(json, "type=1 id=1").unwrap(), Some(4));
        assert_eq!(find_handle(json, "type=2 id=1").unwrap(), None);
        assert!(find_handle("not json", "x").is_err());
    }
}
