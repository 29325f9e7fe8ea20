use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::proxy::ProxyType;

/// Prometheus-compatible daemon metrics.
///
/// Gauges are kept up to date by the engines owning the counted objects:
/// - interfaces and peers by the daemon supervisor
/// - connected peers by the endpoint-discovery coordinators
#[derive(Default)]
pub struct Metrics {
    // === Gauges ===
    pub interfaces_active: AtomicU64,
    pub peers_active: AtomicU64,
    pub peers_connected: AtomicU64,

    // === Endpoint discovery ===
    pub agents_created_total: AtomicU64,
    pub agent_restarts_total: AtomicU64,
    pub connections_established_total: AtomicU64,
    pub candidates_sent_total: AtomicU64,
    pub candidates_received_total: AtomicU64,
    pub proxies_kernel_nat_total: AtomicU64,
    pub proxies_loopback_total: AtomicU64,
    pub proxies_in_process_total: AtomicU64,

    // === Signaling ===
    pub signaling_published_total: AtomicU64,
    pub signaling_publish_failures_total: AtomicU64,
    pub signaling_received_total: AtomicU64,

    // === Other engines ===
    pub peers_discovered_total: AtomicU64,
    pub routes_added_total: AtomicU64,
    pub routes_removed_total: AtomicU64,
    pub hosts_syncs_total: AtomicU64,
    pub hooks_run_total: AtomicU64,
    pub hooks_failed_total: AtomicU64,
    pub watcher_syncs_total: AtomicU64,
    pub watcher_errors_total: AtomicU64,
}

fn inc(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

fn dec(c: &AtomicU64) {
    // Saturate at zero so a late close never wraps the gauge.
    let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_interfaces(&self) {
        inc(&self.interfaces_active);
    }

    pub fn dec_interfaces(&self) {
        dec(&self.interfaces_active);
    }

    pub fn inc_peers(&self) {
        inc(&self.peers_active);
    }

    pub fn dec_peers(&self) {
        dec(&self.peers_active);
    }

    pub fn inc_connected(&self) {
        inc(&self.peers_connected);
        inc(&self.connections_established_total);
    }

    pub fn dec_connected(&self) {
        dec(&self.peers_connected);
    }

    pub fn inc_agents(&self) {
        inc(&self.agents_created_total);
    }

    pub fn inc_restarts(&self) {
        inc(&self.agent_restarts_total);
    }

    pub fn inc_candidates_sent(&self) {
        inc(&self.candidates_sent_total);
    }

    pub fn inc_candidates_received(&self) {
        inc(&self.candidates_received_total);
    }

    pub fn inc_proxy(&self, typ: ProxyType) {
        match typ {
            ProxyType::KernelNat => inc(&self.proxies_kernel_nat_total),
            ProxyType::Loopback => inc(&self.proxies_loopback_total),
            ProxyType::InProcess => inc(&self.proxies_in_process_total),
        }
    }

    pub fn inc_published(&self) {
        inc(&self.signaling_published_total);
    }

    pub fn inc_publish_failures(&self) {
        inc(&self.signaling_publish_failures_total);
    }

    pub fn inc_received(&self) {
        inc(&self.signaling_received_total);
    }

    pub fn inc_discovered(&self) {
        inc(&self.peers_discovered_total);
    }

    pub fn inc_routes_added(&self) {
        inc(&self.routes_added_total);
    }

    pub fn inc_routes_removed(&self) {
        inc(&self.routes_removed_total);
    }

    pub fn inc_hosts_syncs(&self) {
        inc(&self.hosts_syncs_total);
    }

    pub fn inc_hooks(&self, ok: bool) {
        inc(&self.hooks_run_total);
        if !ok {
            inc(&self.hooks_failed_total);
        }
    }

    pub fn inc_watcher_syncs(&self) {
        inc(&self.watcher_syncs_total);
    }

    pub fn inc_watcher_errors(&self) {
        inc(&self.watcher_errors_total);
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let families: [(&str, &str, &str, &AtomicU64); 24] = [
            ("icewire_interfaces", "gauge", "Managed WireGuard interfaces", &self.interfaces_active),
            ("icewire_peers", "gauge", "Known peers across all interfaces", &self.peers_active),
            ("icewire_peers_connected", "gauge", "Peers with a connected ICE session", &self.peers_connected),
            ("icewire_agents_created_total", "counter", "ICE agents created", &self.agents_created_total),
            ("icewire_agent_restarts_total", "counter", "ICE agent restarts", &self.agent_restarts_total),
            (
                "icewire_connections_established_total",
                "counter",
                "ICE sessions that reached the connected state",
                &self.connections_established_total,
            ),
            ("icewire_candidates_sent_total", "counter", "Local candidates published", &self.candidates_sent_total),
            (
                "icewire_candidates_received_total",
                "counter",
                "Remote candidates added to agents",
                &self.candidates_received_total,
            ),
            (
                "icewire_proxies_kernel_nat_total",
                "counter",
                "Pairs bridged with kernel NAT rules",
                &self.proxies_kernel_nat_total,
            ),
            (
                "icewire_proxies_loopback_total",
                "counter",
                "Pairs bridged with a loopback socket",
                &self.proxies_loopback_total,
            ),
            (
                "icewire_proxies_in_process_total",
                "counter",
                "Pairs bridged inside a user-space bind",
                &self.proxies_in_process_total,
            ),
            (
                "icewire_signaling_published_total",
                "counter",
                "Signaling messages published",
                &self.signaling_published_total,
            ),
            (
                "icewire_signaling_publish_failures_total",
                "counter",
                "Signaling publishes rejected by every backend",
                &self.signaling_publish_failures_total,
            ),
            (
                "icewire_signaling_received_total",
                "counter",
                "Signaling messages received",
                &self.signaling_received_total,
            ),
            ("icewire_peers_discovered_total", "counter", "Peers added by discovery", &self.peers_discovered_total),
            ("icewire_routes_added_total", "counter", "Routes installed by route sync", &self.routes_added_total),
            ("icewire_routes_removed_total", "counter", "Routes removed by route sync", &self.routes_removed_total),
            ("icewire_hosts_syncs_total", "counter", "Hosts file rewrites", &self.hosts_syncs_total),
            ("icewire_hooks_run_total", "counter", "Hooks executed", &self.hooks_run_total),
            ("icewire_hooks_failed_total", "counter", "Hooks that failed", &self.hooks_failed_total),
            ("icewire_watcher_syncs_total", "counter", "Watcher synchronizations", &self.watcher_syncs_total),
            ("icewire_watcher_errors_total", "counter", "Failed watcher synchronizations", &self.watcher_errors_total),
            (
                "icewire_peers_disconnected",
                "gauge",
                "Known peers without a connected ICE session",
                &AtomicU64::new(
                    self.peers_active
                        .load(Ordering::Relaxed)
                        .saturating_sub(self.peers_connected.load(Ordering::Relaxed)),
                ),
            ),
            ("icewire_up", "gauge", "Daemon is running", &AtomicU64::new(1)),
        ];

        let mut out = String::with_capacity(4096);
        for (name, typ, help, value) in families {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} {typ}");
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.peers_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.agent_restarts_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_gauges_saturate() {
        let metrics = Metrics::new();
        metrics.inc_peers();
        metrics.dec_peers();
        metrics.dec_peers();
        assert_eq!(metrics.peers_active.load(Ordering::Relaxed), 0);

        metrics.inc_connected();
        metrics.inc_connected();
        metrics.dec_connected();
        assert_eq!(metrics.peers_connected.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.connections_established_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hook_metrics() {
        let metrics = Metrics::new();
        metrics.inc_hooks(true);
        metrics.inc_hooks(false);
        assert_eq!(metrics.hooks_run_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.hooks_failed_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.inc_proxy(ProxyType::KernelNat);
        metrics.inc_restarts();
        metrics.inc_peers();
        metrics.inc_peers();
        metrics.inc_connected();

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE icewire_peers gauge\n"));
        assert!(output.contains("icewire_proxies_kernel_nat_total 1\n"));
        assert!(output.contains("icewire_agent_restarts_total 1\n"));
        assert!(output.contains("icewire_peers_disconnected 1\n"));
        assert!(output.contains("icewire_up 1\n"));
    }
}
