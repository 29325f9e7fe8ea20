use anyhow::{Context, Result};
use clap::Parser;
use icewire::{config::Config, wg::Client, Daemon};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "icewire",
    version,
    about = "WireGuard overlay daemon with ICE endpoint discovery",
    long_about = "icewire daemon\n\n\
        Augments WireGuard interfaces with:\n\
        - ICE endpoint discovery and NAT traversal\n\
        - Peer discovery on a shared community key\n\
        - Route and hosts file synchronization\n\n\
        Examples:\n  \
          # Manage all WireGuard interfaces, signaling via a broker\n  \
          icewire --backend https://broker.example.com\n\n  \
          # Run a broker and use it locally\n  \
          icewire --broker 0.0.0.0:8080 --backend http://127.0.0.1:8080"
)]
struct Args {
    /// Path to config file
    #[arg(long, short = 'C', env = "ICEWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling backend URI (repeatable, replaces the configured list)
    #[arg(long, short = 'b', action = clap::ArgAction::Append)]
    backend: Vec<String>,

    /// Glob on the names of the interfaces to manage
    #[arg(long, short = 'i')]
    interface_filter: Option<String>,

    /// Create configured interfaces in user-space even if the kernel module is available
    #[arg(long)]
    userspace: bool,

    /// Port of the status and control server (0 disables it)
    #[arg(long)]
    http_port: Option<u16>,

    /// Serve the HTTP signaling broker on this address (host:port)
    #[arg(long)]
    broker: Option<String>,

    /// Interval between device scans in seconds
    #[arg(long, short = 'w')]
    watch_interval: Option<u64>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };

    if !args.backend.is_empty() {
        config.signaling.backends = args.backend.clone();
    }
    if let Some(f) = &args.interface_filter {
        config.daemon.interface_filter = f.clone();
    }
    if args.userspace {
        config.interface.userspace = true;
        for s in config.interfaces.values_mut() {
            s.userspace = true;
        }
    }
    if let Some(port) = args.http_port {
        config.daemon.http_port = port;
    }
    if let Some(addr) = &args.broker {
        config.daemon.broker_listen = Some(addr.clone());
    }
    if let Some(secs) = args.watch_interval {
        config.daemon.watch_interval_secs = secs;
    }

    config.check().context("invalid configuration")?;
    Ok(config)
}

/// Kernel interfaces and firewall rules need root.
#[cfg(target_os = "linux")]
fn check_privileges(config: &Config) -> Result<()> {
    let kernel = !config.interface.userspace || config.interfaces.values().any(|s| !s.userspace);
    if !kernel {
        return Ok(());
    }
    let output = std::process::Command::new("id").arg("-u").output()?;
    let uid = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u32>()
        .unwrap_or(0);
    if uid != 0 {
        anyhow::bail!("Root/sudo privileges are required to manage kernel WireGuard interfaces (or use --userspace)");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn check_privileges(_config: &Config) -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let config = load_config(&args)?;
    check_privileges(&config)?;

    info!("🧊 Starting icewire {}", env!("CARGO_PKG_VERSION"));
    info!("Signaling backends: {}", config.signaling.backends.join(", "));
    if config.interfaces.is_empty() {
        info!("No interfaces configured, managing existing interfaces matching {:?}", config.daemon.interface_filter);
    }
    if config.interface.pdisc.community.is_none() && config.interfaces.values().all(|s| s.pdisc.community.is_none()) {
        warn!("No community configured, peer discovery is disabled");
    }

    let daemon = Daemon::new(config, Arc::new(Client::new())).await?;
    daemon.run().await
}
