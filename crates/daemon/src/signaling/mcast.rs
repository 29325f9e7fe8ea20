//! LAN multicast backend (`multicast://group:port?interface=..&loopback=..`).
//!
//! Every envelope is sent as one JSON datagram to the group; receivers filter
//! by recipient through the subscriptions registry.

use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use url::Url;

use super::backend::SubscriptionsRegistry;
use super::envelope::Envelope;
use crate::error::SignalingError;

pub const DEFAULT_PORT: u16 = 7788;
const MAX_DATAGRAM: usize = 65507;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Options {
    group: SocketAddr,
    interface: Option<Ipv4Addr>,
    loopback: bool,
}

fn parse_options(url: &Url) -> Result<Options, SignalingError> {
    let host = url
        .host_str()
        .ok_or_else(|| SignalingError::InvalidUri(format!("{url}: missing group")))?;
    let ip: IpAddr = host
        .trim_matches(|c| c == '[' || c == ']')
        .parse()
        .map_err(|_| SignalingError::InvalidUri(format!("{url}: group must be an IP address")))?;
    if !ip.is_multicast() {
        return Err(SignalingError::InvalidUri(format!("{ip} is not a multicast group")));
    }

    let mut opts = Options {
        group: SocketAddr::new(ip, url.port().unwrap_or(DEFAULT_PORT)),
        interface: None,
        loopback: true,
    };
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "interface" => {
                opts.interface = Some(
                    v.parse()
                        .map_err(|_| SignalingError::InvalidUri(format!("invalid interface address {v:?}")))?,
                )
            }
            "loopback" => opts.loopback = matches!(v.as_ref(), "true" | "1" | "yes"),
            other => return Err(SignalingError::InvalidUri(format!("unknown option {other:?}"))),
        }
    }
    Ok(opts)
}

fn bind(opts: &Options) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(opts.group), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    match opts.group.ip() {
        IpAddr::V4(group) => {
            let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), opts.group.port());
            socket.bind(&any.into())?;
            let iface = opts.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &iface)?;
            socket.set_multicast_loop_v4(opts.loopback)?;
            if let Some(iface) = opts.interface {
                socket.set_multicast_if_v4(&iface)?;
            }
        }
        IpAddr::V6(group) => {
            let any = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), opts.group.port());
            socket.bind(&any.into())?;
            socket.join_multicast_v6(&group, 0)?;
            socket.set_multicast_loop_v6(opts.loopback)?;
        }
    }

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

pub struct MulticastBackend {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    task: JoinHandle<()>,
}

impl MulticastBackend {
    pub async fn new(url: &Url, registry: Arc<SubscriptionsRegistry>) -> Result<Self, SignalingError> {
        let opts = parse_options(url)?;
        let socket = Arc::new(bind(&opts).map_err(|e| SignalingError::Transport(e.to_string()))?);
        info!("Multicast signaling on group {}", opts.group);

        let task = tokio::spawn(receive(Arc::clone(&socket), registry));
        Ok(Self {
            socket,
            group: opts.group,
            task,
        })
    }

    pub async fn publish(&self, env: &Envelope) -> Result<(), SignalingError> {
        let buf = serde_json::to_vec(env).map_err(|e| SignalingError::Transport(e.to_string()))?;
        if buf.len() > MAX_DATAGRAM {
            return Err(SignalingError::Transport(format!("envelope too large ({} bytes)", buf.len())));
        }
        self.socket
            .send_to(&buf, self.group)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        Ok(())
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for MulticastBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive(socket: Arc<UdpSocket>, registry: Arc<SubscriptionsRegistry>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Multicast receive failed: {}", e);
                continue;
            }
        };
        match serde_json::from_slice::<Envelope>(&buf[..n]) {
            Ok(env) => {
                trace!("Multicast envelope from {} ({})", env.sender.short(), from);
                registry.dispatch(&env).await;
            }
            Err(e) => debug!("Ignoring non-envelope datagram from {}: {}", from, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let url = Url::parse("multicast://239.0.0.1:7000?interface=192.168.1.2&loopback=false").unwrap();
        let opts = parse_options(&url).unwrap();
        assert_eq!(opts.group, "239.0.0.1:7000".parse().unwrap());
        assert_eq!(opts.interface, Some(Ipv4Addr::new(192, 168, 1, 2)));
        assert!(!opts.loopback);

        let url = Url::parse("multicast://[ff02::1234]").unwrap();
        assert_eq!(parse_options(&url).unwrap().group.port(), DEFAULT_PORT);

        let url = Url::parse("multicast://10.0.0.1:7000").unwrap();
        assert!(parse_options(&url).is_err());
        let url = Url::parse("multicast://239.0.0.1:7000?ttl=3").unwrap();
        assert!(parse_options(&url).is_err());
    }
}
