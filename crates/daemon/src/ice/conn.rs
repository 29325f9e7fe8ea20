//! Datagram connection over a selected candidate pair.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::mux::{MuxSocket, UdpMux};

/// Application datagrams to and from the remote candidate of the selected pair.
///
/// Inbound datagrams are fed by the owning agent; sending goes straight to the
/// mux socket of the local candidate.
pub struct IceConn {
    mux: Arc<UdpMux>,
    socket: Arc<MuxSocket>,
    ufrag: String,
    remote: SocketAddr,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl IceConn {
    pub(super) fn new(
        mux: Arc<UdpMux>,
        socket: Arc<MuxSocket>,
        ufrag: String,
        remote: SocketAddr,
        rx: mpsc::Receiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            mux,
            socket,
            ufrag,
            remote,
            rx: Mutex::new(rx),
            closed,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "ICE connection closed"));
        }
        self.mux.send_to(&self.socket, &self.ufrag, buf, self.remote).await
    }

    /// Next datagram from the remote. Fails once the agent went away.
    pub async fn recv(&self) -> io::Result<Vec<u8>> {
        match self.rx.lock().await.recv().await {
            Some(data) => Ok(data),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "ICE connection closed")),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for IceConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceConn")
            .field("local", &self.socket.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
impl IceConn {
    /// Connection over the first socket of `mux` fed by the returned sender.
    pub(crate) fn for_test(mux: Arc<UdpMux>, remote: SocketAddr) -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let socket = Arc::clone(&mux.sockets()[0]);
        let conn = Self::new(mux, socket, "test".into(), remote, rx, Arc::new(AtomicBool::new(false)));
        (Arc::new(conn), tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::mux::MuxKind;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_send_recv_and_close() {
        let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mux = Arc::new(UdpMux::from_sockets(MuxKind::Host, vec![s]).unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let closed = Arc::new(AtomicBool::new(false));
        let conn = IceConn::new(
            Arc::clone(&mux),
            Arc::clone(&mux.sockets()[0]),
            "ufrag".into(),
            peer.local_addr().unwrap(),
            rx,
            Arc::clone(&closed),
        );

        conn.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, conn.local_addr());

        tx.send(b"world".to_vec()).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), b"world");

        conn.close();
        assert!(conn.send(b"late").await.is_err());
        drop(tx);
        assert!(conn.recv().await.is_err());
    }
}
