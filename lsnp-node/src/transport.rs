//! UDP socket ownership: bind with address reuse, send datagrams, run the receive loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lsnp_core::SendError;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Receive buffer; covers the largest UDP payload.
const RECV_BUF_LEN: usize = 65_536;

/// Pause after a receive error so a persistent one does not spin the loop.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A received datagram and its source.
pub type Inbound = (Vec<u8>, SocketAddr);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot bind UDP port {port}: {source}")]
    SocketBindFailure {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Shared handle on the bound socket.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_port: u16,
}

impl Transport {
    /// Bind `0.0.0.0:port` with SO_REUSEADDR and SO_BROADCAST. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self, EngineError> {
        let socket = bind_reuse(port).map_err(|source| EngineError::SocketBindFailure { port, source })?;
        let local_port = socket
            .local_addr()
            .map_err(|source| EngineError::SocketBindFailure { port, source })?
            .port();
        Ok(Self {
            socket: Arc::new(socket),
            local_port,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub async fn send_to(&self, bytes: &[u8], target: SocketAddr) -> Result<(), SendError> {
        self.socket
            .send_to(bytes, target)
            .await
            .map(|_| ())
            .map_err(|source| SendError::SocketSendFailure { target, source })
    }

    /// Receive until `shutdown` flips, forwarding every datagram to `inbound`.
    pub async fn listen(self, inbound: mpsc::Sender<Inbound>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => {
                        if inbound.send((buf[..n].to_vec(), from)).await.is_err() {
                            break;
                        }
                    }
                    // ICMP errors surface here on some platforms; the socket stays usable.
                    Err(e) => {
                        warn!(error = %e, "udp receive failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(port = self.local_port, "listener stopped");
    }
}

fn bind_reuse(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;
    let std_sock: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_sock)
}

/// Address of the interface used for outbound traffic. Connecting a UDP socket sends nothing.
pub fn detect_local_ip() -> Option<IpAddr> {
    let sock = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    sock.connect(("8.8.8.8", 80)).ok()?;
    sock.local_addr().ok().map(|a| a.ip())
}
