use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// Abstraction for putting a finished datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing.
///
/// A `UdpSocket` send is atomic per datagram, so connections sharing a socket cannot corrupt
///  each other's packets even when their sends interleave.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize> {
        trace!("UDP socket: sending {} byte packet to {:?}", packet_buf.len(), to);
        self.send_to(packet_buf, to).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The send path every connection writes through. Kept as its own layer so the socket can be
///  swapped for a mock, and as the single place to hang send-side concerns off later.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> io::Result<usize> {
        self.socket.send_packet(to, packet_buf).await
    }
}
