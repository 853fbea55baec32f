//! The server-side endpoint: one UDP socket shared by all connections, with a receive loop
//!  that demultiplexes datagrams onto per-peer connection instances.

use crate::config::HazelConfig;
use crate::connection::Connection;
use crate::events::{CloseEvent, EventDispatcher};
use crate::packet::TYPE_HELLO;
use crate::send_pipeline::SendPipeline;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::RwLock;
use tracing::{debug, error, info, span, trace, Level};
use uuid::Uuid;

type ConnectionMap = RwLock<FxHashMap<SocketAddr, Connection>>;

/// EndPoint is the place where all other parts of the protocol come together: it listens on a
///  UdpSocket, routes incoming datagrams to the connection of their sender, and accepts new
///  connections when an unknown endpoint introduces itself with a HELLO. Anything else from an
///  unknown endpoint is dropped without a reply.
pub struct EndPoint {
    receive_socket: Arc<UdpSocket>,
    send_pipeline_v4: Arc<SendPipeline>,
    send_pipeline_v6: Arc<SendPipeline>,
    connections: Arc<ConnectionMap>,
    dispatcher: Arc<EvictingDispatcher>,
    config: Arc<HazelConfig>,
}

/// A connection never touches the endpoint's map itself - it signals close through its event
///  stream, and this wrapper observes that event to evict the entry before handing it on to
///  the application.
struct EvictingDispatcher {
    connections: Weak<ConnectionMap>,
    inner: Arc<dyn EventDispatcher>,
}

#[async_trait]
impl EventDispatcher for EvictingDispatcher {
    async fn on_connection(&self, connection: Connection) {
        self.inner.on_connection(connection).await
    }

    async fn on_hello(&self, peer: SocketAddr, payload: Bytes) {
        self.inner.on_hello(peer, payload).await
    }

    async fn on_connected(&self, peer: SocketAddr) {
        self.inner.on_connected(peer).await
    }

    async fn on_message(&self, peer: SocketAddr, message: crate::codec::HazelMessage) {
        self.inner.on_message(peer, message).await
    }

    async fn on_close(&self, peer: SocketAddr, close: CloseEvent) {
        if let Some(connections) = self.connections.upgrade() {
            if connections.write().await.remove(&peer).is_some() {
                debug!("evicted closed connection to {:?}", peer);
            }
        }
        self.inner.on_close(peer, close).await
    }

    async fn on_error(&self, peer: SocketAddr, error: crate::error::HazelError) {
        self.inner.on_error(peer, error).await
    }
}

impl EndPoint {
    pub async fn new(
        addrs: impl ToSocketAddrs,
        dispatcher: Arc<dyn EventDispatcher>,
        config: Arc<HazelConfig>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(addrs).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);
        let (send_socket_v4, send_socket_v6) = if receive_socket.local_addr()?.is_ipv6() {
            (Arc::new(UdpSocket::bind("0.0.0.0:0").await?), receive_socket.clone())
        }
        else {
            (receive_socket.clone(), Arc::new(UdpSocket::bind("[::]:0").await?))
        };

        let connections: Arc<ConnectionMap> = Arc::new(RwLock::new(FxHashMap::default()));
        let dispatcher = Arc::new(EvictingDispatcher {
            connections: Arc::downgrade(&connections),
            inner: dispatcher,
        });

        Ok(EndPoint {
            receive_socket,
            send_pipeline_v4: Arc::new(SendPipeline::new(Arc::new(send_socket_v4))),
            send_pipeline_v6: Arc::new(SendPipeline::new(Arc::new(send_socket_v6))),
            connections,
            dispatcher,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.receive_socket
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    pub async fn connection(&self, peer: SocketAddr) -> Option<Connection> {
        self.connections.read().await.get(&peer).cloned()
    }

    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.receive_buffer_size];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            let _entered = span.enter();

            trace!("received {} bytes from {:?}", num_read, from);
            let datagram = Bytes::copy_from_slice(&buf[..num_read]);

            let existing = { self.connections.read().await.get(&from).cloned() };
            let connection = match existing {
                Some(connection) => connection,
                None => {
                    if datagram.first() != Some(&TYPE_HELLO) {
                        trace!("dropping non-HELLO packet from unknown endpoint {:?}", from);
                        continue;
                    }
                    debug!("new endpoint {:?} introduced itself with a HELLO", from);
                    let connection = Connection::server(
                        from,
                        self.send_pipeline_for(from),
                        self.dispatcher.clone(),
                        self.config.clone(),
                    );
                    self.connections.write().await.insert(from, connection.clone());
                    self.dispatcher.on_connection(connection.clone()).await;
                    connection
                }
            };

            connection.on_datagram(datagram).await;
        }
    }

    fn send_pipeline_for(&self, peer_addr: SocketAddr) -> Arc<SendPipeline> {
        if peer_addr.is_ipv4() {
            self.send_pipeline_v4.clone()
        }
        else {
            self.send_pipeline_v6.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MockEventDispatcher;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn spawn_endpoint(dispatcher: MockEventDispatcher) -> SocketAddr {
        let endpoint = EndPoint::new(
            "127.0.0.1:0",
            Arc::new(dispatcher) as Arc<dyn EventDispatcher>,
            Arc::new(HazelConfig::default()),
        )
        .await
        .unwrap();
        let addr = endpoint.local_addr();
        tokio::spawn(async move { endpoint.recv_loop().await });
        addr
    }

    fn permissive_dispatcher() -> MockEventDispatcher {
        let mut dispatcher = MockEventDispatcher::new();
        dispatcher.expect_on_connection().returning(|_| ());
        dispatcher.expect_on_hello().returning(|_, _| ());
        dispatcher.expect_on_message().returning(|_, _| ());
        dispatcher.expect_on_close().returning(|_, _| ());
        dispatcher.expect_on_error().returning(|_, _| ());
        dispatcher
    }

    #[tokio::test]
    async fn test_hello_from_unknown_endpoint_is_accepted_and_acked() {
        let addr = spawn_endpoint(permissive_dispatcher()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&[0x08, 0x00, 0x01, 0x00, 0x68, 0x69], addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (num_read, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, addr);
        assert_eq!(&buf[..num_read], &[0x0A, 0x00, 0x01, 0xFF]);
    }

    #[tokio::test]
    async fn test_non_hello_from_unknown_endpoint_is_dropped() {
        let addr = spawn_endpoint(permissive_dispatcher()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // a ping from an endpoint the server has never heard of draws no reaction at all -
        // the HELLO that follows it is the first packet to be answered
        client.send_to(&[0x0C, 0x00, 0x07], addr).await.unwrap();
        client
            .send_to(&[0x08, 0x00, 0x01, 0x00], addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (num_read, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..num_read], &[0x0A, 0x00, 0x01, 0xFF]);
    }

    #[tokio::test]
    async fn test_closed_connection_is_evicted() {
        let addr = spawn_endpoint(permissive_dispatcher()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&[0x08, 0x00, 0x01, 0x00], addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // disconnect, then introduce ourselves again - a fresh connection must answer
        client.send_to(&[0x09, 0x00], addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client
            .send_to(&[0x08, 0x00, 0x01, 0x00], addr)
            .await
            .unwrap();

        let (num_read, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..num_read], &[0x0A, 0x00, 0x01, 0xFF]);
    }
}
