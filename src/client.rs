//! The client side of a connection: binds its own ephemeral socket, issues the HELLO, and
//!  feeds everything the server sends back into the shared connection state machine.

use crate::codec::HazelMessage;
use crate::config::HazelConfig;
use crate::connection::Connection;
use crate::error::HazelError;
use crate::events::EventDispatcher;
use crate::send_pipeline::SendPipeline;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

pub struct HazelClient {
    connection: Connection,
    recv_task: JoinHandle<()>,
}

impl HazelClient {
    /// Binds an ephemeral socket in the server's address family and starts the receive loop.
    ///  The connection is not established until [`connect`](Self::connect) succeeds.
    pub async fn new(
        server_addr: SocketAddr,
        dispatcher: Arc<dyn EventDispatcher>,
        config: Arc<HazelConfig>,
    ) -> anyhow::Result<HazelClient> {
        config.validate()?;

        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound client socket to {:?}", socket.local_addr()?);

        let send_pipeline = Arc::new(SendPipeline::new(Arc::new(socket.clone())));
        let connection = Connection::client(server_addr, send_pipeline, dispatcher, config.clone());
        let recv_task = tokio::spawn(Self::recv_loop(socket, connection.clone(), config));

        Ok(HazelClient {
            connection,
            recv_task,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// Sends the HELLO (reliably - it is retransmitted like any reliable packet) and resolves
    ///  once the server acknowledges it. Fails with [`HazelError::AlreadyConnected`] when the
    ///  handshake is already done or underway.
    pub async fn connect(&self, hello_payload: &[u8]) -> Result<(), HazelError> {
        self.connection
            .connect(Bytes::copy_from_slice(hello_payload))
            .await
    }

    pub async fn send_normal(&self, messages: &[HazelMessage]) -> Result<usize, HazelError> {
        self.connection.send_normal(messages).await
    }

    pub async fn send_reliable(&self, messages: &[HazelMessage]) -> Result<usize, HazelError> {
        self.connection.send_reliable(messages).await
    }

    pub async fn disconnect(
        &self,
        forced: bool,
        reason: Option<u8>,
        message: Option<String>,
    ) -> Result<usize, HazelError> {
        self.connection.disconnect(forced, reason, message).await
    }

    pub async fn ping_ms(&self) -> f64 {
        self.connection.ping_ms().await
    }

    pub async fn is_closed(&self) -> bool {
        self.connection.is_closed().await
    }

    async fn recv_loop(socket: Arc<UdpSocket>, connection: Connection, config: Arc<HazelConfig>) {
        let mut buf = vec![0u8; config.receive_buffer_size];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            if from != connection.peer_addr() {
                trace!("dropping packet from {:?} - not the connected server", from);
                continue;
            }

            connection
                .on_datagram(Bytes::copy_from_slice(&buf[..num_read]))
                .await;

            if connection.is_closed().await {
                debug!("connection closed - stopping client receive loop");
                return;
            }
        }
    }
}

impl Drop for HazelClient {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::end_point::EndPoint;
    use crate::events::CloseEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Records every event it sees; the tests poll it. Server connections are captured so the
    ///  test can send from the server side.
    #[derive(Default)]
    struct RecordingDispatcher {
        connections: Mutex<Vec<Connection>>,
        hellos: Mutex<Vec<(SocketAddr, Bytes)>>,
        connected: Mutex<Vec<SocketAddr>>,
        messages: Mutex<Vec<(SocketAddr, HazelMessage)>>,
        closes: Mutex<Vec<(SocketAddr, CloseEvent)>>,
    }

    #[async_trait]
    impl EventDispatcher for RecordingDispatcher {
        async fn on_connection(&self, connection: Connection) {
            self.connections.lock().unwrap().push(connection);
        }

        async fn on_hello(&self, peer: SocketAddr, payload: Bytes) {
            self.hellos.lock().unwrap().push((peer, payload));
        }

        async fn on_connected(&self, peer: SocketAddr) {
            self.connected.lock().unwrap().push(peer);
        }

        async fn on_message(&self, peer: SocketAddr, message: HazelMessage) {
            self.messages.lock().unwrap().push((peer, message));
        }

        async fn on_close(&self, peer: SocketAddr, close: CloseEvent) {
            self.closes.lock().unwrap().push((peer, close));
        }

        async fn on_error(&self, _peer: SocketAddr, _error: HazelError) {}
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition was not reached in time");
    }

    #[tokio::test]
    async fn test_full_loopback_conversation() {
        let server_events = Arc::new(RecordingDispatcher::default());
        let endpoint = EndPoint::new(
            "127.0.0.1:0",
            server_events.clone() as Arc<dyn EventDispatcher>,
            Arc::new(HazelConfig::default()),
        )
        .await
        .unwrap();
        let server_addr = endpoint.local_addr();
        tokio::spawn(async move { endpoint.recv_loop().await });

        let client_events = Arc::new(RecordingDispatcher::default());
        let client = HazelClient::new(
            server_addr,
            client_events.clone() as Arc<dyn EventDispatcher>,
            Arc::new(HazelConfig::default()),
        )
        .await
        .unwrap();

        // handshake
        client.connect(b"greetings").await.unwrap();
        assert_eq!(client_events.connected.lock().unwrap().len(), 1);
        wait_until(|| !server_events.hellos.lock().unwrap().is_empty()).await;
        {
            let hellos = server_events.hellos.lock().unwrap();
            assert_eq!(hellos[0].1.as_ref(), b"greetings");
        }

        // client -> server, reliably
        client
            .send_reliable(&[HazelMessage::new(3, &b"ping"[..])])
            .await
            .unwrap();
        wait_until(|| !server_events.messages.lock().unwrap().is_empty()).await;
        {
            let messages = server_events.messages.lock().unwrap();
            assert_eq!(messages[0].1, HazelMessage::new(3, &b"ping"[..]));
        }

        // server -> client, reliably
        let server_connection = server_events.connections.lock().unwrap()[0].clone();
        server_connection
            .send_reliable(&[HazelMessage::new(4, &b"pong"[..])])
            .await
            .unwrap();
        wait_until(|| !client_events.messages.lock().unwrap().is_empty()).await;
        {
            let messages = client_events.messages.lock().unwrap();
            assert_eq!(messages[0].1, HazelMessage::new(4, &b"pong"[..]));
        }

        // graceful teardown, observed on both sides
        client.disconnect(false, Some(1), None).await.unwrap();
        assert!(client.is_closed().await);
        wait_until(|| !server_events.closes.lock().unwrap().is_empty()).await;
        {
            let closes = server_events.closes.lock().unwrap();
            assert_eq!(
                closes[0].1,
                CloseEvent {
                    forced: false,
                    reason: Some(1),
                    message: None,
                }
            );
        }
        assert_eq!(client_events.closes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_against_dead_server_times_out() {
        // bind a socket that never answers, then drop to half-open: nobody acks the HELLO
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = silent.local_addr().unwrap();

        let config = HazelConfig {
            resend_interval: Duration::from_millis(20),
            ..HazelConfig::default()
        };
        let events = Arc::new(RecordingDispatcher::default());
        let client = HazelClient::new(
            server_addr,
            events.clone() as Arc<dyn EventDispatcher>,
            Arc::new(config),
        )
        .await
        .unwrap();

        let result = client.connect(b"").await;
        assert!(matches!(result, Err(HazelError::NotAcknowledged)));
        assert!(client.is_closed().await);
        wait_until(|| !events.closes.lock().unwrap().is_empty()).await;
    }
}
