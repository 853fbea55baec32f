use crate::codec::HazelMessage;
use crate::connection::Connection;
use crate::error::HazelError;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;

/// The terminal event of every connection, emitted exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// `true` for protocol errors, timeouts and forced disconnects; `false` only when the
    ///  peer (or the local caller) disconnected gracefully.
    pub forced: bool,
    /// The numeric reason code from a graceful DISCONNECT, if one was carried.
    pub reason: Option<u8>,
    /// The human-readable message from a graceful DISCONNECT, if one was carried.
    pub message: Option<String>,
}

impl CloseEvent {
    pub fn forced() -> CloseEvent {
        CloseEvent {
            forced: true,
            reason: None,
            message: None,
        }
    }
}

/// Where the protocol hands its events to the application. One dispatcher can serve a whole
///  endpoint - every callback carries the peer address the event belongs to.
///
/// Callbacks are invoked outside the connection's internal lock, so it is safe to call back
///  into the connection (e.g. answer a message from `on_message`).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventDispatcher: Send + Sync + 'static {
    /// A server endpoint accepted a HELLO from an unknown peer and created a connection for
    ///  it. Emitted before the HELLO payload is dispatched via `on_hello`.
    async fn on_connection(&self, connection: Connection);

    /// The handshake payload of an accepted HELLO (server role).
    async fn on_hello(&self, peer: SocketAddr, payload: Bytes);

    /// The HELLO sent by `connect` was acknowledged (client role).
    async fn on_connected(&self, peer: SocketAddr);

    /// A decoded application record. Records within one datagram arrive in wire order.
    async fn on_message(&self, peer: SocketAddr, message: HazelMessage);

    /// The connection is gone. Emitted at most once per connection, after which every
    ///  outstanding and future operation on it fails.
    async fn on_close(&self, peer: SocketAddr, close: CloseEvent);

    /// A non-fatal or fatal error worth surfacing (malformed packets, protocol violations).
    ///  Fatal ones are followed by `on_close`.
    async fn on_error(&self, peer: SocketAddr, error: HazelError);
}
