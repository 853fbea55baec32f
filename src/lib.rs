//! Reliable messaging over UDP, wire-compatible with the Hazel-Networking protocol as used by
//!  several real-time multiplayer games.
//!
//! UDP gives low latency but no delivery or ordering guarantees. This crate layers a small,
//!  well-known protocol on top of it: packets that need to arrive carry a 16-bit nonce and are
//!  re-sent on a fixed interval until the peer acknowledges them, connections are established
//!  with a versioned HELLO handshake, and liveness is probed with periodic pings that double as
//!  round-trip-time samples. Application messages are multiplexed as tagged records inside a
//!  single datagram and dispatched in arrival order.
//!
//! ## Packet envelope
//!
//! The first byte of every datagram selects the packet type; multi-byte integers are network
//!  byte order (BE) except packed integers (see below):
//!
//! ```ascii
//! 0x00 NORMAL      [0x00] [records...]                      unreliable payload
//! 0x01 RELIABLE    [0x01] [nonce u16] [records...]          acknowledged + re-sent payload
//! 0x05 FRAGMENT    reserved by the upstream protocol, never defined - silently ignored
//! 0x08 HELLO       [0x08] [nonce u16] [version u8] [payload...]
//! 0x09 DISCONNECT  [0x09] [graceful u8] [optional reason record]
//! 0x0A ACK         [0x0A] [nonce u16] [missing mask u8]
//! 0x0C PING        [0x0C] [nonce u16]
//! ```
//!
//! Any other leading byte is ignored.
//!
//! ## Records
//!
//! NORMAL and RELIABLE bodies are a concatenation of tagged records, each
//!  `[length u16][tag u8][length bytes of payload]`. A datagram may carry any number of them;
//!  they are dispatched to the application in order.
//!
//! Record payloads are encoded with the primitives in [`codec`], including the protocol's
//!  7-bits-per-byte little-endian packed integers.
//!
//! ## Nonces and acknowledgements
//!
//! Each connection allocates outbound nonces from a counter that is incremented before use and
//!  wraps modulo 65535 - the value 65535 itself is never produced. This matches the upstream
//!  implementation and must not be "fixed": wire compatibility requires the same sequence.
//!
//! Every ACK carries, besides the acknowledged nonce N, an 8-bit mask whose bit `i-1` is set
//!  iff nonce `N - i` has *not* been seen on this connection. The mask is advisory: a sender
//!  can use it to infer losses before the retransmit timer fires.
//!
//! Reliable packets are re-sent unchanged every 300ms. After 10 unsuccessful attempts the
//!  send fails and the connection is closed forcibly. Pings go out every 1500ms and are
//!  acknowledged like any other reliable packet; ten outstanding pings close the connection.
//!
//! ## Roles
//!
//! The same state machine serves both sides of a connection:
//! * the **server** side is created by [`end_point::EndPoint`] when a HELLO arrives from an
//!   unknown endpoint; any other first packet, a repeated HELLO, or a version mismatch closes
//!   the connection with a forced DISCONNECT
//! * the **client** side ([`client::HazelClient`]) binds its own socket and issues the HELLO;
//!   it counts as connected once the HELLO's ack returns
//!
//! Events (messages, handshake completion, close) are delivered through the
//!  [`events::EventDispatcher`] trait.
//!
//! Out of scope by design: congestion control beyond the fixed retransmit interval, flow
//!  control, encryption, and ordering guarantees between successive reliable sends -
//!  reliability is strictly per-packet.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod error;
pub mod events;

mod nonce;
mod packet;
mod pending;
mod rtt;
mod send_pipeline;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
