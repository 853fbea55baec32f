use anyhow::bail;
use std::time::Duration;

/// Protocol constants and tunables shared by both connection roles.
///
/// The defaults mirror the upstream Hazel implementation; changing the intervals or attempt
///  caps changes observable wire behaviour, so deviate only when both peers agree.
pub struct HazelConfig {
    /// The version byte carried in every HELLO. The handshake fails unless both peers use the
    ///  same value.
    pub protocol_version: u8,

    /// Interval between retransmissions of an unacknowledged reliable packet.
    pub resend_interval: Duration,

    /// Total number of times a reliable packet is put on the wire before the send is failed
    ///  and the connection closed (the initial send counts as the first attempt).
    pub max_send_attempts: u32,

    /// Interval between liveness pings on an established connection.
    pub ping_interval: Duration,

    /// Number of unanswered pings that closes the connection.
    pub max_pending_pings: u32,

    /// Receive buffer size per datagram. Hazel packets fit comfortably into a full Ethernet
    ///  frame; the protocol does not reassemble anything larger (FRAGMENT is reserved but
    ///  undefined upstream), so there is no point in a bigger buffer.
    pub receive_buffer_size: usize,
}

impl Default for HazelConfig {
    fn default() -> HazelConfig {
        HazelConfig {
            protocol_version: 0,
            resend_interval: Duration::from_millis(300),
            max_send_attempts: 10,
            ping_interval: Duration::from_millis(1500),
            max_pending_pings: 10,
            receive_buffer_size: 1500,
        }
    }
}

impl HazelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resend_interval.is_zero() {
            bail!("resend interval must be non-zero");
        }
        if self.max_send_attempts == 0 {
            bail!("at least one send attempt is required");
        }
        if self.ping_interval.is_zero() {
            bail!("ping interval must be non-zero");
        }
        if self.max_pending_pings == 0 {
            bail!("at least one pending ping must be allowed");
        }
        if self.receive_buffer_size < 64 {
            bail!("receive buffer is too small for a packet header");
        }
        Ok(())
    }
}
