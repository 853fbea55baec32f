use std::io;
use thiserror::Error;

/// Low-level decoding failures. These always bubble up into [`HazelError::Codec`] and are
///  treated as a fatal protocol error for the connection the bytes arrived on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the value (or a record's declared length) was complete.
    #[error("unexpected end of packet")]
    UnexpectedEnd,

    /// A packed integer kept its continuation bit set past the five-byte maximum.
    #[error("packed integer exceeds five bytes")]
    PackedIntTooLong,

    /// A length-prefixed string was not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidUtf8,
}

/// Errors surfaced on the public connection API.
#[derive(Debug, Error)]
pub enum HazelError {
    /// Malformed bytes from the peer. Fatal for the connection.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The peer violated the protocol (unexpected or repeated HELLO, version mismatch, ...).
    ///  Fatal for the connection; answered with a forced DISCONNECT.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The underlying socket send failed. Not fatal by itself - persistent failures surface
    ///  as retransmit exhaustion instead.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A reliable packet was re-sent the maximum number of times without an acknowledgement.
    #[error("reliable packet was not acknowledged")]
    NotAcknowledged,

    /// The connection closed while the operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// `connect` was called on a client that is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// `disconnect` was called on a connection that is already closed.
    #[error("already disconnected")]
    AlreadyDisconnected,
}

impl HazelError {
    /// Whether this error closes the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HazelError::Codec(_) | HazelError::Protocol(_) | HazelError::NotAcknowledged
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(HazelError::Codec(CodecError::UnexpectedEnd).is_fatal());
        assert!(HazelError::Protocol("second HELLO").is_fatal());
        assert!(HazelError::NotAcknowledged.is_fatal());

        assert!(!HazelError::Io(io::Error::new(io::ErrorKind::Other, "test")).is_fatal());
        assert!(!HazelError::ConnectionClosed.is_fatal());
        assert!(!HazelError::AlreadyConnected.is_fatal());
        assert!(!HazelError::AlreadyDisconnected.is_fatal());
    }
}
