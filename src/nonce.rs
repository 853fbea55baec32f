//! Nonce allocation and the inbound nonce history that feeds the ack mask.

use std::collections::VecDeque;

/// The nonce counter wraps modulo 65535, not 65536: the upstream implementation takes the
///  incremented counter mod 65535, so the value 65535 is never put on the wire. Peers rely on
///  the exact sequence, so this is preserved as-is.
const NONCE_MODULUS: u32 = 65535;

/// How many nonces preceding an acknowledged one are reported in the ack's missing-mask.
pub const ACK_MASK_DEPTH: u16 = 8;

/// Allocator for outbound nonces: incremented before use, so the first allocated nonce is 1.
#[derive(Debug)]
pub struct NonceSequence {
    last: u16,
}

impl NonceSequence {
    pub fn new() -> NonceSequence {
        NonceSequence { last: 0 }
    }

    pub fn next(&mut self) -> u16 {
        self.last = ((self.last as u32 + 1) % NONCE_MODULUS) as u16;
        self.last
    }
}

/// The recently observed inbound nonces, kept to compute the selective-ack mask. Only the
///  [`ACK_MASK_DEPTH`] most recent entries can influence a mask, so older ones are evicted.
///
/// This tracks *inbound* traffic only - outbound nonces awaiting an ack live in the
///  retransmit table, which is a deliberately separate structure.
#[derive(Debug)]
pub struct NonceWindow {
    recent: VecDeque<u16>,
}

impl NonceWindow {
    pub fn new() -> NonceWindow {
        NonceWindow {
            recent: VecDeque::with_capacity(ACK_MASK_DEPTH as usize + 1),
        }
    }

    pub fn observe(&mut self, nonce: u16) {
        if self.contains(nonce) {
            return;
        }
        self.recent.push_back(nonce);
        if self.recent.len() > ACK_MASK_DEPTH as usize {
            self.recent.pop_front();
        }
    }

    pub fn contains(&self, nonce: u16) -> bool {
        self.recent.contains(&nonce)
    }

    /// The mask sent alongside an ack for `nonce`: bit `i-1` is set iff `nonce - i` has not
    ///  been observed, for i in 1..=8.
    ///
    /// The subtraction is plain u16 wrap-around. Nonce allocation runs mod 65535, so around
    ///  the wrap the arithmetic spaces differ - the upstream implementation subtracts in
    ///  unsigned space too, and with an 8-slot window the resulting set lookups come out the
    ///  same, so this matches it bit for bit.
    pub fn missing_mask(&self, nonce: u16) -> u8 {
        let mut mask = 0u8;
        for i in 1..=ACK_MASK_DEPTH {
            if !self.contains(nonce.wrapping_sub(i)) {
                mask |= 1 << (i - 1);
            }
        }
        mask
    }
}
