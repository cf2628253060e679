//! # Fragment Wire Format
//!
//! Fixed 18-byte header carried on every datagram, data and ACK alike.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1|.|O|R|C|E|A|    Fan-In     |      Participation Bitmap     :
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! :          Bitmap (cont.)       |          Slot Index           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Job Id                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Sequence Number (16-bit, widened)                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Flags: O=overflow, R=resend, C=collision, E=ecn, A=ack. The payload is
//! opaque — aggregation semantics are carried entirely by the bitmap.

use bytes::{Buf, BufMut, BytesMut};

use crate::seq::SeqNum;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version (two high bits of the flags byte).
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 18;

/// Fixed fragment payload size in bytes.
pub const FRAGMENT_PAYLOAD: usize = 1024;

/// Full datagram size: header plus opaque payload.
pub const PACKET_SIZE: usize = HEADER_SIZE + FRAGMENT_PAYLOAD;

/// Width of the participation bitmap — the hard cap on workers per job.
pub const MAX_FAN_IN: u8 = 32;

/// Default physical slot table capacity at the switch.
pub const MAX_SLOT_COUNT: usize = 4096;

// Flag bits (low five bits of the flags byte).
const FLAG_OVERFLOW: u8 = 1 << 4;
const FLAG_RESEND: u8 = 1 << 3;
const FLAG_COLLISION: u8 = 1 << 2;
const FLAG_ECN: u8 = 1 << 1;
const FLAG_ACK: u8 = 1 << 0;

// ─── Fragment Header ────────────────────────────────────────────────────────

/// Decoded fragment header — present on every protocol datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Slot exhausted its retry budget; aggregation bypassed.
    pub overflow: bool,
    /// Sender marks a retransmission.
    pub resend: bool,
    /// Slot holds a different epoch's state.
    pub collision: bool,
    /// Congestion experienced along the path.
    pub ecn: bool,
    /// Packet is the aggregated reply.
    pub ack: bool,
    /// Total participating workers for this job.
    pub fan_in: u8,
    /// Bit `i` set ⇒ worker `i`'s contribution is accounted.
    pub bitmap: u32,
    /// Aggregator slot selector.
    pub slot: u16,
    /// Logical job identity.
    pub job_id: u32,
    /// 16-bit sequence number, widened to 32 bits for carriage.
    pub seq: SeqNum,
    /// Opaque payload bytes following the header.
    pub payload_len: u16,
}

impl FragmentHeader {
    /// Build a fresh data-packet header carrying one worker's contribution.
    pub fn data(worker_id: u8, fan_in: u8, slot: u16, job_id: u32, seq: SeqNum) -> Self {
        FragmentHeader {
            overflow: false,
            resend: false,
            collision: false,
            ecn: false,
            ack: false,
            fan_in,
            bitmap: 1u32 << worker_id,
            slot,
            job_id,
            seq,
            payload_len: FRAGMENT_PAYLOAD as u16,
        }
    }

    /// Number of workers accounted in the bitmap.
    #[inline]
    pub fn contributors(&self) -> u32 {
        self.bitmap.count_ones()
    }

    /// Whether every expected contribution is accounted.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.contributors() == u32::from(self.fan_in)
    }

    /// Rewrite this header into the aggregated reply, keeping the ECN bit
    /// observed on the ingress path.
    pub fn into_ack(mut self, bitmap: u32, seq: SeqNum) -> Self {
        self.ack = true;
        self.bitmap = bitmap;
        self.seq = seq;
        self
    }

    /// Encode the header into a buffer (network byte order).
    pub fn encode(&self, buf: &mut BytesMut) {
        let flags: u8 = ((PROTOCOL_VERSION & 0x03) << 6)
            | if self.overflow { FLAG_OVERFLOW } else { 0 }
            | if self.resend { FLAG_RESEND } else { 0 }
            | if self.collision { FLAG_COLLISION } else { 0 }
            | if self.ecn { FLAG_ECN } else { 0 }
            | if self.ack { FLAG_ACK } else { 0 };
        buf.put_u8(flags);
        buf.put_u8(self.fan_in);
        buf.put_u32(self.bitmap);
        buf.put_u16(self.slot);
        buf.put_u32(self.job_id);
        buf.put_u32(u32::from(self.seq.value()));
        buf.put_u16(self.payload_len);
    }

    /// Decode a header from a buffer. Returns `None` if the buffer is too
    /// short or the version does not match — malformed datagrams are dropped.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < HEADER_SIZE {
            return None;
        }

        let flags = buf.get_u8();
        if (flags >> 6) & 0x03 != PROTOCOL_VERSION {
            return None;
        }

        let fan_in = buf.get_u8();
        let bitmap = buf.get_u32();
        let slot = buf.get_u16();
        let job_id = buf.get_u32();
        let seq = SeqNum::new(buf.get_u32() as u16);
        let payload_len = buf.get_u16();

        Some(FragmentHeader {
            overflow: flags & FLAG_OVERFLOW != 0,
            resend: flags & FLAG_RESEND != 0,
            collision: flags & FLAG_COLLISION != 0,
            ecn: flags & FLAG_ECN != 0,
            ack: flags & FLAG_ACK != 0,
            fan_in,
            bitmap,
            slot,
            job_id,
            seq,
            payload_len,
        })
    }

    /// Encoded size — fixed for every header.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FragmentHeader {
        let mut h = FragmentHeader::data(3, 4, 0x0123, 0xDEAD_BEEF, SeqNum::new(0xFFFE));
        h.ecn = true;
        h.resend = true;
        h
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let h = sample();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FragmentHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let h = sample();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        let mut truncated = buf.freeze().slice(..HEADER_SIZE - 1);
        assert!(FragmentHeader::decode(&mut truncated).is_none());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let h = sample();
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        let mut bytes = buf.to_vec();
        bytes[0] = (bytes[0] & 0x3F) | (2 << 6); // forge version 2
        assert!(FragmentHeader::decode(&mut &bytes[..]).is_none());
    }

    #[test]
    fn ack_rewrite_keeps_ecn_and_path_fields() {
        let h = sample();
        let ack = h.into_ack(0b1111, SeqNum::new(9));
        assert!(ack.ack);
        assert!(ack.ecn, "ECN observed on the data path must survive");
        assert_eq!(ack.bitmap, 0b1111);
        assert_eq!(ack.seq.value(), 9);
        assert_eq!(ack.slot, h.slot);
        assert_eq!(ack.job_id, h.job_id);
    }

    #[test]
    fn completeness_follows_fan_in() {
        let mut h = FragmentHeader::data(0, 2, 0, 0, SeqNum::new(0));
        assert!(!h.is_complete());
        h.bitmap |= 1 << 1;
        assert!(h.is_complete());
    }
}
