//! ARQ segment framing.
//!
//! Wire format, big-endian throughout:
//!
//! ```text
//! ┌─────────┬─────────┬───────────┬──────────┬───────────────┐
//! │ Seq (4) │ Ack (4) │ Flags (1) │ Len (2)  │ Payload (Len) │
//! └─────────┴─────────┴───────────┴──────────┴───────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Segment header size in bytes.
pub const HEADER_SIZE: usize = 11;

/// Maximum payload per segment.
pub const MAX_SEGMENT: usize = 1200;

/// Segment kinds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Application payload
    Data = 0x00,
    /// Pure cumulative acknowledgement
    Ack = 0x01,
    /// Keepalive probe
    Ping = 0x02,
    /// Keepalive reply
    Pong = 0x03,
    /// Terminal close
    Fin = 0x04,
}

impl TryFrom<u8> for Flag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Flag::Data),
            0x01 => Ok(Flag::Ack),
            0x02 => Ok(Flag::Ping),
            0x03 => Ok(Flag::Pong),
            0x04 => Ok(Flag::Fin),
            _ => Err(Error::malformed(format!("unknown flag: 0x{value:02x}"))),
        }
    }
}

/// A single ARQ segment.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Sequence number (meaningful for DATA)
    pub seq: u32,
    /// Cumulative acknowledgement: every seq ≤ ack is acknowledged
    pub ack: u32,
    /// Segment kind
    pub flag: Flag,
    /// Payload (empty for control segments)
    pub payload: Bytes,
}

impl Segment {
    /// Create a DATA segment.
    pub fn data(seq: u32, ack: u32, payload: Bytes) -> Self {
        Self {
            seq,
            ack,
            flag: Flag::Data,
            payload,
        }
    }

    /// Create a pure ACK segment.
    pub fn ack(ack: u32) -> Self {
        Self {
            seq: 0,
            ack,
            flag: Flag::Ack,
            payload: Bytes::new(),
        }
    }

    /// Create a keepalive probe.
    pub fn ping() -> Self {
        Self {
            seq: 0,
            ack: 0,
            flag: Flag::Ping,
            payload: Bytes::new(),
        }
    }

    /// Create a keepalive reply.
    pub fn pong() -> Self {
        Self {
            seq: 0,
            ack: 0,
            flag: Flag::Pong,
            payload: Bytes::new(),
        }
    }

    /// Create a terminal FIN.
    pub fn fin() -> Self {
        Self {
            seq: 0,
            ack: 0,
            flag: Flag::Fin,
            payload: Bytes::new(),
        }
    }

    /// Serialize the segment.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(self.flag as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize a segment, copying the payload out of the input buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::malformed(format!(
                "segment too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let flag = Flag::try_from(buf.get_u8())?;
        let len = buf.get_u16() as usize;

        if len != buf.len() {
            return Err(Error::malformed(format!(
                "segment length mismatch: header says {len}, got {}",
                buf.len()
            )));
        }

        Ok(Self {
            seq,
            ack,
            flag,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Total wire size of this segment.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
