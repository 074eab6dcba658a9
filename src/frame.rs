//! Wire format of a single datagram. All numbers are in network byte order (BE):
//!
//! ```ascii
//! 0: kind (u8) - see [FrameKind] for the assigned values
//! 1: sequence number (i32) - only for RELIABLE, SEQUENCED and ACK frames
//! *: payload - all remaining bytes, possibly none
//! ```

use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::sequence_number::SequenceNumber;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum FrameError {
    #[error("frame too short: {needed} bytes required, {remaining} remaining")]
    FrameTooShort {
        needed: usize,
        remaining: usize,
    },
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Connect = 0,
    Disconnect = 1,
    Ack = 2,
    Ping = 3,
    Pong = 4,
    Reliable = 5,
    Sequenced = 6,
    Unreliable = 7,
}
impl FrameKind {
    pub fn has_sequence_number(&self) -> bool {
        matches!(self, FrameKind::Reliable | FrameKind::Sequenced | FrameKind::Ack)
    }
}

/// The delivery guarantee an application picks when sending data
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DeliveryKind {
    /// ordered, acknowledged by the receiver
    Reliable,
    /// ordered, not acknowledged
    Sequenced,
    /// neither ordered nor acknowledged
    Unreliable,
}
impl DeliveryKind {
    pub fn frame_kind(&self) -> FrameKind {
        match self {
            DeliveryKind::Reliable => FrameKind::Reliable,
            DeliveryKind::Sequenced => FrameKind::Sequenced,
            DeliveryKind::Unreliable => FrameKind::Unreliable,
        }
    }

    pub fn is_ordered(&self) -> bool {
        !matches!(self, DeliveryKind::Unreliable)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    kind: FrameKind,
    sequence_number: SequenceNumber,
    payload: Bytes,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.kind.has_sequence_number() {
            write!(f, "FRAME{{{:?}#{}:{}b}}", self.kind, self.sequence_number, self.payload.len())
        }
        else {
            write!(f, "FRAME{{{:?}:{}b}}", self.kind, self.payload.len())
        }
    }
}

impl Frame {
    pub const KIND_LEN: usize = size_of::<u8>();
    pub const SEQUENCE_NUMBER_LEN: usize = size_of::<i32>();
    pub const MAX_HEADER_LEN: usize = Self::KIND_LEN + Self::SEQUENCE_NUMBER_LEN;

    /// The sequence number is normalized to zero for kinds that do not transmit one, so that
    ///  frames compare equal to their decoded counterparts
    pub fn new(kind: FrameKind, sequence_number: SequenceNumber, payload: impl Into<Bytes>) -> Frame {
        let sequence_number = if kind.has_sequence_number() {
            sequence_number
        }
        else {
            SequenceNumber::ZERO
        };

        Frame {
            kind,
            sequence_number,
            payload: payload.into(),
        }
    }

    pub fn control(kind: FrameKind) -> Frame {
        Self::new(kind, SequenceNumber::ZERO, Bytes::new())
    }

    pub fn ack(sequence_number: SequenceNumber) -> Frame {
        Self::new(FrameKind::Ack, sequence_number, Bytes::new())
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn serialized_len(&self) -> usize {
        let header_len = if self.kind.has_sequence_number() {
            Self::MAX_HEADER_LEN
        }
        else {
            Self::KIND_LEN
        };
        header_len + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        if self.kind.has_sequence_number() {
            buf.put_i32(self.sequence_number.to_raw());
        }
        if !self.payload.is_empty() {
            buf.put_slice(&self.payload);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Frame, FrameError> {
        Self::ensure_remaining(buf, Self::KIND_LEN)?;
        let raw_kind = buf.get_u8();
        let kind = FrameKind::try_from(raw_kind)
            .map_err(|e| FrameError::UnknownKind(e.number))?;

        let sequence_number = if kind.has_sequence_number() {
            Self::ensure_remaining(buf, Self::SEQUENCE_NUMBER_LEN)?;
            SequenceNumber::from_raw(buf.get_i32())
        }
        else {
            SequenceNumber::ZERO
        };

        Ok(Frame {
            kind,
            sequence_number,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    fn ensure_remaining(buf: &[u8], needed: usize) -> Result<(), FrameError> {
        if buf.remaining() < needed {
            return Err(FrameError::FrameTooShort {
                needed,
                remaining: buf.remaining(),
            });
        }
        Ok(())
    }
}
