// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logical header fields shared by every packet type, and the per-version
//! fixed-prefix byte layouts.

use std::fmt;

/// Protocol version carried by every datagram.
///
/// v2 adds header blocks, NACK bitmaps, ACK packets and the encryption
/// flag. v3 splits the response into independent header-chunk and
/// body-chunk streams and adds aggregate-tag mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

impl ProtocolVersion {
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// Flag bits known to this implementation.
pub mod flags {
    /// Payload is AEAD-encrypted.
    pub const ENCRYPTED: u8 = 0x80;
    /// Body carries aggregate-tag semantics (v3 only).
    pub const AGGREGATE_TAG: u8 = 0x40;
    /// First response chunk carries a header block (v2 response context).
    pub const HAS_HEADER: u8 = 0x40;
}

/// Convenience bitfield wrapper over the raw `flags` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    #[must_use]
    pub fn encrypted(self) -> bool {
        self.0 & flags::ENCRYPTED != 0
    }

    #[must_use]
    pub fn aggregate_tag(self) -> bool {
        self.0 & flags::AGGREGATE_TAG != 0
    }

    #[must_use]
    pub fn has_header(self) -> bool {
        self.0 & flags::HAS_HEADER != 0
    }

    #[must_use]
    pub fn with_encrypted(mut self, on: bool) -> Self {
        if on {
            self.0 |= flags::ENCRYPTED;
        } else {
            self.0 &= !flags::ENCRYPTED;
        }
        self
    }

    #[must_use]
    pub fn with_bit(mut self, bit: u8, on: bool) -> Self {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }
}

/// Wire type tags, one per packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Req = 0,
    Resp = 1,
    RespHead = 2,
    RespHeadCont = 3,
    RespBody = 4,
    Nack = 5,
    NackHead = 6,
    NackBody = 7,
    Ack = 8,
    Error = 9,
}

impl TypeTag {
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Req),
            1 => Some(Self::Resp),
            2 => Some(Self::RespHead),
            3 => Some(Self::RespHeadCont),
            4 => Some(Self::RespBody),
            5 => Some(Self::Nack),
            6 => Some(Self::NackHead),
            7 => Some(Self::NackBody),
            8 => Some(Self::Ack),
            9 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Logical header fields. Not every field is meaningful for every
/// (version, type) combination; see [`crate::wire::codec`] for which
/// fields each variant actually serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: ProtocolVersion,
    pub type_tag: TypeTag,
    pub flags: Flags,
    pub message_id: u32,
    /// Seconds, diagnostic only. Zero for v3 (no wire field).
    pub timestamp: u32,
    pub seq: u16,
    pub seq_total: u16,
    /// v3 reserved field; zero unless explicitly set.
    pub short_id: u16,
}

impl Header {
    #[must_use]
    pub fn new(version: ProtocolVersion, type_tag: TypeTag, message_id: u32) -> Self {
        Self {
            version,
            type_tag,
            flags: Flags::default(),
            message_id,
            timestamp: 0,
            seq: 0,
            seq_total: 1,
            short_id: 0,
        }
    }
}
