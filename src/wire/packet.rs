// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The decoded packet value produced by [`crate::wire::codec::decode`] and
//! consumed by [`crate::client`] / [`crate::server`].

use super::header::{Header, ProtocolVersion, TypeTag};

/// Which packet kind a [`Packet`] carries. Mirrors [`TypeTag`] but without
/// the wire-byte concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Req,
    Resp,
    RespHead,
    RespHeadCont,
    RespBody,
    Nack,
    NackHead,
    NackBody,
    Ack,
    Error,
}

impl PacketKind {
    #[must_use]
    pub fn type_tag(self) -> TypeTag {
        match self {
            Self::Req => TypeTag::Req,
            Self::Resp => TypeTag::Resp,
            Self::RespHead => TypeTag::RespHead,
            Self::RespHeadCont => TypeTag::RespHeadCont,
            Self::RespBody => TypeTag::RespBody,
            Self::Nack => TypeTag::Nack,
            Self::NackHead => TypeTag::NackHead,
            Self::NackBody => TypeTag::NackBody,
            Self::Ack => TypeTag::Ack,
            Self::Error => TypeTag::Error,
        }
    }

    #[must_use]
    pub fn from_type_tag(tag: TypeTag) -> Self {
        match tag {
            TypeTag::Req => Self::Req,
            TypeTag::Resp => Self::Resp,
            TypeTag::RespHead => Self::RespHead,
            TypeTag::RespHeadCont => Self::RespHeadCont,
            TypeTag::RespBody => Self::RespBody,
            TypeTag::Nack => Self::Nack,
            TypeTag::NackHead => Self::NackHead,
            TypeTag::NackBody => Self::NackBody,
            TypeTag::Ack => Self::Ack,
            TypeTag::Error => Self::Error,
        }
    }
}

/// Kind-specific payload data. Each variant corresponds 1:1 to a
/// [`PacketKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Req {
        method: String,
        url: String,
        body: Vec<u8>,
    },
    /// Covers v1/v2 `resp` chunks. `status_code`/`body_len`/`header_block`
    /// are only `Some` on the first chunk (`seq == 0`).
    Resp {
        status_code: Option<u16>,
        body_len: Option<u32>,
        header_block: Option<Vec<u8>>,
        chunk: Vec<u8>,
    },
    RespHead {
        status_code: u16,
        body_len: u32,
        hdr_idx: u16,
        hdr_chunks_total: u16,
        body_seq_total: u16,
        header_chunk: Vec<u8>,
    },
    RespHeadCont {
        hdr_idx: u16,
        hdr_chunks_total: u16,
        header_chunk: Vec<u8>,
    },
    RespBody {
        chunk: Vec<u8>,
        /// Present only on the terminal body chunk in AGG mode.
        agg_tag: Option<[u8; 16]>,
    },
    /// Covers `nack` / `nack-head` / `nack-body`; [`PacketKind`] disambiguates.
    NackBitmap {
        bitmap: Vec<u8>,
    },
    Ack {
        first_lost_seq: u16,
    },
    Error {
        error_code: u8,
        http_status: u16,
        message: String,
    },
}

/// A fully decoded AKARI-UDP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub kind: PacketKind,
    pub payload: Payload,
}

impl Packet {
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.header.version
    }

    #[must_use]
    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    #[must_use]
    pub fn seq(&self) -> u16 {
        self.header.seq
    }

    #[must_use]
    pub fn seq_total(&self) -> u16 {
        self.header.seq_total
    }
}
