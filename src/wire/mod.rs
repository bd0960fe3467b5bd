// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The AKARI-UDP wire format: header layout, authentication, and the
//! per-version codec.
//!
//! Byte order is big-endian throughout. Every datagram is
//! `header-prefix ‖ payload ‖ mac(16)`, where the prefix shape depends on
//! `version` (see [`header`]).

pub mod aead;
pub mod codec;
pub mod header;
pub mod header_block;
pub mod mac;
pub mod packet;

pub use codec::{decode, Codec, DecodeError};
pub use header::{Flags, ProtocolVersion};
pub use packet::{Packet, PacketKind, Payload};

/// Fixed 2-byte magic that opens every AKARI-UDP datagram.
pub const MAGIC: [u8; 2] = *b"AK";

/// Length in bytes of the truncated HMAC-SHA256 authenticator.
pub const MAC_LEN: usize = 16;
