// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error taxonomy.
//!
//! Follows the severity ladder of drop-and-log / per-request / server-side
//! unexpected / fatal. Hand-rolled `Display`/`Error` impls, no `thiserror`.

use std::fmt;

/// The five AKARI domain error codes carried on the wire in `error` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainErrorCode {
    InvalidUrl,
    ResponseTooLarge,
    Timeout,
    UpstreamFailure,
    UnsupportedPacketType,
    Internal,
}

impl DomainErrorCode {
    /// Wire representation (u8).
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::InvalidUrl => 10,
            Self::ResponseTooLarge => 11,
            Self::Timeout => 20,
            Self::UpstreamFailure => 30,
            Self::UnsupportedPacketType => 254,
            Self::Internal => 255,
        }
    }

    /// Recommended HTTP status to pair with this code.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidUrl => 400,
            Self::ResponseTooLarge => 502,
            Self::Timeout => 504,
            Self::UpstreamFailure => 502,
            Self::UnsupportedPacketType => 400,
            Self::Internal => 500,
        }
    }

    /// Decode from the wire byte, if recognized.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            10 => Some(Self::InvalidUrl),
            11 => Some(Self::ResponseTooLarge),
            20 => Some(Self::Timeout),
            30 => Some(Self::UpstreamFailure),
            254 => Some(Self::UnsupportedPacketType),
            255 => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for DomainErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidUrl => "invalid url",
            Self::ResponseTooLarge => "response too large",
            Self::Timeout => "timeout",
            Self::UpstreamFailure => "upstream failure",
            Self::UnsupportedPacketType => "unsupported packet type",
            Self::Internal => "internal",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Crate-wide error type for fatal/configuration failures.
///
/// Per-request failures are surfaced as `Outcome.error` (see [`crate::client`])
/// rather than through this type; this type is reserved for startup-time
/// configuration errors and internal invariant violations.
#[derive(Debug)]
pub enum AkariError {
    /// Startup-time configuration problem (missing PSK, bad bind address, ...).
    Config(String),
    /// An internal invariant was violated; should never surface to callers.
    Internal(String),
    /// Wrapped I/O failure (socket bind/send/recv).
    Io(std::io::Error),
}

impl fmt::Display for AkariError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for AkariError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AkariError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type AkariResult<T> = Result<T, AkariError>;
