// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # AKARI-UDP
//!
//! A UDP-framed request/response transport that lets a browser-facing proxy
//! fetch HTTPS resources indirectly through a remote egress proxy, using far
//! fewer wire bytes than a direct TLS handshake would cost per hop. A client
//! encodes an HTTP-style GET into one authenticated UDP datagram; a server
//! fetches the resource over ordinary HTTPS, chunks the response into
//! MTU-sized authenticated datagrams, and streams them back. Reliability on
//! top of UDP comes from selective-repeat NACKs, a proactive ACK of the
//! first gap, idempotent request retries, and a per-message server-side
//! resend cache.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use akari_udp::client::ClientTransport;
//! use akari_udp::config::AkariConfig;
//!
//! # fn main() -> std::io::Result<()> {
//! let config = AkariConfig {
//!     psk: b"test-psk-0000-test".to_vec(),
//!     ..AkariConfig::default()
//! };
//! let client = ClientTransport::connect("127.0.0.1:14500".parse().unwrap(), config)?;
//! let outcome = client.send_request("https://example.test/ok", client.next_message_id());
//! if outcome.complete {
//!     println!("status={:?} bytes={}", outcome.status_code, outcome.body.unwrap_or_default().len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`wire`] — packet encoding/decoding, authentication, header-block format.
//! - [`fragment`] — splits a response into MTU-safe chunks.
//! - [`reassemble`] — per-message sparse chunk store and completeness checks.
//! - [`recovery`] — NACK/ACK/retry/heartbeat policy.
//! - [`client`] — drives one request/response round.
//! - [`server`] — dispatches incoming packets, owns the response/HTTP caches.
//! - [`contracts`] — the `Fetcher`/`Clock`/`Rng` seams a caller plugs in.
//! - [`config`] — runtime configuration and its TOML loader.
//! - [`error`] — the crate-wide error taxonomy.
//! - `async_server` (feature `async`) — a `tokio` datagram loop around [`server::ServerHandler`].

#[cfg(feature = "async")]
pub mod async_server;
pub mod client;
pub mod config;
pub mod contracts;
pub mod error;
pub mod fragment;
pub mod reassemble;
pub mod recovery;
pub mod server;
pub mod wire;

/// Documents the nonce-safety property of [`wire::aead`]'s AEAD mode: the
/// nonce is `session_prefix(32 random bits) ‖ message_id ‖ seq ‖ type_tag`.
/// The random prefix, generated once per [`wire::Codec`] and never
/// persisted, measurably reduces in-session nonce reuse but does not make
/// nonce reuse impossible across process restarts with the same PSK — a
/// restarted process drawing the same 32-bit prefix and encoding the same
/// (message_id, seq, type_tag) triple would repeat a nonce. Anti-replay
/// across restarts is out of scope for this crate; callers requiring it
/// should rotate the PSK per deployment or add a persisted counter.
pub const AKARI_NONCE_SAFETY: &str =
    "AEAD nonces mix a per-codec random prefix into message_id/seq/type; this is a partial mitigation, not a full fix, for nonce reuse across process restarts under a reused PSK.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_safety_doc_is_non_empty() {
        assert!(!AKARI_NONCE_SAFETY.is_empty());
    }
}
